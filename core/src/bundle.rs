use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::reference::EntityRef;

/// Container types a placement may name.
const CONTAINER_TYPES: &[&str] = &["lxc", "kvm"];

/// A bundle's deployment description (`bundle.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleData {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machines: BTreeMap<String, MachineSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<Vec<String>>,
}

/// One service deployed by a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub charm: String,
    #[serde(default)]
    pub num_units: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
}

/// An explicitly declared machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
}

/// A parsed unit placement directive.
///
/// The textual forms are `<machine>`, `new`, `<service>[/<unit>]`, each
/// optionally prefixed with `<container>:`. Exactly one of `machine` and
/// `service` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlacement {
    pub container: String,
    pub machine: String,
    pub service: String,
    pub unit: i32,
}

impl UnitPlacement {
    /// The default placement used for services with no `to` field.
    fn new_machine() -> Self {
        Self {
            container: String::new(),
            machine: "new".to_owned(),
            service: String::new(),
            unit: -1,
        }
    }

    pub fn parse(input: &str) -> Result<Self, StoreError> {
        let invalid =
            |reason: &str| StoreError::bad_request(format!("invalid placement {input:?}: {reason}"));

        let (container, rest) = match input.split_once(':') {
            Some((container, rest)) => {
                if container.is_empty() || !container.chars().all(|c| c.is_ascii_lowercase()) {
                    return Err(invalid("malformed container type"));
                }
                (container, rest)
            }
            None => ("", input),
        };

        if rest.is_empty() {
            return Err(invalid("empty target"));
        }

        if rest == "new" || rest.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self {
                container: container.to_owned(),
                machine: rest.to_owned(),
                service: String::new(),
                unit: -1,
            });
        }

        let (service, unit) = match rest.split_once('/') {
            Some((service, unit)) => {
                if unit.is_empty() || !unit.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid("malformed unit number"));
                }
                let unit: i32 = unit
                    .parse()
                    .map_err(|_| invalid("unit number out of range"))?;
                (service, unit)
            }
            None => (rest, -1),
        };

        if service.is_empty()
            || !service
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("malformed service name"));
        }

        Ok(Self {
            container: container.to_owned(),
            machine: String::new(),
            service: service.to_owned(),
            unit,
        })
    }
}

impl BundleData {
    /// Checks the bundle's internal consistency: machine identifiers,
    /// placement syntax, and placement targets. Returns all problems
    /// found, joined, as a `BadRequest`.
    pub fn verify(&self) -> Result<(), StoreError> {
        let mut problems = Vec::new();

        for id in self.machines.keys() {
            if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
                problems.push(format!("invalid machine id {id:?}"));
            }
        }

        for (name, service) in &self.services {
            if EntityRef::parse(&service.charm).is_err() {
                problems.push(format!(
                    "invalid charm URL {:?} for service {name:?}",
                    service.charm
                ));
            }
            if service.to.len() > service.num_units as usize {
                problems.push(format!(
                    "too many units placed for service {name:?}: {} placements for {} units",
                    service.to.len(),
                    service.num_units
                ));
            }
            for location in &service.to {
                let placement = match UnitPlacement::parse(location) {
                    Ok(placement) => placement,
                    Err(err) => {
                        problems.push(err.to_string());
                        continue;
                    }
                };
                if !placement.container.is_empty()
                    && !CONTAINER_TYPES.contains(&placement.container.as_str())
                {
                    problems.push(format!(
                        "invalid container type {:?} in placement {location:?}",
                        placement.container
                    ));
                }
                if !placement.service.is_empty() && !self.services.contains_key(&placement.service)
                {
                    problems.push(format!(
                        "placement {location:?} refers to unknown service {:?}",
                        placement.service
                    ));
                }
                if !placement.machine.is_empty()
                    && placement.machine != "new"
                    && !self.machines.contains_key(&placement.machine)
                {
                    problems.push(format!(
                        "placement {location:?} refers to unknown machine {:?}",
                        placement.machine
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(StoreError::bad_request(problems.join("; ")))
        }
    }
}

/// Total number of units the bundle deploys.
pub fn unit_count(data: &BundleData) -> i64 {
    data.services
        .values()
        .map(|service| i64::from(service.num_units))
        .sum()
}

/// Number of machines the bundle creates or uses.
///
/// Starts from the explicitly declared machines. Each placement naming
/// `new` (with or without a container prefix) adds a machine; placements
/// onto declared machines or other services' units add nothing, and
/// invalid placements are ignored. When a service gives fewer placements
/// than units the last placement is replicated for the remainder, so a
/// trailing `new` adds the shortfall; a service with no `to` field puts
/// every unit on its own new machine.
pub fn machine_count(data: &BundleData) -> i64 {
    let mut count = data.machines.len() as i64;
    for service in data.services.values() {
        let mut last = Some(UnitPlacement::new_machine());
        for location in &service.to {
            match UnitPlacement::parse(location) {
                Ok(placement) => {
                    if placement.machine == "new" {
                        count += 1;
                    }
                    last = Some(placement);
                }
                Err(_) => last = None,
            }
        }
        if matches!(&last, Some(placement) if placement.machine == "new") {
            count += (i64::from(service.num_units) - service.to.len() as i64).max(0);
        }
    }
    count
}

/// All charm URLs used by the bundle, together with their base
/// references, de-duplicated and sorted.
pub fn bundle_charms(data: &BundleData) -> Result<Vec<EntityRef>, StoreError> {
    let mut urls: BTreeMap<String, EntityRef> = BTreeMap::new();
    for service in data.services.values() {
        let url = EntityRef::parse(&service.charm)?;
        let base = url.base();
        urls.insert(url.to_string(), url);
        urls.insert(base.to_string(), base);
    }
    Ok(urls.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(num_units: u32, to: &[&str]) -> ServiceSpec {
        ServiceSpec {
            charm: "cs:utopic/django-0".to_owned(),
            num_units,
            to: to.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    fn bundle(services: &[(&str, ServiceSpec)], machines: &[&str]) -> BundleData {
        BundleData {
            services: services
                .iter()
                .map(|(name, spec)| ((*name).to_owned(), spec.clone()))
                .collect(),
            machines: machines
                .iter()
                .map(|id| ((*id).to_owned(), MachineSpec::default()))
                .collect(),
            relations: Vec::new(),
        }
    }

    #[test]
    fn placement_parsing() {
        let p = UnitPlacement::parse("new").unwrap();
        assert_eq!(p.machine, "new");

        let p = UnitPlacement::parse("3").unwrap();
        assert_eq!(p.machine, "3");

        let p = UnitPlacement::parse("lxc:new").unwrap();
        assert_eq!((p.container.as_str(), p.machine.as_str()), ("lxc", "new"));

        let p = UnitPlacement::parse("kvm:2").unwrap();
        assert_eq!((p.container.as_str(), p.machine.as_str()), ("kvm", "2"));

        let p = UnitPlacement::parse("django/1").unwrap();
        assert_eq!((p.service.as_str(), p.unit), ("django", 1));

        let p = UnitPlacement::parse("lxc:django/1").unwrap();
        assert_eq!(p.container, "lxc");
        assert_eq!((p.service.as_str(), p.unit), ("django", 1));

        let p = UnitPlacement::parse("django").unwrap();
        assert_eq!((p.service.as_str(), p.unit), ("django", -1));

        for bad in ["", ":new", "lxc:", "django/", "django/x", "LXC:new"] {
            assert!(UnitPlacement::parse(bad).is_err(), "parsed {bad:?}");
        }
    }

    #[test]
    fn unit_count_sums_service_units() {
        let data = bundle(
            &[
                ("django", service(1, &[])),
                ("haproxy", service(2, &[])),
                ("postgres", service(5, &[])),
            ],
            &[],
        );
        assert_eq!(unit_count(&data), 8);
        assert_eq!(unit_count(&BundleData::default()), 0);
    }

    // Machine count fixtures mirror the deployment shapes the placement
    // grammar is meant to cover; each bundle verifies cleanly first.
    #[test]
    fn machine_count_scenarios() {
        let cases: Vec<(&str, BundleData, i64)> = vec![
            (
                "single unit, no placement",
                bundle(&[("django", service(1, &[]))], &[]),
                1,
            ),
            (
                "single unit on a declared machine",
                bundle(&[("django", service(1, &["1"]))], &["1"]),
                1,
            ),
            (
                "two services on one declared machine",
                bundle(
                    &[
                        ("django", service(1, &["1"])),
                        ("haproxy", service(1, &["1"])),
                    ],
                    &["1"],
                ),
                1,
            ),
            (
                "co-location with a trailing new",
                bundle(
                    &[
                        ("django", service(2, &[])),
                        ("haproxy", service(3, &["django/0", "django/1", "new"])),
                    ],
                    &[],
                ),
                3,
            ),
            (
                "containers on new and declared machines",
                bundle(
                    &[("haproxy", service(6, &["lxc:new", "1", "lxc:1", "kvm:new"]))],
                    &["1"],
                ),
                5,
            ),
            (
                "partial placement with new machines",
                bundle(
                    &[
                        ("django", service(3, &[])),
                        ("haproxy", service(6, &["new", "1", "lxc:1", "new"])),
                        (
                            "postgres",
                            service(10, &["kvm:2", "lxc:django/1", "new", "new", "kvm:2"]),
                        ),
                    ],
                    &["1", "2"],
                ),
                11,
            ),
            (
                "hulk smash",
                bundle(
                    &[
                        ("django", service(1, &["1"])),
                        ("haproxy", service(1, &["2"])),
                        ("postgres", service(2, &["1", "2"])),
                    ],
                    &["1", "2"],
                ),
                2,
            ),
            (
                "partial placement in containers",
                bundle(
                    &[
                        ("django", service(1, &["1"])),
                        ("haproxy", service(10, &["lxc:1", "lxc:2"])),
                    ],
                    &["1", "2"],
                ),
                2,
            ),
            ("no services", BundleData::default(), 0),
        ];

        for (about, data, expect) in cases {
            data.verify().unwrap_or_else(|err| {
                panic!("bundle for {about:?} failed verification: {err}")
            });
            assert_eq!(machine_count(&data), expect, "scenario: {about}");
        }
    }

    #[test]
    fn invalid_placements_are_ignored_by_the_count() {
        let mut data = bundle(&[("django", service(2, &["1", "LXC:new"]))], &["1"]);
        assert!(data.verify().is_err());
        assert_eq!(machine_count(&data), 1);

        // A trailing invalid placement also suppresses the shortfall rule.
        data.services.get_mut("django").unwrap().to = vec!["bad/"].into_iter()
            .map(str::to_owned)
            .collect();
        assert_eq!(machine_count(&data), 1);
    }

    #[test]
    fn verify_reports_unknown_targets() {
        let data = bundle(&[("django", service(1, &["5"]))], &[]);
        let err = data.verify().unwrap_err().to_string();
        assert!(err.contains("unknown machine"), "got: {err}");

        let data = bundle(&[("django", service(1, &["rails/0"]))], &[]);
        let err = data.verify().unwrap_err().to_string();
        assert!(err.contains("unknown service"), "got: {err}");

        let data = bundle(&[("django", service(1, &["mongo:new"]))], &[]);
        let err = data.verify().unwrap_err().to_string();
        assert!(err.contains("container type"), "got: {err}");
    }

    #[test]
    fn bundle_charms_includes_base_references() {
        let data = bundle(
            &[
                ("django", service(1, &[])),
                ("frontend", {
                    let mut s = service(1, &[]);
                    s.charm = "cs:utopic/django-0".to_owned();
                    s
                }),
                ("haproxy", {
                    let mut s = service(1, &[]);
                    s.charm = "cs:~who/trusty/haproxy-2".to_owned();
                    s
                }),
            ],
            &[],
        );

        let urls: Vec<String> = bundle_charms(&data)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            urls,
            [
                "cs:django",
                "cs:utopic/django-0",
                "cs:~who/haproxy",
                "cs:~who/trusty/haproxy-2",
            ]
        );
    }
}
