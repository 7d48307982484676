use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::StoreError;

/// The only schema the store serves.
pub const SCHEMA: &str = "cs";

/// A fully or partially qualified entity identifier.
///
/// String form: `[cs:][~user/][series/]name[-revision]`. An empty series
/// and revision `-1` denote a *base reference*, which matches every
/// concrete revision of the named entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub schema: String,
    pub user: String,
    pub series: String,
    pub name: String,
    pub revision: i32,
}

impl EntityRef {
    pub fn new(
        user: impl Into<String>,
        series: impl Into<String>,
        name: impl Into<String>,
        revision: i32,
    ) -> Self {
        Self {
            schema: SCHEMA.to_owned(),
            user: user.into(),
            series: series.into(),
            name: name.into(),
            revision,
        }
    }

    /// Parses a reference string, defaulting the schema to `cs`.
    pub fn parse(input: &str) -> Result<Self, StoreError> {
        let invalid = |reason: &str| StoreError::invalid_reference(input, reason);

        let mut rest = input;
        let mut schema = SCHEMA;
        if let Some(colon) = rest.find(':') {
            schema = &rest[..colon];
            rest = &rest[colon + 1..];
            if schema != SCHEMA {
                return Err(invalid("unsupported schema"));
            }
        }

        let mut user = "";
        if let Some(after_tilde) = rest.strip_prefix('~') {
            let slash = after_tilde
                .find('/')
                .ok_or_else(|| invalid("user name must be followed by a '/'"))?;
            user = &after_tilde[..slash];
            if user.is_empty() || !user.chars().all(is_user_char) {
                return Err(invalid("invalid user name"));
            }
            rest = &after_tilde[slash + 1..];
        }

        let mut parts = rest.split('/');
        let (series, name_part) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => ("", name),
            (Some(series), Some(name), None) => {
                if !is_valid_series(series) {
                    return Err(invalid("invalid series"));
                }
                (series, name)
            }
            _ => return Err(invalid("too many path components")),
        };

        let (name, revision) = split_revision(name_part);
        if !is_valid_name(name) {
            return Err(invalid("invalid entity name"));
        }

        Ok(Self {
            schema: schema.to_owned(),
            user: user.to_owned(),
            series: series.to_owned(),
            name: name.to_owned(),
            revision,
        })
    }

    /// The base reference: series and revision cleared.
    pub fn base(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            user: self.user.clone(),
            series: String::new(),
            name: self.name.clone(),
            revision: -1,
        }
    }

    /// True when this reference names exactly one entity.
    pub fn is_fully_qualified(&self) -> bool {
        !self.series.is_empty() && self.revision >= 0
    }

    /// Reports whether a concrete entity URL satisfies `pattern`.
    ///
    /// Names and users must be equal (both empty counts as equal); an
    /// empty pattern series or a `-1` pattern revision matches anything.
    pub fn matches(&self, pattern: &EntityRef) -> bool {
        if self.name != pattern.name || self.user != pattern.user {
            return false;
        }
        if !pattern.series.is_empty() && self.series != pattern.series {
            return false;
        }
        pattern.revision == -1 || self.revision == pattern.revision
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.schema)?;
        if !self.user.is_empty() {
            write!(f, "~{}/", self.user)?;
        }
        if !self.series.is_empty() {
            write!(f, "{}/", self.series)?;
        }
        write!(f, "{}", self.name)?;
        if self.revision >= 0 {
            write!(f, "-{}", self.revision)?;
        }
        Ok(())
    }
}

impl FromStr for EntityRef {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EntityRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Splits a trailing `-<digits>` revision suffix off an entity name.
fn split_revision(input: &str) -> (&str, i32) {
    if let Some(dash) = input.rfind('-') {
        let suffix = &input[dash + 1..];
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(revision) = suffix.parse::<i32>() {
                return (&input[..dash], revision);
            }
        }
    }
    (input, -1)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_valid_series(series: &str) -> bool {
    let mut chars = series.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    series
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

fn is_user_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.' | '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fully_qualified_reference() {
        let r = EntityRef::parse("cs:precise/wordpress-23").unwrap();
        assert_eq!(r.schema, "cs");
        assert_eq!(r.user, "");
        assert_eq!(r.series, "precise");
        assert_eq!(r.name, "wordpress");
        assert_eq!(r.revision, 23);
        assert_eq!(r.to_string(), "cs:precise/wordpress-23");
    }

    #[test]
    fn parses_owned_reference_without_revision() {
        let r = EntityRef::parse("~alice/trusty/mysql").unwrap();
        assert_eq!(r.user, "alice");
        assert_eq!(r.series, "trusty");
        assert_eq!(r.name, "mysql");
        assert_eq!(r.revision, -1);
        assert_eq!(r.to_string(), "cs:~alice/trusty/mysql");
    }

    #[test]
    fn parses_bundle_series() {
        let r = EntityRef::parse("bundle/wordpress-simple-42").unwrap();
        assert_eq!(r.series, "bundle");
        assert_eq!(r.name, "wordpress-simple");
        assert_eq!(r.revision, 42);
    }

    #[test]
    fn dashed_name_without_numeric_suffix_keeps_revision_unset() {
        let r = EntityRef::parse("wordpress-simple").unwrap();
        assert_eq!(r.name, "wordpress-simple");
        assert_eq!(r.revision, -1);
        assert_eq!(r.series, "");
    }

    #[test]
    fn rejects_malformed_references() {
        for input in [
            "gopher:archie-server",
            "cs:pr:ecise/something-23",
            "cs:/bad",
            "cs:precise/trusty/wordpress",
            "cs:~/wordpress",
            "cs:precise/Wordpress",
            "",
        ] {
            assert!(
                EntityRef::parse(input).is_err(),
                "expected parse failure for {input:?}"
            );
        }
    }

    #[test]
    fn base_clears_series_and_revision() {
        let r = EntityRef::parse("cs:~who/trusty/wordpress-47").unwrap();
        let base = r.base();
        assert_eq!(base.to_string(), "cs:~who/wordpress");
        assert_eq!(base.revision, -1);
        assert!(base.series.is_empty());
    }

    #[test]
    fn matching_follows_pattern_rules() {
        let entity = EntityRef::parse("cs:precise/wordpress-23").unwrap();
        assert!(entity.matches(&EntityRef::parse("wordpress").unwrap()));
        assert!(entity.matches(&EntityRef::parse("precise/wordpress").unwrap()));
        assert!(entity.matches(&EntityRef::parse("precise/wordpress-23").unwrap()));
        assert!(!entity.matches(&EntityRef::parse("trusty/wordpress").unwrap()));
        assert!(!entity.matches(&EntityRef::parse("precise/wordpress-24").unwrap()));
        assert!(!entity.matches(&EntityRef::parse("arble").unwrap()));
        assert!(!entity.matches(&EntityRef::parse("~user/wordpress").unwrap()));
    }

    #[test]
    fn serde_round_trips_as_string() {
        let r = EntityRef::parse("cs:~who/utopic/django-2").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"cs:~who/utopic/django-2\"");
        let back: EntityRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
