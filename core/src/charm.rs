use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A relation endpoint declared in charm metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    "global".to_owned()
}

impl Relation {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            limit: None,
            optional: false,
            scope: default_scope(),
        }
    }
}

/// Structural charm metadata extracted from an archive's `metadata.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharmMeta {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provides: BTreeMap<String, Relation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requires: BTreeMap<String, Relation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peers: BTreeMap<String, Relation>,
    #[serde(default)]
    pub subordinate: bool,
}

/// A single configuration option exposed by a charm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigOption {
    #[serde(rename = "type")]
    pub option_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// Charm configuration schema (`config.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharmConfig {
    #[serde(default)]
    pub options: BTreeMap<String, ConfigOption>,
}

/// A single action exposed by a charm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

/// Charm action declarations (`actions.yaml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharmActions {
    #[serde(default)]
    pub actions: BTreeMap<String, ActionSpec>,
}

/// The parsed content of a charm archive that the store records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharmData {
    pub meta: CharmMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<CharmConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<CharmActions>,
}

/// Distinct interface names offered by a relation map, sorted.
pub fn interfaces_for_relations(relations: &BTreeMap<String, Relation>) -> Vec<String> {
    let mut interfaces: Vec<String> = relations
        .values()
        .map(|relation| relation.interface.clone())
        .collect();
    interfaces.sort();
    interfaces.dedup();
    interfaces
}
