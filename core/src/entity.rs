use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::bundle::BundleData;
use crate::charm::{CharmActions, CharmConfig, CharmMeta};
use crate::reference::EntityRef;

/// Extra-info key under which import tooling records the source revision
/// digest.
pub const BZR_DIGEST_KEY: &str = "bzr-digest";

/// Metadata document for one uploaded charm or bundle.
///
/// The fully qualified URL is the primary key. Exactly one of the charm
/// and bundle field groups is populated. `blob_hash_256` starts out
/// absent and is filled lazily by the first legacy info request that
/// needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "_id")]
    pub url: EntityRef,
    pub base_url: EntityRef,
    pub blob_name: String,
    pub blob_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_hash_256: Option<String>,
    pub size: i64,
    pub upload_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charm_meta: Option<CharmMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charm_config: Option<CharmConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charm_actions: Option<CharmActions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charm_provided_interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charm_required_interfaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_data: Option<BundleData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_readme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_unit_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_machine_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundle_charms: Vec<EntityRef>,

    /// Opaque per-entity annotations owned by external systems. The
    /// store never interprets the values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_info: BTreeMap<String, ByteBuf>,
}

impl Entity {
    pub fn is_bundle(&self) -> bool {
        self.bundle_data.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_entity() -> Entity {
        let url = EntityRef::parse("cs:precise/wordpress-3").unwrap();
        Entity {
            base_url: url.base(),
            url,
            blob_name: "0123456789abcdef01234567".into(),
            blob_hash: "deadbeef".into(),
            blob_hash_256: None,
            size: 42,
            upload_time: Utc::now(),
            charm_meta: Some(CharmMeta {
                name: "wordpress".into(),
                ..Default::default()
            }),
            charm_config: None,
            charm_actions: None,
            charm_provided_interfaces: Vec::new(),
            charm_required_interfaces: Vec::new(),
            bundle_data: None,
            bundle_readme: None,
            bundle_unit_count: None,
            bundle_machine_count: None,
            bundle_charms: Vec::new(),
            extra_info: BTreeMap::new(),
        }
    }

    #[test]
    fn url_is_the_document_id() {
        let entity = minimal_entity();
        let doc = bson::to_document(&entity).unwrap();
        assert_eq!(
            doc.get_str("_id").unwrap(),
            "cs:precise/wordpress-3"
        );
        assert_eq!(doc.get_str("base_url").unwrap(), "cs:wordpress");
        assert!(!doc.contains_key("blob_hash_256"));
        assert!(!doc.contains_key("bundle_data"));
    }

    #[test]
    fn bson_round_trip_preserves_extra_info() {
        let mut entity = minimal_entity();
        entity
            .extra_info
            .insert(BZR_DIGEST_KEY.to_owned(), ByteBuf::from(b"\"rev-1\"".to_vec()));

        let doc = bson::to_document(&entity).unwrap();
        let back: Entity = bson::from_document(doc).unwrap();
        assert_eq!(back, entity);
        assert!(!back.is_bundle());
    }
}
