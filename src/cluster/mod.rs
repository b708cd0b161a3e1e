//! Cluster data model shared by the dispatcher and the rdir client:
//! service records as reported by the conscience, service identifiers used
//! to correlate records across gateways, and the rawx/meta2 service types.

pub mod conscience;
pub mod directory;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Account under which every volume-to-rdir link is stored in the
/// directory.
pub const RDIR_ACCOUNT: &str = "_RDIR";

/// Builds the `{namespace}|{type}|{address}` key used to correlate records
/// between the conscience and the directory. Never transmitted.
pub fn service_id(namespace: &str, service_type: &str, addr: &str) -> String {
    format!("{namespace}|{service_type}|{addr}")
}

/// Storage-service types whose volumes require an rdir link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Rawx,
    Meta2,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Rawx => "rawx",
            ServiceType::Meta2 => "meta2",
        }
    }

    /// URI prefix of the rdir HTTP surface dedicated to this service type.
    pub fn rdir_prefix(self) -> &'static str {
        match self {
            ServiceType::Rawx => "rdir",
            ServiceType::Meta2 => "rdir/meta2",
        }
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(identifier: &str) -> Result<Self, Self::Err> {
        match identifier {
            "rawx" => Ok(ServiceType::Rawx),
            "meta2" => Ok(ServiceType::Meta2),
            _ => Err(format!("unknown service type: {identifier}")),
        }
    }
}

/// Tag map attached to a service record. Known fields are typed; anything
/// this client does not interpret is preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceTags {
    #[serde(rename = "tag.service_id", skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(
        rename = "stat.opened_db_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub opened_db_count: Option<u64>,
    #[serde(rename = "tag.loc", skip_serializing_if = "Option::is_none")]
    pub loc: Option<String>,
    #[serde(rename = "tag.up", skip_serializing_if = "Option::is_none")]
    pub up: Option<bool>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One service as reported by the conscience. `score <= 0` means the
/// service is considered down for selection purposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub addr: String,
    #[serde(default)]
    pub score: i32,
    #[serde(default)]
    pub tags: ServiceTags,
}

impl ServiceRecord {
    pub fn is_up(&self) -> bool {
        self.score > 0
    }

    /// Advisory load counter, defaulting to 0 when the tag is absent.
    pub fn opened_db_count(&self) -> u64 {
        self.tags.opened_db_count.unwrap_or(0)
    }

    /// The identifier a volume is linked under: its service id tag when
    /// set, its address otherwise.
    pub fn volume_id(&self) -> &str {
        self.tags.service_id.as_deref().unwrap_or(&self.addr)
    }

    /// Placeholder for an rdir that is linked in the directory but absent
    /// from the conscience answer; score 0 marks it down.
    pub fn down_placeholder(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            score: 0,
            tags: ServiceTags::default(),
        }
    }
}

/// One volume of the dispatched fleet, possibly carrying its attached rdir.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub service: ServiceRecord,
    pub rdir: Option<ServiceRecord>,
}
