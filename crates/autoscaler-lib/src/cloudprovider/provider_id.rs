//! Provider-id scheme
//!
//! Real servers are addressed as `openstack:///<uuid>`. Minion slots that have
//! no server yet get a synthetic `fake:///<group-id>/<index>` id so they can
//! still be reported to the orchestrator and deleted by index.

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const OPENSTACK_PREFIX: &str = "openstack:///";
pub const FAKE_PREFIX: &str = "fake:///";

/// A parsed provider id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderId {
    Openstack(Uuid),
    Fake { group_id: String, index: String },
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderId::Openstack(id) => write!(f, "{}{}", OPENSTACK_PREFIX, id.hyphenated()),
            ProviderId::Fake { group_id, index } => {
                write!(f, "{}{}/{}", FAKE_PREFIX, group_id, index)
            }
        }
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((group_id, index)) = parse_fake(s) {
            return Ok(ProviderId::Fake { group_id, index });
        }
        parse_openstack(s)
            .map(ProviderId::Openstack)
            .ok_or_else(|| format!("unrecognised provider id {:?}", s))
    }
}

pub fn format_fake(group_id: &str, index: &str) -> String {
    format!("{}{}/{}", FAKE_PREFIX, group_id, index)
}

/// Parses `fake:///<group>/<index>`. Group ids never contain `/`, so the
/// index is everything after the last separator.
pub fn parse_fake(provider_id: &str) -> Option<(String, String)> {
    let rest = provider_id.strip_prefix(FAKE_PREFIX)?;
    let (group_id, index) = rest.rsplit_once('/')?;
    if group_id.is_empty() || index.is_empty() || group_id.contains('/') {
        return None;
    }
    Some((group_id.to_string(), index.to_string()))
}

pub fn format_openstack(id: &Uuid) -> String {
    format!("{}{}", OPENSTACK_PREFIX, id.hyphenated())
}

pub fn parse_openstack(provider_id: &str) -> Option<Uuid> {
    let rest = provider_id.strip_prefix(OPENSTACK_PREFIX)?;
    Uuid::parse_str(rest).ok()
}

/// Returns the hyphenated form of a server id if it parses as a UUID.
/// Kubelets report machine ids without hyphens.
pub fn canonical_uuid(raw: &str) -> Option<String> {
    Uuid::parse_str(raw.trim())
        .ok()
        .map(|id| id.hyphenated().to_string())
}
