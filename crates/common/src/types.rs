use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of a tenant identifier.
pub const MAX_TENANT_LEN: usize = 128;

/// Validated tenant identifier.
///
/// Every stateful resource (document index collection, memory collection,
/// attachment directory) is namespaced by this value, so it must be safe to use
/// both as a path component and as a collection key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let reason = if raw.is_empty() {
            Some("must not be empty")
        } else if raw.len() > MAX_TENANT_LEN {
            Some("too long")
        } else if raw.starts_with('.') {
            Some("must not start with '.'")
        } else if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            Some("only ASCII letters, digits, '-', '_' and '.' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(Error::InvalidTenant { id: raw, reason }),
            None => Ok(Self(raw)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Collection name holding this tenant's uploaded documents.
    pub fn document_collection(&self) -> String {
        format!("doc:{}", self.0)
    }

    /// Collection name holding this tenant's long-term memories.
    ///
    /// Both prefixes end in `:`, which no tenant id may contain, so the two
    /// namespaces never collide across tenants.
    pub fn memory_collection(&self) -> String {
        format!("mem:{}", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}
