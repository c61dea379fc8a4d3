//! Entity kinds shared by the cache, the outbox and the remote seam

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The cached collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Groups,
    Expenses,
    Users,
}

/// How a compared field behaves during automatic conflict resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Free text that can be merged by concatenation
    Text,
    /// Monetary amount
    Amount,
    Other,
}

impl EntityKind {
    pub const ALL: [Self; 3] = [Self::Groups, Self::Expenses, Self::Users];

    /// Collection (table) name in the local store and on the remote.
    pub const fn collection(self) -> &'static str {
        match self {
            Self::Groups => "groups",
            Self::Expenses => "expenses",
            Self::Users => "users",
        }
    }

    /// Foreign key used by `CacheFilter::parent`.
    pub const fn parent_field(self) -> Option<&'static str> {
        match self {
            Self::Expenses => Some("group_id"),
            Self::Groups | Self::Users => None,
        }
    }

    /// Mutable fields compared during conflict detection.
    pub const fn compared_fields(self) -> &'static [(&'static str, FieldKind)] {
        match self {
            Self::Expenses => &[
                ("description", FieldKind::Text),
                ("amount", FieldKind::Amount),
                ("currency", FieldKind::Other),
                ("date", FieldKind::Other),
                ("notes", FieldKind::Text),
            ],
            Self::Groups => &[
                ("name", FieldKind::Text),
                ("description", FieldKind::Text),
                ("currency", FieldKind::Other),
            ],
            Self::Users => &[
                ("display_name", FieldKind::Text),
                ("avatar_url", FieldKind::Other),
            ],
        }
    }

    /// Kind of a compared field; unknown fields are `Other`.
    pub fn field_kind(self, field: &str) -> FieldKind {
        self.compared_fields()
            .iter()
            .find(|(name, _)| *name == field)
            .map_or(FieldKind::Other, |(_, kind)| *kind)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groups" | "group" => Ok(Self::Groups),
            "expenses" | "expense" => Ok(Self::Expenses),
            "users" | "user" => Ok(Self::Users),
            other => Err(format!("unknown collection: {other}")),
        }
    }
}

/// A record type stored in one of the cached collections
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}
