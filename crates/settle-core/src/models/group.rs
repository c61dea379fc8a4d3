//! Group model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::{Entity, EntityKind};
use super::expense::default_currency;
use crate::error::{Error, Result};

/// A group of people sharing expenses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Group {
    const KIND: EntityKind = EntityKind::Groups;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Input for creating a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl NewGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            currency: default_currency(),
            created_by: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("group name cannot be empty".into()));
        }
        Ok(())
    }

    pub fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn provisional(&self, id: impl Into<String>, now: DateTime<Utc>) -> Group {
        Group {
            id: id.into(),
            name: self.name.clone(),
            description: self.description.clone(),
            currency: self.currency.clone(),
            created_by: self.created_by.clone(),
            created_at: Some(now),
            updated_at: Some(now),
        }
    }
}
