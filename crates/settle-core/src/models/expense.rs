//! Expense model

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::{Entity, EntityKind};
use crate::error::{Error, Result};

pub(crate) fn default_currency() -> String {
    "USD".to_string()
}

/// An expense paid inside a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    /// Server id, or `temp_<actionId>` while the create is queued
    pub id: String,
    pub group_id: String,
    pub description: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub notes: Option<String>,
    /// User who paid
    #[serde(default)]
    pub paid_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Expense {
    const KIND: EntityKind = EntityKind::Expenses;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Input for creating an expense
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExpense {
    pub group_id: String,
    pub description: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Defaults to today (UTC) when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_by: Option<String>,
}

impl NewExpense {
    pub fn new(group_id: impl Into<String>, description: impl Into<String>, amount: f64) -> Self {
        Self {
            group_id: group_id.into(),
            description: description.into(),
            amount,
            currency: default_currency(),
            date: None,
            notes: None,
            paid_by: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(Error::InvalidInput("expense group_id is required".into()));
        }
        if self.description.trim().is_empty() {
            return Err(Error::InvalidInput(
                "expense description cannot be empty".into(),
            ));
        }
        validate_amount(self.amount)
    }

    /// Insert payload sent to the remote (the server assigns the id).
    pub fn to_payload(&self, now: DateTime<Utc>) -> Result<Value> {
        let mut filled = self.clone();
        filled.date = Some(self.date.unwrap_or_else(|| now.date_naive()));
        Ok(serde_json::to_value(filled)?)
    }

    /// Optimistic record rendered while the create is queued.
    pub fn provisional(&self, id: impl Into<String>, now: DateTime<Utc>) -> Expense {
        Expense {
            id: id.into(),
            group_id: self.group_id.clone(),
            description: self.description.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            date: self.date.unwrap_or_else(|| now.date_naive()),
            notes: self.notes.clone(),
            paid_by: self.paid_by.clone(),
            created_at: Some(now),
            updated_at: Some(now),
        }
    }
}

/// Partial update of an expense; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpensePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ExpensePatch {
    pub const fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.amount.is_none()
            && self.currency.is_none()
            && self.date.is_none()
            && self.notes.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::InvalidInput("expense update is empty".into()));
        }
        if self
            .description
            .as_deref()
            .is_some_and(|description| description.trim().is_empty())
        {
            return Err(Error::InvalidInput(
                "expense description cannot be empty".into(),
            ));
        }
        self.amount.map_or(Ok(()), validate_amount)
    }

    /// The changed fields as a JSON object (without the id).
    pub fn to_fields(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn apply_to(&self, expense: &mut Expense) {
        if let Some(description) = &self.description {
            expense.description.clone_from(description);
        }
        if let Some(amount) = self.amount {
            expense.amount = amount;
        }
        if let Some(currency) = &self.currency {
            expense.currency.clone_from(currency);
        }
        if let Some(date) = self.date {
            expense.date = date;
        }
        if let Some(notes) = &self.notes {
            expense.notes = Some(notes.clone());
        }
    }
}

fn validate_amount(amount: f64) -> Result<()> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidInput(
            "expense amount must be a positive number".into(),
        ))
    }
}
