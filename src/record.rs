use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// The CRM entity kinds the engine knows how to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    User,
    Opportunity,
    Account,
}

impl ObjectType {
    /// Field the destination matches on to decide between create and update.
    pub fn match_key(self) -> &'static str {
        match self {
            ObjectType::User => "Email",
            ObjectType::Opportunity | ObjectType::Account => "Name",
        }
    }

    /// Name the CRM uses for the object (the `type` attribute of a payload).
    pub fn api_name(self) -> &'static str {
        match self {
            ObjectType::User => "User",
            ObjectType::Opportunity => "Opportunity",
            ObjectType::Account => "Account",
        }
    }

    /// Identifier prefix, so ids read like the CRM's own.
    pub fn id_prefix(self) -> &'static str {
        match self {
            ObjectType::User => "005",
            ObjectType::Opportunity => "006",
            ObjectType::Account => "001",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::User => "user",
            ObjectType::Opportunity => "opportunity",
            ObjectType::Account => "account",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "users" => Ok(ObjectType::User),
            "opportunity" | "opportunities" => Ok(ObjectType::Opportunity),
            "account" | "accounts" => Ok(ObjectType::Account),
            other => Err(Error::Config(format!("unknown object type: {other}"))),
        }
    }
}

/// One CRM entity: a bag of named fields plus the identifier and
/// last-modified timestamp of the org it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self {
            id: None,
            last_modified: Utc::now(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String value of a field, if present and a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Value of the object type's match key, when it is a non-empty string.
    pub fn match_value(&self, object: ObjectType) -> Option<&str> {
        self.get_str(object.match_key()).filter(|v| !v.is_empty())
    }
}

/// Fluent builder for test and seed records.
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    id: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    fields: BTreeMap<String, Value>,
}

pub fn a_user() -> RecordBuilder {
    RecordBuilder::default()
}

pub fn an_opportunity() -> RecordBuilder {
    RecordBuilder::default()
}

pub fn an_account() -> RecordBuilder {
    RecordBuilder::default()
}

impl RecordBuilder {
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn modified_at(mut self, ts: DateTime<Utc>) -> Self {
        self.last_modified = Some(ts);
        self
    }

    pub fn build(self) -> Record {
        Record {
            id: self.id,
            last_modified: self.last_modified.unwrap_or_else(Utc::now),
            fields: self.fields,
        }
    }
}
