pub mod sandbox;
pub mod sqlite;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::date_util::format_timestamp;
use crate::record::{ObjectType, Record};

pub use sandbox::SandboxOrg;
pub use sqlite::SqliteOrg;

/// Failure of a single call against a CRM org.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl CrmError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CrmError::Transport(_) | CrmError::RateLimited(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CrmError::Authentication(_))
    }
}

/// Criteria for [`CrmSystem::query`]. All set criteria must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    pub modified_after: Option<DateTime<Utc>>,
    pub equals: Vec<(String, Value)>,
    pub ids: Option<Vec<String>>,
}

impl QueryFilter {
    pub fn modified_after(ts: DateTime<Utc>) -> Self {
        Self {
            modified_after: Some(ts),
            ..Self::default()
        }
    }

    pub fn by_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().and_equals(field, value)
    }

    pub fn and_equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        if let Some(after) = self.modified_after {
            if record.last_modified <= after {
                return false;
            }
        }
        if let Some(ref ids) = self.ids {
            match record.id {
                Some(ref id) if ids.contains(id) => {}
                _ => return false,
            }
        }
        self.equals
            .iter()
            .all(|(field, value)| record.get(field) == Some(value))
    }
}

impl fmt::Display for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut clauses = Vec::new();
        if let Some(after) = self.modified_after {
            clauses.push(format!("LastModifiedDate > {}", format_timestamp(after)));
        }
        for (field, value) in &self.equals {
            clauses.push(format!("{field} = {value}"));
        }
        if let Some(ref ids) = self.ids {
            clauses.push(format!("Id IN ({})", ids.join(", ")));
        }
        if clauses.is_empty() {
            f.write_str("<all>")
        } else {
            f.write_str(&clauses.join(" AND "))
        }
    }
}

/// Per-record answer of [`CrmSystem::upsert_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created { id: String },
    Updated { id: String },
    Failed { message: String },
}

/// Per-id answer of [`CrmSystem::delete_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted { id: String },
    Failed { id: String, message: String },
}

/// Access to one CRM org.
///
/// `upsert_batch` matches incoming records against existing ones by the
/// object type's match key; the incoming `id` belongs to the org the record
/// was read from and is ignored. Outcomes are positional: the n-th outcome
/// answers the n-th record (or id).
#[async_trait]
pub trait CrmSystem: Send + Sync {
    fn name(&self) -> &str;

    async fn query(&self, object: ObjectType, filter: &QueryFilter) -> Result<Vec<Record>, CrmError>;

    async fn upsert_batch(
        &self,
        object: ObjectType,
        records: &[Record],
    ) -> Result<Vec<UpsertOutcome>, CrmError>;

    async fn delete_batch(
        &self,
        object: ObjectType,
        ids: &[String],
    ) -> Result<Vec<DeleteOutcome>, CrmError>;
}

/// Merge `incoming` into `existing`: incoming fields win, everything else
/// is kept.
pub(crate) fn merge_fields(existing: &mut Record, incoming: &Record) {
    for (field, value) in &incoming.fields {
        existing.fields.insert(field.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::a_user;
    use chrono::TimeDelta;
    use serde_json::json;

    #[test]
    fn test_filter_modified_after_is_strict() {
        let now = Utc::now();
        let user = a_user().with("Email", "a@b.com").modified_at(now).build();
        assert!(!QueryFilter::modified_after(now).matches(&user));
        assert!(QueryFilter::modified_after(now - TimeDelta::seconds(1)).matches(&user));
    }

    #[test]
    fn test_filter_by_ids_requires_an_id() {
        let filter = QueryFilter::by_ids(vec!["005A".to_string()]);
        assert!(!filter.matches(&a_user().build()));
        assert!(filter.matches(&a_user().id("005A").build()));
        assert!(!filter.matches(&a_user().id("005B").build()));
    }

    #[test]
    fn test_filter_equals() {
        let filter = QueryFilter::field_equals("IsActive", true).and_equals("Email", "a@b.com");
        let active = a_user().with("IsActive", true).with("Email", "a@b.com").build();
        let inactive = a_user().with("IsActive", false).with("Email", "a@b.com").build();
        assert!(filter.matches(&active));
        assert!(!filter.matches(&inactive));
    }

    #[test]
    fn test_filter_display() {
        let filter = QueryFilter::field_equals("Email", json!("a@b.com"));
        assert_eq!(filter.to_string(), "Email = \"a@b.com\"");
        assert_eq!(QueryFilter::default().to_string(), "<all>");
    }

    #[test]
    fn test_error_classification() {
        assert!(CrmError::Transport("timeout".into()).is_transient());
        assert!(CrmError::RateLimited("429".into()).is_transient());
        assert!(!CrmError::Validation("bad".into()).is_transient());
        assert!(CrmError::Authentication("expired".into()).is_fatal());
    }
}
