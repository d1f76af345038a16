use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::crm::{CrmSystem, QueryFilter};
use crate::date_util::parse_timestamp;
use crate::error::{Error, Result};
use crate::record::{ObjectType, Record};
use crate::sync::retry::RetryPolicy;

/// Reads changed records from the source org.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn CrmSystem>,
    object: ObjectType,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(source: Arc<dyn CrmSystem>, object: ObjectType, retry: RetryPolicy) -> Self {
        Self {
            source,
            object,
            retry,
        }
    }

    /// Records modified strictly after `since`, oldest first (ties by id),
    /// one version per id. The last record's timestamp is the next
    /// watermark.
    pub async fn fetch_changed(&self, since: DateTime<Utc>) -> Result<Vec<Record>> {
        let filter = QueryFilter::modified_after(since);
        log::debug!("Querying {} for {} where {filter}", self.source.name(), self.object);
        let fetched = self
            .retry
            .run(&format!("query {}", self.source.name()), || {
                self.source.query(self.object, &filter)
            })
            .await?;
        Ok(order_changes(fetched, since))
    }

    /// Parse one pushed payload into a record.
    ///
    /// Accepts either a bare JSON object of fields or an envelope of the form
    /// `{"sObject": {...}}`. `Id` and `LastModifiedDate` fields, when
    /// present, become the record's identifier and timestamp.
    pub fn fetch_one(&self, payload: &str) -> Result<Record> {
        parse_payload(self.object, payload)
    }
}

fn order_changes(fetched: Vec<Record>, since: DateTime<Utc>) -> Vec<Record> {
    let mut latest: HashMap<String, Record> = HashMap::new();
    let mut anonymous = Vec::new();
    for record in fetched.into_iter().filter(|r| r.last_modified > since) {
        match record.id.clone() {
            Some(id) => match latest.get(&id) {
                Some(seen) if seen.last_modified >= record.last_modified => {}
                _ => {
                    latest.insert(id, record);
                }
            },
            None => anonymous.push(record),
        }
    }
    let mut records: Vec<Record> = latest.into_values().chain(anonymous).collect();
    records.sort_by(|a, b| {
        a.last_modified
            .cmp(&b.last_modified)
            .then_with(|| a.id.cmp(&b.id))
    });
    records
}

fn parse_payload(object: ObjectType, payload: &str) -> Result<Record> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| Error::MalformedPayload(format!("not valid JSON: {e}")))?;
    let mut body = match value {
        Value::Object(map) => map,
        _ => return Err(Error::MalformedPayload("payload must be a JSON object".into())),
    };
    if let Some(inner) = body.remove("sObject") {
        body = match inner {
            Value::Object(map) => map,
            _ => return Err(Error::MalformedPayload("sObject must be a JSON object".into())),
        };
    }

    if let Some(declared) = body.get("type").and_then(Value::as_str) {
        if !declared.eq_ignore_ascii_case(object.api_name()) {
            return Err(Error::MalformedPayload(format!(
                "expected a {} payload, got {declared}",
                object.api_name()
            )));
        }
    }

    let id = body.get("Id").and_then(Value::as_str).map(str::to_string);
    let last_modified = match body.get("LastModifiedDate") {
        Some(Value::String(s)) => parse_timestamp(s)
            .ok_or_else(|| Error::MalformedPayload(format!("invalid LastModifiedDate: {s}")))?,
        Some(other) => {
            return Err(Error::MalformedPayload(format!("invalid LastModifiedDate: {other}")))
        }
        None => Utc::now(),
    };

    let record = Record {
        id,
        last_modified,
        fields: body.into_iter().collect(),
    };
    if record.match_value(object).is_none() {
        return Err(Error::MalformedPayload(format!(
            "required field {} is missing",
            object.match_key()
        )));
    }
    Ok(record)
}
