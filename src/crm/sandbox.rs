use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use super::{merge_fields, CrmError, CrmSystem, DeleteOutcome, QueryFilter, UpsertOutcome};
use crate::date_util::truncate_millis;
use crate::record::{ObjectType, Record};

/// In-memory CRM org with fault injection, standing in for a sandbox org.
///
/// Timestamps are whole milliseconds and strictly increasing per org, so
/// every write is visible to a later `modified_after` query.
pub struct SandboxOrg {
    name: String,
    state: Mutex<SandboxState>,
    latency: Mutex<Duration>,
    upsert_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Default)]
struct SandboxState {
    records: HashMap<ObjectType, BTreeMap<String, Record>>,
    next_seq: u64,
    last_stamp: Option<DateTime<Utc>>,
    upsert_failures: VecDeque<CrmError>,
    query_failures: VecDeque<CrmError>,
    rejections: Vec<Rejection>,
    batch_sizes: Vec<usize>,
}

struct Rejection {
    field: String,
    value: Value,
    message: String,
}

impl SandboxOrg {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SandboxState::default()),
            latency: Mutex::new(Duration::ZERO),
            upsert_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `upsert_batch` call fail with `error`. Queued errors are
    /// consumed one per call.
    pub fn fail_next_upsert(&self, error: CrmError) {
        self.state().upsert_failures.push_back(error);
    }

    pub fn fail_next_query(&self, error: CrmError) {
        self.state().query_failures.push_back(error);
    }

    /// Reject, per record, any upserted record whose `field` equals `value`.
    pub fn reject_when(&self, field: impl Into<String>, value: impl Into<Value>, message: impl Into<String>) {
        self.state().rejections.push(Rejection {
            field: field.into(),
            value: value.into(),
            message: message.into(),
        });
    }

    /// Delay every upsert call, to exercise concurrent page submission.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Highest number of upsert calls that were in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Sizes of the batches received by `upsert_batch`, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state().batch_sizes.clone()
    }

    /// All stored records of one object type, ordered by id.
    pub fn records(&self, object: ObjectType) -> Vec<Record> {
        self.state()
            .records
            .get(&object)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn find_by_key(&self, object: ObjectType, key: &str) -> Option<Record> {
        self.state().find_by_key(object, key).cloned()
    }

    /// Store records directly, bypassing fault injection. Returns their ids.
    pub fn seed(&self, object: ObjectType, records: Vec<Record>) -> Vec<String> {
        let mut state = self.state();
        records
            .into_iter()
            .map(|record| state.create(object, record))
            .collect()
    }
}

impl SandboxState {
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = truncate_millis(Utc::now());
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + TimeDelta::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn create(&mut self, object: ObjectType, mut record: Record) -> String {
        self.next_seq += 1;
        let id = format!("{}{:012}", object.id_prefix(), self.next_seq);
        record.id = Some(id.clone());
        record.last_modified = self.stamp();
        self.records.entry(object).or_default().insert(id.clone(), record);
        id
    }

    fn find_by_key(&self, object: ObjectType, key: &str) -> Option<&Record> {
        self.records
            .get(&object)?
            .values()
            .find(|r| r.match_value(object) == Some(key))
    }

    fn rejection_for(&self, record: &Record) -> Option<String> {
        self.rejections
            .iter()
            .find(|r| record.get(&r.field) == Some(&r.value))
            .map(|r| r.message.clone())
    }

    fn upsert_one(&mut self, object: ObjectType, record: &Record) -> UpsertOutcome {
        if let Some(message) = self.rejection_for(record) {
            return UpsertOutcome::Failed { message };
        }
        let key = match record.match_value(object) {
            Some(key) => key.to_string(),
            None => {
                return UpsertOutcome::Failed {
                    message: format!("required field {} is missing", object.match_key()),
                }
            }
        };
        let existing_id = self.find_by_key(object, &key).and_then(|r| r.id.clone());
        match existing_id {
            Some(id) => {
                let stamp = self.stamp();
                if let Some(existing) = self.records.get_mut(&object).and_then(|m| m.get_mut(&id)) {
                    merge_fields(existing, record);
                    existing.last_modified = stamp;
                }
                UpsertOutcome::Updated { id }
            }
            None => {
                let mut fresh = record.clone();
                fresh.id = None;
                let id = self.create(object, fresh);
                UpsertOutcome::Created { id }
            }
        }
    }
}

#[async_trait]
impl CrmSystem for SandboxOrg {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, object: ObjectType, filter: &QueryFilter) -> Result<Vec<Record>, CrmError> {
        let mut state = self.state();
        if let Some(error) = state.query_failures.pop_front() {
            return Err(error);
        }
        Ok(state
            .records
            .get(&object)
            .map(|m| m.values().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_batch(
        &self,
        object: ObjectType,
        records: &[Record],
    ) -> Result<Vec<UpsertOutcome>, CrmError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = {
            let mut state = self.state();
            state.batch_sizes.push(records.len());
            match state.upsert_failures.pop_front() {
                Some(error) => Err(error),
                None => Ok(records
                    .iter()
                    .map(|record| state.upsert_one(object, record))
                    .collect()),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn delete_batch(
        &self,
        object: ObjectType,
        ids: &[String],
    ) -> Result<Vec<DeleteOutcome>, CrmError> {
        let mut state = self.state();
        let store = state.records.entry(object).or_default();
        Ok(ids
            .iter()
            .map(|id| match store.remove(id) {
                Some(_) => DeleteOutcome::Deleted { id: id.clone() },
                None => DeleteOutcome::Failed {
                    id: id.clone(),
                    message: "entity is deleted or does not exist".into(),
                },
            })
            .collect())
    }
}
