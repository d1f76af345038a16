//! Named retrieve/update/delete operations against either org.
//!
//! Operation names (`retrieveUserFromBFlow`, `deleteAccountFromAFlow`, ...)
//! are resolved once, up front, to typed handles. An unknown name, or a name
//! used as the wrong kind of operation, fails immediately with
//! [`Error::UnknownOperation`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::crm::{CrmSystem, DeleteOutcome, QueryFilter, UpsertOutcome};
use crate::error::{Error, Result};
use crate::record::{ObjectType, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => f.write_str("A"),
            Side::B => f.write_str("B"),
        }
    }
}

/// The source org (A) and destination org (B).
#[derive(Clone)]
pub struct OrgPair {
    pub a: Arc<dyn CrmSystem>,
    pub b: Arc<dyn CrmSystem>,
}

impl OrgPair {
    pub fn new(a: Arc<dyn CrmSystem>, b: Arc<dyn CrmSystem>) -> Self {
        Self { a, b }
    }

    pub fn side(&self, side: Side) -> &Arc<dyn CrmSystem> {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }
}

/// Which field a retrieve looks records up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The object type's match key (`Email` or `Name`).
    MatchKey,
    /// `FirstName` for users, `Name` otherwise.
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveOp {
    name: String,
    side: Side,
    object: ObjectType,
    lookup: Lookup,
}

impl RetrieveOp {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn field(&self) -> &'static str {
        match (self.lookup, self.object) {
            (Lookup::Name, ObjectType::User) => "FirstName",
            (Lookup::Name, _) => "Name",
            (Lookup::MatchKey, object) => object.match_key(),
        }
    }

    /// First record whose lookup field equals `value`.
    pub async fn call(&self, orgs: &OrgPair, value: &str) -> Result<Option<Record>> {
        let filter = QueryFilter::field_equals(self.field(), value);
        let mut found = orgs.side(self.side).query(self.object, &filter).await?;
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found.into_iter().next())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOp {
    name: String,
    side: Side,
    object: ObjectType,
}

impl UpdateOp {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upsert `records` (matched by key) into the operation's org.
    pub async fn call(&self, orgs: &OrgPair, records: &[Record]) -> Result<Vec<UpsertOutcome>> {
        Ok(orgs.side(self.side).upsert_batch(self.object, records).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOp {
    name: String,
    side: Side,
    object: ObjectType,
}

impl DeleteOp {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, orgs: &OrgPair, ids: &[String]) -> Result<Vec<DeleteOutcome>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(orgs.side(self.side).delete_batch(self.object, ids).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Retrieve(RetrieveOp),
    Update(UpdateOp),
    Delete(DeleteOp),
}

impl Operation {
    pub fn name(&self) -> &str {
        match self {
            Operation::Retrieve(op) => op.name(),
            Operation::Update(op) => op.name(),
            Operation::Delete(op) => op.name(),
        }
    }

    /// Run with JSON input and output, for the command line.
    ///
    /// Retrieve takes a string and returns the record or `null`; update takes
    /// an object or an array of field objects; delete takes an id or an
    /// array of ids. Both return per-item outcomes.
    pub async fn call_json(&self, orgs: &OrgPair, input: Value) -> Result<Value> {
        match self {
            Operation::Retrieve(op) => {
                let value = input
                    .as_str()
                    .ok_or_else(|| Error::MalformedPayload(format!("{} expects a string", op.name)))?;
                Ok(serde_json::to_value(op.call(orgs, value).await?)?)
            }
            Operation::Update(op) => {
                let records = json_items(input)?
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(map) => Ok(Record::new(map.into_iter().collect())),
                        other => Err(Error::MalformedPayload(format!("not a record: {other}"))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(serde_json::to_value(op.call(orgs, &records).await?)?)
            }
            Operation::Delete(op) => {
                let ids = json_items(input)?
                    .into_iter()
                    .map(|item| match item {
                        Value::String(id) => Ok(id),
                        other => Err(Error::MalformedPayload(format!("not an id: {other}"))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(serde_json::to_value(op.call(orgs, &ids).await?)?)
            }
        }
    }
}

fn json_items(input: Value) -> Result<Vec<Value>> {
    match input {
        Value::Array(items) => Ok(items),
        Value::Null => Err(Error::MalformedPayload("input is required".into())),
        single => Ok(vec![single]),
    }
}

pub struct OperationRegistry {
    ops: BTreeMap<String, Operation>,
}

impl OperationRegistry {
    /// Retrieve, update and delete for every object type in both orgs, plus
    /// the by-name user lookups.
    pub fn standard() -> Self {
        let mut ops = BTreeMap::new();
        let objects = [ObjectType::User, ObjectType::Opportunity, ObjectType::Account];
        for object in objects {
            let api = object.api_name();
            for side in [Side::A, Side::B] {
                let retrieve = format!("retrieve{api}From{side}Flow");
                ops.insert(
                    retrieve.clone(),
                    Operation::Retrieve(RetrieveOp {
                        name: retrieve,
                        side,
                        object,
                        lookup: Lookup::MatchKey,
                    }),
                );
                let update = format!("update{api}In{side}Flow");
                ops.insert(
                    update.clone(),
                    Operation::Update(UpdateOp {
                        name: update,
                        side,
                        object,
                    }),
                );
                let delete = format!("delete{api}From{side}Flow");
                ops.insert(
                    delete.clone(),
                    Operation::Delete(DeleteOp {
                        name: delete,
                        side,
                        object,
                    }),
                );
            }
        }
        for side in [Side::A, Side::B] {
            let name = format!("retrieveUserByNameFrom{side}Flow");
            ops.insert(
                name.clone(),
                Operation::Retrieve(RetrieveOp {
                    name,
                    side,
                    object: ObjectType::User,
                    lookup: Lookup::Name,
                }),
            );
        }
        Self { ops }
    }

    pub fn resolve(&self, name: &str) -> Result<&Operation> {
        self.ops
            .get(name)
            .ok_or_else(|| Error::UnknownOperation(name.to_string()))
    }

    pub fn retrieve(&self, name: &str) -> Result<RetrieveOp> {
        match self.resolve(name)? {
            Operation::Retrieve(op) => Ok(op.clone()),
            _ => Err(Error::UnknownOperation(format!("{name} is not a retrieve operation"))),
        }
    }

    pub fn update(&self, name: &str) -> Result<UpdateOp> {
        match self.resolve(name)? {
            Operation::Update(op) => Ok(op.clone()),
            _ => Err(Error::UnknownOperation(format!("{name} is not an update operation"))),
        }
    }

    pub fn delete(&self, name: &str) -> Result<DeleteOp> {
        match self.resolve(name)? {
            Operation::Delete(op) => Ok(op.clone()),
            _ => Err(Error::UnknownOperation(format!("{name} is not a delete operation"))),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }
}

/// How many records `cleanup` removed from each org.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted_in_a: usize,
    pub deleted_in_b: usize,
}

/// Remove test records from both orgs: `created` (as stored in A) are
/// deleted from A by id, and their copies in B are found by match key and
/// deleted there.
pub async fn cleanup(
    registry: &OperationRegistry,
    orgs: &OrgPair,
    object: ObjectType,
    created: &[Record],
) -> Result<CleanupReport> {
    let api = object.api_name();
    let delete_a = registry.delete(&format!("delete{api}FromAFlow"))?;
    let delete_b = registry.delete(&format!("delete{api}FromBFlow"))?;
    let retrieve_b = registry.retrieve(&format!("retrieve{api}FromBFlow"))?;

    let ids_in_a: Vec<String> = created.iter().filter_map(|r| r.id.clone()).collect();
    let deleted_in_a = count_deleted(&delete_a.call(orgs, &ids_in_a).await?);

    let mut ids_in_b = Vec::new();
    for record in created {
        let Some(key) = record.match_value(object) else {
            continue;
        };
        if let Some(id) = retrieve_b.call(orgs, key).await?.and_then(|r| r.id) {
            ids_in_b.push(id);
        }
    }
    let deleted_in_b = count_deleted(&delete_b.call(orgs, &ids_in_b).await?);

    log::debug!("Cleaned up {deleted_in_a} {object} record(s) in A and {deleted_in_b} in B");
    Ok(CleanupReport {
        deleted_in_a,
        deleted_in_b,
    })
}

fn count_deleted(outcomes: &[DeleteOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, DeleteOutcome::Deleted { .. }))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::crm::SandboxOrg;
    use crate::fixtures::test_opportunity;
    use crate::storage::Database;
    use crate::sync::engine::SyncEngine;
    use serde_json::json;

    fn orgs() -> (Arc<SandboxOrg>, Arc<SandboxOrg>, OrgPair) {
        let a = Arc::new(SandboxOrg::new("A"));
        let b = Arc::new(SandboxOrg::new("B"));
        let pair = OrgPair::new(a.clone(), b.clone());
        (a, b, pair)
    }

    #[test]
    fn test_resolves_well_known_names() {
        let registry = OperationRegistry::standard();
        for name in [
            "retrieveUserFromAFlow",
            "retrieveUserFromBFlow",
            "retrieveUserByNameFromBFlow",
            "updateUserInAFlow",
            "deleteOpportunityFromAFlow",
            "deleteOpportunityFromBFlow",
            "retrieveOpportunityFromBFlow",
            "deleteAccountFromAFlow",
            "retrieveAccountFromBFlow",
        ] {
            assert!(registry.resolve(name).is_ok(), "{name} should resolve");
        }
    }

    #[test]
    fn test_unknown_and_mismatched_names_fail_fast() {
        let registry = OperationRegistry::standard();
        assert!(matches!(
            registry.resolve("retrieveLeadFromBFlow"),
            Err(Error::UnknownOperation(_))
        ));
        assert!(matches!(
            registry.retrieve("deleteUserFromAFlow"),
            Err(Error::UnknownOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_retrieve_by_key_and_by_name() {
        let (_a, b, pair) = orgs();
        b.seed(
            ObjectType::User,
            vec![crate::record::a_user()
                .with("Email", "First@email.sk")
                .with("FirstName", "Unique")
                .build()],
        );
        let registry = OperationRegistry::standard();

        let by_key = registry.retrieve("retrieveUserFromBFlow").unwrap();
        let found = by_key.call(&pair, "First@email.sk").await.unwrap().unwrap();
        assert_eq!(found.get_str("FirstName"), Some("Unique"));

        let by_name = registry.retrieve("retrieveUserByNameFromBFlow").unwrap();
        assert!(by_name.call(&pair, "Unique").await.unwrap().is_some());
        assert!(by_name.call(&pair, "Other").await.unwrap().is_none());

        let in_a = registry.retrieve("retrieveUserFromAFlow").unwrap();
        assert!(in_a.call(&pair, "First@email.sk").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_call_json() {
        let (a, _b, pair) = orgs();
        let registry = OperationRegistry::standard();

        let update = registry.resolve("updateAccountInAFlow").unwrap();
        let out = update
            .call_json(&pair, json!({"Name": "Acme", "Industry": "Education"}))
            .await
            .unwrap();
        assert_eq!(out[0]["outcome"], "created");
        let id = out[0]["id"].as_str().unwrap().to_string();

        let retrieve = registry.resolve("retrieveAccountFromAFlow").unwrap();
        let found = retrieve.call_json(&pair, json!("Acme")).await.unwrap();
        assert_eq!(found["fields"]["Industry"], "Education");

        let delete = registry.resolve("deleteAccountFromAFlow").unwrap();
        let out = delete.call_json(&pair, json!([id])).await.unwrap();
        assert_eq!(out[0]["outcome"], "deleted");
        assert!(a.records(ObjectType::Account).is_empty());

        assert!(matches!(
            retrieve.call_json(&pair, json!(42)).await,
            Err(Error::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_removes_synced_records_from_both_orgs() {
        let (a, b, pair) = orgs();
        let db = Database::open_memory().await.unwrap();
        let config = SyncConfig::for_object(ObjectType::Opportunity);
        let engine = SyncEngine::new(config, a.clone(), b.clone(), db).unwrap();

        let ids = a.seed(
            ObjectType::Opportunity,
            (0..3).map(test_opportunity).collect(),
        );
        let job = engine.run_poll(None).await.unwrap();
        assert!(job.is_successful());
        assert_eq!(b.records(ObjectType::Opportunity).len(), 3);

        let created = a.records(ObjectType::Opportunity);
        let registry = OperationRegistry::standard();
        let report = cleanup(&registry, &pair, ObjectType::Opportunity, &created)
            .await
            .unwrap();
        assert_eq!(
            report,
            CleanupReport {
                deleted_in_a: 3,
                deleted_in_b: 3
            }
        );

        let leftover = pair
            .a
            .query(ObjectType::Opportunity, &QueryFilter::by_ids(ids))
            .await
            .unwrap();
        assert!(leftover.is_empty());
        assert!(b.records(ObjectType::Opportunity).is_empty());
    }
}
