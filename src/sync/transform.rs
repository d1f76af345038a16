use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DestinationProfile;
use crate::error::{Error, Result};
use crate::record::{ObjectType, Record};

/// Fields owned by the source org that must never be written to the
/// destination.
pub const SYSTEM_FIELDS: &[&str] = &[
    "Id",
    "LastModifiedDate",
    "SystemModstamp",
    "CreatedDate",
    "CreatedById",
    "LastModifiedById",
    "type",
];

/// A record is synced only if `field` is present and equal to `equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InclusionRule {
    pub field: String,
    pub equals: Value,
}

impl InclusionRule {
    pub fn new(field: impl Into<String>, equals: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            equals: equals.into(),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.get(&self.field) == Some(&self.equals)
    }
}

/// Static source-to-destination field mapping. Applied in order: drop,
/// rename, then constant overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub drop: BTreeSet<String>,
    pub rename: BTreeMap<String, String>,
    pub set: BTreeMap<String, Value>,
}

impl FieldMapping {
    pub fn dropping_system_fields() -> Self {
        Self {
            drop: SYSTEM_FIELDS.iter().map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }
}

/// Inclusion rules plus field mapping for one object type.
///
/// Construction rejects tables whose output would change on a second pass,
/// so `apply(apply(x)) == apply(x)` always holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformer {
    rules: Vec<InclusionRule>,
    mapping: FieldMapping,
}

impl Transformer {
    pub fn new(rules: Vec<InclusionRule>, mapping: FieldMapping) -> Result<Self> {
        validate(&rules, &mapping)?;
        Ok(Self { rules, mapping })
    }

    /// Built-in tables: active users only; system fields never leave the
    /// source; synced users get the destination profile when one is set.
    pub fn defaults(object: ObjectType, destination: &DestinationProfile) -> Self {
        let mut mapping = FieldMapping::dropping_system_fields();
        let rules = match object {
            ObjectType::User => {
                if let Some(ref profile_id) = destination.profile_id {
                    mapping
                        .set
                        .insert("ProfileId".to_string(), Value::String(profile_id.clone()));
                }
                vec![InclusionRule::new("IsActive", true)]
            }
            ObjectType::Opportunity | ObjectType::Account => Vec::new(),
        };
        Self { rules, mapping }
    }

    pub fn rules(&self) -> &[InclusionRule] {
        &self.rules
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn includes(&self, record: &Record) -> bool {
        self.rules.iter().all(|rule| rule.matches(record))
    }

    /// Rewrite one record's fields. Identifier and timestamp carry over.
    pub fn transform(&self, record: &Record) -> Record {
        let mut fields: BTreeMap<String, Value> = record
            .fields
            .iter()
            .filter(|(name, _)| !self.mapping.drop.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        for (from, to) in &self.mapping.rename {
            if let Some(value) = fields.remove(from) {
                fields.insert(to.clone(), value);
            }
        }
        for (name, value) in &self.mapping.set {
            fields.insert(name.clone(), value.clone());
        }
        Record {
            id: record.id.clone(),
            last_modified: record.last_modified,
            fields,
        }
    }

    /// Included records, transformed, in input order.
    pub fn apply(&self, records: &[Record]) -> Vec<Record> {
        self.split(records).0
    }

    /// `(included and transformed, excluded as given)`, both in input order.
    pub fn split(&self, records: &[Record]) -> (Vec<Record>, Vec<Record>) {
        let mut kept = Vec::with_capacity(records.len());
        let mut skipped = Vec::new();
        for record in records {
            if self.includes(record) {
                kept.push(self.transform(record));
            } else {
                skipped.push(record.clone());
            }
        }
        (kept, skipped)
    }
}

fn validate(rules: &[InclusionRule], mapping: &FieldMapping) -> Result<()> {
    let targets: BTreeSet<&String> = mapping.rename.values().collect();
    if targets.len() != mapping.rename.len() {
        return Err(Error::Config("two renames share a target field".into()));
    }
    for (from, to) in &mapping.rename {
        if targets.contains(from) {
            return Err(Error::Config(format!("{from} is both renamed and a rename target")));
        }
        if mapping.set.contains_key(from) {
            return Err(Error::Config(format!("{from} is both renamed and set to a constant")));
        }
        if mapping.drop.contains(from) || mapping.drop.contains(to) {
            return Err(Error::Config(format!("rename {from} -> {to} touches a dropped field")));
        }
    }
    if let Some(name) = mapping.set.keys().find(|k| mapping.drop.contains(*k)) {
        return Err(Error::Config(format!("{name} is both dropped and set to a constant")));
    }
    for rule in rules {
        let field = &rule.field;
        if mapping.drop.contains(field)
            || mapping.rename.contains_key(field)
            || targets.contains(field)
            || mapping.set.contains_key(field)
        {
            return Err(Error::Config(format!(
                "inclusion rule field {field} must pass through the mapping unchanged"
            )));
        }
    }
    Ok(())
}
