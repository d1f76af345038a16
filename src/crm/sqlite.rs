use async_trait::async_trait;
use chrono::Utc;

use super::{merge_fields, CrmError, CrmSystem, DeleteOutcome, QueryFilter, UpsertOutcome};
use crate::date_util::{from_micros, to_micros};
use crate::record::{ObjectType, Record};
use crate::storage::{repository, Database};

/// A CRM org whose records live in the local SQLite database, so the engine
/// can be driven end to end without a remote system. Several orgs share one
/// database, separated by name.
#[derive(Clone)]
pub struct SqliteOrg {
    db: Database,
    name: String,
}

impl SqliteOrg {
    pub fn new(db: Database, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }
}

fn transport<E: std::fmt::Display>(e: E) -> CrmError {
    CrmError::Transport(e.to_string())
}

#[async_trait]
impl CrmSystem for SqliteOrg {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, object: ObjectType, filter: &QueryFilter) -> Result<Vec<Record>, CrmError> {
        let org = self.name.clone();
        let after = filter.modified_after.map(to_micros);
        let records = self
            .db
            .reader()
            .call(move |conn| repository::list_org_records(conn, &org, object, after))
            .await
            .map_err(transport)?;
        Ok(records.into_iter().filter(|r| filter.matches(r)).collect())
    }

    async fn upsert_batch(
        &self,
        object: ObjectType,
        records: &[Record],
    ) -> Result<Vec<UpsertOutcome>, CrmError> {
        let org = self.name.clone();
        let records = records.to_vec();
        self.db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut outcomes = Vec::with_capacity(records.len());
                for record in &records {
                    let key = match record.match_value(object) {
                        Some(key) => key.to_string(),
                        None => {
                            outcomes.push(UpsertOutcome::Failed {
                                message: format!("required field {} is missing", object.match_key()),
                            });
                            continue;
                        }
                    };
                    let now = to_micros(Utc::now());
                    match repository::find_org_record_by_key(&tx, &org, object, &key)? {
                        Some(mut existing) => {
                            let (_, stamp) = repository::next_org_stamp(&tx, &org, object, now, false)?;
                            merge_fields(&mut existing, record);
                            existing.last_modified = from_micros(stamp);
                            repository::put_org_record(&tx, &org, object, &existing)?;
                            outcomes.push(UpsertOutcome::Updated {
                                id: existing.id.clone().unwrap_or_default(),
                            });
                        }
                        None => {
                            let (id, stamp) = repository::next_org_stamp(&tx, &org, object, now, true)?;
                            let mut fresh = record.clone();
                            fresh.id = id.clone();
                            fresh.last_modified = from_micros(stamp);
                            repository::put_org_record(&tx, &org, object, &fresh)?;
                            outcomes.push(UpsertOutcome::Created {
                                id: id.unwrap_or_default(),
                            });
                        }
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(outcomes)
            })
            .await
            .map_err(transport)
    }

    async fn delete_batch(
        &self,
        object: ObjectType,
        ids: &[String],
    ) -> Result<Vec<DeleteOutcome>, CrmError> {
        let org = self.name.clone();
        let ids = ids.to_vec();
        self.db
            .writer()
            .call(move |conn| {
                let mut outcomes = Vec::with_capacity(ids.len());
                for id in ids {
                    if repository::delete_org_record(conn, &org, object, &id)? {
                        outcomes.push(DeleteOutcome::Deleted { id });
                    } else {
                        outcomes.push(DeleteOutcome::Failed {
                            id,
                            message: "entity is deleted or does not exist".into(),
                        });
                    }
                }
                Ok::<_, rusqlite::Error>(outcomes)
            })
            .await
            .map_err(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::a_user;

    #[tokio::test]
    async fn test_orgs_are_isolated_by_name() {
        let db = Database::open_memory().await.unwrap();
        let a = SqliteOrg::new(db.clone(), "A");
        let b = SqliteOrg::new(db, "B");

        let user = a_user().with("Email", "a@b.com").with("IsActive", true).build();
        a.upsert_batch(ObjectType::User, &[user]).await.unwrap();

        assert_eq!(a.query(ObjectType::User, &QueryFilter::default()).await.unwrap().len(), 1);
        assert!(b.query(ObjectType::User, &QueryFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_matches_by_key_and_bumps_timestamp() {
        let db = Database::open_memory().await.unwrap();
        let org = SqliteOrg::new(db, "B");

        let created = org
            .upsert_batch(
                ObjectType::User,
                &[a_user().with("Email", "a@b.com").with("Title", "Dev").build()],
            )
            .await
            .unwrap();
        let id = match &created[0] {
            UpsertOutcome::Created { id } => id.clone(),
            other => panic!("expected create, got {other:?}"),
        };
        let before = org.query(ObjectType::User, &QueryFilter::default()).await.unwrap()[0].last_modified;

        let updated = org
            .upsert_batch(ObjectType::User, &[a_user().with("Email", "a@b.com").with("Title", "Lead").build()])
            .await
            .unwrap();
        assert_eq!(updated[0], UpsertOutcome::Updated { id: id.clone() });

        let changed = org.query(ObjectType::User, &QueryFilter::modified_after(before)).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].get_str("Title"), Some("Lead"));
        assert_eq!(changed[0].id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_query_applies_field_criteria() {
        let db = Database::open_memory().await.unwrap();
        let org = SqliteOrg::new(db, "A");
        org.upsert_batch(
            ObjectType::User,
            &[
                a_user().with("Email", "on@b.com").with("IsActive", true).build(),
                a_user().with("Email", "off@b.com").with("IsActive", false).build(),
            ],
        )
        .await
        .unwrap();

        let active = org
            .query(ObjectType::User, &QueryFilter::field_equals("IsActive", true))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].get_str("Email"), Some("on@b.com"));
    }

    #[tokio::test]
    async fn test_delete_batch() {
        let db = Database::open_memory().await.unwrap();
        let org = SqliteOrg::new(db, "A");
        let outcomes = org
            .upsert_batch(ObjectType::User, &[a_user().with("Email", "a@b.com").build()])
            .await
            .unwrap();
        let id = match &outcomes[0] {
            UpsertOutcome::Created { id } => id.clone(),
            other => panic!("expected create, got {other:?}"),
        };

        let deleted = org.delete_batch(ObjectType::User, &[id.clone()]).await.unwrap();
        assert_eq!(deleted, vec![DeleteOutcome::Deleted { id: id.clone() }]);
        let again = org.delete_batch(ObjectType::User, &[id]).await.unwrap();
        assert!(matches!(again[0], DeleteOutcome::Failed { .. }));
    }
}
