use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::date_util::{from_micros, to_micros};
use crate::record::{ObjectType, Record};
use crate::sync::{RecordResult, RecordStatus, SyncJob};

// ── Watermarks ─────────────────────────────────────────────────────

pub fn get_watermark(conn: &Connection, job_name: &str) -> Result<Option<i64>, rusqlite::Error> {
    conn.query_row(
        "SELECT watermark_us FROM watermarks WHERE job_name = ?1",
        params![job_name],
        |row| row.get(0),
    )
    .optional()
}

/// Move the watermark forward. Returns `false` (and writes nothing) when
/// the stored value is already at or past `watermark_us`.
pub fn advance_watermark(
    conn: &Connection,
    job_name: &str,
    watermark_us: i64,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "INSERT INTO watermarks (job_name, watermark_us, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(job_name) DO UPDATE SET
            watermark_us = excluded.watermark_us,
            updated_at = excluded.updated_at
         WHERE excluded.watermark_us > watermarks.watermark_us",
        params![job_name, watermark_us],
    )?;
    Ok(changed > 0)
}

pub fn delete_watermark(conn: &Connection, job_name: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "DELETE FROM watermarks WHERE job_name = ?1",
        params![job_name],
    )?;
    Ok(count > 0)
}

pub fn list_watermarks(conn: &Connection) -> Result<Vec<(String, i64)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT job_name, watermark_us FROM watermarks ORDER BY job_name")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Sync Jobs ──────────────────────────────────────────────────────

pub fn insert_sync_job(conn: &Connection, job: &SyncJob) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_jobs (job_name, trigger_kind, status, started_at_us, ended_at_us, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job.job_name,
            job.trigger.as_str(),
            job.status.as_str(),
            to_micros(job.started_at),
            job.ended_at.map(to_micros),
            job.error,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_sync_job(conn: &Connection, job_id: i64, job: &SyncJob) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_jobs SET
            status = ?2, started_at_us = ?3, ended_at_us = ?4, error_message = ?5,
            created_count = ?6, updated_count = ?7, skipped_count = ?8, failed_count = ?9
         WHERE id = ?1",
        params![
            job_id,
            job.status.as_str(),
            to_micros(job.started_at),
            job.ended_at.map(to_micros),
            job.error,
            job.count(RecordStatus::Created) as i64,
            job.count(RecordStatus::Updated) as i64,
            job.count(RecordStatus::SkippedFiltered) as i64,
            job.count(RecordStatus::Failed) as i64,
        ],
    )?;
    Ok(())
}

/// Replace the stored per-record results of a job.
pub fn replace_record_results(
    conn: &Connection,
    job_id: i64,
    results: &[RecordResult],
) -> Result<(), rusqlite::Error> {
    conn.execute("DELETE FROM record_results WHERE job_id = ?1", params![job_id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO record_results (
            job_id, position, source_id, match_key, status, destination_id, error_message
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for (position, result) in results.iter().enumerate() {
        stmt.execute(params![
            job_id,
            position as i64,
            result.source_id,
            result.key,
            result.status.as_str(),
            result.destination_id,
            result.error,
        ])?;
    }
    Ok(())
}

const JOB_COLUMNS: &str =
    "id, job_name, trigger_kind, status, started_at_us, ended_at_us, error_message";

fn job_from_row(row: &Row<'_>) -> Result<SyncJob, rusqlite::Error> {
    let trigger: String = row.get(2)?;
    let status: String = row.get(3)?;
    let ended_at: Option<i64> = row.get(5)?;
    Ok(SyncJob {
        id: Some(row.get(0)?),
        job_name: row.get(1)?,
        trigger: parse_column(2, &trigger)?,
        status: parse_column(3, &status)?,
        started_at: from_micros(row.get(4)?),
        ended_at: ended_at.map(from_micros),
        results: Vec::new(),
        error: row.get(6)?,
    })
}

fn parse_column<T>(index: usize, value: &str) -> Result<T, rusqlite::Error>
where
    T: std::str::FromStr<Err = crate::error::Error>,
{
    value.parse().map_err(|e: crate::error::Error| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn load_record_results(conn: &Connection, job_id: i64) -> Result<Vec<RecordResult>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT source_id, match_key, status, destination_id, error_message
         FROM record_results WHERE job_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![job_id], |row| {
        let status: String = row.get(2)?;
        Ok(RecordResult {
            source_id: row.get(0)?,
            key: row.get(1)?,
            status: parse_column(2, &status)?,
            destination_id: row.get(3)?,
            error: row.get(4)?,
        })
    })?;
    rows.collect()
}

pub fn get_sync_job(conn: &Connection, job_id: i64) -> Result<Option<SyncJob>, rusqlite::Error> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?1"),
            params![job_id],
            job_from_row,
        )
        .optional()?;
    with_results(conn, job)
}

/// Most recent job recorded under `job_name`, with its results.
pub fn latest_sync_job(conn: &Connection, job_name: &str) -> Result<Option<SyncJob>, rusqlite::Error> {
    let job = conn
        .query_row(
            &format!(
                "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE job_name = ?1 ORDER BY id DESC LIMIT 1"
            ),
            params![job_name],
            job_from_row,
        )
        .optional()?;
    with_results(conn, job)
}

/// Status of the most recent job under `job_name`, without loading results.
pub fn latest_job_status(conn: &Connection, job_name: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT status FROM sync_jobs WHERE job_name = ?1 ORDER BY id DESC LIMIT 1",
        params![job_name],
        |row| row.get(0),
    )
    .optional()
}

/// Recent jobs across all names, newest first, without results.
pub fn recent_sync_jobs(conn: &Connection, limit: u32) -> Result<Vec<SyncJob>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY id DESC LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit], job_from_row)?;
    rows.collect()
}

fn with_results(conn: &Connection, job: Option<SyncJob>) -> Result<Option<SyncJob>, rusqlite::Error> {
    match job {
        Some(mut job) => {
            if let Some(id) = job.id {
                job.results = load_record_results(conn, id)?;
            }
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

// ── Org Records ────────────────────────────────────────────────────

fn record_from_row(row: &Row<'_>) -> Result<Record, rusqlite::Error> {
    let fields_json: String = row.get(1)?;
    let fields: BTreeMap<String, Value> = serde_json::from_str(&fields_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Record {
        id: Some(row.get(0)?),
        last_modified: from_micros(row.get(2)?),
        fields,
    })
}

/// Records of one org and object type, optionally only those modified after
/// `modified_after_us`, in modification order.
pub fn list_org_records(
    conn: &Connection,
    org: &str,
    object: ObjectType,
    modified_after_us: Option<i64>,
) -> Result<Vec<Record>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT record_id, fields_json, last_modified_us FROM org_records
         WHERE org = ?1 AND object_type = ?2 AND (?3 IS NULL OR last_modified_us > ?3)
         ORDER BY last_modified_us, record_id",
    )?;
    let rows = stmt.query_map(params![org, object.as_str(), modified_after_us], record_from_row)?;
    rows.collect()
}

pub fn find_org_record_by_key(
    conn: &Connection,
    org: &str,
    object: ObjectType,
    key: &str,
) -> Result<Option<Record>, rusqlite::Error> {
    conn.query_row(
        "SELECT record_id, fields_json, last_modified_us FROM org_records
         WHERE org = ?1 AND object_type = ?2 AND match_key = ?3
         ORDER BY record_id LIMIT 1",
        params![org, object.as_str(), key],
        record_from_row,
    )
    .optional()
}

/// Allocate the next record id and a modification stamp strictly later
/// than any previously issued for this org and object type.
pub fn next_org_stamp(
    conn: &Connection,
    org: &str,
    object: ObjectType,
    now_us: i64,
    allocate_id: bool,
) -> Result<(Option<String>, i64), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO org_sequences (org, object_type, next_seq, last_stamp_us)
         VALUES (?1, ?2, 1, 0)",
        params![org, object.as_str()],
    )?;
    let (seq, last_stamp): (i64, i64) = conn.query_row(
        "SELECT next_seq, last_stamp_us FROM org_sequences WHERE org = ?1 AND object_type = ?2",
        params![org, object.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    // Millisecond granularity, like the CRM.
    let now_ms = now_us - now_us.rem_euclid(1_000);
    let stamp = if now_ms <= last_stamp { last_stamp + 1_000 } else { now_ms };
    let next_seq = if allocate_id { seq + 1 } else { seq };
    conn.execute(
        "UPDATE org_sequences SET next_seq = ?3, last_stamp_us = ?4
         WHERE org = ?1 AND object_type = ?2",
        params![org, object.as_str(), next_seq, stamp],
    )?;
    let id = allocate_id.then(|| format!("{}{:012}", object.id_prefix(), seq));
    Ok((id, stamp))
}

/// Insert or overwrite one stored record. The record must carry an id.
pub fn put_org_record(
    conn: &Connection,
    org: &str,
    object: ObjectType,
    record: &Record,
) -> Result<(), rusqlite::Error> {
    let fields_json = serde_json::to_string(&record.fields)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO org_records (org, object_type, record_id, match_key, fields_json, last_modified_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(org, object_type, record_id) DO UPDATE SET
            match_key = excluded.match_key,
            fields_json = excluded.fields_json,
            last_modified_us = excluded.last_modified_us",
        params![
            org,
            object.as_str(),
            record.id,
            record.match_value(object),
            fields_json,
            to_micros(record.last_modified),
        ],
    )?;
    Ok(())
}

pub fn delete_org_record(
    conn: &Connection,
    org: &str,
    object: ObjectType,
    record_id: &str,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "DELETE FROM org_records WHERE org = ?1 AND object_type = ?2 AND record_id = ?3",
        params![org, object.as_str(), record_id],
    )?;
    Ok(count > 0)
}
