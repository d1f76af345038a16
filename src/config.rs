use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::date_util::parse_timestamp;
use crate::error::{Error, Result};
use crate::record::ObjectType;
use crate::sync::retry::RetryPolicy;
use crate::sync::transform::{FieldMapping, InclusionRule, Transformer};
use crate::sync::TriggerKind;

static RE_RELATIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^now(?:\s*-\s*(\d+)\s*(ms|s|m|h|d))?$").unwrap());

/// Where a job's watermark starts when none has been recorded yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WatermarkExpr {
    /// `now` minus an offset, evaluated each time it is read.
    Relative(TimeDelta),
    Fixed(DateTime<Utc>),
}

impl WatermarkExpr {
    /// Parse an expression.
    ///
    /// Supported formats:
    /// - `now`
    /// - `now-10s`, `now-500ms`, `now-5m`, `now-2h`, `now-1d`
    /// - an RFC 3339 timestamp, e.g. `2024-01-01T00:00:00Z`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let lower = s.to_lowercase();
        if let Some(caps) = RE_RELATIVE.captures(&lower) {
            let offset = match (caps.get(1), caps.get(2)) {
                (Some(n), Some(unit)) => {
                    let n: i64 = n
                        .as_str()
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid watermark offset: {s}")))?;
                    match unit.as_str() {
                        "ms" => TimeDelta::try_milliseconds(n),
                        "s" => TimeDelta::try_seconds(n),
                        "m" => TimeDelta::try_minutes(n),
                        "h" => TimeDelta::try_hours(n),
                        _ => TimeDelta::try_days(n),
                    }
                    .ok_or_else(|| Error::Config(format!("watermark offset out of range: {s}")))?
                }
                _ => TimeDelta::zero(),
            };
            if Utc::now().checked_sub_signed(offset).is_none() {
                return Err(Error::Config(format!("watermark offset out of range: {s}")));
            }
            return Ok(WatermarkExpr::Relative(offset));
        }
        parse_timestamp(s)
            .map(WatermarkExpr::Fixed)
            .ok_or_else(|| Error::Config(format!("invalid watermark expression: {s}")))
    }

    pub fn evaluate(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WatermarkExpr::Relative(offset) => now
                .checked_sub_signed(*offset)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            WatermarkExpr::Fixed(ts) => *ts,
        }
    }
}

impl Default for WatermarkExpr {
    fn default() -> Self {
        WatermarkExpr::Relative(TimeDelta::hours(1))
    }
}

impl TryFrom<String> for WatermarkExpr {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        WatermarkExpr::parse(&s)
    }
}

impl From<WatermarkExpr> for String {
    fn from(expr: WatermarkExpr) -> Self {
        expr.to_string()
    }
}

impl fmt::Display for WatermarkExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatermarkExpr::Relative(offset) if offset.is_zero() => f.write_str("now"),
            WatermarkExpr::Relative(offset) => {
                let ms = offset.num_milliseconds();
                if ms % 86_400_000 == 0 {
                    write!(f, "now-{}d", ms / 86_400_000)
                } else if ms % 3_600_000 == 0 {
                    write!(f, "now-{}h", ms / 3_600_000)
                } else if ms % 60_000 == 0 {
                    write!(f, "now-{}m", ms / 60_000)
                } else if ms % 1_000 == 0 {
                    write!(f, "now-{}s", ms / 1_000)
                } else {
                    write!(f, "now-{ms}ms")
                }
            }
            WatermarkExpr::Fixed(ts) => f.write_str(&ts.to_rfc3339()),
        }
    }
}

/// Identity settings applied to records written to the destination org.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationProfile {
    /// Profile assigned to synced users in the destination org.
    pub profile_id: Option<String>,
}

/// Static configuration of one sync job, passed to the engine at
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Defaults to `<object>-sync`.
    pub job_name: Option<String>,
    pub object: ObjectType,
    pub trigger: TriggerKind,
    pub poll_interval_ms: u64,
    pub poll_start_delay_ms: u64,
    pub page_size: usize,
    pub max_concurrent_pages: usize,
    pub retry: RetryPolicy,
    pub watermark_default: WatermarkExpr,
    pub destination: DestinationProfile,
    /// Replaces the object type's default inclusion rules when set.
    pub inclusion_rules: Option<Vec<InclusionRule>>,
    /// Replaces the object type's default field mapping when set.
    pub mapping: Option<FieldMapping>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            job_name: None,
            object: ObjectType::User,
            trigger: TriggerKind::Poll,
            poll_interval_ms: 60_000,
            poll_start_delay_ms: 1_000,
            page_size: 1_000,
            max_concurrent_pages: 4,
            retry: RetryPolicy::default(),
            watermark_default: WatermarkExpr::default(),
            destination: DestinationProfile::default(),
            inclusion_rules: None,
            mapping: None,
        }
    }
}

impl SyncConfig {
    pub fn for_object(object: ObjectType) -> Self {
        Self {
            object,
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: SyncConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn job_name(&self) -> String {
        self.job_name
            .clone()
            .unwrap_or_else(|| format!("{}-sync", self.object))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_start_delay(&self) -> Duration {
        Duration::from_millis(self.poll_start_delay_ms)
    }

    /// The filter/transform tables in effect: configured overrides, or the
    /// object type's defaults.
    pub fn transformer(&self) -> Result<Transformer> {
        let defaults = Transformer::defaults(self.object, &self.destination);
        let rules = self
            .inclusion_rules
            .clone()
            .unwrap_or_else(|| defaults.rules().to_vec());
        let mapping = self
            .mapping
            .clone()
            .unwrap_or_else(|| defaults.mapping().clone());
        Transformer::new(rules, mapping)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be at least 1".into()));
        }
        if self.max_concurrent_pages == 0 {
            return Err(Error::Config("max_concurrent_pages must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be at least 1".into()));
        }
        if self.job_name().trim().is_empty() {
            return Err(Error::Config("job_name must not be empty".into()));
        }
        self.transformer().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_relative_expressions() {
        assert_eq!(WatermarkExpr::parse("now").unwrap(), WatermarkExpr::Relative(TimeDelta::zero()));
        assert_eq!(
            WatermarkExpr::parse("now-10s").unwrap(),
            WatermarkExpr::Relative(TimeDelta::seconds(10))
        );
        assert_eq!(
            WatermarkExpr::parse("NOW - 500ms").unwrap(),
            WatermarkExpr::Relative(TimeDelta::milliseconds(500))
        );
        assert_eq!(
            WatermarkExpr::parse("now-2d").unwrap(),
            WatermarkExpr::Relative(TimeDelta::days(2))
        );
    }

    #[test]
    fn test_parse_fixed_expression() {
        let expr = WatermarkExpr::parse("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(
            expr,
            WatermarkExpr::Fixed(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(WatermarkExpr::parse("yesterday").is_err());
        assert!(WatermarkExpr::parse("now+10s").is_err());
        assert!(WatermarkExpr::parse("now-10y").is_err());
    }

    #[test]
    fn test_parse_rejects_offset_past_representable_time() {
        assert!(matches!(
            WatermarkExpr::parse("now-100000000d"),
            Err(Error::Config(_))
        ));
        let parsed: std::result::Result<SyncConfig, _> =
            serde_json::from_str(r#"{"watermark_default": "now-100000000d"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_evaluate_saturates_instead_of_overflowing() {
        let expr = WatermarkExpr::Relative(TimeDelta::days(100_000_000));
        assert_eq!(expr.evaluate(Utc::now()), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_evaluate() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let expr = WatermarkExpr::parse("now-10s").unwrap();
        assert_eq!(expr.evaluate(now), Utc.with_ymd_and_hms(2025, 6, 1, 11, 59, 50).unwrap());
    }

    #[test]
    fn test_display_round_trips() {
        for s in ["now", "now-10s", "now-5m", "now-2h", "now-1d", "now-1500ms"] {
            let expr = WatermarkExpr::parse(s).unwrap();
            assert_eq!(expr.to_string(), s);
        }
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"object": "opportunity", "page_size": 200, "watermark_default": "now-10s"}"#,
        )
        .unwrap();
        assert_eq!(config.object, ObjectType::Opportunity);
        assert_eq!(config.page_size, 200);
        assert_eq!(config.trigger, TriggerKind::Poll);
        assert_eq!(config.watermark_default, WatermarkExpr::Relative(TimeDelta::seconds(10)));
        assert_eq!(config.job_name(), "opportunity-sync");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_watermark() {
        let parsed: std::result::Result<SyncConfig, _> =
            serde_json::from_str(r#"{"watermark_default": "last tuesday"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_page_size() {
        let config = SyncConfig {
            page_size: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(
            &path,
            r#"{"job_name": "users-a-to-b", "trigger": "push", "destination": {"profile_id": "00e80000001CDZBAA4"}}"#,
        )
        .unwrap();

        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.job_name(), "users-a-to-b");
        assert_eq!(config.trigger, TriggerKind::Push);
        assert_eq!(config.destination.profile_id.as_deref(), Some("00e80000001CDZBAA4"));
    }
}
