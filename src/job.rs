//! Job parameters as delivered by the queue.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Layout of the `start_time` field, minus the trailing zone.
const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Information needed to run one check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobParams {
    pub check_id: String,
    pub start_time: DateTime<Utc>,
    pub image: String,
    pub target: String,
    /// Timeout in seconds; 0 means the agent default.
    pub timeout: u64,
    pub assettype: String,
    pub options: String,
    pub required_vars: Vec<String>,
    pub metadata: HashMap<String, String>,
}

/// Wire shape of a job message.
#[derive(Deserialize)]
struct RawJobParams {
    check_id: String,
    start_time: Option<String>,
    /// Historical name of `start_time`.
    scan_start_time: Option<String>,
    image: String,
    target: String,
    #[serde(default)]
    timeout: u64,
    #[serde(default)]
    assettype: String,
    #[serde(default)]
    options: String,
    #[serde(default, deserialize_with = "null_as_default")]
    required_vars: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    metadata: HashMap<String, String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl<'de> Deserialize<'de> for JobParams {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawJobParams::deserialize(deserializer)?;
        let start = raw
            .start_time
            .or(raw.scan_start_time)
            .ok_or_else(|| serde::de::Error::missing_field("start_time"))?;
        let start_time = parse_start_time(&start).map_err(serde::de::Error::custom)?;

        Ok(Self {
            check_id: raw.check_id,
            start_time,
            image: raw.image,
            target: raw.target,
            timeout: raw.timeout,
            assettype: raw.assettype,
            options: raw.options,
            required_vars: raw.required_vars,
            metadata: raw.metadata,
        })
    }
}

/// Parse `YYYY-MM-DD HH:MM:SS TZ`.
///
/// `TZ` is either a numeric offset (`+0200`) or an alphabetic abbreviation
/// (`UTC`, `CET`, ...); abbreviations carry no offset information and are
/// read as offset zero.
pub fn parse_start_time(value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    let (datetime, zone) = value
        .rsplit_once(' ')
        .ok_or_else(|| format!("invalid start time {value:?}: missing time zone"))?;

    let naive = NaiveDateTime::parse_from_str(datetime, START_TIME_FORMAT)
        .map_err(|e| format!("invalid start time {value:?}: {e}"))?;

    let offset = if zone.len() >= 3 && zone.chars().all(|c| c.is_ascii_uppercase()) {
        FixedOffset::east_opt(0)
    } else {
        parse_numeric_offset(zone)
    }
    .ok_or_else(|| format!("invalid start time {value:?}: bad time zone {zone:?}"))?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| format!("invalid start time {value:?}"))
}

fn parse_numeric_offset(zone: &str) -> Option<FixedOffset> {
    let (sign, digits) = match zone.split_at_checked(1)? {
        ("+", rest) => (1, rest),
        ("-", rest) => (-1, rest),
        _ => return None,
    };
    let digits = digits.replace(':', "");
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

impl JobParams {
    /// Effective run timeout, falling back to `default` when unset.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        if self.timeout == 0 {
            default
        } else {
            Duration::from_secs(self.timeout)
        }
    }

    /// Checktype name and version derived from the image reference.
    ///
    /// `registry.local:5000/checks/nmap:1.2` yields `("nmap", "1.2")`; an
    /// untagged image is version `latest`.
    pub fn checktype(&self) -> (String, String) {
        let without_digest = self.image.split('@').next().unwrap_or(&self.image);
        let last = without_digest.rsplit('/').next().unwrap_or(without_digest);
        match last.split_once(':') {
            Some((name, tag)) => (name.to_string(), tag.to_string()),
            None => (last.to_string(), "latest".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    const JOB: &str = r#"{
        "check_id": "c1",
        "start_time": "2024-03-05 10:11:12 UTC",
        "image": "registry.local:5000/checks/nmap:1.2",
        "target": "example.com",
        "timeout": 30,
        "assettype": "Hostname",
        "options": "{\"ports\": [80]}",
        "required_vars": ["NMAP_TOKEN"],
        "metadata": {"team": "sec"}
    }"#;

    #[test]
    fn deserializes_full_job() {
        let job: JobParams = serde_json::from_str(JOB).unwrap();
        assert_eq!(job.check_id, "c1");
        assert_eq!(job.start_time.year(), 2024);
        assert_eq!(job.start_time.hour(), 10);
        assert_eq!(job.required_vars, vec!["NMAP_TOKEN"]);
        assert_eq!(job.metadata.get("team").map(String::as_str), Some("sec"));
        assert_eq!(job.effective_timeout(Duration::from_secs(600)), Duration::from_secs(30));
    }

    #[test]
    fn accepts_historical_start_time_field() {
        let job: JobParams = serde_json::from_str(
            r#"{"check_id":"c2","scan_start_time":"2024-03-05 10:11:12 CET",
                "image":"nmap","target":"t","required_vars":null}"#,
        )
        .unwrap();
        assert_eq!(job.start_time.minute(), 11);
        assert!(job.required_vars.is_empty());
        assert_eq!(job.timeout, 0);
    }

    #[test]
    fn rejects_missing_or_malformed_start_time() {
        let missing = r#"{"check_id":"c","image":"i","target":"t"}"#;
        assert!(serde_json::from_str::<JobParams>(missing).is_err());

        let malformed = r#"{"check_id":"c","start_time":"2024-03-05T10:11:12Z","image":"i","target":"t"}"#;
        assert!(serde_json::from_str::<JobParams>(malformed).is_err());
    }

    #[test]
    fn numeric_offsets_are_applied() {
        let ts = parse_start_time("2024-03-05 10:00:00 +0200").unwrap();
        assert_eq!(ts.hour(), 8);
        assert!(parse_start_time("2024-03-05 10:00:00 +2").is_err());
        assert!(parse_start_time("2024-03-05 10:00:00").is_err());
    }

    #[test]
    fn checktype_from_image() {
        let mut job: JobParams = serde_json::from_str(JOB).unwrap();
        assert_eq!(job.checktype(), ("nmap".to_string(), "1.2".to_string()));

        job.image = "vulcan-checks/zap".to_string();
        assert_eq!(job.checktype(), ("zap".to_string(), "latest".to_string()));
    }

    #[test]
    fn zero_timeout_uses_default() {
        let mut job: JobParams = serde_json::from_str(JOB).unwrap();
        job.timeout = 0;
        assert_eq!(job.effective_timeout(Duration::from_secs(42)), Duration::from_secs(42));
    }
}
