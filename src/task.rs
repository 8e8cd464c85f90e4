use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A queued unit of work: a script run in a working directory with a
/// CPU/GPU reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub script_path: PathBuf,
    pub workdir: PathBuf,
    pub ncpu: usize,
    pub ngpu: usize,
    /// Non-empty overrides count-based allocation; the scheduler must
    /// use exactly this set.
    pub specific_cpus: Vec<usize>,
    pub specific_gpus: Vec<usize>,
    /// Relative file name for per-job output in `workdir`; empty means
    /// no per-job log.
    #[serde(default)]
    pub log_file: String,
    pub allocated_cpus: Vec<usize>,
    pub allocated_gpus: Vec<usize>,
    pub status: TaskStatus,
    pub pid: i32,
    pub exit_code: Option<i32>,
    #[serde(with = "iso_seconds")]
    pub submit_time: DateTime<Utc>,
    #[serde(with = "iso_seconds_opt")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(with = "iso_seconds_opt")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: u64, req: SubmitRequest) -> Self {
        Self {
            id,
            script_path: req.script_path,
            workdir: req.workdir,
            ncpu: req.ncpu,
            ngpu: req.ngpu,
            specific_cpus: req.specific_cpus,
            specific_gpus: req.specific_gpus,
            log_file: req.log_file,
            allocated_cpus: Vec::new(),
            allocated_gpus: Vec::new(),
            status: TaskStatus::Pending,
            pid: 0,
            exit_code: None,
            submit_time: truncate_to_seconds(Utc::now()),
            start_time: None,
            end_time: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds from start to end, or to now while still running.
    pub fn duration_seconds(&self) -> i64 {
        match self.start_time {
            Some(start) => {
                let end = self.end_time.unwrap_or_else(Utc::now);
                (end - start).num_seconds()
            }
            None => 0,
        }
    }
}

/// Submission parameters as received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub script_path: PathBuf,
    pub workdir: PathBuf,
    #[serde(default = "one")]
    pub ncpu: usize,
    #[serde(default = "one")]
    pub ngpu: usize,
    #[serde(default)]
    pub specific_cpus: Vec<usize>,
    #[serde(default)]
    pub specific_gpus: Vec<usize>,
    #[serde(default)]
    pub log_file: String,
}

fn one() -> usize {
    1
}

/// Timestamps are exchanged at second precision; drop sub-second parts
/// so a save/load round-trip compares equal.
pub fn truncate_to_seconds(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(dt.timestamp(), 0).unwrap_or(dt)
}

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

mod iso_seconds {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::ISO_FORMAT;

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.format(ISO_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let naive = NaiveDateTime::parse_from_str(&s, ISO_FORMAT)
            .map_err(serde::de::Error::custom)?;
        Ok(naive.and_utc())
    }
}

mod iso_seconds_opt {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::ISO_FORMAT;

    pub fn serialize<S>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match dt {
            Some(dt) => serializer.serialize_str(&dt.format(ISO_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => {
                let naive = NaiveDateTime::parse_from_str(&s, ISO_FORMAT)
                    .map_err(serde::de::Error::custom)?;
                Ok(Some(naive.and_utc()))
            }
            None => Ok(None),
        }
    }
}
