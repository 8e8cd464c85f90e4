use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Server configuration: resource thresholds, scheduling cadence, host
/// topology and filesystem paths.
///
/// Defaults describe a dual-socket box with 64 cores and 8 GPUs split
/// into two affinity groups. Other topologies are configured via
/// `total_cpus`, `total_gpus` and `gpus_per_group`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GPU is busy when its used memory exceeds this (strictly greater).
    pub gpu_memory_threshold_mb: u64,
    /// CPU is busy when a utilization sample reaches this percentage.
    pub cpu_util_threshold: f64,
    /// A core must stay below the threshold for this long to count as idle.
    pub cpu_check_duration_ms: u64,
    /// Sampling cadence within the sustained-idle window.
    pub cpu_check_interval_ms: u64,

    pub scheduling_interval_ms: u64,
    pub process_check_interval_ms: u64,

    pub total_cpus: usize,
    pub total_gpus: usize,
    /// GPUs `[0, gpus_per_group)` pair with the lower half of the CPU
    /// range (group 1); the rest pair with the upper half (group 2).
    pub gpus_per_group: usize,

    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,

    pub enable_logging: bool,
    /// Write per-job output to `workdir/job.log` when the task names no
    /// log file of its own.
    pub enable_job_log: bool,

    pub excluded_cpus: Vec<usize>,
    pub excluded_gpus: Vec<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gpu_memory_threshold_mb: 2000,
            cpu_util_threshold: 40.0,
            cpu_check_duration_ms: 3000,
            cpu_check_interval_ms: 500,
            scheduling_interval_ms: 1000,
            process_check_interval_ms: 500,
            total_cpus: 64,
            total_gpus: 8,
            gpus_per_group: 4,
            socket_path: default_socket_path(),
            data_dir: default_data_dir(),
            log_dir: PathBuf::new(),
            enable_logging: false,
            enable_job_log: false,
            excluded_cpus: Vec::new(),
            excluded_gpus: Vec::new(),
        }
    }
}

/// `/tmp/myqueue_<user>.sock`
pub fn default_socket_path() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/myqueue_{user}.sock"))
}

/// `~/.myqueue/<hostname>`
pub fn default_data_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    home.join(".myqueue").join(host)
}

impl Config {
    /// Affinity group of a GPU device: 1 for the first `gpus_per_group`
    /// devices, 2 for the rest.
    pub fn gpu_affinity_group(&self, gpu_id: usize) -> u8 {
        if gpu_id < self.gpus_per_group {
            1
        } else {
            2
        }
    }

    /// Half-open CPU core range for an affinity group. Group 0 spans all
    /// cores.
    pub fn cpu_range_for_group(&self, group: u8) -> (usize, usize) {
        let half = self.total_cpus / 2;
        match group {
            1 => (0, half),
            2 => (half, self.total_cpus),
            _ => (0, self.total_cpus),
        }
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Persist to `<data_dir>/config.json`, creating the directory.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(self.config_file(), json)?;
        Ok(())
    }

    /// Load from `<data_dir>/config.json`. A missing file yields the
    /// defaults with `data_dir` set; a malformed file is an error for
    /// the caller to surface.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("config.json");
        if !path.exists() {
            let mut config = Self::default();
            config.data_dir = data_dir.to_path_buf();
            return Ok(config);
        }
        let content = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }
}

/// Parse a comma-separated list of ids ("0,3,17"); invalid entries are
/// skipped.
pub fn parse_id_list(s: &str) -> Vec<usize> {
    s.split(',')
        .filter_map(|item| item.trim().parse().ok())
        .collect()
}
