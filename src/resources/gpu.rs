use std::process::Stdio;

use tokio::process::Command;

/// One device row from a memory snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub device_id: usize,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

/// Snapshots per-device memory usage by shelling out to `nvidia-smi`.
///
/// The probe never fails: if the tool is absent, exits non-zero, or
/// prints garbage, every device is reported at threshold + 1 so nothing
/// gets scheduled on GPUs until the tool is restored. Missing devices
/// must be treated as busy by consumers, not as available.
#[derive(Debug)]
pub struct GpuProbe {
    threshold_mb: u64,
    total_gpus: usize,
    /// Canned snapshot for tests; bypasses the tool entirely.
    fixed: Option<Vec<GpuInfo>>,
}

impl GpuProbe {
    pub fn new(threshold_mb: u64, total_gpus: usize) -> Self {
        Self {
            threshold_mb,
            total_gpus,
            fixed: None,
        }
    }

    /// Replace measured data with a canned snapshot.
    pub fn set_fixed(&mut self, data: Vec<GpuInfo>) {
        self.fixed = Some(data);
    }

    pub fn threshold_mb(&self) -> u64 {
        self.threshold_mb
    }

    pub fn total_gpus(&self) -> usize {
        self.total_gpus
    }

    /// One `{device, used, total}` tuple per device.
    pub async fn snapshot(&self) -> Vec<GpuInfo> {
        if let Some(fixed) = &self.fixed {
            return fixed.clone();
        }

        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                parse_query_output(&String::from_utf8_lossy(&output.stdout))
            }
            _ => self.all_busy(),
        }
    }

    /// `true` when the device's used memory strictly exceeds the
    /// threshold, or the device is missing from the snapshot.
    pub async fn is_over(&self, device_id: usize) -> bool {
        let snapshot = self.snapshot().await;
        match snapshot.iter().find(|g| g.device_id == device_id) {
            Some(gpu) => gpu.memory_used_mb > self.threshold_mb,
            None => true,
        }
    }

    /// Synthesized snapshot with every device over threshold. Used when
    /// the query tool is unavailable.
    fn all_busy(&self) -> Vec<GpuInfo> {
        (0..self.total_gpus)
            .map(|device_id| GpuInfo {
                device_id,
                memory_used_mb: self.threshold_mb + 1,
                memory_total_mb: 0,
            })
            .collect()
    }
}

/// Parse `index, memory.used, memory.total` CSV lines. Malformed lines
/// are skipped.
fn parse_query_output(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let device_id = fields.next()?.parse().ok()?;
            let memory_used_mb = fields.next()?.parse().ok()?;
            let memory_total_mb = fields.next()?.parse().ok()?;
            Some(GpuInfo {
                device_id,
                memory_used_mb,
                memory_total_mb,
            })
        })
        .collect()
}
