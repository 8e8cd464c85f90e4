use std::collections::HashMap;
use std::time::Duration;

/// Per-core jiffy counters from one `/proc/stat` reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_time(&self) -> u64 {
        self.idle + self.iowait
    }
}

/// Measures per-core utilization over a short sampling window.
///
/// GPUs are judged by a memory snapshot because GPU jobs hold a chunk of
/// memory for their lifetime; CPUs need a sustained-idle window because a
/// transiently quiet core proves nothing about co-tenancy.
#[derive(Debug)]
pub struct CpuProbe {
    util_threshold: f64,
    total_cpus: usize,
    window_ms: u64,
    interval_ms: u64,
    /// Canned utilization per core for tests; bypasses `/proc/stat`.
    fixed: Option<HashMap<usize, f64>>,
}

/// Gap between the two readings of one utilization sample.
const SAMPLE_GAP: Duration = Duration::from_millis(100);

impl CpuProbe {
    pub fn new(util_threshold: f64, total_cpus: usize, window_ms: u64, interval_ms: u64) -> Self {
        Self {
            util_threshold,
            total_cpus,
            window_ms,
            interval_ms,
            fixed: None,
        }
    }

    /// Replace measured utilization with canned per-core values. Cores
    /// absent from the map read as 0 %.
    pub fn set_fixed(&mut self, utils: HashMap<usize, f64>) {
        self.fixed = Some(utils);
    }

    pub fn util_threshold(&self) -> f64 {
        self.util_threshold
    }

    pub fn total_cpus(&self) -> usize {
        self.total_cpus
    }

    /// One utilization sample for a core, in [0, 100]. `None` when the
    /// stats file is unreadable or the core is missing from it.
    pub async fn utilization(&self, core_id: usize) -> Option<f64> {
        if let Some(fixed) = &self.fixed {
            return Some(*fixed.get(&core_id).unwrap_or(&0.0));
        }

        let first = read_proc_stat()?;
        let before = *first.get(&core_id)?;
        tokio::time::sleep(SAMPLE_GAP).await;
        let second = read_proc_stat()?;
        let after = *second.get(&core_id)?;

        Some(utilization_between(before, after))
    }

    /// `true` iff every sample across the window stays strictly below
    /// the threshold. Short-circuits on the first busy sample; a failed
    /// reading counts as busy. Blocks the caller for up to the window.
    pub async fn sustained_idle(&self, core_id: usize) -> bool {
        let samples = (self.window_ms / self.interval_ms).max(1);

        for i in 0..samples {
            match self.utilization(core_id).await {
                Some(util) if util < self.util_threshold => {}
                _ => return false,
            }
            if i + 1 < samples {
                tokio::time::sleep(Duration::from_millis(self.interval_ms)).await;
            }
        }

        true
    }

    /// Current utilization of every core, for status rendering. Cores
    /// the stats file does not mention read as 0 %.
    pub async fn status(&self) -> Vec<(usize, f64)> {
        let utils: HashMap<usize, f64> = if let Some(fixed) = &self.fixed {
            fixed.clone()
        } else {
            let first = read_proc_stat().unwrap_or_default();
            tokio::time::sleep(SAMPLE_GAP).await;
            let second = read_proc_stat().unwrap_or_default();
            second
                .iter()
                .filter_map(|(core, after)| {
                    first
                        .get(core)
                        .map(|before| (*core, utilization_between(*before, *after)))
                })
                .collect()
        };

        (0..self.total_cpus)
            .map(|core| (core, *utils.get(&core).unwrap_or(&0.0)))
            .collect()
    }
}

/// `(Δtotal − Δidle) / Δtotal · 100`, clamped to [0, 100].
fn utilization_between(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total().saturating_sub(before.total());
    if total == 0 {
        return 0.0;
    }
    let idle = after.idle_time().saturating_sub(before.idle_time());
    let busy = total.saturating_sub(idle);
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

fn read_proc_stat() -> Option<HashMap<usize, CpuTimes>> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    Some(parse_proc_stat(&content))
}

/// Parse per-core `cpuN` lines. The aggregate `cpu` line and anything
/// else is skipped; trailing counter fields missing on old kernels read
/// as 0.
fn parse_proc_stat(content: &str) -> HashMap<usize, CpuTimes> {
    let mut stats = HashMap::new();

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else { continue };
        let Some(core_id) = label
            .strip_prefix("cpu")
            .and_then(|rest| rest.parse::<usize>().ok())
        else {
            continue;
        };

        let mut next = || fields.next().and_then(|f| f.parse().ok()).unwrap_or(0u64);
        let times = CpuTimes {
            user: next(),
            nice: next(),
            system: next(),
            idle: next(),
            iowait: next(),
            irq: next(),
            softirq: next(),
            steal: next(),
        };
        stats.insert(core_id, times);
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_per_core_lines_only() {
        let content = "cpu  100 0 100 800 0 0 0 0\n\
                       cpu0 10 0 10 80 0 0 0 0\n\
                       cpu1 50 0 25 25\n\
                       intr 12345\n";
        let stats = parse_proc_stat(content);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[&0].idle, 80);
        // Short line: missing fields are zero.
        assert_eq!(stats[&1].iowait, 0);
        assert_eq!(stats[&1].total(), 100);
    }

    #[test]
    fn utilization_is_busy_share_of_delta() {
        let before = CpuTimes {
            user: 100,
            idle: 900,
            ..Default::default()
        };
        let after = CpuTimes {
            user: 150,
            idle: 950,
            ..Default::default()
        };
        let util = utilization_between(before, after);
        assert!((util - 50.0).abs() < 1e-9);
    }

    #[test]
    fn zero_delta_reads_as_idle() {
        let times = CpuTimes::default();
        assert_eq!(utilization_between(times, times), 0.0);
    }

    #[tokio::test]
    async fn sample_at_threshold_is_not_idle() {
        let mut probe = CpuProbe::new(40.0, 4, 10, 5);
        probe.set_fixed(HashMap::from([(0, 39.9), (1, 40.0)]));
        assert!(probe.sustained_idle(0).await);
        assert!(!probe.sustained_idle(1).await);
    }
}
