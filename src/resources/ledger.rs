use std::collections::{BTreeSet, HashMap};

use rand::seq::SliceRandom;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::resources::cpu::CpuProbe;
use crate::resources::gpu::{GpuInfo, GpuProbe};

/// The exact resource sets a successful reservation handed out, each in
/// ascending order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Allocation {
    pub cpus: Vec<usize>,
    pub gpus: Vec<usize>,
}

/// A device row combined with ledger state, for status rendering.
#[derive(Debug, Clone)]
pub struct GpuStatus {
    pub device_id: usize,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub busy: bool,
    pub reserved: bool,
}

/// A core row combined with ledger state, for status rendering.
#[derive(Debug, Clone)]
pub struct CpuStatus {
    pub core_id: usize,
    pub utilization: f64,
    pub affinity_group: u8,
    pub reserved: bool,
}

/// Authoritative map of reserved CPUs and GPUs, combined with the probes
/// to answer availability.
///
/// One mutex guards probes, reserved sets and excluded sets, and it is
/// held across the sustained-idle waits inside [`reserve`]: a candidate
/// core must be marked reserved before the next candidate is examined,
/// or two concurrent reservations converge on the same core. The
/// dispatch loop places one task per tick for the same reason.
///
/// [`reserve`]: ResourceLedger::reserve
#[derive(Debug)]
pub struct ResourceLedger {
    config: Config,
    inner: Mutex<LedgerInner>,
}

#[derive(Debug)]
struct LedgerInner {
    gpu: GpuProbe,
    cpu: CpuProbe,
    reserved_cpus: BTreeSet<usize>,
    reserved_gpus: BTreeSet<usize>,
    excluded_cpus: BTreeSet<usize>,
    excluded_gpus: BTreeSet<usize>,
}

impl ResourceLedger {
    pub fn new(config: &Config) -> Self {
        let gpu = GpuProbe::new(config.gpu_memory_threshold_mb, config.total_gpus);
        let cpu = CpuProbe::new(
            config.cpu_util_threshold,
            config.total_cpus,
            config.cpu_check_duration_ms,
            config.cpu_check_interval_ms,
        );
        Self {
            config: config.clone(),
            inner: Mutex::new(LedgerInner {
                gpu,
                cpu,
                reserved_cpus: BTreeSet::new(),
                reserved_gpus: BTreeSet::new(),
                excluded_cpus: config.excluded_cpus.iter().copied().collect(),
                excluded_gpus: config.excluded_gpus.iter().copied().collect(),
            }),
        }
    }

    /// Atomically reserve `ncpu` cores and `ngpu` devices, or the exact
    /// explicit sets when given. All-or-nothing: on any shortfall every
    /// partial reservation is rolled back and the ledger is unchanged.
    ///
    /// GPUs are placed first (a cheap snapshot) which pins the affinity
    /// group; CPU candidates are then shuffled and each must pass the
    /// sustained-idle check, costing up to the probe window per core.
    pub async fn reserve(
        &self,
        ncpu: usize,
        ngpu: usize,
        specific_cpus: &[usize],
        specific_gpus: &[usize],
    ) -> Option<Allocation> {
        let mut inner = self.inner.lock().await;

        // GPU phase: verify the explicit set, or take the first ngpu
        // available devices in ascending order.
        let gpus: Vec<usize> = if !specific_gpus.is_empty() {
            for &gpu_id in specific_gpus {
                if inner.excluded_gpus.contains(&gpu_id)
                    || inner.reserved_gpus.contains(&gpu_id)
                    || inner.gpu.is_over(gpu_id).await
                {
                    return None;
                }
            }
            let mut gpus = specific_gpus.to_vec();
            gpus.sort_unstable();
            gpus.dedup();
            gpus
        } else if ngpu > 0 {
            let available = Self::available_gpus_locked(&inner).await;
            let gpus: Vec<usize> = available
                .into_iter()
                .filter(|id| !inner.excluded_gpus.contains(id))
                .take(ngpu)
                .collect();
            if gpus.len() < ngpu {
                return None;
            }
            gpus
        } else {
            Vec::new()
        };
        for &gpu_id in &gpus {
            inner.reserved_gpus.insert(gpu_id);
        }

        let group = self.affinity_group_of(&gpus);

        // CPU phase. Each auto-placed candidate is reserved before the
        // next one is probed.
        let cpus: Vec<usize> = if !specific_cpus.is_empty() {
            let mut cpus = specific_cpus.to_vec();
            cpus.sort_unstable();
            cpus.dedup();
            for &core_id in &cpus {
                if inner.excluded_cpus.contains(&core_id)
                    || inner.reserved_cpus.contains(&core_id)
                    || !inner.cpu.sustained_idle(core_id).await
                {
                    Self::rollback(&mut inner, &[], &gpus);
                    return None;
                }
            }
            for &core_id in &cpus {
                inner.reserved_cpus.insert(core_id);
            }
            cpus
        } else {
            let (start, end) = self.config.cpu_range_for_group(group);
            let mut candidates: Vec<usize> = (start..end)
                .filter(|id| {
                    !inner.reserved_cpus.contains(id) && !inner.excluded_cpus.contains(id)
                })
                .collect();
            {
                let mut rng = rand::thread_rng();
                candidates.shuffle(&mut rng);
            }

            let mut picked = Vec::with_capacity(ncpu);
            for core_id in candidates {
                if picked.len() >= ncpu {
                    break;
                }
                if inner.cpu.sustained_idle(core_id).await {
                    picked.push(core_id);
                    inner.reserved_cpus.insert(core_id);
                }
            }
            if picked.len() < ncpu {
                Self::rollback(&mut inner, &picked, &gpus);
                return None;
            }
            picked.sort_unstable();
            picked
        };

        Some(Allocation { cpus, gpus })
    }

    /// Return resources to the pool. Idempotent; unheld ids are ignored.
    pub async fn release(&self, cpus: &[usize], gpus: &[usize]) {
        let mut inner = self.inner.lock().await;
        Self::rollback(&mut inner, cpus, gpus);
    }

    /// Mark resources reserved without probing, for startup recovery of
    /// tasks that survived a daemon restart.
    pub async fn re_mark(&self, cpus: &[usize], gpus: &[usize]) {
        let mut inner = self.inner.lock().await;
        inner.reserved_cpus.extend(cpus.iter().copied());
        inner.reserved_gpus.extend(gpus.iter().copied());
    }

    /// Devices neither reserved nor over threshold, ascending.
    pub async fn available_gpus(&self) -> Vec<usize> {
        let inner = self.inner.lock().await;
        Self::available_gpus_locked(&inner).await
    }

    /// Unreserved cores within the affinity group's range, ascending.
    /// No idleness check; that is per-candidate work for the caller.
    pub async fn available_cpus(&self, group: u8) -> Vec<usize> {
        let inner = self.inner.lock().await;
        let (start, end) = self.config.cpu_range_for_group(group);
        (start..end)
            .filter(|id| !inner.reserved_cpus.contains(id))
            .collect()
    }

    pub async fn reserved_cpus(&self) -> Vec<usize> {
        self.inner.lock().await.reserved_cpus.iter().copied().collect()
    }

    pub async fn reserved_gpus(&self) -> Vec<usize> {
        self.inner.lock().await.reserved_gpus.iter().copied().collect()
    }

    /// Snapshot every device with ledger state attached.
    pub async fn gpu_status(&self) -> Vec<GpuStatus> {
        let inner = self.inner.lock().await;
        let snapshot = inner.gpu.snapshot().await;
        let threshold = inner.gpu.threshold_mb();
        (0..self.config.total_gpus)
            .map(|device_id| {
                let row = snapshot.iter().find(|g| g.device_id == device_id);
                GpuStatus {
                    device_id,
                    memory_used_mb: row.map_or(threshold + 1, |g| g.memory_used_mb),
                    memory_total_mb: row.map_or(0, |g| g.memory_total_mb),
                    busy: row.map_or(true, |g| g.memory_used_mb > threshold),
                    reserved: inner.reserved_gpus.contains(&device_id),
                }
            })
            .collect()
    }

    /// Sample every core with ledger state attached.
    pub async fn cpu_status(&self) -> Vec<CpuStatus> {
        let inner = self.inner.lock().await;
        let half = self.config.total_cpus / 2;
        inner
            .cpu
            .status()
            .await
            .into_iter()
            .map(|(core_id, utilization)| CpuStatus {
                core_id,
                utilization,
                affinity_group: if core_id < half { 1 } else { 2 },
                reserved: inner.reserved_cpus.contains(&core_id),
            })
            .collect()
    }

    /// Affinity group of a GPU set: the common group, 0 when the set is
    /// empty, and 0 when an explicit set spans both groups (the CPU
    /// stage may then pick from either range).
    fn affinity_group_of(&self, gpus: &[usize]) -> u8 {
        let mut groups = gpus.iter().map(|&id| self.config.gpu_affinity_group(id));
        let Some(first) = groups.next() else {
            return 0;
        };
        if groups.all(|g| g == first) {
            first
        } else {
            0
        }
    }

    async fn available_gpus_locked(inner: &LedgerInner) -> Vec<usize> {
        let snapshot = inner.gpu.snapshot().await;
        let threshold = inner.gpu.threshold_mb();
        (0..inner.gpu.total_gpus())
            .filter(|id| {
                if inner.reserved_gpus.contains(id) {
                    return false;
                }
                // Missing from the snapshot means busy.
                snapshot
                    .iter()
                    .find(|g| g.device_id == *id)
                    .map_or(false, |g| g.memory_used_mb <= threshold)
            })
            .collect()
    }

    fn rollback(inner: &mut LedgerInner, cpus: &[usize], gpus: &[usize]) {
        for core_id in cpus {
            inner.reserved_cpus.remove(core_id);
        }
        for gpu_id in gpus {
            inner.reserved_gpus.remove(gpu_id);
        }
    }

    // Test hooks: replace measured probe data with canned values.

    pub async fn set_fixed_gpu_data(&self, data: Vec<GpuInfo>) {
        self.inner.lock().await.gpu.set_fixed(data);
    }

    pub async fn set_fixed_cpu_utils(&self, utils: HashMap<usize, f64>) {
        self.inner.lock().await.cpu.set_fixed(utils);
    }
}
