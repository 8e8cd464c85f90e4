use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use myqueue::config::Config;
use myqueue::resources::{GpuInfo, ResourceLedger};

/// Millisecond-scale probe windows so sustained-idle checks finish fast.
fn test_config() -> Config {
    Config {
        cpu_check_duration_ms: 10,
        cpu_check_interval_ms: 5,
        ..Config::default()
    }
}

fn gpu(device_id: usize, memory_used_mb: u64) -> GpuInfo {
    GpuInfo {
        device_id,
        memory_used_mb,
        memory_total_mb: 16384,
    }
}

/// All 8 devices lightly used, all 64 cores idle.
async fn idle_ledger() -> ResourceLedger {
    let ledger = ResourceLedger::new(&test_config());
    ledger
        .set_fixed_gpu_data((0..8).map(|id| gpu(id, 100)).collect())
        .await;
    ledger.set_fixed_cpu_utils(HashMap::new()).await;
    ledger
}

fn busy_cpus(util: f64) -> HashMap<usize, f64> {
    (0..64).map(|core| (core, util)).collect()
}

#[tokio::test]
async fn test_auto_allocation_takes_lowest_gpus_first() {
    let ledger = idle_ledger().await;

    let alloc = ledger.reserve(2, 1, &[], &[]).await.unwrap();
    assert_eq!(alloc.gpus, vec![0]);
    assert_eq!(alloc.cpus.len(), 2);
    // GPU 0 is in group 1, so the CPUs come from the lower half.
    assert!(alloc.cpus.iter().all(|&c| c < 32));

    let next = ledger.reserve(0, 1, &[], &[]).await.unwrap();
    assert_eq!(next.gpus, vec![1]);
}

#[tokio::test]
async fn test_gpu_over_threshold_switches_affinity_group() {
    let ledger = ResourceLedger::new(&test_config());
    let mut data: Vec<GpuInfo> = (0..4).map(|id| gpu(id, 3000)).collect();
    data.extend((4..8).map(|id| gpu(id, 100)));
    ledger.set_fixed_gpu_data(data).await;
    ledger.set_fixed_cpu_utils(HashMap::new()).await;

    let alloc = ledger.reserve(4, 1, &[], &[]).await.unwrap();
    assert_eq!(alloc.gpus, vec![4]);
    assert_eq!(alloc.cpus.len(), 4);
    assert!(alloc.cpus.iter().all(|&c| (32..64).contains(&c)));
}

#[tokio::test]
async fn test_gpu_at_threshold_is_still_available() {
    let ledger = ResourceLedger::new(&test_config());
    // Exactly at the 2000 MB threshold: not busy. One over: busy.
    ledger
        .set_fixed_gpu_data(vec![gpu(0, 2000), gpu(1, 2001)])
        .await;
    ledger.set_fixed_cpu_utils(HashMap::new()).await;

    assert_eq!(ledger.available_gpus().await, vec![0]);
}

#[tokio::test]
async fn test_cpu_shortfall_rolls_back_gpus() {
    let ledger = idle_ledger().await;
    ledger.set_fixed_cpu_utils(busy_cpus(80.0)).await;

    let alloc = ledger.reserve(4, 2, &[], &[]).await;
    assert!(alloc.is_none());
    // No trace of the attempt: the GPU set is back to pre-call state.
    assert!(ledger.reserved_gpus().await.is_empty());
    assert!(ledger.reserved_cpus().await.is_empty());
    assert_eq!(ledger.available_gpus().await.len(), 8);
}

#[tokio::test]
async fn test_failed_reserve_leaves_existing_reservations_alone() {
    let ledger = idle_ledger().await;

    let first = ledger.reserve(2, 1, &[], &[]).await.unwrap();
    // 9 GPUs can never be satisfied.
    assert!(ledger.reserve(0, 9, &[], &[]).await.is_none());

    assert_eq!(ledger.reserved_gpus().await, first.gpus);
    assert_eq!(ledger.reserved_cpus().await, first.cpus);
}

#[tokio::test]
async fn test_specific_sets_are_used_exactly() {
    let ledger = idle_ledger().await;

    let alloc = ledger.reserve(1, 1, &[10, 3], &[6, 2]).await.unwrap();
    assert_eq!(alloc.cpus, vec![3, 10]);
    assert_eq!(alloc.gpus, vec![2, 6]);

    // A device from the taken set is refused outright.
    assert!(ledger.reserve(0, 0, &[], &[2]).await.is_none());
    // And a core likewise.
    assert!(ledger.reserve(0, 0, &[3], &[]).await.is_none());
}

#[tokio::test]
async fn test_specific_busy_cpu_rolls_back_gpus() {
    let ledger = idle_ledger().await;
    let mut utils = HashMap::new();
    utils.insert(5usize, 95.0);
    ledger.set_fixed_cpu_utils(utils).await;

    assert!(ledger.reserve(0, 0, &[5], &[0]).await.is_none());
    assert!(ledger.reserved_gpus().await.is_empty());
}

#[tokio::test]
async fn test_excluded_resources_are_never_handed_out() {
    let config = Config {
        excluded_cpus: (1..32).collect(),
        excluded_gpus: vec![0, 1],
        ..test_config()
    };
    let ledger = ResourceLedger::new(&config);
    ledger
        .set_fixed_gpu_data((0..8).map(|id| gpu(id, 100)).collect())
        .await;
    ledger.set_fixed_cpu_utils(HashMap::new()).await;

    // Auto placement skips the excluded devices.
    let alloc = ledger.reserve(1, 1, &[], &[]).await.unwrap();
    assert_eq!(alloc.gpus, vec![2]);
    assert_eq!(alloc.cpus, vec![0]);

    // Explicit placement on an excluded resource is rejected.
    assert!(ledger.reserve(0, 0, &[], &[1]).await.is_none());
    assert!(ledger.reserve(0, 0, &[7], &[]).await.is_none());
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let ledger = idle_ledger().await;
    let alloc = ledger.reserve(2, 2, &[], &[]).await.unwrap();

    ledger.release(&alloc.cpus, &alloc.gpus).await;
    assert!(ledger.reserved_cpus().await.is_empty());
    assert!(ledger.reserved_gpus().await.is_empty());

    // Releasing unheld resources is a no-op.
    ledger.release(&alloc.cpus, &alloc.gpus).await;
    assert!(ledger.reserved_cpus().await.is_empty());
    assert_eq!(ledger.available_gpus().await.len(), 8);
}

#[tokio::test]
async fn test_cpu_only_request_draws_from_either_group() {
    let ledger = idle_ledger().await;

    // 40 cores cannot fit in one 32-core group.
    let alloc = ledger.reserve(40, 0, &[], &[]).await.unwrap();
    assert_eq!(alloc.cpus.len(), 40);
    assert!(alloc.gpus.is_empty());
}

#[tokio::test]
async fn test_gpu_probe_failure_means_nothing_schedules() {
    // No fixed data and no nvidia-smi on the test host: every device
    // reads as over threshold.
    let ledger = ResourceLedger::new(&test_config());
    ledger.set_fixed_cpu_utils(HashMap::new()).await;

    assert!(ledger.available_gpus().await.is_empty());
    assert!(ledger.reserve(1, 1, &[], &[]).await.is_none());
}

#[tokio::test]
async fn test_concurrent_reserves_never_overlap() {
    let ledger = Arc::new(idle_ledger().await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(
            async move { ledger.reserve(2, 1, &[], &[]).await },
        ));
    }

    let mut seen_cpus = HashSet::new();
    let mut seen_gpus = HashSet::new();
    for handle in handles {
        let alloc = handle.await.unwrap().expect("8 disjoint requests fit");
        for cpu in alloc.cpus {
            assert!(seen_cpus.insert(cpu), "core {cpu} double-booked");
        }
        for gpu in alloc.gpus {
            assert!(seen_gpus.insert(gpu), "device {gpu} double-booked");
        }
    }
    assert_eq!(seen_cpus.len(), 16);
    assert_eq!(seen_gpus.len(), 8);
}

#[tokio::test]
async fn test_spanning_specific_gpus_allows_any_cpu_group() {
    let ledger = idle_ledger().await;

    // GPUs 3 and 4 straddle the groups; the CPU stage may use the full
    // range.
    let alloc = ledger.reserve(2, 0, &[], &[3, 4]).await.unwrap();
    assert_eq!(alloc.gpus, vec![3, 4]);
    assert_eq!(alloc.cpus.len(), 2);
}
