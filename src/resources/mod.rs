//! Resource availability: probes for measured host utilization and the
//! ledger that combines them with bookkept allocations.
//!
//! - [`GpuProbe`]: per-device memory snapshots via the platform query tool
//! - [`CpuProbe`]: per-core utilization with a sustained-idle criterion
//! - [`ResourceLedger`]: reserve/release with CPU↔GPU affinity and rollback

pub mod cpu;
pub mod gpu;
pub mod ledger;

pub use cpu::CpuProbe;
pub use gpu::{GpuInfo, GpuProbe};
pub use ledger::{Allocation, CpuStatus, GpuStatus, ResourceLedger};
