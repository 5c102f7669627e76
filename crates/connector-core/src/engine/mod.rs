//! Dispatch engines, one per broker family.
//!
//! Each engine owns the scheduling model of its family (partition workers,
//! a bounded worker pool, or a semaphore-gated subscription) and drives
//! every message through the same path: invoke once, route the outcome,
//! then acknowledge. Engines are generic over their driver traits; brokers
//! are swapped by construction, not by conditional code.

pub mod partitioned;
pub mod queue;
pub mod subscription;
