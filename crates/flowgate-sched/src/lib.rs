//! Flowgate Scheduler
//!
//! Per-worker hierarchical scheduling for the Flowgate datapath. Each worker
//! owns one traffic-class tree: interior nodes pick among their children by
//! policy (strict priority, weighted-fair stride scheduling, round robin, or
//! rate limiting) and leaves hold the runnable tasks. The scheduler loop
//! descends the tree, dispatches one task, and bills the reported usage back
//! up toward the root.
//!
//! Nothing here is shared between workers: the tree is single-threaded by
//! construction and the hot path takes no locks.

#![warn(missing_docs)]

pub mod scheduler;
pub mod tree;

pub use scheduler::{Scheduler, SchedulerStats};
pub use tree::{
    limit_per_cycle, work_units, PolicyKind, TaskId, TcId, TcNode, TcStats, TcTree, QUANTUM,
    STRIDE1, USAGE_AMPLIFIER_POW,
};
