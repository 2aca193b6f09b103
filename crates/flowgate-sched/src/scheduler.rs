//! Per-worker scheduler loop
//!
//! One scheduler per worker thread, owning its traffic-class tree outright.
//! Each iteration reclaims expired throttled classes, descends the tree to a
//! leaf, dispatches one task, and bills the reported usage back up toward
//! the root. When the whole tree is blocked the loop spin-waits on the
//! clock; there are no blocking syscalls on the fast path.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use flowgate_common::{accumulate, Clock, ResourceArr, TscClock};

use crate::tree::{TcId, TcTree};

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    /// Tasks dispatched.
    pub cnt_dispatched: u64,
    /// Iterations that found no runnable leaf.
    pub cnt_idle: u64,
    /// Total usage billed through the root.
    pub usage: ResourceArr,
}

/// A per-worker scheduler over one traffic-class tree.
pub struct Scheduler<C: Clock = TscClock> {
    tree: TcTree,
    root: TcId,
    clock: C,
    /// Throttled rate-limit classes, keyed by expiration. Duplicates are
    /// suppressed by a per-class membership flag.
    throttled: BinaryHeap<Reverse<(u64, TcId)>>,
    throttle_buf: Vec<(TcId, u64)>,
    stats: SchedulerStats,
}

impl<C: Clock> Scheduler<C> {
    /// Take ownership of a built tree, scheduling from `root`.
    pub fn new(tree: TcTree, root: TcId, clock: C) -> Self {
        Self {
            tree,
            root,
            clock,
            throttled: BinaryHeap::new(),
            throttle_buf: Vec::new(),
            stats: SchedulerStats::default(),
        }
    }

    /// The scheduled tree.
    pub fn tree(&self) -> &TcTree {
        &self.tree
    }

    /// Mutable tree access for setup-time changes (adding tasks, attaching
    /// classes). Must not race the running loop; apply between iterations.
    pub fn tree_mut(&mut self) -> &mut TcTree {
        &mut self.tree
    }

    /// The root class.
    pub fn root(&self) -> TcId {
        self.root
    }

    /// The worker clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// One scheduler iteration: reclaim, descend, dispatch, account.
    pub fn schedule_once(&mut self) {
        let now = self.clock.now();
        self.reclaim_throttled(now);

        let Some(leaf) = self.tree.pick_next_leaf(self.root) else {
            // Nothing runnable; spin on the clock.
            self.stats.cnt_idle += 1;
            std::hint::spin_loop();
            return;
        };

        let usage = self.tree.run_next_task(leaf);
        self.stats.cnt_dispatched += 1;
        accumulate(&mut self.stats.usage, &usage);

        let done = self.clock.now();
        self.throttle_buf.clear();
        self.tree.finish_and_account(leaf, &usage, done, &mut self.throttle_buf);
        for &(id, expiration) in &self.throttle_buf {
            self.throttled.push(Reverse((expiration, id)));
        }
    }

    /// Run until `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool) {
        let root_name = self.tree.get(self.root).map(|n| n.name().to_string()).unwrap_or_default();
        info!(root = %root_name, "scheduler running");
        while !stop.load(Ordering::Relaxed) {
            self.schedule_once();
        }
        info!(
            dispatched = self.stats.cnt_dispatched,
            idle = self.stats.cnt_idle,
            "scheduler stopped"
        );
    }

    /// Destroy a class (and its subtree), dropping any stale throttled
    /// entries so a recycled id cannot be reclaimed by mistake.
    pub fn destroy_class(&mut self, id: TcId) {
        let now = self.clock.now();
        let removed = self.tree.destroy(id, now);
        if !removed.is_empty() {
            self.throttled.retain(|Reverse((_, tid))| !removed.contains(tid));
        }
    }

    /// Pop every throttled class whose expiration has passed and unblock it.
    fn reclaim_throttled(&mut self, now: u64) {
        while let Some(&Reverse((expiration, id))) = self.throttled.peek() {
            if expiration > now {
                break;
            }
            self.throttled.pop();
            self.tree.clear_throttle(id, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_common::{ManualClock, Resource, Task};
    use crate::tree::{limit_per_cycle, work_units};

    struct UnitTask;

    impl Task for UnitTask {
        fn run(&mut self) -> ResourceArr {
            [1, 0, 1, 512]
        }
    }

    #[test]
    fn test_dispatch_and_idle_counters() {
        let clock = ManualClock::new();
        let mut tree = TcTree::new();
        let root = tree.new_round_robin("root").unwrap();
        let leaf = tree.new_leaf("leaf").unwrap();
        tree.add_round_robin_child(root, leaf, 0).unwrap();
        let tid = tree.add_task(leaf, Box::new(UnitTask), 0).unwrap();

        let mut sched = Scheduler::new(tree, root, clock.clone());
        for _ in 0..5 {
            sched.schedule_once();
        }
        assert_eq!(sched.stats().cnt_dispatched, 5);
        assert_eq!(sched.stats().usage[Resource::Packets.index()], 5);

        let now = clock.now();
        sched.tree_mut().remove_task(leaf, tid, now).unwrap();
        sched.schedule_once();
        assert_eq!(sched.stats().cnt_dispatched, 5);
        assert_eq!(sched.stats().cnt_idle, 1);
    }

    #[test]
    fn test_throttle_and_reclaim() {
        let hz = 1_000_000;
        let clock = ManualClock::new();
        let mut tree = TcTree::new();
        // 10 packets per second, no burst headroom.
        let root = tree
            .new_rate_limit("rl", Resource::Packets, limit_per_cycle(10, hz), work_units(0))
            .unwrap();
        let leaf = tree.new_leaf("leaf").unwrap();
        tree.set_rate_limit_child(root, leaf, 0).unwrap();
        tree.add_task(leaf, Box::new(UnitTask), 0).unwrap();

        let mut sched = Scheduler::new(tree, root, clock.clone());

        // First dispatch succeeds, then the class is throttled for 1/10 s.
        sched.schedule_once();
        assert_eq!(sched.stats().cnt_dispatched, 1);
        assert!(sched.tree().get(root).unwrap().is_blocked());

        sched.schedule_once();
        assert_eq!(sched.stats().cnt_dispatched, 1);
        assert_eq!(sched.stats().cnt_idle, 1);

        // After the expiration the class runs again.
        clock.advance(hz / 10 + 1);
        sched.schedule_once();
        assert_eq!(sched.stats().cnt_dispatched, 2);
        assert_eq!(sched.tree().get(root).unwrap().stats().cnt_throttled, 2);
    }

    #[test]
    fn test_destroy_class_clears_throttled() {
        let hz = 1_000_000;
        let clock = ManualClock::new();
        let mut tree = TcTree::new();
        let root = tree.new_round_robin("root").unwrap();
        let rl = tree
            .new_rate_limit("rl", Resource::Packets, limit_per_cycle(1, hz), work_units(0))
            .unwrap();
        let leaf = tree.new_leaf("leaf").unwrap();
        tree.add_round_robin_child(root, rl, 0).unwrap();
        tree.set_rate_limit_child(rl, leaf, 0).unwrap();
        tree.add_task(leaf, Box::new(UnitTask), 0).unwrap();

        let mut sched = Scheduler::new(tree, root, clock.clone());
        sched.schedule_once();
        assert!(sched.tree().get(rl).unwrap().is_blocked());

        // Destroying the throttled subtree mid-flight must not leave a
        // stale heap entry behind.
        sched.destroy_class(rl);
        assert!(sched.tree().get(rl).is_none());
        clock.advance(10 * hz);
        sched.schedule_once();
        assert_eq!(sched.stats().cnt_dispatched, 1);
    }
}
