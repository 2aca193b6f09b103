//! Traffic-class tree
//!
//! Arena-allocated scheduling tree. Nodes are addressed by [`TcId`] and keep
//! a back-reference to their parent, so both the downward descent
//! (`pick_next_leaf`) and the upward accounting walk run as plain loops over
//! indices. Each node carries a tagged [`Policy`] with its per-variant state
//! inline; there is no dynamic dispatch on the hot path.
//!
//! Blocked-state machine: a node is blocked when it cannot yield a runnable
//! leaf (no runnable child, empty leaf, or a rate-limit token deficit).
//! Blocking and unblocking both propagate strictly parent-ward in O(depth).

use std::collections::HashMap;

use flowgate_common::{accumulate, CoreError, CoreResult, Resource, ResourceArr, Task};

/// Stride-scheduling unit: a child with share `s` advances its pass by
/// `STRIDE1 / s` per quantum consumed.
pub const STRIDE1: i64 = 1 << 20;

/// Billing granularity for stride scheduling.
pub const QUANTUM: i64 = 1 << 10;

/// Rate-limit token amounts are shifted left by this much to keep precision
/// when limits are expressed per cycle.
pub const USAGE_AMPLIFIER_POW: u32 = 32;

/// Convert a per-second rate into amplified tokens per clock cycle.
pub fn limit_per_cycle(rate_per_sec: u64, hz: u64) -> u64 {
    (((rate_per_sec as u128) << USAGE_AMPLIFIER_POW) / hz as u128) as u64
}

/// Convert a raw resource amount into amplified work units (for burst
/// sizes).
pub fn work_units(amount: u64) -> u64 {
    amount << USAGE_AMPLIFIER_POW
}

/// Handle to a traffic class within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcId(u32);

/// Handle to a task within its leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// Cumulative per-class statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcStats {
    /// Resources consumed by this subtree since creation.
    pub usage: ResourceArr,
    /// Times a rate-limit class entered the throttled state.
    pub cnt_throttled: u64,
}

/// Child-selection policy of a traffic class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Strict priority among children.
    Priority,
    /// Weighted-fair (stride) scheduling among children.
    WeightedFair,
    /// Round robin among children.
    RoundRobin,
    /// Token-bucket rate limit over a single child.
    RateLimit,
    /// Leaf holding runnable tasks.
    Leaf,
}

#[derive(Debug, Clone, Copy)]
struct PriorityChild {
    priority: i32,
    child: TcId,
}

#[derive(Debug, Clone, Copy)]
struct WfChild {
    stride: i64,
    pass: i64,
    child: TcId,
}

/// Min-heap of runnable weighted-fair children keyed by `pass`.
///
/// `std::collections::BinaryHeap` cannot adjust the key of its top element
/// in place, which the stride update needs after every dispatch, so this is
/// a small hand-rolled binary heap.
#[derive(Debug, Default)]
struct PassHeap {
    items: Vec<WfChild>,
}

impl PassHeap {
    fn push(&mut self, item: WfChild) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    fn pop(&mut self) -> Option<WfChild> {
        if self.items.is_empty() {
            return None;
        }
        let top = self.items.swap_remove(0);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Some(top)
    }

    fn peek(&self) -> Option<&WfChild> {
        self.items.first()
    }

    /// Increase the top element's pass and restore heap order.
    fn update_top_pass(&mut self, new_pass: i64) {
        debug_assert!(!self.items.is_empty());
        self.items[0].pass = new_pass;
        self.sift_down(0);
    }

    fn remove(&mut self, child: TcId) -> Option<WfChild> {
        let i = self.items.iter().position(|c| c.child == child)?;
        let item = self.items.swap_remove(i);
        if i < self.items.len() {
            self.sift_down(i);
            self.sift_up(i);
        }
        Some(item)
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &WfChild> {
        self.items.iter()
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let p = (i - 1) / 2;
            if self.items[i].pass < self.items[p].pass {
                self.items.swap(i, p);
                i = p;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.items.len();
        loop {
            let l = 2 * i + 1;
            let r = l + 1;
            let mut m = i;
            if l < len && self.items[l].pass < self.items[m].pass {
                m = l;
            }
            if r < len && self.items[r].pass < self.items[m].pass {
                m = r;
            }
            if m == i {
                break;
            }
            self.items.swap(i, m);
            i = m;
        }
    }
}

enum Policy {
    Priority {
        /// Sorted descending by priority; priorities are distinct.
        children: Vec<PriorityChild>,
        /// Index of the highest-priority runnable child.
        first_runnable: usize,
    },
    WeightedFair {
        resource: Resource,
        runnable: PassHeap,
        blocked: Vec<WfChild>,
    },
    RoundRobin {
        runnable: Vec<TcId>,
        blocked: Vec<TcId>,
        next_child: usize,
    },
    RateLimit {
        resource: Resource,
        /// Amplified tokens per cycle.
        limit: u64,
        /// Amplified token ceiling.
        max_burst: u64,
        tokens: u64,
        last_tsc: u64,
        /// 0 when not throttled.
        throttle_expiration: u64,
        /// Membership flag for the scheduler's throttled set.
        in_throttled_set: bool,
        child: Option<TcId>,
    },
    Leaf {
        tasks: Vec<(TaskId, Box<dyn Task>)>,
        next_task: usize,
    },
}

impl Policy {
    fn kind(&self) -> PolicyKind {
        match self {
            Policy::Priority { .. } => PolicyKind::Priority,
            Policy::WeightedFair { .. } => PolicyKind::WeightedFair,
            Policy::RoundRobin { .. } => PolicyKind::RoundRobin,
            Policy::RateLimit { .. } => PolicyKind::RateLimit,
            Policy::Leaf { .. } => PolicyKind::Leaf,
        }
    }
}

/// One traffic class.
pub struct TcNode {
    name: String,
    parent: Option<TcId>,
    blocked: bool,
    stats: TcStats,
    policy: Policy,
}

impl TcNode {
    /// The class's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent class, if attached.
    pub fn parent(&self) -> Option<TcId> {
        self.parent
    }

    /// Whether the class currently cannot yield a runnable leaf.
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> TcStats {
        self.stats
    }

    /// Child-selection policy kind.
    pub fn kind(&self) -> PolicyKind {
        self.policy.kind()
    }
}

/// A per-worker tree of traffic classes with its name registry.
///
/// Built and torn down at setup time; between those points exactly one
/// worker walks it. Mutation during scheduling is confined to the methods
/// the scheduler calls.
#[derive(Default)]
pub struct TcTree {
    slots: Vec<Option<TcNode>>,
    free: Vec<u32>,
    names: HashMap<String, TcId>,
    next_task_id: u64,
}

impl TcTree {
    /// Create an empty tree with a fresh name registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a strict-priority class.
    pub fn new_priority(&mut self, name: &str) -> CoreResult<TcId> {
        self.new_node(name, Policy::Priority { children: Vec::new(), first_runnable: 0 })
    }

    /// Create a weighted-fair class billing on `resource`.
    pub fn new_weighted_fair(&mut self, name: &str, resource: Resource) -> CoreResult<TcId> {
        self.new_node(
            name,
            Policy::WeightedFair { resource, runnable: PassHeap::default(), blocked: Vec::new() },
        )
    }

    /// Create a round-robin class.
    pub fn new_round_robin(&mut self, name: &str) -> CoreResult<TcId> {
        self.new_node(
            name,
            Policy::RoundRobin { runnable: Vec::new(), blocked: Vec::new(), next_child: 0 },
        )
    }

    /// Create a rate-limit class billing on `resource`.
    ///
    /// `limit` is in amplified tokens per cycle (see [`limit_per_cycle`]),
    /// `max_burst` in amplified work units (see [`work_units`]).
    pub fn new_rate_limit(
        &mut self,
        name: &str,
        resource: Resource,
        limit: u64,
        max_burst: u64,
    ) -> CoreResult<TcId> {
        if limit == 0 {
            return Err(CoreError::InvalidConfig("rate limit must be nonzero".to_string()));
        }
        self.new_node(
            name,
            Policy::RateLimit {
                resource,
                limit,
                max_burst,
                tokens: 0,
                last_tsc: 0,
                throttle_expiration: 0,
                in_throttled_set: false,
                child: None,
            },
        )
    }

    /// Create a leaf class.
    pub fn new_leaf(&mut self, name: &str) -> CoreResult<TcId> {
        self.new_node(name, Policy::Leaf { tasks: Vec::new(), next_task: 0 })
    }

    fn new_node(&mut self, name: &str, policy: Policy) -> CoreResult<TcId> {
        if self.names.contains_key(name) {
            return Err(CoreError::DuplicateName(name.to_string()));
        }
        let node = TcNode {
            name: name.to_string(),
            parent: None,
            // Every class starts blocked; attaching children or tasks
            // unblocks it.
            blocked: true,
            stats: TcStats::default(),
            policy,
        };
        let id = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(node);
                TcId(i)
            }
            None => {
                self.slots.push(Some(node));
                TcId(self.slots.len() as u32 - 1)
            }
        };
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Look up a class by registered name.
    pub fn find_class(&self, name: &str) -> Option<TcId> {
        self.names.get(name).copied()
    }

    /// Borrow a class, if it still exists.
    pub fn get(&self, id: TcId) -> Option<&TcNode> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    fn node(&self, id: TcId) -> &TcNode {
        self.get(id).expect("stale traffic class id")
    }

    fn node_mut(&mut self, id: TcId) -> &mut TcNode {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(|s| s.as_mut())
            .expect("stale traffic class id")
    }

    fn check_unattached(&self, child: TcId) -> CoreResult<()> {
        if self.node(child).parent.is_some() {
            return Err(CoreError::AlreadyAttached(self.node(child).name.clone()));
        }
        Ok(())
    }

    /// Attach `child` under a priority class. Fails if the child already has
    /// a parent or the priority is taken by a sibling.
    pub fn add_priority_child(
        &mut self,
        parent: TcId,
        child: TcId,
        priority: i32,
        now: u64,
    ) -> CoreResult<()> {
        self.check_unattached(child)?;
        {
            let pname = self.node(parent).name.clone();
            let Policy::Priority { children, .. } = &mut self.node_mut(parent).policy else {
                return Err(CoreError::InvalidConfig(format!(
                    "'{}' is not a priority class",
                    pname
                )));
            };
            if children.iter().any(|c| c.priority == priority) {
                return Err(CoreError::DuplicatePriority { parent: pname, priority });
            }
            let at = children
                .iter()
                .position(|c| c.priority < priority)
                .unwrap_or(children.len());
            children.insert(at, PriorityChild { priority, child });
        }
        self.node_mut(child).parent = Some(parent);
        self.unblock_towards_root(parent, now);
        Ok(())
    }

    /// Attach `child` under a weighted-fair class with the given share.
    pub fn add_weighted_fair_child(
        &mut self,
        parent: TcId,
        child: TcId,
        share: u32,
        now: u64,
    ) -> CoreResult<()> {
        self.check_unattached(child)?;
        if share == 0 {
            return Err(CoreError::InvalidConfig("share must be nonzero".to_string()));
        }
        let child_blocked = self.node(child).blocked;
        {
            let pname = self.node(parent).name.clone();
            let Policy::WeightedFair { runnable, blocked, .. } =
                &mut self.node_mut(parent).policy
            else {
                return Err(CoreError::InvalidConfig(format!(
                    "'{}' is not a weighted-fair class",
                    pname
                )));
            };
            let stride = STRIDE1 / i64::from(share);
            // Join at the current virtual time so the newcomer neither
            // starves siblings nor banks credit.
            let pass = runnable.peek().map(|c| c.pass).unwrap_or(0);
            let item = WfChild { stride, pass, child };
            if child_blocked {
                blocked.push(item);
            } else {
                runnable.push(item);
            }
        }
        self.node_mut(child).parent = Some(parent);
        if !child_blocked {
            self.unblock_towards_root(parent, now);
        }
        Ok(())
    }

    /// Attach `child` under a round-robin class.
    pub fn add_round_robin_child(&mut self, parent: TcId, child: TcId, now: u64) -> CoreResult<()> {
        self.check_unattached(child)?;
        let child_blocked = self.node(child).blocked;
        {
            let pname = self.node(parent).name.clone();
            let Policy::RoundRobin { runnable, blocked, .. } = &mut self.node_mut(parent).policy
            else {
                return Err(CoreError::InvalidConfig(format!(
                    "'{}' is not a round-robin class",
                    pname
                )));
            };
            if child_blocked {
                blocked.push(child);
            } else {
                runnable.push(child);
            }
        }
        self.node_mut(child).parent = Some(parent);
        self.unblock_towards_root(parent, now);
        Ok(())
    }

    /// Attach the single child of a rate-limit class.
    pub fn set_rate_limit_child(&mut self, parent: TcId, child: TcId, now: u64) -> CoreResult<()> {
        self.check_unattached(child)?;
        {
            let pname = self.node(parent).name.clone();
            let Policy::RateLimit { child: slot, .. } = &mut self.node_mut(parent).policy else {
                return Err(CoreError::InvalidConfig(format!(
                    "'{}' is not a rate-limit class",
                    pname
                )));
            };
            if slot.is_some() {
                return Err(CoreError::AlreadyAttached(format!("'{}' already has a child", pname)));
            }
            *slot = Some(child);
        }
        self.node_mut(child).parent = Some(parent);
        self.unblock_towards_root(parent, now);
        Ok(())
    }

    /// Append a task to a leaf and unblock it.
    pub fn add_task(&mut self, leaf: TcId, task: Box<dyn Task>, now: u64) -> CoreResult<TaskId> {
        let id = TaskId(self.next_task_id);
        {
            let lname = self.node(leaf).name.clone();
            let Policy::Leaf { tasks, .. } = &mut self.node_mut(leaf).policy else {
                return Err(CoreError::InvalidConfig(format!("'{}' is not a leaf class", lname)));
            };
            tasks.push((id, task));
        }
        self.next_task_id += 1;
        self.unblock_towards_root(leaf, now);
        Ok(id)
    }

    /// Remove a task by identity. Emptying the leaf blocks it (and possibly
    /// its ancestors). The task is returned to the caller, which owns its
    /// teardown from here.
    pub fn remove_task(&mut self, leaf: TcId, task: TaskId, now: u64) -> CoreResult<Box<dyn Task>> {
        let (removed, empty) = {
            let lname = self.node(leaf).name.clone();
            let Policy::Leaf { tasks, next_task } = &mut self.node_mut(leaf).policy else {
                return Err(CoreError::InvalidConfig(format!("'{}' is not a leaf class", lname)));
            };
            let i = tasks
                .iter()
                .position(|(id, _)| *id == task)
                .ok_or_else(|| CoreError::NotFound(format!("no such task in '{}'", lname)))?;
            let (_, removed) = tasks.remove(i);
            if i < *next_task {
                *next_task -= 1;
            }
            if !tasks.is_empty() && *next_task >= tasks.len() {
                *next_task = 0;
            }
            (removed, tasks.is_empty())
        };
        if empty {
            self.node_mut(leaf).blocked = true;
            self.propagate_block(leaf, now);
        }
        Ok(removed)
    }

    /// Descend from `root` to the next leaf to dispatch, or `None` if the
    /// root is blocked.
    pub fn pick_next_leaf(&self, root: TcId) -> Option<TcId> {
        if self.node(root).blocked {
            return None;
        }
        let mut id = root;
        loop {
            id = match &self.node(id).policy {
                Policy::Leaf { .. } => return Some(id),
                Policy::Priority { children, first_runnable } => {
                    children
                        .get(*first_runnable)
                        .unwrap_or_else(|| {
                            panic!("runnable priority class '{}' has no runnable child",
                                   self.node(id).name)
                        })
                        .child
                }
                Policy::WeightedFair { runnable, .. } => {
                    runnable
                        .peek()
                        .unwrap_or_else(|| {
                            panic!("runnable weighted-fair class '{}' has an empty heap",
                                   self.node(id).name)
                        })
                        .child
                }
                Policy::RoundRobin { runnable, next_child, .. } => {
                    *runnable.get(*next_child).unwrap_or_else(|| {
                        panic!("runnable round-robin class '{}' has no runnable child",
                               self.node(id).name)
                    })
                }
                Policy::RateLimit { child, .. } => child.unwrap_or_else(|| {
                    panic!("runnable rate-limit class '{}' has no child", self.node(id).name)
                }),
            };
        }
    }

    /// Run the leaf's next task (round-robin within the leaf) and return its
    /// usage report.
    pub fn run_next_task(&mut self, leaf: TcId) -> ResourceArr {
        let lname = self.node(leaf).name.clone();
        let Policy::Leaf { tasks, next_task } = &mut self.node_mut(leaf).policy else {
            panic!("dispatch on non-leaf class '{}'", lname);
        };
        assert!(!tasks.is_empty(), "dispatch on empty leaf '{}'", lname);
        let i = *next_task % tasks.len();
        *next_task = (i + 1) % tasks.len();
        tasks[i].1.run()
    }

    /// Bill `usage` from a finished dispatch at `leaf` up to the root,
    /// updating each ancestor's policy state and blocked flag.
    ///
    /// Rate-limit classes that entered the throttled state are appended to
    /// `throttled` as `(class, expiration)`; the scheduler owns their
    /// expiration.
    pub fn finish_and_account(
        &mut self,
        leaf: TcId,
        usage: &ResourceArr,
        now: u64,
        throttled: &mut Vec<(TcId, u64)>,
    ) {
        {
            let node = self.node_mut(leaf);
            accumulate(&mut node.stats.usage, usage);
        }
        let leaf_empty =
            matches!(&self.node(leaf).policy, Policy::Leaf { tasks, .. } if tasks.is_empty());
        self.node_mut(leaf).blocked = leaf_empty;

        let mut child = leaf;
        while let Some(parent) = self.node(child).parent {
            let child_blocked = self.node(child).blocked;
            accumulate(&mut self.node_mut(parent).stats.usage, usage);

            match self.node(parent).policy.kind() {
                PolicyKind::Priority => {
                    if child_blocked {
                        let blocked_now = self.priority_rescan_from_current(parent);
                        self.node_mut(parent).blocked = blocked_now;
                    }
                }
                PolicyKind::WeightedFair => {
                    let node = self.node_mut(parent);
                    let Policy::WeightedFair { resource, runnable, blocked } = &mut node.policy
                    else {
                        unreachable!()
                    };
                    if child_blocked {
                        let item = runnable.pop().expect("picked child missing from heap");
                        debug_assert_eq!(item.child, child);
                        blocked.push(item);
                        let empty = runnable.is_empty();
                        node.blocked = empty;
                    } else {
                        let consumed = usage[resource.index()];
                        let top = runnable.peek().expect("picked child missing from heap");
                        debug_assert_eq!(top.child, child);
                        let new_pass = top.pass + top.stride * consumed as i64 / QUANTUM;
                        runnable.update_top_pass(new_pass);
                    }
                }
                PolicyKind::RoundRobin => {
                    let node = self.node_mut(parent);
                    let Policy::RoundRobin { runnable, blocked, next_child } = &mut node.policy
                    else {
                        unreachable!()
                    };
                    if child_blocked {
                        let picked = runnable.remove(*next_child);
                        debug_assert_eq!(picked, child);
                        blocked.push(picked);
                        if *next_child >= runnable.len() {
                            *next_child = 0;
                        }
                        let empty = runnable.is_empty();
                        node.blocked = empty;
                    } else {
                        *next_child += 1;
                        if *next_child >= runnable.len() {
                            *next_child = 0;
                        }
                    }
                }
                PolicyKind::RateLimit => {
                    let node = self.node_mut(parent);
                    let Policy::RateLimit {
                        resource,
                        limit,
                        max_burst,
                        tokens,
                        last_tsc,
                        throttle_expiration,
                        in_throttled_set,
                        ..
                    } = &mut node.policy
                    else {
                        unreachable!()
                    };
                    let elapsed = now.wrapping_sub(*last_tsc);
                    *last_tsc = now;
                    let refilled = tokens.saturating_add(limit.saturating_mul(elapsed));
                    let consumed =
                        usage[resource.index()].saturating_mul(1u64 << USAGE_AMPLIFIER_POW);
                    if refilled < consumed {
                        // Token deficit: throttle until the bucket can cover
                        // the overrun.
                        *tokens = 0;
                        let wait = (consumed - refilled) / *limit;
                        *throttle_expiration = now.saturating_add(wait);
                        let newly = !*in_throttled_set;
                        *in_throttled_set = true;
                        let exp = *throttle_expiration;
                        node.blocked = true;
                        node.stats.cnt_throttled += 1;
                        if newly {
                            throttled.push((parent, exp));
                        }
                    } else {
                        *tokens = (refilled - consumed).min(*max_burst);
                        if child_blocked {
                            node.blocked = true;
                        }
                    }
                }
                PolicyKind::Leaf => {
                    panic!("leaf '{}' has a child", self.node(parent).name)
                }
            }

            child = parent;
        }
    }

    /// Reopen a throttled rate-limit class once its expiration passed.
    /// Returns whether the class was still throttled.
    pub(crate) fn clear_throttle(&mut self, id: TcId, now: u64) -> bool {
        let Some(node) = self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut()) else {
            // Destroyed while throttled; nothing to do.
            return false;
        };
        let Policy::RateLimit { throttle_expiration, in_throttled_set, .. } = &mut node.policy
        else {
            return false;
        };
        if !*in_throttled_set {
            return false;
        }
        *in_throttled_set = false;
        *throttle_expiration = 0;
        self.unblock_towards_root(id, now);
        true
    }

    /// Called when a descendant became runnable: recompute each ancestor's
    /// blocked flag, moving newly runnable children back into the runnable
    /// structures, until a still-blocked node stops the walk.
    pub fn unblock_towards_root(&mut self, start: TcId, now: u64) {
        let mut id = start;
        loop {
            let was = self.node(id).blocked;
            let blocked_now = self.recompute_unblock(id, now);
            self.node_mut(id).blocked = blocked_now;
            if !(was && !blocked_now) {
                break;
            }
            match self.node(id).parent {
                Some(p) => id = p,
                None => break,
            }
        }
    }

    fn recompute_unblock(&mut self, id: TcId, now: u64) -> bool {
        match self.node(id).policy.kind() {
            PolicyKind::Priority => self.priority_rescan(id),
            PolicyKind::WeightedFair => {
                let (movers, top_pass) = {
                    let Policy::WeightedFair { runnable, blocked, .. } = &self.node(id).policy
                    else {
                        unreachable!()
                    };
                    let top_pass = runnable.peek().map(|c| c.pass).unwrap_or(0);
                    let movers: Vec<WfChild> = blocked
                        .iter()
                        .filter(|c| !self.node(c.child).blocked)
                        .copied()
                        .collect();
                    (movers, top_pass)
                };
                let Policy::WeightedFair { runnable, blocked, .. } =
                    &mut self.node_mut(id).policy
                else {
                    unreachable!()
                };
                for mut item in movers {
                    blocked.retain(|c| c.child != item.child);
                    // Rejoin at the current virtual time; idling earns no
                    // credit.
                    item.pass = top_pass;
                    runnable.push(item);
                }
                runnable.is_empty()
            }
            PolicyKind::RoundRobin => {
                let movers: Vec<TcId> = {
                    let Policy::RoundRobin { blocked, .. } = &self.node(id).policy else {
                        unreachable!()
                    };
                    blocked.iter().filter(|c| !self.node(**c).blocked).copied().collect()
                };
                let Policy::RoundRobin { runnable, blocked, .. } = &mut self.node_mut(id).policy
                else {
                    unreachable!()
                };
                for c in movers {
                    blocked.retain(|b| *b != c);
                    runnable.push(c);
                }
                runnable.is_empty()
            }
            PolicyKind::RateLimit => {
                let child_blocked = {
                    let Policy::RateLimit { child, .. } = &self.node(id).policy else {
                        unreachable!()
                    };
                    child.map(|c| self.node(c).blocked).unwrap_or(true)
                };
                let Policy::RateLimit { last_tsc, throttle_expiration, .. } =
                    &mut self.node_mut(id).policy
                else {
                    unreachable!()
                };
                *last_tsc = now;
                *throttle_expiration != 0 || child_blocked
            }
            PolicyKind::Leaf => {
                let Policy::Leaf { tasks, .. } = &self.node(id).policy else { unreachable!() };
                tasks.is_empty()
            }
        }
    }

    /// Called when `start` became blocked outside the accounting walk:
    /// remove it from each ancestor's runnable structure until an ancestor
    /// stays runnable.
    fn propagate_block(&mut self, start: TcId, _now: u64) {
        let mut child = start;
        loop {
            if !self.node(child).blocked {
                break;
            }
            let Some(parent) = self.node(child).parent else { break };
            let was = self.node(parent).blocked;
            let blocked_now = self.remove_from_runnable(parent, child);
            self.node_mut(parent).blocked = blocked_now;
            if !blocked_now || was {
                break;
            }
            child = parent;
        }
    }

    /// Move `child` out of `parent`'s runnable structure (into its blocked
    /// list where the policy keeps one) and return whether `parent` is now
    /// blocked.
    fn remove_from_runnable(&mut self, parent: TcId, child: TcId) -> bool {
        match self.node(parent).policy.kind() {
            PolicyKind::Priority => self.priority_rescan(parent),
            PolicyKind::WeightedFair => {
                let Policy::WeightedFair { runnable, blocked, .. } =
                    &mut self.node_mut(parent).policy
                else {
                    unreachable!()
                };
                if let Some(item) = runnable.remove(child) {
                    blocked.push(item);
                }
                runnable.is_empty()
            }
            PolicyKind::RoundRobin => {
                let Policy::RoundRobin { runnable, blocked, next_child } =
                    &mut self.node_mut(parent).policy
                else {
                    unreachable!()
                };
                if let Some(pos) = runnable.iter().position(|c| *c == child) {
                    runnable.remove(pos);
                    if pos < *next_child {
                        *next_child -= 1;
                    }
                    blocked.push(child);
                }
                if *next_child >= runnable.len() {
                    *next_child = 0;
                }
                runnable.is_empty()
            }
            // A blocked only-child blocks the limiter regardless of tokens.
            PolicyKind::RateLimit => true,
            PolicyKind::Leaf => panic!("leaf '{}' has a child", self.node(parent).name),
        }
    }

    /// Rescan a priority class's children from the top for the first
    /// runnable one. Returns whether the class is blocked.
    fn priority_rescan(&mut self, id: TcId) -> bool {
        let len = {
            let Policy::Priority { children, .. } = &self.node(id).policy else { unreachable!() };
            children.len()
        };
        let mut fr = 0;
        while fr < len {
            let c = {
                let Policy::Priority { children, .. } = &self.node(id).policy else {
                    unreachable!()
                };
                children[fr].child
            };
            if self.node(c).blocked {
                fr += 1;
            } else {
                break;
            }
        }
        let Policy::Priority { first_runnable, .. } = &mut self.node_mut(id).policy else {
            unreachable!()
        };
        *first_runnable = fr;
        fr >= len
    }

    /// Advance a priority class's cursor past blocked children without
    /// rescanning from the top (children above the cursor are blocked by
    /// invariant). Returns whether the class is blocked.
    fn priority_rescan_from_current(&mut self, id: TcId) -> bool {
        loop {
            let next = {
                let Policy::Priority { children, first_runnable } = &self.node(id).policy else {
                    unreachable!()
                };
                children.get(*first_runnable).map(|c| c.child)
            };
            match next {
                Some(c) if self.node(c).blocked => {
                    let Policy::Priority { first_runnable, .. } =
                        &mut self.node_mut(id).policy
                    else {
                        unreachable!()
                    };
                    *first_runnable += 1;
                }
                Some(_) => return false,
                None => return true,
            }
        }
    }

    /// Depth-first traversal of the subtree under `from`.
    pub fn traverse<F: FnMut(TcId, &TcNode)>(&self, from: TcId, f: &mut F) {
        f(from, self.node(from));
        for c in self.children_of(from) {
            self.traverse(c, f);
        }
    }

    /// Children of a class, runnable and blocked alike.
    pub fn children_of(&self, id: TcId) -> Vec<TcId> {
        match &self.node(id).policy {
            Policy::Priority { children, .. } => children.iter().map(|c| c.child).collect(),
            Policy::WeightedFair { runnable, blocked, .. } => runnable
                .iter()
                .map(|c| c.child)
                .chain(blocked.iter().map(|c| c.child))
                .collect(),
            Policy::RoundRobin { runnable, blocked, .. } => {
                runnable.iter().chain(blocked.iter()).copied().collect()
            }
            Policy::RateLimit { child, .. } => child.iter().copied().collect(),
            Policy::Leaf { .. } => Vec::new(),
        }
    }

    /// Destroy a class and its whole subtree, unregistering every name.
    /// Returns the destroyed ids so the scheduler can drop stale throttled
    /// entries.
    pub fn destroy(&mut self, id: TcId, now: u64) -> Vec<TcId> {
        let mut removed = Vec::new();
        if self.get(id).is_none() {
            return removed;
        }
        self.detach(id, now);
        self.destroy_rec(id, &mut removed);
        removed
    }

    fn destroy_rec(&mut self, id: TcId, removed: &mut Vec<TcId>) {
        for c in self.children_of(id) {
            self.destroy_rec(c, removed);
        }
        // Tasks owned by a leaf are dropped with it.
        if let Some(node) = self.slots[id.0 as usize].take() {
            self.names.remove(&node.name);
        }
        self.free.push(id.0);
        removed.push(id);
    }

    fn detach(&mut self, child: TcId, now: u64) {
        let Some(parent) = self.node(child).parent else { return };
        match &mut self.node_mut(parent).policy {
            Policy::Priority { children, .. } => {
                children.retain(|c| c.child != child);
            }
            Policy::WeightedFair { runnable, blocked, .. } => {
                runnable.remove(child);
                blocked.retain(|c| c.child != child);
            }
            Policy::RoundRobin { runnable, blocked, next_child } => {
                if let Some(pos) = runnable.iter().position(|c| *c == child) {
                    runnable.remove(pos);
                    if pos < *next_child {
                        *next_child -= 1;
                    }
                }
                blocked.retain(|c| *c != child);
                if *next_child >= runnable.len() {
                    *next_child = 0;
                }
            }
            Policy::RateLimit { child: slot, .. } => {
                if *slot == Some(child) {
                    *slot = None;
                }
            }
            Policy::Leaf { .. } => {}
        }
        self.node_mut(child).parent = None;

        // The parent may have changed state either way.
        let was = self.node(parent).blocked;
        let blocked_now = self.recompute_unblock(parent, now);
        self.node_mut(parent).blocked = blocked_now;
        if blocked_now && !was {
            self.propagate_block(parent, now);
        } else if !blocked_now && was {
            if let Some(gp) = self.node(parent).parent {
                self.unblock_towards_root(gp, now);
            }
        }
    }
}
