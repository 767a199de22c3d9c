/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

use std::cmp;
use std::collections::binary_heap::PeekMut;
use std::collections::{BinaryHeap, HashMap};
use std::mem;

use cycles;
use resource::{Resource, ResourceArr};
use sched::SchedWakeupQueue;
use task::{Task, TaskState};

/// A large default priority, scheduled after everything else.
pub const DEFAULT_PRIORITY: u32 = 0xFFFF_FFFF;

/// One work unit represents 2^USAGE_AMPLIFIER_POW resource units. Running
/// the token bucket in work units gives it ~28 bits of fractional
/// precision without floating point.
pub const USAGE_AMPLIFIER_POW: u32 = 32;

/// Shares are relative, so 2^20 is large enough for any sensible split.
pub const STRIDE1: i64 = 1 << 20;

/// The priority of a child under a priority class. Smaller values are
/// scheduled first.
pub type Priority = u32;

/// The share of a resource allocated to a child under a weighted-fair
/// class. Must be positive.
pub type Share = u32;

/// Converts resource units per second into work units per cycle. The
/// four-bit pre-shift keeps the intermediate product inside 64 bits for
/// rates below 2^36 units per second and counter frequencies between
/// 2^24 and 2^34 Hz.
#[inline]
pub fn to_work_units(x: u64, tsc_hz: u64) -> u64 {
    (x << (USAGE_AMPLIFIER_POW - 4)) / (tsc_hz >> 4)
}

/// Identifies a traffic class inside a builder's arena. Identifiers stay
/// valid until `clear()` destroys the class or `clear_all()` resets the
/// arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcId(usize);

/// The scheduling discipline of a traffic class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    Priority,
    WeightedFair,
    RoundRobin,
    RateLimit,
    Leaf,
}

impl Policy {
    /// Returns the textual name of this policy, as used by configuration
    /// files and log output.
    pub fn name(&self) -> &'static str {
        match *self {
            Policy::Priority => "priority",
            Policy::WeightedFair => "weighted_fair",
            Policy::RoundRobin => "round_robin",
            Policy::RateLimit => "rate_limit",
            Policy::Leaf => "leaf",
        }
    }
}

/// Usage statistics kept by every traffic class.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcStats {
    /// Resources consumed by every run under this class.
    pub usage: ResourceArr,

    /// How many times this class was throttled by its token bucket.
    pub cnt_throttled: u64,
}

/// Identifies a child and the parameter its parent's policy associates
/// with it. Used both to attach children and as the payload handed to
/// traversal callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcChildArgs {
    /// A child of a priority class; smaller values are scheduled first.
    Priority(Priority, TcId),

    /// A child of a weighted-fair class and its share of the resource.
    WeightedFair(Share, TcId),

    /// A child of a round-robin class.
    RoundRobin(TcId),

    /// The single child of a rate-limit class.
    RateLimit(TcId),
}

impl TcChildArgs {
    /// The child this descriptor refers to.
    pub fn child(&self) -> TcId {
        match *self {
            TcChildArgs::Priority(_, c) => c,
            TcChildArgs::WeightedFair(_, c) => c,
            TcChildArgs::RoundRobin(c) => c,
            TcChildArgs::RateLimit(c) => c,
        }
    }
}

/// A nested description of a scheduling tree, consumed by
/// `TrafficClassBuilder::create_tree()`. Every node carries the name it
/// will be registered under.
pub enum TcSpec {
    Priority {
        name: String,
        children: Vec<(Priority, TcSpec)>,
    },
    WeightedFair {
        name: String,
        resource: Resource,
        children: Vec<(Share, TcSpec)>,
    },
    RoundRobin {
        name: String,
        children: Vec<TcSpec>,
    },
    RateLimit {
        name: String,
        resource: Resource,
        limit: u64,
        max_burst: u64,
        child: Option<Box<TcSpec>>,
    },
    Leaf {
        name: String,
        task: Box<Task>,
    },
}

/// Per-child state of a priority class.
struct PriorityChild {
    priority: Priority,
    child: TcId,
}

struct PriorityState {
    /// Index into `children` of the first runnable child, or
    /// `children.len()` if every child is blocked.
    first_runnable: usize,

    /// All children, in ascending priority-value order.
    children: Vec<PriorityChild>,
}

/// Stride-scheduling state for one weighted-fair child.
#[derive(Clone, Copy, Debug)]
struct WfChild {
    stride: i64,
    pass: i64,
    child: TcId,
}

// Reversed so that BinaryHeap behaves as a min-heap on pass.
impl Ord for WfChild {
    fn cmp(&self, other: &WfChild) -> cmp::Ordering {
        other
            .pass
            .cmp(&self.pass)
            .then(other.child.cmp(&self.child))
    }
}

impl PartialOrd for WfChild {
    fn partial_cmp(&self, other: &WfChild) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for WfChild {
    fn eq(&self, other: &WfChild) -> bool {
        self.pass == other.pass && self.child == other.child
    }
}

impl Eq for WfChild {}

struct WeightedFairState {
    /// The resource whose usage this class divides between its children.
    resource: Resource,

    /// Runnable children, ordered by pass.
    runnable: BinaryHeap<WfChild>,

    /// Children with no runnable leaf below them. Their stride and pass
    /// are preserved so they can rejoin the heap on wakeup.
    blocked: Vec<WfChild>,

    /// A snapshot of every attached child and its share. Safe to read
    /// from the master thread while the worker runs.
    all_children: Vec<(TcId, Share)>,
}

struct RoundRobinState {
    /// Index into `children` of the child that runs next.
    next_child: usize,

    /// Runnable children, in turn order.
    children: Vec<TcId>,

    /// Children with no runnable leaf below them.
    blocked: Vec<TcId>,

    /// A snapshot of every attached child. Safe to read from the master
    /// thread while the worker runs.
    all_children: Vec<TcId>,
}

struct RateLimitState {
    /// The resource this class limits.
    resource: Resource,

    /// In work units per cycle (0 if unlimited).
    limit: u64,

    /// In resource units per second, kept for read-back.
    limit_arg: u64,

    /// Token cap, in work units (0 if unlimited).
    max_burst: u64,

    /// In resource units per second, kept for read-back.
    max_burst_arg: u64,

    /// Accumulated tokens, in work units.
    tokens: u64,

    /// Counter value at the last refill.
    last_tsc: u64,

    child: Option<TcId>,
}

struct LeafState {
    task: Box<Task>,
}

enum PolicyState {
    Priority(PriorityState),
    WeightedFair(WeightedFairState),
    RoundRobin(RoundRobinState),
    RateLimit(RateLimitState),
    Leaf(LeafState),
}

/// A node in a scheduling tree. Internal classes arbitrate between their
/// children under their policy; leaves wrap a schedulable task.
pub struct TrafficClass {
    /// Parent in the scheduling tree; `None` for a root.
    parent: Option<TcId>,

    /// The name this class was registered under.
    name: String,

    stats: TcStats,

    /// The counter value at which a throttled class becomes eligible
    /// again. Only meaningful while the class is blocked by its bucket.
    wakeup_time: u64,

    /// True when no runnable leaf is reachable through this class.
    blocked: bool,

    state: PolicyState,
}

impl TrafficClass {
    /// The name this class was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parent of this class, or `None` for a root.
    pub fn parent(&self) -> Option<TcId> {
        self.parent
    }

    /// Usage accumulated by every run under this class.
    pub fn stats(&self) -> &TcStats {
        &self.stats
    }

    /// The counter value at which a throttled class becomes eligible
    /// again.
    pub fn wakeup_time(&self) -> u64 {
        self.wakeup_time
    }

    /// True when no runnable leaf is reachable through this class.
    pub fn blocked(&self) -> bool {
        self.blocked
    }

    /// The scheduling discipline of this class.
    pub fn policy(&self) -> Policy {
        match self.state {
            PolicyState::Priority(_) => Policy::Priority,
            PolicyState::WeightedFair(_) => Policy::WeightedFair,
            PolicyState::RoundRobin(_) => Policy::RoundRobin,
            PolicyState::RateLimit(_) => Policy::RateLimit,
            PolicyState::Leaf(_) => Policy::Leaf,
        }
    }

    /// The resource a weighted-fair class shares or a rate-limit class
    /// limits; `None` for other policies.
    pub fn resource(&self) -> Option<Resource> {
        match self.state {
            PolicyState::WeightedFair(ref s) => Some(s.resource),
            PolicyState::RateLimit(ref s) => Some(s.resource),
            _ => None,
        }
    }

    /// The configured rate limit in work units per cycle; `None` for
    /// classes that are not rate limits.
    pub fn limit(&self) -> Option<u64> {
        match self.state {
            PolicyState::RateLimit(ref s) => Some(s.limit),
            _ => None,
        }
    }

    /// The configured burst cap in work units; `None` for classes that
    /// are not rate limits.
    pub fn max_burst(&self) -> Option<u64> {
        match self.state {
            PolicyState::RateLimit(ref s) => Some(s.max_burst),
            _ => None,
        }
    }

    /// The configured rate limit in resource units per second; `None`
    /// for classes that are not rate limits.
    pub fn limit_arg(&self) -> Option<u64> {
        match self.state {
            PolicyState::RateLimit(ref s) => Some(s.limit_arg),
            _ => None,
        }
    }

    /// The configured burst cap in resource units per second; `None` for
    /// classes that are not rate limits.
    pub fn max_burst_arg(&self) -> Option<u64> {
        match self.state {
            PolicyState::RateLimit(ref s) => Some(s.max_burst_arg),
            _ => None,
        }
    }
}

/// Creates, owns, and destroys every traffic class in the process. Names
/// are unique across the builder; trees are composed by attaching
/// registered classes to one another. The builder is also the arena the
/// scheduler walks, so the worker thread needs mutable access to it
/// while running.
pub struct TrafficClassBuilder {
    /// The arena. Slots are never reused; a destroyed class leaves a
    /// hole until `clear_all()` resets the arena.
    slots: Vec<Option<TrafficClass>>,

    /// Maps a class name to its identifier.
    by_name: HashMap<String, TcId>,

    /// Classes in creation order, so teardown can run in reverse.
    order: Vec<TcId>,

    /// Cycle-counter frequency used to convert rate-limit arguments into
    /// work units.
    tsc_hz: u64,
}

impl TrafficClassBuilder {
    /// Returns a builder that converts rate-limit arguments with the
    /// measured cycle-counter frequency.
    pub fn new() -> TrafficClassBuilder {
        TrafficClassBuilder::with_tsc_hz(cycles::frequency())
    }

    /// Returns a builder that converts rate-limit arguments with the
    /// given frequency. Used by simulations and tests that drive the
    /// scheduler with a synthetic clock.
    pub fn with_tsc_hz(tsc_hz: u64) -> TrafficClassBuilder {
        TrafficClassBuilder {
            slots: Vec::new(),
            by_name: HashMap::new(),
            order: Vec::new(),
            tsc_hz: tsc_hz,
        }
    }

    /// The cycle-counter frequency this builder converts rate-limit
    /// arguments with.
    pub fn tsc_hz(&self) -> u64 {
        self.tsc_hz
    }

    fn node(&self, id: TcId) -> &TrafficClass {
        self.slots[id.0].as_ref().expect("stale traffic class id")
    }

    fn node_mut(&mut self, id: TcId) -> &mut TrafficClass {
        self.slots[id.0].as_mut().expect("stale traffic class id")
    }

    fn register(&mut self, name: &str, state: PolicyState, blocked: bool) -> Option<TcId> {
        if self.by_name.contains_key(name) {
            warn!("Traffic class {} already exists", name);
            return None;
        }

        let id = TcId(self.slots.len());
        self.slots.push(Some(TrafficClass {
            parent: None,
            name: name.to_string(),
            stats: Default::default(),
            wakeup_time: 0,
            blocked: blocked,
            state: state,
        }));
        self.by_name.insert(name.to_string(), id);
        self.order.push(id);

        debug!("Created traffic class {}", name);
        Some(id)
    }

    /// Creates a priority class. Returns `None` if the name is taken.
    pub fn create_priority(&mut self, name: &str) -> Option<TcId> {
        self.register(
            name,
            PolicyState::Priority(PriorityState {
                first_runnable: 0,
                children: Vec::new(),
            }),
            true,
        )
    }

    /// Creates a weighted-fair class.
    ///
    /// # Arguments
    ///
    /// * `name`:     Registry name for the class. Must be unique.
    /// * `resource`: The resource whose usage is divided between the
    ///               children.
    ///
    /// # Return
    ///
    /// The new class, or `None` if the name is taken.
    pub fn create_weighted_fair(&mut self, name: &str, resource: Resource) -> Option<TcId> {
        self.register(
            name,
            PolicyState::WeightedFair(WeightedFairState {
                resource: resource,
                runnable: BinaryHeap::new(),
                blocked: Vec::new(),
                all_children: Vec::new(),
            }),
            true,
        )
    }

    /// Creates a round-robin class. Returns `None` if the name is taken.
    pub fn create_round_robin(&mut self, name: &str) -> Option<TcId> {
        self.register(
            name,
            PolicyState::RoundRobin(RoundRobinState {
                next_child: 0,
                children: Vec::new(),
                blocked: Vec::new(),
                all_children: Vec::new(),
            }),
            true,
        )
    }

    /// Creates a rate-limit class.
    ///
    /// # Arguments
    ///
    /// * `name`:      Registry name for the class. Must be unique.
    /// * `resource`:  The resource this class limits.
    /// * `limit`:     The sustained rate, in resource units per second.
    ///                Zero means unlimited.
    /// * `max_burst`: The burst cap, in resource units per second,
    ///                converted with the same fixed-point formula as the
    ///                limit. Ignored when the limit is unlimited.
    ///
    /// # Return
    ///
    /// The new class, or `None` if the name is taken.
    pub fn create_rate_limit(
        &mut self,
        name: &str,
        resource: Resource,
        limit: u64,
        max_burst: u64,
    ) -> Option<TcId> {
        let limit_wu = to_work_units(limit, self.tsc_hz);
        let (burst_wu, burst_arg) = if limit_wu != 0 {
            (to_work_units(max_burst, self.tsc_hz), max_burst)
        } else {
            (0, 0)
        };

        self.register(
            name,
            PolicyState::RateLimit(RateLimitState {
                resource: resource,
                limit: limit_wu,
                limit_arg: limit,
                max_burst: burst_wu,
                max_burst_arg: burst_arg,
                tokens: 0,
                last_tsc: 0,
                child: None,
            }),
            true,
        )
    }

    /// Creates a leaf class around `task` and attaches the task to it.
    /// Leaves start out unblocked; the task signals non-readiness by
    /// returning `TaskState::Blocked` from a run.
    ///
    /// # Arguments
    ///
    /// * `name`: Registry name for the class. Must be unique.
    /// * `task`: The unit of work scheduled through this leaf.
    ///
    /// # Return
    ///
    /// The new class, or `None` if the name is taken, in which case the
    /// task is dropped unattached.
    pub fn create_leaf(&mut self, name: &str, task: Box<Task>) -> Option<TcId> {
        let id = self.register(name, PolicyState::Leaf(LeafState { task: task }), false)?;
        if let PolicyState::Leaf(ref mut l) = self.node_mut(id).state {
            l.task.attach(id);
        }
        Some(id)
    }

    /// Composes a whole subtree from a nested description, registering
    /// every class in it. Returns the root, or `None` if any class could
    /// not be created or attached; no rollback is attempted on failure,
    /// matching the rest of the builder surface (already-registered
    /// classes can be removed with `clear()`).
    pub fn create_tree(&mut self, spec: TcSpec) -> Option<TcId> {
        match spec {
            TcSpec::Priority { name, children } => {
                let root = self.create_priority(&name)?;
                for (priority, child_spec) in children {
                    let child = self.create_tree(child_spec)?;
                    if !self.add_child(root, TcChildArgs::Priority(priority, child)) {
                        return None;
                    }
                }
                Some(root)
            }
            TcSpec::WeightedFair {
                name,
                resource,
                children,
            } => {
                let root = self.create_weighted_fair(&name, resource)?;
                for (share, child_spec) in children {
                    let child = self.create_tree(child_spec)?;
                    if !self.add_child(root, TcChildArgs::WeightedFair(share, child)) {
                        return None;
                    }
                }
                Some(root)
            }
            TcSpec::RoundRobin { name, children } => {
                let root = self.create_round_robin(&name)?;
                for child_spec in children {
                    let child = self.create_tree(child_spec)?;
                    if !self.add_child(root, TcChildArgs::RoundRobin(child)) {
                        return None;
                    }
                }
                Some(root)
            }
            TcSpec::RateLimit {
                name,
                resource,
                limit,
                max_burst,
                child,
            } => {
                let root = self.create_rate_limit(&name, resource, limit, max_burst)?;
                if let Some(child_spec) = child {
                    let child = self.create_tree(*child_spec)?;
                    if !self.add_child(root, TcChildArgs::RateLimit(child)) {
                        return None;
                    }
                }
                Some(root)
            }
            TcSpec::Leaf { name, task } => self.create_leaf(&name, task),
        }
    }

    /// Looks a class up by name.
    pub fn find(&self, name: &str) -> Option<TcId> {
        self.by_name.get(name).cloned()
    }

    /// Returns the class registered under `id`, or `None` if it has been
    /// destroyed.
    pub fn get(&self, id: TcId) -> Option<&TrafficClass> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    /// The full name registry, for introspection.
    pub fn all(&self) -> &HashMap<String, TcId> {
        &self.by_name
    }

    /// Attaches a child under `parent`.
    ///
    /// # Arguments
    ///
    /// * `parent`: The class gaining a child.
    /// * `args`:   The child and the parameter the parent's policy
    ///             associates with it (priority value, share, nothing).
    ///
    /// # Return
    ///
    /// True if the child was attached. False, without any state change,
    /// if either class is dead, the child already has a parent, the
    /// descriptor does not match the parent's policy, the share is zero,
    /// or a rate-limit parent already has its one child.
    pub fn add_child(&mut self, parent: TcId, args: TcChildArgs) -> bool {
        let child = args.child();
        if parent == child {
            return false;
        }

        let child_blocked = match self.get(child) {
            Some(c) if c.parent.is_none() => c.blocked,
            _ => return false,
        };
        if self.get(parent).is_none() {
            return false;
        }

        let attached = {
            let tc = self.node_mut(parent);
            match (&mut tc.state, args) {
                (&mut PolicyState::Priority(ref mut s), TcChildArgs::Priority(priority, _)) => {
                    let pos = s.children
                        .iter()
                        .position(|c| c.priority > priority)
                        .unwrap_or(s.children.len());
                    s.children.insert(
                        pos,
                        PriorityChild {
                            priority: priority,
                            child: child,
                        },
                    );
                    if pos <= s.first_runnable {
                        if child_blocked {
                            s.first_runnable += 1;
                        } else {
                            s.first_runnable = pos;
                        }
                    }
                    true
                }
                (&mut PolicyState::WeightedFair(ref mut s), TcChildArgs::WeightedFair(share, _)) => {
                    if share == 0 {
                        false
                    } else {
                        // A new child starts even with the current front
                        // runner rather than at pass zero.
                        let item = WfChild {
                            stride: STRIDE1 / share as i64,
                            pass: s.runnable.peek().map_or(0, |top| top.pass),
                            child: child,
                        };
                        if child_blocked {
                            s.blocked.push(item);
                        } else {
                            s.runnable.push(item);
                        }
                        s.all_children.push((child, share));
                        true
                    }
                }
                (&mut PolicyState::RoundRobin(ref mut s), TcChildArgs::RoundRobin(_)) => {
                    if child_blocked {
                        s.blocked.push(child);
                    } else {
                        s.children.push(child);
                    }
                    s.all_children.push(child);
                    true
                }
                (&mut PolicyState::RateLimit(ref mut s), TcChildArgs::RateLimit(_)) => {
                    if s.child.is_some() {
                        false
                    } else {
                        s.child = Some(child);
                        true
                    }
                }
                _ => false,
            }
        };
        if !attached {
            return false;
        }

        self.node_mut(child).parent = Some(parent);
        if !child_blocked {
            self.unblock_towards_root(parent, 0);
        }
        true
    }

    /// Detaches `child` from `parent`.
    ///
    /// # Arguments
    ///
    /// * `parent`: The class losing a child.
    /// * `child`:  The child to detach.
    ///
    /// # Return
    ///
    /// True if the child was detached; it keeps its subtree and stays
    /// registered, so it can be reattached elsewhere or destroyed with
    /// `clear()`. False, without any state change, if `child` is not
    /// currently a child of `parent`.
    pub fn remove_child(&mut self, parent: TcId, child: TcId) -> bool {
        match self.get(child) {
            Some(c) if c.parent == Some(parent) => {}
            _ => return false,
        }

        let removed = {
            let tc = self.node_mut(parent);
            match tc.state {
                PolicyState::Priority(ref mut s) => {
                    match s.children.iter().position(|c| c.child == child) {
                        Some(i) => {
                            s.children.remove(i);
                            true
                        }
                        None => false,
                    }
                }
                PolicyState::WeightedFair(ref mut s) => {
                    let mut found = false;
                    let mut items = mem::replace(&mut s.runnable, BinaryHeap::new()).into_vec();
                    if let Some(i) = items.iter().position(|c| c.child == child) {
                        items.remove(i);
                        found = true;
                    }
                    s.runnable = BinaryHeap::from(items);
                    if !found {
                        if let Some(i) = s.blocked.iter().position(|c| c.child == child) {
                            s.blocked.remove(i);
                            found = true;
                        }
                    }
                    if found {
                        if let Some(i) = s.all_children.iter().position(|&(c, _)| c == child) {
                            s.all_children.remove(i);
                        }
                    }
                    found
                }
                PolicyState::RoundRobin(ref mut s) => {
                    let mut found = false;
                    if let Some(i) = s.children.iter().position(|&c| c == child) {
                        s.children.remove(i);
                        if i < s.next_child {
                            s.next_child -= 1;
                        }
                        found = true;
                    } else if let Some(i) = s.blocked.iter().position(|&c| c == child) {
                        s.blocked.remove(i);
                        found = true;
                    }
                    if found {
                        if let Some(i) = s.all_children.iter().position(|&c| c == child) {
                            s.all_children.remove(i);
                        }
                    }
                    found
                }
                PolicyState::RateLimit(ref mut s) => {
                    if s.child == Some(child) {
                        s.child = None;
                        true
                    } else {
                        false
                    }
                }
                PolicyState::Leaf(_) => false,
            }
        };
        if !removed {
            return false;
        }

        self.node_mut(child).parent = None;
        self.reevaluate_after_removal(parent);
        true
    }

    /// Recomputes a parent's cursor and blocked flag after a child was
    /// detached, propagating a block towards the root if the parent just
    /// lost its last runnable child.
    fn reevaluate_after_removal(&mut self, id: TcId) {
        let nowblocked = match self.node(id).policy() {
            Policy::Priority => {
                let kids = self.priority_children(id);
                let fr = self.first_unblocked(&kids);
                if let PolicyState::Priority(ref mut s) = self.node_mut(id).state {
                    s.first_runnable = fr;
                }
                fr == kids.len()
            }
            Policy::WeightedFair => {
                if let PolicyState::WeightedFair(ref s) = self.node(id).state {
                    s.runnable.is_empty()
                } else {
                    false
                }
            }
            Policy::RoundRobin => {
                let tc = self.node_mut(id);
                if let PolicyState::RoundRobin(ref mut s) = tc.state {
                    if s.children.is_empty() {
                        s.next_child = 0;
                    } else {
                        s.next_child %= s.children.len();
                    }
                    s.children.is_empty()
                } else {
                    false
                }
            }
            Policy::RateLimit => true,
            Policy::Leaf => false,
        };

        if nowblocked {
            self.block_towards_root_set_blocked(id, true);
        }
    }

    /// Destroys one class: detaches it from its parent (propagating any
    /// resulting block), then destroys it and every class below it.
    /// Returns false if `id` is already dead.
    pub fn clear(&mut self, id: TcId) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        if let Some(parent) = self.node(id).parent {
            self.remove_child(parent, id);
        }
        self.destroy_subtree(id);
        true
    }

    /// Destroys every class this builder has created, children before
    /// parents (reverse creation order), and resets the arena.
    pub fn clear_all(&mut self) {
        let order: Vec<TcId> = self.order.iter().rev().cloned().collect();
        for id in order {
            self.destroy_one(id);
        }
        self.order.clear();
        self.slots.clear();
        debug!("Cleared all traffic classes");
    }

    fn destroy_subtree(&mut self, id: TcId) {
        let kids: Vec<TcId> = self.child_args(id).iter().map(|a| a.child()).collect();
        for k in kids {
            self.destroy_subtree(k);
        }
        self.destroy_one(id);
    }

    fn destroy_one(&mut self, id: TcId) {
        if let Some(mut tc) = self.slots[id.0].take() {
            if let PolicyState::Leaf(ref mut l) = tc.state {
                l.task.detach();
            }
            self.by_name.remove(&tc.name);
            debug!("Destroyed traffic class {}", tc.name);
        }
    }

    /// Reconfigures a rate-limit class's sustained rate.
    ///
    /// # Arguments
    ///
    /// * `id`:    The rate-limit class to reconfigure.
    /// * `limit`: The new rate, in resource units per second.
    ///
    /// # Return
    ///
    /// False if `id` is not a live rate-limit class.
    pub fn set_limit(&mut self, id: TcId, limit: u64) -> bool {
        let hz = self.tsc_hz;
        match self.slots.get_mut(id.0).and_then(|s| s.as_mut()) {
            Some(tc) => {
                if let PolicyState::RateLimit(ref mut s) = tc.state {
                    s.limit_arg = limit;
                    s.limit = to_work_units(limit, hz);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Reconfigures a rate-limit class's burst cap.
    ///
    /// # Arguments
    ///
    /// * `id`:        The rate-limit class to reconfigure.
    /// * `max_burst`: The new burst cap, in resource units per second.
    ///
    /// # Return
    ///
    /// False if `id` is not a live rate-limit class.
    pub fn set_max_burst(&mut self, id: TcId, max_burst: u64) -> bool {
        let hz = self.tsc_hz;
        match self.slots.get_mut(id.0).and_then(|s| s.as_mut()) {
            Some(tc) => {
                if let PolicyState::RateLimit(ref mut s) = tc.state {
                    s.max_burst_arg = max_burst;
                    s.max_burst = to_work_units(max_burst, hz);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Picks the next schedulable child of `id`. A rate-limit class
    /// refills its bucket here: with the bucket empty it returns `None`
    /// and the tick idles (the accounting path is what blocks and
    /// queues the class for wakeup).
    ///
    /// # Arguments
    ///
    /// * `id`:  The class to pick from.
    /// * `tsc`: The current cycle counter value, for bucket refills.
    ///
    /// # Return
    ///
    /// The child to descend into, or `None` if nothing under `id` can
    /// run right now.
    pub fn pick_next_child(&mut self, id: TcId, tsc: u64) -> Option<TcId> {
        match self.node_mut(id).state {
            PolicyState::Priority(ref s) => s.children.get(s.first_runnable).map(|c| c.child),
            PolicyState::WeightedFair(ref s) => s.runnable.peek().map(|top| top.child),
            PolicyState::RoundRobin(ref s) => s.children.get(s.next_child).cloned(),
            PolicyState::RateLimit(ref mut s) => {
                if s.limit != 0 {
                    let elapsed = tsc.saturating_sub(s.last_tsc);
                    s.tokens = cmp::min(
                        s.tokens.saturating_add(s.limit.saturating_mul(elapsed)),
                        s.max_burst,
                    );
                }
                s.last_tsc = tsc;
                if s.limit != 0 && s.tokens == 0 {
                    None
                } else {
                    s.child
                }
            }
            PolicyState::Leaf(_) => None,
        }
    }

    /// Runs the task attached to a leaf. Returns `None` if `id` is dead
    /// or not a leaf.
    pub fn run_leaf(&mut self, id: TcId) -> Option<(TaskState, ResourceArr)> {
        match self.slots.get_mut(id.0).and_then(|s| s.as_mut()) {
            Some(tc) => match tc.state {
                PolicyState::Leaf(ref mut l) => Some(l.task.run()),
                _ => None,
            },
            None => None,
        }
    }

    /// Accounts `usage` to every class on the path from `leaf` to the
    /// root. Each parent charges the child it picked and reorganizes if
    /// that child became blocked along the way: a rate-limit class whose
    /// bucket ran dry blocks itself, records its wakeup time, bumps its
    /// throttle count, and queues itself for wakeup; the classes above
    /// it then observe the blocked child while accounting and move it
    /// out of their runnable sets. Flags only ever flip once per chain,
    /// keeping propagation edge-triggered.
    ///
    /// # Arguments
    ///
    /// * `wakeup_queue`: Where a class that throttles itself is queued.
    /// * `leaf`:         The leaf whose task just ran.
    /// * `usage`:        The resources the run consumed.
    /// * `tsc`:          The cycle counter value for this tick.
    pub fn finish_and_account_towards_root(
        &mut self,
        wakeup_queue: &mut SchedWakeupQueue,
        leaf: TcId,
        usage: &ResourceArr,
        tsc: u64,
    ) {
        self.node_mut(leaf).stats.usage.accumulate(usage);

        let mut child = leaf;
        let mut child_blocked = self.node(leaf).blocked;
        let mut cur = self.node(leaf).parent;

        while let Some(id) = cur {
            let parent = self.node(id).parent;
            self.node_mut(id).stats.usage.accumulate(usage);

            let nowblocked = match self.node(id).policy() {
                Policy::Priority => {
                    if child_blocked {
                        let kids = self.priority_children(id);
                        let fr = self.first_unblocked(&kids);
                        if let PolicyState::Priority(ref mut s) = self.node_mut(id).state {
                            s.first_runnable = fr;
                        }
                        fr == kids.len()
                    } else {
                        false
                    }
                }
                Policy::WeightedFair => {
                    let tc = self.node_mut(id);
                    if let PolicyState::WeightedFair(ref mut s) = tc.state {
                        let amount = usage[s.resource];
                        if let Some(mut top) = s.runnable.peek_mut() {
                            debug_assert_eq!(top.child, child);
                            let charge = top.stride * amount as i64;
                            top.pass += charge;
                            if child_blocked {
                                let item = PeekMut::pop(top);
                                s.blocked.push(item);
                            }
                        }
                        s.runnable.is_empty()
                    } else {
                        false
                    }
                }
                Policy::RoundRobin => {
                    let tc = self.node_mut(id);
                    if let PolicyState::RoundRobin(ref mut s) = tc.state {
                        if child_blocked {
                            debug_assert_eq!(s.children[s.next_child], child);
                            let c = s.children.remove(s.next_child);
                            s.blocked.push(c);
                            if s.children.is_empty() {
                                s.next_child = 0;
                            } else {
                                s.next_child %= s.children.len();
                            }
                        } else if !s.children.is_empty() {
                            s.next_child = (s.next_child + 1) % s.children.len();
                        }
                        s.children.is_empty()
                    } else {
                        false
                    }
                }
                Policy::RateLimit => {
                    let mut throttled = false;
                    let mut wakeup_at = 0;
                    {
                        let tc = self.node_mut(id);
                        if let PolicyState::RateLimit(ref mut s) = tc.state {
                            if s.limit != 0 {
                                let consumed = usage[s.resource]
                                    .saturating_mul(1u64 << USAGE_AMPLIFIER_POW);
                                if s.tokens < consumed {
                                    let deficit = consumed - s.tokens;
                                    let wait = deficit / s.limit
                                        + if deficit % s.limit != 0 { 1 } else { 0 };
                                    s.tokens = 0;
                                    throttled = true;
                                    wakeup_at = tsc.saturating_add(wait);
                                } else {
                                    s.tokens = cmp::min(s.tokens - consumed, s.max_burst);
                                }
                            }
                        }
                        if throttled {
                            tc.wakeup_time = wakeup_at;
                            tc.stats.cnt_throttled += 1;
                        }
                    }
                    if throttled {
                        wakeup_queue.add(id, wakeup_at);
                        trace!("Throttled {} until {}", self.node(id).name, wakeup_at);
                    }
                    throttled || child_blocked
                }
                // Leaves are never parents.
                Policy::Leaf => false,
            };

            if nowblocked && !self.node(id).blocked {
                self.node_mut(id).blocked = true;
            }

            child_blocked = self.node(id).blocked;
            child = id;
            cur = parent;
        }
    }

    /// Marks a ready leaf blocked and propagates towards the root. This
    /// is the side channel a task's environment uses when the task ran
    /// out of work; the scheduler calls it after accounting a run that
    /// returned `TaskState::Blocked`. Returns false if the leaf was
    /// already blocked (in which case nothing is signalled upwards) or
    /// if `id` is not a live leaf.
    pub fn block(&mut self, id: TcId) -> bool {
        match self.get(id) {
            Some(tc) if tc.policy() == Policy::Leaf && !tc.blocked => {}
            _ => return false,
        }
        self.block_towards_root_set_blocked(id, true);
        true
    }

    /// Marks a blocked leaf ready again and propagates towards the
    /// root.
    ///
    /// # Arguments
    ///
    /// * `id`:  The leaf to wake.
    /// * `tsc`: The current cycle counter value, checked against the
    ///          throttle windows of the ancestors.
    ///
    /// # Return
    ///
    /// True if the leaf transitioned to ready. False if it was already
    /// unblocked or `id` is not a live leaf.
    pub fn unblock(&mut self, id: TcId, tsc: u64) -> bool {
        match self.get(id) {
            Some(tc) if tc.policy() == Policy::Leaf && tc.blocked => {}
            _ => return false,
        }
        self.unblock_towards_root_set_blocked(id, tsc, false);
        true
    }

    /// Unblocks a throttled rate-limit class once its wakeup time has
    /// passed. Called by the scheduler when draining the wakeup queue.
    ///
    /// # Arguments
    ///
    /// * `id`:  The rate-limit class to wake.
    /// * `tsc`: The cycle counter value of the wakeup.
    ///
    /// # Return
    ///
    /// True if the class was unblocked. The wakeup is skipped, returning
    /// false, if the class was destroyed, is no longer blocked, or its
    /// child is itself blocked.
    pub fn wake(&mut self, id: TcId, tsc: u64) -> bool {
        let child = match self.get(id) {
            Some(tc) if tc.blocked => match tc.state {
                PolicyState::RateLimit(ref s) => s.child,
                _ => return false,
            },
            _ => return false,
        };
        match child {
            Some(c) if !self.node(c).blocked => {
                self.unblock_towards_root_set_blocked(id, tsc, false);
                true
            }
            _ => false,
        }
    }

    /// Sets the blocked flag and signals the parent only if this class
    /// just became unblocked.
    fn unblock_towards_root_set_blocked(&mut self, id: TcId, tsc: u64, nowblocked: bool) {
        let (became_unblocked, parent) = {
            let tc = self.node_mut(id);
            let became = !nowblocked && tc.blocked;
            tc.blocked = nowblocked;
            (became, tc.parent)
        };
        if became_unblocked {
            if let Some(p) = parent {
                self.unblock_towards_root(p, tsc);
            }
        }
    }

    /// Sets the blocked flag and signals the parent only if this class
    /// just became blocked.
    fn block_towards_root_set_blocked(&mut self, id: TcId, nowblocked: bool) {
        let (became_blocked, parent) = {
            let tc = self.node_mut(id);
            let became = nowblocked && !tc.blocked;
            tc.blocked = nowblocked;
            (became, tc.parent)
        };
        if became_blocked {
            if let Some(p) = parent {
                self.block_towards_root(p);
            }
        }
    }

    /// A child of `id` became runnable: pulls newly unblocked children
    /// back into the runnable set and recurses towards the root if `id`
    /// gained its first runnable child.
    fn unblock_towards_root(&mut self, id: TcId, tsc: u64) {
        let nowblocked = match self.node(id).policy() {
            Policy::Priority => {
                let kids = self.priority_children(id);
                let fr = self.first_unblocked(&kids);
                if let PolicyState::Priority(ref mut s) = self.node_mut(id).state {
                    s.first_runnable = fr;
                }
                fr == kids.len()
            }
            Policy::WeightedFair => {
                let parked: Vec<TcId> = match self.node(id).state {
                    PolicyState::WeightedFair(ref s) => {
                        s.blocked.iter().map(|c| c.child).collect()
                    }
                    _ => Vec::new(),
                };
                let ready: Vec<TcId> = parked
                    .into_iter()
                    .filter(|&c| !self.node(c).blocked)
                    .collect();
                let tc = self.node_mut(id);
                if let PolicyState::WeightedFair(ref mut s) = tc.state {
                    for c in ready {
                        if let Some(i) = s.blocked.iter().position(|item| item.child == c) {
                            let mut item = s.blocked.remove(i);
                            // A child returning from a long block does
                            // not get to bank the passes it missed.
                            let floor = s.runnable.peek().map_or(0, |top| top.pass);
                            item.pass = cmp::max(item.pass, floor);
                            s.runnable.push(item);
                        }
                    }
                    s.runnable.is_empty()
                } else {
                    false
                }
            }
            Policy::RoundRobin => {
                let parked: Vec<TcId> = match self.node(id).state {
                    PolicyState::RoundRobin(ref s) => s.blocked.clone(),
                    _ => Vec::new(),
                };
                let ready: Vec<TcId> = parked
                    .into_iter()
                    .filter(|&c| !self.node(c).blocked)
                    .collect();
                let tc = self.node_mut(id);
                if let PolicyState::RoundRobin(ref mut s) = tc.state {
                    for c in ready {
                        if let Some(i) = s.blocked.iter().position(|&b| b == c) {
                            s.blocked.remove(i);
                            // Returning children rejoin at the back of
                            // the turn order.
                            s.children.push(c);
                        }
                    }
                    s.children.is_empty()
                } else {
                    false
                }
            }
            Policy::RateLimit => {
                let (child, limit, tokens) = match self.node(id).state {
                    PolicyState::RateLimit(ref s) => (s.child, s.limit, s.tokens),
                    _ => (None, 0, 0),
                };
                let wakeup_time = self.node(id).wakeup_time;
                match child {
                    None => true,
                    Some(c) => {
                        self.node(c).blocked
                            || (limit != 0 && tokens == 0 && wakeup_time > tsc)
                    }
                }
            }
            Policy::Leaf => false,
        };

        self.unblock_towards_root_set_blocked(id, tsc, nowblocked);
    }

    /// A child of `id` became blocked: moves it out of the runnable set
    /// and recurses towards the root if `id` just lost its last
    /// runnable child.
    fn block_towards_root(&mut self, id: TcId) {
        let nowblocked = match self.node(id).policy() {
            Policy::Priority => {
                let kids = self.priority_children(id);
                let fr = self.first_unblocked(&kids);
                if let PolicyState::Priority(ref mut s) = self.node_mut(id).state {
                    s.first_runnable = fr;
                }
                fr == kids.len()
            }
            Policy::WeightedFair => {
                let stalled: Vec<TcId> = match self.node(id).state {
                    PolicyState::WeightedFair(ref s) => s.runnable
                        .iter()
                        .filter(|item| self.node(item.child).blocked)
                        .map(|item| item.child)
                        .collect(),
                    _ => Vec::new(),
                };
                if !stalled.is_empty() {
                    if let PolicyState::WeightedFair(ref mut s) = self.node_mut(id).state {
                        let mut items =
                            mem::replace(&mut s.runnable, BinaryHeap::new()).into_vec();
                        let mut i = 0;
                        while i < items.len() {
                            if stalled.contains(&items[i].child) {
                                let item = items.remove(i);
                                s.blocked.push(item);
                            } else {
                                i += 1;
                            }
                        }
                        s.runnable = BinaryHeap::from(items);
                    }
                }
                match self.node(id).state {
                    PolicyState::WeightedFair(ref s) => s.runnable.is_empty(),
                    _ => false,
                }
            }
            Policy::RoundRobin => {
                let (kids, cursor) = match self.node(id).state {
                    PolicyState::RoundRobin(ref s) => (s.children.clone(), s.next_child),
                    _ => (Vec::new(), 0),
                };
                let stalled: Vec<usize> = kids
                    .iter()
                    .enumerate()
                    .filter(|&(_, &c)| self.node(c).blocked)
                    .map(|(i, _)| i)
                    .collect();
                let tc = self.node_mut(id);
                if let PolicyState::RoundRobin(ref mut s) = tc.state {
                    let mut cursor = cursor;
                    for &i in stalled.iter().rev() {
                        let c = s.children.remove(i);
                        s.blocked.push(c);
                        if i < cursor {
                            cursor -= 1;
                        }
                    }
                    if s.children.is_empty() {
                        s.next_child = 0;
                    } else {
                        s.next_child = cursor % s.children.len();
                    }
                    s.children.is_empty()
                } else {
                    false
                }
            }
            Policy::RateLimit => true,
            Policy::Leaf => false,
        };

        self.block_towards_root_set_blocked(id, nowblocked);
    }

    /// Child identifiers of a priority class, in priority order.
    fn priority_children(&self, id: TcId) -> Vec<TcId> {
        match self.node(id).state {
            PolicyState::Priority(ref s) => s.children.iter().map(|c| c.child).collect(),
            _ => Vec::new(),
        }
    }

    /// Index of the first unblocked child in `kids`, or `kids.len()`.
    fn first_unblocked(&self, kids: &[TcId]) -> usize {
        kids.iter()
            .position(|&c| !self.node(c).blocked)
            .unwrap_or(kids.len())
    }

    /// Descriptors for every direct child of `id`, including blocked
    /// ones.
    fn child_args(&self, id: TcId) -> Vec<TcChildArgs> {
        match self.node(id).state {
            PolicyState::Priority(ref s) => s.children
                .iter()
                .map(|c| TcChildArgs::Priority(c.priority, c.child))
                .collect(),
            PolicyState::WeightedFair(ref s) => s.all_children
                .iter()
                .map(|&(c, share)| TcChildArgs::WeightedFair(share, c))
                .collect(),
            PolicyState::RoundRobin(ref s) => s.all_children
                .iter()
                .map(|&c| TcChildArgs::RoundRobin(c))
                .collect(),
            PolicyState::RateLimit(ref s) => {
                s.child.iter().map(|&c| TcChildArgs::RateLimit(c)).collect()
            }
            PolicyState::Leaf(_) => Vec::new(),
        }
    }

    /// Calls `f` with a descriptor for every direct child of `id`.
    pub fn traverse_children<F: FnMut(TcChildArgs)>(&self, id: TcId, f: &mut F) {
        for args in self.child_args(id) {
            f(args);
        }
    }

    /// Calls `f` with a descriptor for every edge in the subtree rooted
    /// at `id`, parents before children.
    pub fn traverse<F: FnMut(TcChildArgs)>(&self, id: TcId, f: &mut F) {
        for args in self.child_args(id) {
            f(args);
            self.traverse(args.child(), f);
        }
    }

    /// The number of classes in the subtree rooted at `id`, including
    /// `id` itself.
    pub fn size_of(&self, id: TcId) -> usize {
        1 + self.child_args(id)
            .iter()
            .map(|a| self.size_of(a.child()))
            .sum::<usize>()
    }

    /// The root of the tree `id` belongs to. Walks parent links, so
    /// avoid it on hot paths.
    pub fn root_of(&self, id: TcId) -> TcId {
        match self.node(id).parent {
            Some(p) => self.root_of(p),
            None => id,
        }
    }

    /// Stride-scheduling state of a weighted-fair class's runnable
    /// children, for assertions: (stride, pass, child) sorted by child.
    #[cfg(test)]
    fn wf_items(&self, id: TcId) -> Vec<(i64, i64, TcId)> {
        match self.node(id).state {
            PolicyState::WeightedFair(ref s) => {
                let mut items: Vec<(i64, i64, TcId)> = s.runnable
                    .iter()
                    .map(|c| (c.stride, c.pass, c.child))
                    .collect();
                items.sort_by_key(|&(_, _, c)| c);
                items
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use resource::{Resource, ResourceArr};
    use sched::SchedWakeupQueue;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use task::{Task, TaskState};

    /// A task that is always ready and consumes nothing.
    struct NullTask;

    impl Task for NullTask {
        fn attach(&mut self, _tc: TcId) {}
        fn detach(&mut self) {}
        fn run(&mut self) -> (TaskState, ResourceArr) {
            (TaskState::Ready, ResourceArr::new())
        }
    }

    /// A task that records whether it is currently attached.
    struct TetheredTask {
        attached: Arc<AtomicBool>,
    }

    impl Task for TetheredTask {
        fn attach(&mut self, _tc: TcId) {
            self.attached.store(true, Ordering::Relaxed);
        }
        fn detach(&mut self) {
            self.attached.store(false, Ordering::Relaxed);
        }
        fn run(&mut self) -> (TaskState, ResourceArr) {
            (TaskState::Ready, ResourceArr::new())
        }
    }

    const HZ: u64 = 1 << 30;

    fn builder() -> TrafficClassBuilder {
        TrafficClassBuilder::with_tsc_hz(HZ)
    }

    fn leaf(tcs: &mut TrafficClassBuilder, name: &str) -> TcId {
        tcs.create_leaf(name, Box::new(NullTask)).unwrap()
    }

    fn packet_usage(n: u64) -> ResourceArr {
        let mut usage = ResourceArr::new();
        usage[Resource::Count] = 1;
        usage[Resource::Packet] = n;
        usage
    }

    #[test]
    fn work_unit_conversion_is_exact() {
        // (x << 28) / (hz >> 4), pinned bit for bit.
        assert_eq!(to_work_units(1 << 20, 1 << 30), 1 << 22);
        assert_eq!(to_work_units(1 << 30, 1 << 30), 1 << 32);
        assert_eq!(to_work_units(1_000_000_000, 1 << 32), 1_000_000_000);
        assert_eq!(to_work_units(0, 1 << 30), 0);
        assert_eq!(to_work_units(3, 1 << 30), (3u64 << 28) / (1u64 << 26));
    }

    #[test]
    fn registry_enforces_unique_names() {
        let mut tcs = builder();
        let first = tcs.create_priority("foo");
        assert!(first.is_some());
        assert!(tcs.create_round_robin("foo").is_none());
        assert_eq!(tcs.find("foo"), first);

        tcs.clear_all();
        assert_eq!(tcs.find("foo"), None);
    }

    #[test]
    fn add_child_rejects_bad_attachments() {
        let mut tcs = builder();
        let root = tcs.create_priority("root").unwrap();
        let other = tcs.create_priority("other").unwrap();
        let l = leaf(&mut tcs, "l");

        assert!(tcs.add_child(root, TcChildArgs::Priority(1, l)));
        // Already parented.
        assert!(!tcs.add_child(other, TcChildArgs::Priority(1, l)));
        // Descriptor does not match the parent's policy.
        assert!(!tcs.add_child(other, TcChildArgs::RoundRobin(root)));
        // Leaves take no children.
        let l2 = leaf(&mut tcs, "l2");
        assert!(!tcs.add_child(l, TcChildArgs::Priority(1, l2)));
        // Zero shares are rejected.
        let wf = tcs.create_weighted_fair("wf", Resource::Packet).unwrap();
        assert!(!tcs.add_child(wf, TcChildArgs::WeightedFair(0, l2)));
        // A rate limit holds exactly one child.
        let rl = tcs.create_rate_limit("rl", Resource::Bit, 1 << 30, 1 << 30)
            .unwrap();
        assert!(tcs.add_child(rl, TcChildArgs::RateLimit(l2)));
        let l3 = leaf(&mut tcs, "l3");
        assert!(!tcs.add_child(rl, TcChildArgs::RateLimit(l3)));
        // Unknown child on remove.
        assert!(!tcs.remove_child(root, l3));
    }

    #[test]
    fn priority_picks_lowest_priority_value() {
        let mut tcs = builder();
        let root = tcs.create_priority("root").unwrap();
        let a = leaf(&mut tcs, "a");
        let b = leaf(&mut tcs, "b");
        assert!(tcs.add_child(root, TcChildArgs::Priority(10, a)));
        assert!(tcs.add_child(root, TcChildArgs::Priority(1, b)));

        assert_eq!(tcs.pick_next_child(root, 0), Some(b));

        assert!(tcs.block(b));
        assert_eq!(tcs.pick_next_child(root, 0), Some(a));

        assert!(tcs.unblock(b, 0));
        assert_eq!(tcs.pick_next_child(root, 0), Some(b));
    }

    #[test]
    fn add_then_remove_leaves_parent_unchanged() {
        let mut tcs = builder();
        let root = tcs.create_priority("root").unwrap();
        let a = leaf(&mut tcs, "a");
        assert!(tcs.add_child(root, TcChildArgs::Priority(5, a)));

        let pick_before = tcs.pick_next_child(root, 0);
        let blocked_before = tcs.get(root).unwrap().blocked();
        let size_before = tcs.size_of(root);

        let b = leaf(&mut tcs, "b");
        assert!(tcs.add_child(root, TcChildArgs::Priority(1, b)));
        assert!(tcs.remove_child(root, b));

        assert_eq!(tcs.pick_next_child(root, 0), pick_before);
        assert_eq!(tcs.get(root).unwrap().blocked(), blocked_before);
        assert_eq!(tcs.size_of(root), size_before);
        // The detached child is still registered and can be reused.
        assert_eq!(tcs.find("b"), Some(b));
        assert_eq!(tcs.get(b).unwrap().parent(), None);
    }

    #[test]
    fn removing_last_runnable_child_blocks_parent() {
        let mut tcs = builder();
        let root = tcs.create_priority("root").unwrap();
        let a = leaf(&mut tcs, "a");
        assert!(tcs.add_child(root, TcChildArgs::Priority(1, a)));
        assert!(!tcs.get(root).unwrap().blocked());

        assert!(tcs.remove_child(root, a));
        assert!(tcs.get(root).unwrap().blocked());

        assert!(tcs.add_child(root, TcChildArgs::Priority(1, a)));
        assert!(!tcs.get(root).unwrap().blocked());
    }

    #[test]
    fn wfq_charges_stride_per_unit_of_usage() {
        let mut tcs = builder();
        let mut wakeups = SchedWakeupQueue::new();
        let root = tcs.create_weighted_fair("root", Resource::Packet).unwrap();
        let x = leaf(&mut tcs, "x");
        let y = leaf(&mut tcs, "y");
        assert!(tcs.add_child(root, TcChildArgs::WeightedFair(2, x)));
        assert!(tcs.add_child(root, TcChildArgs::WeightedFair(4, y)));

        let first = tcs.pick_next_child(root, 0).unwrap();
        tcs.finish_and_account_towards_root(&mut wakeups, first, &packet_usage(3), 0);

        let items = tcs.wf_items(root);
        let (stride, pass, _) = *items.iter().find(|&&(_, _, c)| c == first).unwrap();
        assert_eq!(pass, stride * 3);
        let (_, other_pass, _) = *items.iter().find(|&&(_, _, c)| c != first).unwrap();
        assert_eq!(other_pass, 0);

        // The uncharged child now has the lower pass and runs next.
        let second = tcs.pick_next_child(root, 0).unwrap();
        assert!(second != first);
    }

    #[test]
    fn wfq_wakeup_does_not_bank_missed_passes() {
        let mut tcs = builder();
        let mut wakeups = SchedWakeupQueue::new();
        let root = tcs.create_weighted_fair("root", Resource::Packet).unwrap();
        let x = leaf(&mut tcs, "x");
        let y = leaf(&mut tcs, "y");
        assert!(tcs.add_child(root, TcChildArgs::WeightedFair(1, x)));
        assert!(tcs.add_child(root, TcChildArgs::WeightedFair(1, y)));

        assert!(tcs.block(y));
        for _ in 0..5 {
            assert_eq!(tcs.pick_next_child(root, 0), Some(x));
            tcs.finish_and_account_towards_root(&mut wakeups, x, &packet_usage(1), 0);
        }

        assert!(tcs.unblock(y, 0));
        let items = tcs.wf_items(root);
        let (_, x_pass, _) = *items.iter().find(|&&(_, _, c)| c == x).unwrap();
        let (_, y_pass, _) = *items.iter().find(|&&(_, _, c)| c == y).unwrap();
        assert_eq!(x_pass, STRIDE1 * 5);
        // Y rejoins even with X instead of monopolizing the tree.
        assert_eq!(y_pass, x_pass);
    }

    #[test]
    fn rate_limit_throttles_and_wakes() {
        let mut tcs = builder();
        let mut wakeups = SchedWakeupQueue::new();
        // 2^30 bits per second at a 2^30 Hz counter: one bit per cycle,
        // with a bucket that holds a single bit.
        let rl = tcs.create_rate_limit("rl", Resource::Bit, 1 << 30, 1 << 30)
            .unwrap();
        let l = leaf(&mut tcs, "l");
        assert!(tcs.add_child(rl, TcChildArgs::RateLimit(l)));
        assert!(!tcs.get(rl).unwrap().blocked());

        let t0 = 1_000;
        assert_eq!(tcs.pick_next_child(rl, t0), Some(l));

        let mut usage = ResourceArr::new();
        usage[Resource::Count] = 1;
        usage[Resource::Bit] = 1_024;
        tcs.finish_and_account_towards_root(&mut wakeups, l, &usage, t0);

        // The bucket held one bit; 1024 bits at one bit per cycle leave
        // 1023 cycles of debt.
        let tc = tcs.get(rl).unwrap();
        assert!(tc.blocked());
        assert_eq!(tc.wakeup_time(), t0 + 1_023);
        assert_eq!(tc.stats().cnt_throttled, 1);
        assert_eq!(wakeups.peek(), Some((t0 + 1_023, rl)));

        // Waking before the deadline is the queue's job to prevent; the
        // class itself accepts the wakeup only once time has advanced.
        assert!(tcs.wake(rl, t0 + 1_023));
        assert!(!tcs.get(rl).unwrap().blocked());
        assert_eq!(tcs.pick_next_child(rl, t0 + 1_023), Some(l));
    }

    #[test]
    fn rate_limit_bucket_never_exceeds_burst() {
        let mut tcs = builder();
        let rl = tcs.create_rate_limit("rl", Resource::Bit, 1 << 30, 1 << 30)
            .unwrap();
        let l = leaf(&mut tcs, "l");
        assert!(tcs.add_child(rl, TcChildArgs::RateLimit(l)));

        // An enormous idle gap still only refills one burst.
        assert_eq!(tcs.pick_next_child(rl, 1 << 40), Some(l));
        let burst = tcs.get(rl).unwrap().max_burst().unwrap();
        assert_eq!(burst, 1 << 32);
        if let PolicyState::RateLimit(ref s) = tcs.node(rl).state {
            assert_eq!(s.tokens, burst);
        } else {
            panic!("not a rate limit");
        }
    }

    #[test]
    fn unlimited_rate_limit_is_transparent() {
        let mut tcs = builder();
        let mut wakeups = SchedWakeupQueue::new();
        let rl = tcs.create_rate_limit("rl", Resource::Bit, 0, 0).unwrap();
        let l = leaf(&mut tcs, "l");
        assert!(tcs.add_child(rl, TcChildArgs::RateLimit(l)));

        for t in 0..100 {
            assert_eq!(tcs.pick_next_child(rl, t), Some(l));
            let mut usage = ResourceArr::new();
            usage[Resource::Bit] = u64::max_value() >> 8;
            tcs.finish_and_account_towards_root(&mut wakeups, l, &usage, t);
            assert!(!tcs.get(rl).unwrap().blocked());
        }
        assert_eq!(tcs.get(rl).unwrap().stats().cnt_throttled, 0);
    }

    #[test]
    fn propagation_is_edge_triggered() {
        let mut tcs = builder();
        let p = tcs.create_priority("p").unwrap();
        let w = tcs.create_weighted_fair("w", Resource::Count).unwrap();
        let l1 = leaf(&mut tcs, "l1");
        let l2 = leaf(&mut tcs, "l2");
        assert!(tcs.add_child(p, TcChildArgs::Priority(0, w)));
        assert!(tcs.add_child(w, TcChildArgs::WeightedFair(1, l1)));
        assert!(tcs.add_child(w, TcChildArgs::WeightedFair(1, l2)));

        assert!(!tcs.get(p).unwrap().blocked());
        assert!(!tcs.get(w).unwrap().blocked());

        // One blocked child leaves the subtree runnable.
        assert!(tcs.block(l1));
        assert!(!tcs.get(w).unwrap().blocked());
        assert!(!tcs.get(p).unwrap().blocked());

        // Repeating the block changes nothing and signals nothing.
        assert!(!tcs.block(l1));

        // Losing the last runnable leaf blocks the whole path, once.
        assert!(tcs.block(l2));
        assert!(tcs.get(w).unwrap().blocked());
        assert!(tcs.get(p).unwrap().blocked());
        assert!(!tcs.block(l2));

        // First wakeup reopens the path.
        assert!(tcs.unblock(l1, 0));
        assert!(!tcs.get(w).unwrap().blocked());
        assert!(!tcs.get(p).unwrap().blocked());
        assert!(!tcs.unblock(l1, 0));
    }

    #[test]
    fn create_tree_round_trips_descriptors() {
        let mut tcs = builder();
        let root = tcs.create_tree(TcSpec::Priority {
            name: "root".to_string(),
            children: vec![
                (
                    1,
                    TcSpec::Leaf {
                        name: "fast".to_string(),
                        task: Box::new(NullTask),
                    },
                ),
                (
                    2,
                    TcSpec::RateLimit {
                        name: "shaped".to_string(),
                        resource: Resource::Bit,
                        limit: 1 << 30,
                        max_burst: 1 << 30,
                        child: Some(Box::new(TcSpec::Leaf {
                            name: "slow".to_string(),
                            task: Box::new(NullTask),
                        })),
                    },
                ),
            ],
        }).unwrap();

        assert_eq!(tcs.find("root"), Some(root));
        let fast = tcs.find("fast").unwrap();
        let shaped = tcs.find("shaped").unwrap();
        let slow = tcs.find("slow").unwrap();

        let mut edges = Vec::new();
        tcs.traverse(root, &mut |args| edges.push(args));
        assert_eq!(
            edges,
            vec![
                TcChildArgs::Priority(1, fast),
                TcChildArgs::Priority(2, shaped),
                TcChildArgs::RateLimit(slow),
            ]
        );

        assert_eq!(tcs.size_of(root), 4);
        assert_eq!(tcs.root_of(slow), root);
        assert_eq!(tcs.get(shaped).unwrap().limit_arg(), Some(1 << 30));
        assert_eq!(tcs.get(shaped).unwrap().policy(), Policy::RateLimit);
    }

    #[test]
    fn clear_destroys_a_subtree_and_detaches_tasks() {
        let mut tcs = builder();
        let attached = Arc::new(AtomicBool::new(false));
        let root = tcs.create_priority("root").unwrap();
        let rl = tcs.create_rate_limit("rl", Resource::Bit, 1 << 30, 1 << 30)
            .unwrap();
        let l = tcs.create_leaf(
            "l",
            Box::new(TetheredTask {
                attached: attached.clone(),
            }),
        ).unwrap();
        assert!(tcs.add_child(rl, TcChildArgs::RateLimit(l)));
        assert!(tcs.add_child(root, TcChildArgs::Priority(1, rl)));
        assert!(attached.load(Ordering::Relaxed));
        assert!(!tcs.get(root).unwrap().blocked());

        assert!(tcs.clear(rl));
        assert_eq!(tcs.find("rl"), None);
        assert_eq!(tcs.find("l"), None);
        assert!(!attached.load(Ordering::Relaxed));
        // The root lost its only runnable child.
        assert!(tcs.get(root).unwrap().blocked());
        assert_eq!(tcs.size_of(root), 1);

        assert!(!tcs.clear(rl));
    }

    #[test]
    fn round_robin_rotates_after_each_run() {
        let mut tcs = builder();
        let mut wakeups = SchedWakeupQueue::new();
        let root = tcs.create_round_robin("root").unwrap();
        let l1 = leaf(&mut tcs, "l1");
        let l2 = leaf(&mut tcs, "l2");
        assert!(tcs.add_child(root, TcChildArgs::RoundRobin(l1)));
        assert!(tcs.add_child(root, TcChildArgs::RoundRobin(l2)));

        let usage = packet_usage(1);
        assert_eq!(tcs.pick_next_child(root, 0), Some(l1));
        tcs.finish_and_account_towards_root(&mut wakeups, l1, &usage, 0);
        assert_eq!(tcs.pick_next_child(root, 0), Some(l2));
        tcs.finish_and_account_towards_root(&mut wakeups, l2, &usage, 0);
        assert_eq!(tcs.pick_next_child(root, 0), Some(l1));
    }
}
