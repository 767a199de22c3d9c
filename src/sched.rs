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
use std::collections::{BinaryHeap, HashSet};

use resource::Resource;
use task::TaskState;
use tc::{Policy, TcId, TrafficClassBuilder};

/// An entry in the wakeup queue: a throttled class and the counter value
/// at which it becomes eligible again.
#[derive(Clone, Copy, Debug)]
struct WakeupEntry {
    time: u64,
    tc: TcId,
}

// Reversed so that BinaryHeap behaves as a min-heap on wakeup time.
impl Ord for WakeupEntry {
    fn cmp(&self, other: &WakeupEntry) -> cmp::Ordering {
        other.time.cmp(&self.time).then(other.tc.cmp(&self.tc))
    }
}

impl PartialOrd for WakeupEntry {
    fn partial_cmp(&self, other: &WakeupEntry) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for WakeupEntry {
    fn eq(&self, other: &WakeupEntry) -> bool {
        self.time == other.time && self.tc == other.tc
    }
}

impl Eq for WakeupEntry {}

/// A time-ordered queue of throttled rate-limit classes. Each class is
/// queued at most once; re-adding a queued class is a no-op, so the
/// first pending wakeup wins. Entries are validated when they fire, so a
/// class destroyed while queued is simply skipped.
pub struct SchedWakeupQueue {
    queue: BinaryHeap<WakeupEntry>,
    queued: HashSet<TcId>,
}

impl SchedWakeupQueue {
    /// Returns an empty wakeup queue.
    pub fn new() -> SchedWakeupQueue {
        SchedWakeupQueue {
            queue: BinaryHeap::new(),
            queued: HashSet::new(),
        }
    }

    /// Queues `tc` for wakeup. A no-op if `tc` is already queued.
    ///
    /// # Arguments
    ///
    /// * `tc`:   The throttled class.
    /// * `time`: The counter value at which it becomes eligible again.
    pub fn add(&mut self, tc: TcId, time: u64) {
        if self.queued.insert(tc) {
            self.queue.push(WakeupEntry { time: time, tc: tc });
        }
    }

    /// The earliest pending wakeup, if any.
    pub fn peek(&self) -> Option<(u64, TcId)> {
        self.queue.peek().map(|e| (e.time, e.tc))
    }

    /// Removes and returns the earliest pending wakeup.
    pub fn pop(&mut self) -> Option<(u64, TcId)> {
        self.queue.pop().map(|e| {
            self.queued.remove(&e.tc);
            (e.time, e.tc)
        })
    }

    /// The number of pending wakeups.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Counters describing what the scheduler did outside of running tasks.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerStats {
    /// Ticks on which no leaf was runnable.
    pub cnt_idle: u64,

    /// Cycles spent on idle ticks.
    pub cycles_idle: u64,
}

/// Drives one scheduling tree on one worker. Every call to
/// `schedule_once()` services due wakeups, walks the tree from the root
/// to a runnable leaf, runs that leaf's task, and accounts the usage
/// back up the tree. The worker thread owns both the scheduler and
/// mutable access to the builder for the duration of a tick; nothing
/// here blocks.
pub struct Scheduler {
    /// The root of the tree this scheduler drives.
    root: TcId,

    /// Throttled classes waiting out their token debt.
    wakeup_queue: SchedWakeupQueue,

    /// Counter value at the end of the previous tick.
    checkpoint: u64,

    stats: SchedulerStats,
}

impl Scheduler {
    /// Returns a scheduler driving the tree rooted at `root`.
    pub fn new(root: TcId) -> Scheduler {
        Scheduler {
            root: root,
            wakeup_queue: SchedWakeupQueue::new(),
            checkpoint: 0,
            stats: SchedulerStats::default(),
        }
    }

    /// The root of the tree this scheduler drives.
    pub fn root(&self) -> TcId {
        self.root
    }

    /// Idle accounting for this scheduler.
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// The counter value of the earliest pending wakeup, if any. When a
    /// tick comes back idle the worker can sleep until this time instead
    /// of spinning.
    pub fn next_wakeup(&self) -> Option<u64> {
        self.wakeup_queue.peek().map(|(time, _)| time)
    }

    /// Runs one tick.
    ///
    /// # Arguments
    ///
    /// * `tcs`: The builder owning the tree being driven.
    /// * `now`: The cycle counter value for this tick.
    ///
    /// # Return
    ///
    /// The leaf whose task ran, or `None` if the tree had no runnable
    /// leaf.
    pub fn schedule_once(&mut self, tcs: &mut TrafficClassBuilder, now: u64) -> Option<TcId> {
        // Wake every class whose throttle window has passed.
        while let Some((time, _)) = self.wakeup_queue.peek() {
            if time > now {
                break;
            }
            if let Some((_, tc)) = self.wakeup_queue.pop() {
                tcs.wake(tc, now);
            }
        }

        let leaf = match self.next_leaf(tcs, now) {
            Some(leaf) => leaf,
            None => {
                self.stats.cnt_idle += 1;
                self.stats.cycles_idle += now.saturating_sub(self.checkpoint);
                self.checkpoint = now;
                return None;
            }
        };

        let (state, mut usage) = match tcs.run_leaf(leaf) {
            Some(result) => result,
            None => return None,
        };
        usage[Resource::Count] = 1;

        tcs.finish_and_account_towards_root(&mut self.wakeup_queue, leaf, &usage, now);
        if state == TaskState::Blocked {
            tcs.block(leaf);
        }

        self.checkpoint = now;
        Some(leaf)
    }

    /// Walks from the root to the next runnable leaf.
    fn next_leaf(&mut self, tcs: &mut TrafficClassBuilder, now: u64) -> Option<TcId> {
        let mut cur = self.root;
        if tcs.get(cur)?.blocked() {
            return None;
        }
        loop {
            if tcs.get(cur)?.policy() == Policy::Leaf {
                return Some(cur);
            }
            cur = tcs.pick_next_child(cur, now)?;
        }
    }
}
