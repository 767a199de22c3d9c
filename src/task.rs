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

use resource::ResourceArr;
use tc::TcId;

/// The state a task reports after every run. The scheduler treats
/// `Blocked` as a request to mark the task's leaf blocked once the run has
/// been accounted for; a blocked leaf is not scheduled again until the
/// task is woken through `TrafficClassBuilder::unblock()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// The task has more work and can be scheduled again.
    Ready,

    /// The task has nothing to do until it is explicitly woken.
    Blocked,
}

/// A unit of work that can be hung off a leaf traffic class and scheduled.
/// Modules (packet sources, classifiers, etc.) implement this trait; the
/// scheduler only ever sees the boxed trait object.
///
/// A run must always produce a usage vector and a state, even if the task
/// failed internally; the scheduler never unwinds across this boundary.
pub trait Task: Send {
    /// Called when the task is installed under a leaf traffic class. The
    /// identifier can be used to wake the leaf when new work arrives.
    fn attach(&mut self, tc: TcId);

    /// Called when the leaf releases the task, either because the leaf is
    /// being destroyed or because the task is being moved.
    fn detach(&mut self);

    /// Runs the task until it completes or yields. Returns the state the
    /// task is now in along with the resources the run consumed.
    fn run(&mut self) -> (TaskState, ResourceArr);
}
