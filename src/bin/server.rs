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

extern crate env_logger;
extern crate libc;
#[macro_use]
extern crate log;
extern crate rand;
extern crate spin;
extern crate time;
extern crate weir;

use std::collections::HashMap;
use std::env;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use spin::Mutex;

use weir::config;
use weir::config::TreeConfig;
use weir::cycles;
use weir::resource::{Resource, ResourceArr};
use weir::sched::Scheduler;
use weir::task::{Task, TaskState};
use weir::tc::{TcId, TrafficClassBuilder};

/// A synthetic traffic source. Every run pretends to emit one batch of
/// packets of a random size, reporting the packets, bits, and cycles it
/// consumed. Stands in for a port-ingress module while exercising the
/// scheduler under load.
struct SourceTask {
    /// The leaf this task is attached to.
    tc: Option<TcId>,

    /// The largest batch a single run emits.
    max_batch: u64,

    /// Size of each synthetic packet in bytes.
    pkt_bytes: u64,

    rng: rand::XorShiftRng,
}

impl SourceTask {
    fn new(max_batch: u64, pkt_bytes: u64) -> SourceTask {
        SourceTask {
            tc: None,
            max_batch: max_batch,
            pkt_bytes: pkt_bytes,
            rng: rand::weak_rng(),
        }
    }
}

impl Task for SourceTask {
    fn attach(&mut self, tc: TcId) {
        self.tc = Some(tc);
    }

    fn detach(&mut self) {
        self.tc = None;
    }

    fn run(&mut self) -> (TaskState, ResourceArr) {
        let start = cycles::rdtsc();
        let pkts = self.rng.gen_range(1, self.max_batch + 1);

        let mut usage = ResourceArr::new();
        usage[Resource::Packet] = pkts;
        usage[Resource::Bit] = pkts * self.pkt_bytes * 8;
        usage[Resource::Cycle] = cycles::rdtsc() - start;
        (TaskState::Ready, usage)
    }
}

/// A task that does nothing and never blocks. Useful as a placeholder
/// leaf in a configured tree.
struct NullTask;

impl Task for NullTask {
    fn attach(&mut self, _tc: TcId) {}
    fn detach(&mut self) {}
    fn run(&mut self) -> (TaskState, ResourceArr) {
        (TaskState::Ready, ResourceArr::new())
    }
}

/// Maps a leaf's `task` string from the config file to a runnable task.
fn make_task(cfg: &TreeConfig) -> Result<Box<Task>, String> {
    match cfg.task.as_ref().map(|t| t.as_str()).unwrap_or("null") {
        "source" => Ok(Box::new(SourceTask::new(32, 1500))),
        "null" => Ok(Box::new(NullTask)),
        other => Err(format!("Unknown task kind {} on {}", other, cfg.name)),
    }
}

/// Pins the calling thread to `core`.
#[cfg(target_os = "linux")]
fn pin_thread(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!("Failed to pin worker to core {}", core);
        } else {
            info!("Pinned worker to core {}", core);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_thread(core: usize) {
    warn!("Core pinning unsupported on this platform (wanted core {})", core);
}

fn main() {
    env_logger::init();

    let path = env::args().nth(1).unwrap_or_else(|| "server.toml".to_string());
    let cfg = match config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    };

    let mut tcs = match cfg.tsc_hz {
        Some(hz) => TrafficClassBuilder::with_tsc_hz(hz),
        None => TrafficClassBuilder::new(),
    };
    let root = match config::build_tree(&mut tcs, &cfg.tree, &mut make_task) {
        Ok(root) => root,
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    };
    info!(
        "Built scheduling tree {} with {} classes at {} Hz",
        cfg.tree.name,
        tcs.size_of(root),
        tcs.tsc_hz()
    );

    // The worker owns the tree while running; the master thread takes
    // the registry mutex only briefly to report statistics.
    let tcs = Arc::new(Mutex::new(tcs));
    let core = cfg.core.unwrap_or(0);

    let _worker = {
        let tcs = tcs.clone();
        thread::spawn(move || {
            pin_thread(core);
            let mut sched = Scheduler::new(root);
            loop {
                let now = cycles::rdtsc();
                let ran = sched.schedule_once(&mut *tcs.lock(), now);
                if ran.is_none() {
                    // Nothing runnable. Nap briefly unless a throttled
                    // class is due to wake soon.
                    match sched.next_wakeup() {
                        Some(_) => thread::yield_now(),
                        None => thread::sleep(Duration::from_micros(100)),
                    }
                }
            }
        })
    };

    // Report per-class rates once a second.
    let mut last_ns = time::precise_time_ns();
    let mut prev: HashMap<String, ResourceArr> = HashMap::new();
    loop {
        thread::sleep(Duration::from_secs(1));

        let now_ns = time::precise_time_ns();
        let interval = (now_ns - last_ns) as f64 / 1e9;
        last_ns = now_ns;

        let guard = tcs.lock();
        let mut entries: Vec<(&String, &TcId)> = guard.all().iter().collect();
        entries.sort();
        for (name, &id) in entries {
            let tc = match guard.get(id) {
                Some(tc) => tc,
                None => continue,
            };
            let usage = tc.stats().usage;
            let old = prev.get(name).cloned().unwrap_or_else(ResourceArr::new);
            info!(
                "{:<16} {:>12.0} pps {:>14.0} bps sched {:>10} throttled {:>6}{}",
                name,
                (usage[Resource::Packet] - old[Resource::Packet]) as f64 / interval,
                (usage[Resource::Bit] - old[Resource::Bit]) as f64 / interval,
                usage[Resource::Count],
                tc.stats().cnt_throttled,
                if tc.blocked() { " (blocked)" } else { "" }
            );
            prev.insert(name.clone(), usage);
        }
    }
}
