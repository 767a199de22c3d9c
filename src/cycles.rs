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

use std::thread;
use std::time::{Duration, Instant};

/// How long the one-time calibration below samples the counter for.
const CALIBRATE_MS: u64 = 20;

lazy_static! {
    static ref TSC_HZ: u64 = measure_frequency();
}

/// Returns the current value of the processor's monotonic cycle counter.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::_rdtsc;
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::_rdtsc;

    unsafe { _rdtsc() as u64 }
}

/// Returns a monotonic pseudo cycle counter (nanosecond granularity) on
/// targets without a TSC.
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
#[inline]
pub fn rdtsc() -> u64 {
    lazy_static! {
        static ref START: Instant = Instant::now();
    }

    let elapsed = START.elapsed();
    elapsed.as_secs() * 1_000_000_000 + elapsed.subsec_nanos() as u64
}

/// Returns the frequency of the cycle counter in cycles per second. The
/// frequency is measured once on first use and cached thereafter.
#[inline]
pub fn frequency() -> u64 {
    *TSC_HZ
}

/// Converts a count of cycles into seconds.
#[inline]
pub fn to_seconds(cycles: u64) -> f64 {
    cycles as f64 / frequency() as f64
}

/// Measures the frequency of the cycle counter by sampling it across a
/// short wall-clock sleep.
fn measure_frequency() -> u64 {
    let start_cycles = rdtsc();
    let start = Instant::now();

    thread::sleep(Duration::from_millis(CALIBRATE_MS));

    let elapsed_cycles = rdtsc() - start_cycles;
    let elapsed = start.elapsed();
    let elapsed_ns = elapsed.as_secs() * 1_000_000_000 + elapsed.subsec_nanos() as u64;

    let hz = elapsed_cycles.saturating_mul(1_000_000_000) / elapsed_ns;
    debug!("Calibrated cycle counter to {} Hz", hz);

    hz
}

#[cfg(test)]
mod test {
    use super::{frequency, rdtsc, to_seconds};

    #[test]
    fn counter_is_monotonic() {
        let first = rdtsc();
        let second = rdtsc();
        assert!(second >= first);
    }

    #[test]
    fn frequency_is_sane() {
        // Anything below a megahertz means the calibration went wrong.
        assert!(frequency() > 1_000_000);
    }

    #[test]
    fn seconds_scale_with_frequency() {
        let one_second = frequency();
        let secs = to_seconds(one_second);
        assert!(secs > 0.99 && secs < 1.01);
    }
}
