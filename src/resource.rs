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

use std::ops::{Index, IndexMut};

/// The number of resource types a traffic class accounts for.
pub const NUM_RESOURCES: usize = 4;

/// A resource that can be accounted for while running a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Count of how many times a class was scheduled.
    Count = 0,

    /// CPU cycles consumed.
    Cycle = 1,

    /// Packets emitted or processed.
    Packet = 2,

    /// Bits emitted or processed.
    Bit = 3,
}

/// Every resource, in index order.
pub const ALL_RESOURCES: [Resource; NUM_RESOURCES] = [
    Resource::Count,
    Resource::Cycle,
    Resource::Packet,
    Resource::Bit,
];

impl Resource {
    /// Returns the textual name of this resource, as used by configuration
    /// files and log output.
    pub fn name(&self) -> &'static str {
        match *self {
            Resource::Count => "count",
            Resource::Cycle => "cycle",
            Resource::Packet => "packet",
            Resource::Bit => "bit",
        }
    }

    /// Parses a textual resource name. Returns `None` if the name does not
    /// identify a resource.
    pub fn from_name(name: &str) -> Option<Resource> {
        match name {
            "count" => Some(Resource::Count),
            "cycle" => Some(Resource::Cycle),
            "packet" => Some(Resource::Packet),
            "bit" => Some(Resource::Bit),
            _ => None,
        }
    }
}

/// A vector of counters, one per resource type. This is the currency in
/// which tasks report usage and traffic classes accumulate statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceArr(pub [u64; NUM_RESOURCES]);

impl ResourceArr {
    /// Returns a zeroed usage vector.
    pub fn new() -> ResourceArr {
        ResourceArr([0; NUM_RESOURCES])
    }

    /// Componentwise addition of `other` into `self`.
    #[inline]
    pub fn accumulate(&mut self, other: &ResourceArr) {
        for i in 0..NUM_RESOURCES {
            self.0[i] = self.0[i].wrapping_add(other.0[i]);
        }
    }
}

impl Index<Resource> for ResourceArr {
    type Output = u64;

    #[inline]
    fn index(&self, r: Resource) -> &u64 {
        &self.0[r as usize]
    }
}

impl IndexMut<Resource> for ResourceArr {
    #[inline]
    fn index_mut(&mut self, r: Resource) -> &mut u64 {
        &mut self.0[r as usize]
    }
}

#[cfg(test)]
mod test {
    use super::{Resource, ResourceArr, ALL_RESOURCES};

    #[test]
    fn accumulate_is_componentwise() {
        let mut acc = ResourceArr([1, 2, 3, 4]);
        acc.accumulate(&ResourceArr([10, 20, 30, 40]));
        assert_eq!(acc, ResourceArr([11, 22, 33, 44]));
    }

    #[test]
    fn names_round_trip() {
        for r in ALL_RESOURCES.iter() {
            assert_eq!(Resource::from_name(r.name()), Some(*r));
        }
        assert_eq!(Resource::from_name("bogus"), None);
    }

    #[test]
    fn indexing_matches_layout() {
        let mut usage = ResourceArr::new();
        usage[Resource::Packet] = 32;
        usage[Resource::Bit] = 32 * 1500 * 8;
        assert_eq!(usage.0[2], 32);
        assert_eq!(usage.0[3], 32 * 1500 * 8);
    }
}
