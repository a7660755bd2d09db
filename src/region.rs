// src/region.rs

//! Memory regions as seen by the dependency system.
//!
//! Addresses are plain integers in the cluster-wide virtual address space
//! shared by every node's memory image.

use std::fmt;

/// Half-open byte range `[start, start + len)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Region {
    pub start: u64,
    pub len: u64,
}

impl Region {
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    pub const fn end(&self) -> u64 {
        self.start + self.len
    }

    pub const fn size(&self) -> u64 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Intersection of both regions, if it is not empty.
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        (start < end).then(|| Region::new(start, end - start))
    }

    /// True when `self` lies entirely inside `outer`.
    pub fn fully_contained_in(&self, outer: &Region) -> bool {
        outer.start <= self.start && self.end() <= outer.end()
    }

    pub fn contains(&self, inner: &Region) -> bool {
        inner.fully_contained_in(self)
    }

    /// Split into consecutive chunks of at most `max_len` bytes.
    pub fn fragments(&self, max_len: u64) -> Fragments {
        assert!(max_len > 0, "fragment size must be positive");
        Fragments {
            next: self.start,
            end: self.end(),
            max_len,
        }
    }

    /// Number of chunks `fragments(max_len)` yields.
    pub fn fragment_count(&self, max_len: u64) -> usize {
        assert!(max_len > 0, "fragment size must be positive");
        self.len.div_ceil(max_len) as usize
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Iterator returned by [`Region::fragments`].
#[derive(Debug, Clone)]
pub struct Fragments {
    next: u64,
    end: u64,
    max_len: u64,
}

impl Iterator for Fragments {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        if self.next >= self.end {
            return None;
        }
        let len = self.max_len.min(self.end - self.next);
        let fragment = Region::new(self.next, len);
        self.next += len;
        Some(fragment)
    }
}
