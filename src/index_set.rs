//! Contiguous index ranges handed out by the cluster tree.

/// A contiguous range of degrees of freedom, identified by its offset in
/// the global numbering and its length. Blocks keep these by value; the
/// range carries no ownership of the indices it describes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IndexSet {
    offset: usize,
    size: usize,
}

impl IndexSet {
    pub fn new(offset: usize, size: usize) -> Self {
        IndexSet { offset, size }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// True if every index of `self` lies in `other`.
    pub fn is_subset(&self, other: &IndexSet) -> bool {
        self.offset >= other.offset && self.offset + self.size <= other.offset + other.size
    }

    /// True if the two ranges share at least one index.
    pub fn intersects(&self, other: &IndexSet) -> bool {
        self.offset.max(other.offset) < (self.offset + self.size).min(other.offset + other.size)
    }
}
