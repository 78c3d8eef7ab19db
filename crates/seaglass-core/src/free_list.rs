//! Index free list.

use crate::error::{Error, Result};

/// Recycles indices in `0..capacity`.
///
/// Fresh indices are handed out in ascending order; indices given back are reused
/// before any fresh index.
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    /// Stack of free indices; the next index to hand out is at the back.
    free: Vec<u32>,
    /// `is_free[i]` mirrors membership of `i` in `free`.
    is_free: Vec<bool>,
}

impl FreeList {
    /// Create a list with every index in `0..capacity` free.
    pub fn new(capacity: u32) -> Self {
        let mut list = Self::default();
        list.reset(capacity);
        list
    }

    /// Mark every index in `0..capacity` free again.
    pub fn reset(&mut self, capacity: u32) {
        self.free.clear();
        self.free.extend((0..capacity).rev());
        self.is_free.clear();
        self.is_free.resize(capacity as usize, true);
    }

    /// Extend the index space to `new_capacity`.
    ///
    /// Indices already given back stay ahead of the new ones.
    pub fn grow(&mut self, new_capacity: u32) {
        let old_capacity = self.capacity();
        if new_capacity <= old_capacity {
            return;
        }
        self.free.splice(0..0, (old_capacity..new_capacity).rev());
        self.is_free.resize(new_capacity as usize, true);
    }

    /// Take the next free index.
    pub fn pull(&mut self) -> Option<u32> {
        let idx = self.free.pop()?;
        self.is_free[idx as usize] = false;
        Some(idx)
    }

    /// Return an index to the list.
    pub fn give_back(&mut self, idx: u32) -> Result<()> {
        match self.is_free.get_mut(idx as usize) {
            None => Err(Error::OutOfBounds(format!(
                "index {idx} outside free list of capacity {}",
                self.is_free.len()
            ))),
            Some(true) => Err(Error::InvalidData(format!("index {idx} is already free"))),
            Some(flag) => {
                *flag = true;
                self.free.push(idx);
                Ok(())
            }
        }
    }

    /// Whether `idx` is currently free.
    pub fn is_free(&self, idx: u32) -> bool {
        self.is_free.get(idx as usize).copied().unwrap_or(false)
    }

    /// Number of free indices.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// Whether no indices are free.
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Size of the index space.
    pub fn capacity(&self) -> u32 {
        self.is_free.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulls_in_ascending_order() {
        let mut list = FreeList::new(4);
        let pulled: Vec<_> = std::iter::from_fn(|| list.pull()).collect();
        assert_eq!(pulled, vec![0, 1, 2, 3]);
        assert!(list.pull().is_none());
    }

    #[test]
    fn returned_indices_are_reused_first() {
        let mut list = FreeList::new(4);
        list.pull();
        list.pull();
        list.give_back(0).unwrap();

        assert_eq!(list.pull(), Some(0));
        assert_eq!(list.pull(), Some(2));
    }

    #[test]
    fn grow_keeps_holes_ahead_of_new_indices() {
        let mut list = FreeList::new(2);
        assert_eq!(list.pull(), Some(0));
        assert_eq!(list.pull(), Some(1));
        list.give_back(0).unwrap();

        list.grow(4);
        assert_eq!(list.capacity(), 4);
        assert_eq!(list.pull(), Some(0));
        assert_eq!(list.pull(), Some(2));
        assert_eq!(list.pull(), Some(3));
        assert!(list.is_empty());
    }

    #[test]
    fn double_give_back_is_rejected() {
        let mut list = FreeList::new(2);
        let idx = list.pull().unwrap();
        list.give_back(idx).unwrap();
        assert!(matches!(list.give_back(idx), Err(Error::InvalidData(_))));
        assert!(matches!(list.give_back(7), Err(Error::OutOfBounds(_))));
        assert_eq!(list.len(), 2);
    }
}
