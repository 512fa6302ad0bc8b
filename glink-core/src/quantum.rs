//! Partition accounting: a cluster's key space is cut into `size` quanta.
//!
//! Only the bookkeeping lives here. Deciding which peer runs which quantum is
//! left to the caller.

/// One slice of the partition space. `space` is the pool size it was issued for,
/// so a quantum from an older layout can be recognised after a resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quantum {
    pub index: u32,
    pub space: u32,
}

/// Free quanta of one cluster.
#[derive(Debug, Clone, Default)]
pub struct QuantumPool {
    size: u32,
    free: Vec<Quantum>,
}

impl QuantumPool {
    pub fn new(size: u32) -> Self {
        let mut pool = Self::default();
        pool.resize(size);
        pool
    }

    /// Release the free list and reissue `size` quanta for the new space.
    /// Returns the released quanta. Resizing to the current size is a no-op.
    pub fn resize(&mut self, size: u32) -> Vec<Quantum> {
        if self.size == size {
            return Vec::new();
        }
        let released = std::mem::take(&mut self.free);
        self.free = (0..size).map(|index| Quantum { index, space: size }).collect();
        self.size = size;
        released
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn free(&self) -> &[Quantum] {
        &self.free
    }

    /// Take the lowest free quantum.
    pub fn issue(&mut self) -> Option<Quantum> {
        if self.free.is_empty() {
            return None;
        }
        Some(self.free.remove(0))
    }

    /// Return a quantum to the pool. Quanta issued for another space are dropped.
    pub fn release(&mut self, quantum: Quantum) -> bool {
        if quantum.space != self.size || quantum.index >= self.size {
            return false;
        }
        if self.free.contains(&quantum) {
            return false;
        }
        let at = self.free.partition_point(|q| q.index < quantum.index);
        self.free.insert(at, quantum);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_is_all_free() {
        let pool = QuantumPool::new(4);
        assert_eq!(pool.size(), 4);
        let indexes: Vec<u32> = pool.free().iter().map(|q| q.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert!(pool.free().iter().all(|q| q.space == 4));
    }

    #[test]
    fn resize_reissues() {
        let mut pool = QuantumPool::new(2);
        assert!(pool.resize(2).is_empty());
        let released = pool.resize(3);
        assert_eq!(released.len(), 2);
        assert_eq!(pool.free().len(), 3);
        assert!(pool.free().iter().all(|q| q.space == 3));
        pool.resize(0);
        assert!(pool.free().is_empty());
    }

    #[test]
    fn issue_and_release() {
        let mut pool = QuantumPool::new(3);
        let a = pool.issue().unwrap();
        let b = pool.issue().unwrap();
        assert_eq!((a.index, b.index), (0, 1));
        assert!(pool.release(b));
        assert!(!pool.release(b));
        assert!(pool.release(a));
        assert_eq!(pool.free()[0], a);

        let stale = pool.issue().unwrap();
        pool.resize(5);
        assert!(!pool.release(stale));
    }
}
