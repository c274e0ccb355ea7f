//! Numeric resource-id allocation
//!
//! Ids are handed out per resource class. The allocator is process-wide
//! shared state: every `allocate`/`release` pair is serialized by one mutex.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::Error;

/// Namespace of ids on the server (buffers, nodes, buses, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceClass(pub &'static str);

impl ResourceClass {
    pub const BUFFER: Self = Self("buffer");
}

/// Source of unique ids for server-side resources
pub trait IdAllocator: Send + Sync {
    /// Take the lowest free id of the class
    ///
    /// # Errors
    ///
    /// `AllocationExhausted` if every id of the class is in use.
    fn allocate(&self, class: ResourceClass) -> Result<i32, Error>;

    /// Return an id to the class. Releasing an id that is not allocated is ignored.
    fn release(&self, class: ResourceClass, id: i32);
}

/// One bit per id; a set bit means "in use"
#[derive(Debug)]
struct ClassPool {
    words: Vec<u64>,
    capacity: usize,
    in_use: usize,
}

impl ClassPool {
    fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
            in_use: 0,
        }
    }

    fn take(&mut self) -> Option<usize> {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let id = w * 64 + bit;
            if id >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            self.in_use += 1;
            return Some(id);
        }
        None
    }

    fn put(&mut self, id: usize) -> bool {
        let Some(word) = self.words.get_mut(id / 64) else {
            return false;
        };
        let mask = 1u64 << (id % 64);
        if *word & mask == 0 {
            return false;
        }
        *word &= !mask;
        self.in_use -= 1;
        true
    }
}

/// Thread-safe bitmap allocator with a fixed capacity per class
#[derive(Debug)]
pub struct BitmapIdAllocator {
    capacity: usize,
    pools: Mutex<HashMap<ResourceClass, ClassPool>>,
}

impl BitmapIdAllocator {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Number of ids of the class currently handed out
    #[must_use]
    pub fn in_use(&self, class: ResourceClass) -> usize {
        self.pools.lock().get(&class).map_or(0, |pool| pool.in_use)
    }
}

impl Default for BitmapIdAllocator {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl IdAllocator for BitmapIdAllocator {
    fn allocate(&self, class: ResourceClass) -> Result<i32, Error> {
        let mut pools = self.pools.lock();
        let pool = pools
            .entry(class)
            .or_insert_with(|| ClassPool::new(self.capacity));
        pool.take()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or(Error::AllocationExhausted { class: class.0 })
    }

    fn release(&self, class: ResourceClass, id: i32) {
        let released = usize::try_from(id).is_ok_and(|idx| {
            self.pools
                .lock()
                .get_mut(&class)
                .is_some_and(|pool| pool.put(idx))
        });
        if !released {
            log::warn!("idgen.release: {} id {id} was not allocated", class.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_id_first() {
        let alloc = BitmapIdAllocator::new(8);
        assert_eq!(alloc.allocate(ResourceClass::BUFFER).unwrap(), 0);
        assert_eq!(alloc.allocate(ResourceClass::BUFFER).unwrap(), 1);
        assert_eq!(alloc.allocate(ResourceClass::BUFFER).unwrap(), 2);

        alloc.release(ResourceClass::BUFFER, 1);
        assert_eq!(alloc.allocate(ResourceClass::BUFFER).unwrap(), 1);
        assert_eq!(alloc.in_use(ResourceClass::BUFFER), 3);
    }

    #[test]
    fn test_exhaustion() {
        let alloc = BitmapIdAllocator::new(2);
        alloc.allocate(ResourceClass::BUFFER).unwrap();
        alloc.allocate(ResourceClass::BUFFER).unwrap();
        assert_eq!(
            alloc.allocate(ResourceClass::BUFFER),
            Err(Error::AllocationExhausted { class: "buffer" })
        );
    }

    #[test]
    fn test_classes_are_independent() {
        let alloc = BitmapIdAllocator::new(4);
        let nodes = ResourceClass("node");
        assert_eq!(alloc.allocate(ResourceClass::BUFFER).unwrap(), 0);
        assert_eq!(alloc.allocate(nodes).unwrap(), 0);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let alloc = BitmapIdAllocator::new(4);
        let id = alloc.allocate(ResourceClass::BUFFER).unwrap();
        alloc.release(ResourceClass::BUFFER, id);
        alloc.release(ResourceClass::BUFFER, id);
        assert_eq!(alloc.in_use(ResourceClass::BUFFER), 0);
    }

    #[test]
    fn test_capacity_crosses_word_boundary() {
        let alloc = BitmapIdAllocator::new(70);
        for expected in 0..70 {
            assert_eq!(alloc.allocate(ResourceClass::BUFFER).unwrap(), expected);
        }
        assert!(alloc.allocate(ResourceClass::BUFFER).is_err());
    }
}
