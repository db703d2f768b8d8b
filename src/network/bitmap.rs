//! Fixed-size slot allocator for the NAT address pool

use crate::errors::{Error, ErrorKind, Result};

/// Free/used bitmap handing out the lowest free slot
#[derive(Debug, Clone, Default)]
pub struct BitmapAllocator {
    used: Vec<bool>,
}

impl BitmapAllocator {
    pub fn new(size: usize) -> Self {
        Self {
            used: vec![false; size],
        }
    }

    /// Grow or shrink the pool; live slots above the new size are dropped
    pub fn resize(&mut self, size: usize) {
        self.used.resize(size, false);
    }

    pub fn size(&self) -> usize {
        self.used.len()
    }

    /// Allocate the lowest free slot
    pub fn get(&mut self) -> Result<usize> {
        match self.used.iter().position(|used| !used) {
            Some(slot) => {
                self.used[slot] = true;
                Ok(slot)
            }
            None => Err(Error::new(
                ErrorKind::ResourceNotAvailable,
                "no free slots in bitmap",
            )),
        }
    }

    /// Return a slot to the pool
    pub fn put(&mut self, slot: usize) -> Result<()> {
        match self.used.get_mut(slot) {
            Some(used) if *used => {
                *used = false;
                Ok(())
            }
            Some(_) => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("slot {} is not allocated", slot),
            )),
            None => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("slot {} out of range", slot),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn get_returns_lowest_free_slot() {
        let mut bitmap = BitmapAllocator::new(3);
        assert_eq!(bitmap.get().unwrap(), 0);
        assert_eq!(bitmap.get().unwrap(), 1);
        assert_eq!(bitmap.get().unwrap(), 2);
    }

    #[test]
    fn exhaustion_is_resource_not_available() {
        let mut bitmap = BitmapAllocator::new(1);
        bitmap.get().unwrap();
        let err = bitmap.get().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);
    }

    #[test]
    fn put_then_get_reuses_slot() {
        let mut bitmap = BitmapAllocator::new(3);
        for _ in 0..3 {
            bitmap.get().unwrap();
        }
        bitmap.put(1).unwrap();
        assert_eq!(bitmap.get().unwrap(), 1);
    }

    #[test]
    fn live_slots_are_gets_minus_puts() {
        let mut bitmap = BitmapAllocator::new(4);
        let a = bitmap.get().unwrap();
        let b = bitmap.get().unwrap();
        bitmap.put(a).unwrap();
        let c = bitmap.get().unwrap();
        assert_eq!(c, a);
        bitmap.put(b).unwrap();
        bitmap.put(c).unwrap();
        assert_eq!(bitmap.get().unwrap(), 0);
    }

    #[test]
    fn put_of_free_or_foreign_slot_fails() {
        let mut bitmap = BitmapAllocator::new(2);
        assert!(bitmap.put(0).is_err());
        assert!(bitmap.put(7).is_err());
    }
}
