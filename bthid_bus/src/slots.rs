//! Serial number allocation for enumerated children.
//!
//! Serials are 1-based positions in a fixed-size bitmap. The whole bitmap sits
//! behind one lock because acquiring is a scan-then-set.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::error::SlotError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Serial(u32);

impl Serial {
    pub fn get(self) -> u32 {
        self.0
    }

    /// Zero-based position in the bitmap and in the connection table.
    pub fn index(self) -> usize {
        self.0 as usize - 1
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct SlotAllocator {
    capacity: usize,
    words: Mutex<Box<[u64]>>,
}

impl SlotAllocator {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "slot allocator needs at least one slot");
        let words = vec![0u64; capacity.div_ceil(64)].into_boxed_slice();
        Self {
            capacity,
            words: Mutex::new(words),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes the lowest free serial.
    pub fn acquire(&self) -> Result<Serial, SlotError> {
        let mut words = self.words.lock();
        for (w, word) in words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let index = w * 64 + bit;
            if index >= self.capacity {
                break;
            }
            *word |= 1 << bit;
            let serial = Serial::from_index(index);
            trace!("Acquired serial {}", serial);
            return Ok(serial);
        }
        warn!("All {} child slots are in use", self.capacity);
        Err(SlotError::Exhausted)
    }

    pub fn release(&self, serial: Serial) {
        let index = serial.index();
        let mask = 1u64 << (index % 64);
        let released = {
            let mut words = self.words.lock();
            match words.get_mut(index / 64) {
                Some(word) if index < self.capacity && *word & mask != 0 => {
                    *word &= !mask;
                    true
                }
                _ => false,
            }
        };
        if released {
            trace!("Released serial {}", serial);
        } else {
            error!("Release of serial {} which is not allocated", serial);
            debug_assert!(false, "release of unallocated serial {serial}");
        }
    }

    pub fn is_allocated(&self, serial: Serial) -> bool {
        let index = serial.index();
        index < self.capacity && self.words.lock()[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn in_use(&self) -> usize {
        self.words
            .lock()
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }
}

/// An acquired serial that goes back to its allocator on drop.
pub struct SlotLease {
    allocator: Arc<SlotAllocator>,
    serial: Serial,
}

impl SlotLease {
    pub fn acquire(allocator: &Arc<SlotAllocator>) -> Result<Self, SlotError> {
        let serial = allocator.acquire()?;
        Ok(Self {
            allocator: allocator.clone(),
            serial,
        })
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.allocator.release(self.serial);
    }
}

impl fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SlotLease").field(&self.serial).finish()
    }
}
