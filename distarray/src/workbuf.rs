/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The per-epoch work buffer.
//!
//! Every DAG record created during an epoch (operations, dependency
//! nodes, sub-view-blocks) is charged against a single fixed-capacity
//! region. Charges are bump-allocated and rounded up to the configured
//! alignment. The region is rewound in one step once the epoch's DAG
//! has been flushed.
//!
//! Running out of space is a configuration error: the capacity and the
//! DAG size limit are static, and the engine flushes before a
//! submission that would not fit. A charge that fails anyway means a
//! single submission is larger than the whole region.

use crate::error::FatalError;

/// Bump accounting over a fixed-capacity region.
#[derive(Debug, Clone)]
pub struct WorkBuffer {
    capacity: usize,
    alignment: usize,
    next_free: usize,
    high_water: usize,
}

impl WorkBuffer {
    /// Create a work buffer of `capacity` bytes. `alignment` must be a
    /// power of two.
    pub fn new(capacity: usize, alignment: usize) -> Result<Self, FatalError> {
        if !alignment.is_power_of_two() {
            return Err(FatalError::Configuration(format!(
                "work buffer alignment {} is not a power of two",
                alignment
            )));
        }
        Ok(Self {
            capacity,
            alignment,
            next_free: 0,
            high_water: 0,
        })
    }

    /// Bytes actually consumed by a charge of `bytes`.
    pub fn rounded(&self, bytes: usize) -> usize {
        (bytes + self.alignment - 1) & !(self.alignment - 1)
    }

    /// Whether `bytes` (already rounded) fit in the remaining space.
    pub fn fits(&self, bytes: usize) -> bool {
        bytes <= self.remaining()
    }

    /// Charge `bytes` against the region, returning the offset of the
    /// allocation.
    pub fn charge(&mut self, bytes: usize) -> Result<usize, FatalError> {
        let taken = self.rounded(bytes);
        if taken > self.remaining() {
            tracing::error!(
                capacity = self.capacity,
                used = self.next_free,
                requested = taken,
                "work buffer overflow"
            );
            return Err(FatalError::Configuration(format!(
                "work buffer overflow: {} bytes requested, {} of {} bytes free; \
                 increase the work buffer size or decrease the maximum DAG size",
                taken,
                self.remaining(),
                self.capacity
            )));
        }
        let offset = self.next_free;
        self.next_free += taken;
        self.high_water = self.high_water.max(self.next_free);
        Ok(offset)
    }

    /// Charge space for `count` values of `T`.
    pub fn charge_for<T>(&mut self, count: usize) -> Result<usize, FatalError> {
        self.charge(std::mem::size_of::<T>() * count)
    }

    /// Rewind the region. Everything charged since the last reset is
    /// invalid afterwards.
    pub fn reset(&mut self) {
        self.next_free = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.next_free
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.next_free
    }

    /// Largest amount of space in use at any point.
    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        let mut buf = WorkBuffer::new(256, 32).unwrap();
        assert_eq!(buf.charge(1).unwrap(), 0);
        assert_eq!(buf.charge(32).unwrap(), 32);
        assert_eq!(buf.charge(33).unwrap(), 64);
        assert_eq!(buf.used(), 128);
        assert_eq!(buf.charge(0).unwrap(), 128);
        assert_eq!(buf.used(), 128);
        assert_eq!(buf.rounded(65), 96);
    }

    #[test]
    fn test_overflow_is_fatal() {
        let mut buf = WorkBuffer::new(64, 32).unwrap();
        buf.charge(40).unwrap();
        assert!(!buf.fits(32));
        let err = buf.charge(1).unwrap_err();
        assert!(matches!(err, FatalError::Configuration(_)));
        // A failed charge leaves the region untouched.
        assert_eq!(buf.used(), 64);
    }

    #[test]
    fn test_reset() {
        let mut buf = WorkBuffer::new(128, 16).unwrap();
        buf.charge_for::<u64>(10).unwrap();
        assert_eq!(buf.used(), 80);
        buf.reset();
        assert_eq!(buf.used(), 0);
        assert_eq!(buf.high_water(), 80);
        assert_eq!(buf.charge(128).unwrap(), 0);
    }

    #[test]
    fn test_bad_alignment() {
        assert!(WorkBuffer::new(128, 12).is_err());
    }
}
