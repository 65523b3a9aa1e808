// Copyright (c) 2020 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::cmp::{Ord, Ordering, PartialEq, PartialOrd};

/// Represent the address in given address space.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    /// Get the raw value of `GuestAddress`.
    pub fn raw_value(self) -> u64 {
        self.0
    }

    /// Get the offset of this address from the given address.
    /// The caller has to guarantee no underflow occurs.
    ///
    /// # Arguments
    ///
    /// * `other` -Other `GuestAddress`.
    pub fn offset_from(self, other: Self) -> u64 {
        self.raw_value() - other.raw_value()
    }

    /// Return address of this address plus the given offset, return None if overflows.
    ///
    /// # Arguments
    ///
    /// * `offset` - Offset address.
    pub fn checked_add(self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }
}

/// Represent an address range.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AddressRange {
    /// Base address.
    pub base: GuestAddress,
    /// Size of memory segment.
    pub size: u64,
}

/// Implement From trait for AddressRange.
impl From<(u64, u64)> for AddressRange {
    fn from(range: (u64, u64)) -> AddressRange {
        AddressRange {
            base: GuestAddress(range.0),
            size: range.1,
        }
    }
}

/// Implement PartialOrd trait for AddressRange.
impl PartialOrd for AddressRange {
    fn partial_cmp(&self, other: &AddressRange) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Implement Ord trait for AddressRange.
impl Ord for AddressRange {
    fn cmp(&self, other: &AddressRange) -> Ordering {
        self.base
            .cmp(&other.base)
            .then_with(|| self.size.cmp(&other.size))
    }
}

impl AddressRange {
    /// Create a new `AddressRange`.
    ///
    /// # Arguments
    ///
    /// * `base` - The base address of a AddressRange.
    /// * `size` - The size of a AddressRange.
    pub fn new(base: GuestAddress, size: u64) -> AddressRange {
        AddressRange { base, size }
    }

    /// Create an `AddressRange` covering `start..=end`.
    ///
    /// Returns None if `end` is below `start` or the range spans the whole
    /// 64-bit space.
    pub fn from_bounds(start: u64, end: u64) -> Option<AddressRange> {
        if end < start {
            return None;
        }
        (end - start)
            .checked_add(1)
            .map(|size| AddressRange::new(GuestAddress(start), size))
    }

    /// Find the intersection with other `AddressRange`.
    /// Return the intersection of Self and the given address range.
    /// Return None if not overlaps.
    ///
    /// # Arguments
    ///
    /// * `other` - Other AddressRange.
    pub fn find_intersection(&self, other: AddressRange) -> Option<AddressRange> {
        let begin = self.base.raw_value() as u128;
        let end = self.size as u128 + begin;
        let other_begin = other.base.raw_value() as u128;
        let other_end = other.size as u128 + other_begin;

        if end <= other_begin || other_end <= begin {
            return None;
        }
        let start = std::cmp::max(self.base, other.base);
        let size_inter = (std::cmp::min(end, other_end) - start.0 as u128) as u64;

        Some(AddressRange {
            base: start,
            size: size_inter,
        })
    }

    /// Return the last address covered by this range.
    #[inline]
    pub fn last_addr(&self) -> u64 {
        self.base.raw_value() + self.size - 1
    }

    /// Whether `addr` lies inside this range.
    pub fn contains(&self, addr: GuestAddress) -> bool {
        addr >= self.base && (addr.0 - self.base.0) < self.size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_address_add() {
        let addr1 = GuestAddress(0xAE);
        let max_addr = GuestAddress(u64::MAX);

        assert_eq!(Some(GuestAddress(0xAF)), addr1.checked_add(1));
        assert_eq!(None, max_addr.checked_add(1));
        assert_eq!(0xE, addr1.offset_from(GuestAddress(0xA0)));
    }

    #[test]
    fn test_address_range_bounds() {
        let range = AddressRange::from_bounds(0x1000, 0x1fff).unwrap();
        assert_eq!(range.size, 0x1000);
        assert_eq!(range.last_addr(), 0x1fff);
        assert!(range.contains(GuestAddress(0x1fff)));
        assert!(!range.contains(GuestAddress(0x2000)));
        assert!(!range.contains(GuestAddress(0xfff)));

        assert!(AddressRange::from_bounds(0x10, 0xf).is_none());
        assert!(AddressRange::from_bounds(0, u64::MAX).is_none());
        assert_eq!(AddressRange::from_bounds(5, 5).unwrap().size, 1);
    }

    #[test]
    fn test_address_range_intersects() {
        let range1 = AddressRange::from((0, 8));
        let range2 = AddressRange::from((0, 0));
        let range3 = AddressRange::from((5, 9));
        let range4 = AddressRange::from((8, 1));

        assert!(range1.find_intersection(range2).is_none());
        assert_eq!(
            range1.find_intersection(range3),
            Some(AddressRange::from((5, 3)))
        );
        assert!(range1.find_intersection(range4).is_none());
    }

    #[test]
    fn test_address_range_compare() {
        let range1 = AddressRange::from((0x1000, 0x1000));
        let mut range2 = AddressRange::from((0x500, 0x500));

        assert!(range2 < range1);
        range2.base = GuestAddress(0x1000);
        assert!(range2 < range1);
        range2.size = 0x1200;
        assert!(range2 > range1);
    }
}
