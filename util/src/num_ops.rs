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

use anyhow::{Context, Result};

use crate::UtilError;

// This module implements some operations of Rust primitive types.

/// Get the first half or second half of u64.
///
/// # Arguments
///
/// * `value` - The origin value to get u32 from.
/// * `page` - Value is 0 or 1, determines which half to return.
///
/// # Examples
///
/// ```rust
/// extern crate util;
/// use util::num_ops::read_u32;
///
/// let value = read_u32(0x2000_1000_0000, 1);
/// assert!(value == 0x2000);
/// ```
pub fn read_u32(value: u64, page: u32) -> u32 {
    match page {
        0 => value as u32,
        1 => (value >> 32) as u32,
        _ => 0_u32,
    }
}

/// Write the given u32 to the low bits in u64, keep the high bits,
/// returns the u64 value.
///
/// # Examples
///
/// ```rust
/// extern crate util;
/// use util::num_ops::write_u64_low;
///
/// let value = write_u64_low(0x1000_0000_0000_0000, 0x1000_0000);
/// assert!(value == 0x1000_0000_1000_0000);
/// ```
pub fn write_u64_low(origin: u64, value: u32) -> u64 {
    origin & 0xFFFF_FFFF_0000_0000_u64 | u64::from(value)
}

/// Write the given u32 to the high bits in u64, keep the low bits,
/// returns the u64 value.
///
/// # Examples
///
/// ```rust
/// extern crate util;
/// use util::num_ops::write_u64_high;
///
/// let value = write_u64_high(0x0000_0000_1000_0000, 0x1000_0000);
/// assert!(value == 0x1000_0000_1000_0000);
/// ```
pub fn write_u64_high(origin: u64, value: u32) -> u64 {
    u64::from(value) << 32 | (origin & 0x0000_0000_FFFF_FFFF_u64)
}

/// Merge `data` into `old`, only the bits set in `mask` are taken from `data`.
///
/// # Examples
///
/// ```rust
/// extern crate util;
/// use util::num_ops::combine_u32;
///
/// let value = combine_u32(0x1122_3344, 0xaabb_ccdd, 0x0000_ff00);
/// assert!(value == 0x1122_cc44);
/// ```
pub fn combine_u32(old: u32, data: u32, mask: u32) -> u32 {
    (old & !mask) | (data & mask)
}

/// Build the dword byte-lane mask of an access of `len` bytes starting at
/// byte `offset` of the dword.
///
/// # Examples
///
/// ```rust
/// extern crate util;
/// use util::num_ops::lane_mask;
///
/// assert_eq!(lane_mask(2, 2).unwrap(), 0xffff_0000);
/// ```
pub fn lane_mask(offset: usize, len: usize) -> Result<u32> {
    if len == 0 || offset + len > 4 {
        return Err(anyhow::anyhow!(UtilError::InvalidLane(offset, len)));
    }
    let bits = if len == 4 {
        u32::MAX
    } else {
        (1_u32 << (len * 8)) - 1
    };
    Ok(bits << (offset * 8))
}

/// Split a dword byte-lane mask into contiguous `(offset, len)` byte runs.
///
/// A mask with holes, such as `0x00ff_00ff`, yields one run per hole-free
/// group of enabled lanes.
pub fn mask_runs(mask: u32) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;
    for lane in 0..4 {
        let enabled = mask & (0xff << (lane * 8)) != 0;
        match (enabled, start) {
            (true, None) => start = Some(lane),
            (false, Some(s)) => {
                runs.push((s, lane - s));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, 4 - s));
    }
    runs
}

/// Parse a decimal or `0x` prefixed hexadecimal string.
///
/// # Examples
///
/// ```rust
/// extern crate util;
/// use util::num_ops::str_to_num;
///
/// let value = str_to_num::<u32>("0x10396300").unwrap();
/// assert!(value == 0x1039_6300);
/// ```
pub fn str_to_num<T: TryFrom<u64>>(string_in: &str) -> Result<T> {
    let mut base = 10;
    let trimmed = string_in.trim();
    if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
        base = 16;
    }
    let without_prefix = trimmed.trim_start_matches("0x").trim_start_matches("0X");
    let num = u64::from_str_radix(without_prefix, base)
        .with_context(|| format!("Invalid num: {}", string_in))?;
    T::try_from(num).map_err(|_| anyhow::anyhow!(UtilError::InvalidNumber(string_in.to_string())))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_read_u32_from_u64() {
        let value = 0x1234_5678_9012_3456u64;
        assert_eq!(read_u32(value, 0), 0x9012_3456u32);
        assert_eq!(read_u32(value, 1), 0x1234_5678u32);
        assert_eq!(read_u32(value, 2), 0);
    }

    #[test]
    fn test_write_u64_halves() {
        assert_eq!(
            write_u64_low(0xFFFF_FFFF_0000_0000_u64, 0x1234_5678),
            0xFFFF_FFFF_1234_5678_u64
        );
        assert_eq!(
            write_u64_high(0x0000_0000_FFFF_FFFF_u64, 0x1234_5678),
            0x1234_5678_FFFF_FFFF_u64
        );
    }

    #[test]
    fn test_lane_mask() {
        assert_eq!(lane_mask(0, 4).unwrap(), 0xffff_ffff);
        assert_eq!(lane_mask(0, 1).unwrap(), 0x0000_00ff);
        assert_eq!(lane_mask(3, 1).unwrap(), 0xff00_0000);
        assert_eq!(lane_mask(1, 2).unwrap(), 0x00ff_ff00);
        assert!(lane_mask(2, 4).is_err());
        assert!(lane_mask(0, 0).is_err());
    }

    #[test]
    fn test_mask_runs() {
        assert_eq!(mask_runs(0xffff_ffff), vec![(0, 4)]);
        assert_eq!(mask_runs(0x00ff_00ff), vec![(0, 1), (2, 1)]);
        assert_eq!(mask_runs(0xffff_0000), vec![(2, 2)]);
        assert_eq!(mask_runs(0x0000_ff00), vec![(1, 1)]);
        assert!(mask_runs(0).is_empty());
    }

    #[test]
    fn test_combine_u32() {
        assert_eq!(combine_u32(0x0000_0080, 0xffff_ffff, 0x01bf), 0x0000_01bf);
        assert_eq!(combine_u32(0xdead_beef, 0, 0), 0xdead_beef);
    }

    #[test]
    fn test_str_to_num() {
        assert_eq!(str_to_num::<u32>("0x17").unwrap(), 0x17);
        assert_eq!(str_to_num::<u8>("17").unwrap(), 17);
        assert!(str_to_num::<u8>("0x100").is_err());
        assert!(str_to_num::<u32>("zz").is_err());
    }
}
