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

pub mod bridge;
pub mod config;
pub mod error;
pub mod function;
pub mod host;
pub mod root;
pub mod topology;

pub use anyhow::Result;

pub use bridge::BridgeState;
pub use config::{BankFlags, BankMapper, ConfigSpaceRegisterFile, HeaderLayout};
pub use error::PciError;
pub use function::{DecodeWindow, FunctionHooks, MappingContext, PciFunction, RemapHandle};
pub use host::{HostWindows, PciHost};
pub use root::PciRoot;
pub use topology::{FunctionId, PciTopology};

use std::mem::size_of;

use anyhow::{anyhow, bail};
use byteorder::{ByteOrder, LittleEndian};

/// Number of devfn values on one bus, 32 slots of 8 functions.
pub const DEVFN_MAX: usize = 256;
const BDF_FUNC_SHIFT: u8 = 3;

/// Macros that write data in little endian.
macro_rules! le_write {
    ($name: ident, $func: ident, $type: tt) => {
        pub fn $name(buf: &mut [u8], offset: usize, data: $type) -> Result<()> {
            let data_len: usize = size_of::<$type>();
            let buf_len: usize = buf.len();
            if offset + data_len > buf_len {
                bail!(
                    "Out-of-bounds write access: buf_len = {}, offset = {}, data_len = {}",
                    buf_len,
                    offset,
                    data_len
                );
            }
            LittleEndian::$func(&mut buf[offset..(offset + data_len)], data);
            Ok(())
        }
    };
}

le_write!(le_write_u16, write_u16, u16);
le_write!(le_write_u32, write_u32, u32);

/// Macros that read data in little endian.
macro_rules! le_read {
    ($name: ident, $func: ident, $type: tt) => {
        pub fn $name(buf: &[u8], offset: usize) -> Result<$type> {
            let data_len: usize = size_of::<$type>();
            let buf_len: usize = buf.len();
            if offset + data_len > buf_len {
                bail!(
                    "Out-of-bounds read access: buf_len = {}, offset = {}, data_len = {}",
                    buf_len,
                    offset,
                    data_len
                );
            }
            Ok(LittleEndian::$func(&buf[offset..(offset + data_len)]))
        }
    };
}

le_read!(le_read_u16, read_u16, u16);
le_read!(le_read_u32, read_u32, u32);

pub fn pci_devfn(slot: u8, func: u8) -> u8 {
    ((slot & 0x1f) << BDF_FUNC_SHIFT) | (func & 0x07)
}

pub fn pci_slot(devfn: u8) -> u8 {
    devfn >> BDF_FUNC_SHIFT & 0x1f
}

pub fn pci_func(devfn: u8) -> u8 {
    devfn & 0x07
}

/// Parse the devfn out of a function tag.
///
/// The last `:`-separated component of the tag must be `SS.F`, a two digit
/// hexadecimal slot and a single function digit, e.g. `pci:01.0` or
/// `pci:1e.0:0a.2`.
pub fn parse_devfn_tag(tag: &str) -> Result<u8> {
    let last = tag.rsplit(':').next().unwrap_or(tag);
    let invalid = || anyhow!(PciError::InvalidTag(tag.to_string()));
    let (slot, func) = last.split_once('.').ok_or_else(invalid)?;
    if slot.len() != 2 || func.len() != 1 {
        return Err(invalid());
    }
    let slot = u8::from_str_radix(slot, 16).map_err(|_| invalid())?;
    let func = func
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .ok_or_else(invalid)? as u8;
    if slot > 0x1f || func > 7 {
        return Err(invalid());
    }
    Ok(pci_devfn(slot, func))
}

/// Format a bus/devfn pair the way `lspci` does.
pub fn format_bdf(bus: u8, devfn: u8) -> String {
    format!("{:02x}:{:02x}.{:x}", bus, pci_slot(devfn), pci_func(devfn))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_write_u16_01() {
        let mut buf: [u8; 2] = [0; 2];
        le_write_u16(&mut buf, 0, 0x1234_u16).unwrap();
        assert_eq!(buf, [0x34, 0x12]);
    }

    #[test]
    fn test_le_write_u32_overflow() {
        let mut buf: [u8; 4] = [0; 4];
        assert!(le_write_u32(&mut buf, 1, 0x1234_5678_u32).is_err());
        le_write_u32(&mut buf, 0, 0x1234_5678_u32).unwrap();
        assert_eq!(le_read_u32(&buf, 0).unwrap(), 0x1234_5678);
        assert_eq!(le_read_u16(&buf, 2).unwrap(), 0x1234);
        assert!(le_read_u16(&buf, 3).is_err());
    }

    #[test]
    fn test_devfn() {
        assert_eq!(pci_devfn(0x1f, 7), 0xff);
        assert_eq!(pci_devfn(1, 0), 0x08);
        assert_eq!(pci_slot(0x0a), 1);
        assert_eq!(pci_func(0x0a), 2);
    }

    #[test]
    fn test_parse_devfn_tag() {
        assert_eq!(parse_devfn_tag("pci:00.0").unwrap(), 0);
        assert_eq!(parse_devfn_tag(":pci:1e.0").unwrap(), 0xf0);
        assert_eq!(parse_devfn_tag("pci:1e.0:0a.2").unwrap(), 0x52);
        assert_eq!(parse_devfn_tag("02.7").unwrap(), 0x17);

        assert!(parse_devfn_tag("pci:1.0").is_err());
        assert!(parse_devfn_tag("pci:01.8").is_err());
        assert!(parse_devfn_tag("pci:20.0").is_err());
        assert!(parse_devfn_tag("pci:0g.0").is_err());
        assert!(parse_devfn_tag("isa").is_err());
    }

    #[test]
    fn test_format_bdf() {
        assert_eq!(format_bdf(0, 0x08), "00:01.0");
        assert_eq!(format_bdf(2, 0xf1), "02:1e.1");
    }
}
