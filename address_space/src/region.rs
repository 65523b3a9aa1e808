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

use std::fmt;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};

use crate::{AddressRange, AddressSpaceError, GuestAddress, RegionOps};

/// Types of Region.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionType {
    /// Ram type.
    Ram,
    /// IO type, accesses are forwarded to `RegionOps`.
    IO,
    /// Read-only image, writes are refused.
    Rom,
}

#[derive(Clone)]
enum RegionBacking {
    Ops(RegionOps),
    Ram(Arc<RwLock<Vec<u8>>>),
    Rom(Arc<[u8]>),
}

/// Represents a memory region, used by mem-mapped IO, Ram or Rom.
#[derive(Clone)]
pub struct Region {
    /// The name of Region
    name: String,
    /// Type of Region, won't be changed once initialized.
    region_type: RegionType,
    /// Size of Region.
    size: u64,
    backing: RegionBacking,
}

impl Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("region_type", &self.region_type)
            .field("size", &self.size)
            .finish()
    }
}

/// Regions are identified by what they expose, a region rebuilt with the
/// same name, type and size compares equal to the old one.
impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.region_type == other.region_type && self.size == other.size
    }
}

impl Eq for Region {}

/// A piece of an `AddressSpace`'s flat map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatRange {
    /// The address range.
    pub addr_range: AddressRange,
    /// The owner of this flat-range.
    pub owner: Region,
    /// The offset within Region.
    pub offset_in_region: u64,
}

impl Region {
    /// Initialize IO/mmio-type region.
    ///
    /// # Arguments
    ///
    /// * `size` - Size of IO region.
    /// * `ops` - Operation of Region.
    /// * `name` - Name of Region.
    pub fn init_io_region(size: u64, ops: RegionOps, name: &str) -> Region {
        Region {
            name: String::from(name),
            region_type: RegionType::IO,
            size,
            backing: RegionBacking::Ops(ops),
        }
    }

    /// Initialize a zero-filled Ram-type region.
    pub fn init_ram_region(size: u64, name: &str) -> Region {
        Region::init_ram_region_shared(Arc::new(RwLock::new(vec![0_u8; size as usize])), name)
    }

    /// Initialize a Ram-type region on top of an existing buffer, so the
    /// same storage can be installed, unmapped and installed again.
    pub fn init_ram_region_shared(mem: Arc<RwLock<Vec<u8>>>, name: &str) -> Region {
        let size = mem.read().unwrap().len() as u64;
        Region {
            name: String::from(name),
            region_type: RegionType::Ram,
            size,
            backing: RegionBacking::Ram(mem),
        }
    }

    /// Initialize a Rom-type region from an image.
    pub fn init_rom_region(image: Arc<[u8]>, name: &str) -> Region {
        Region {
            name: String::from(name),
            region_type: RegionType::Rom,
            size: image.len() as u64,
            backing: RegionBacking::Rom(image),
        }
    }

    /// Get the name of this region.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the type of this region.
    pub fn region_type(&self) -> RegionType {
        self.region_type
    }

    /// Get the size of this region.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_valid_offset(&self, offset: u64, count: u64) -> Result<()> {
        match offset.checked_add(count) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(anyhow!(AddressSpaceError::InvalidOffset(
                offset, count, self.size
            ))),
        }
    }

    /// Read data from this region to `data`.
    ///
    /// # Arguments
    ///
    /// * `data` - Destination buffer, its length is the access size.
    /// * `base` - Base address of the range this region is installed at.
    /// * `offset` - Offset of the access inside this region.
    pub fn read(&self, data: &mut [u8], base: GuestAddress, offset: u64) -> Result<()> {
        let count = data.len() as u64;
        match &self.backing {
            RegionBacking::Ops(ops) => {
                let read_ops = ops.read.as_ref();
                if !read_ops(data, base, offset) {
                    return Err(anyhow!(AddressSpaceError::IoAccess(
                        base.raw_value(),
                        offset,
                        count
                    )));
                }
            }
            RegionBacking::Ram(mem) => {
                self.check_valid_offset(offset, count)
                    .with_context(|| format!("Failed to read Ram region {}", self.name))?;
                let mem = mem.read().unwrap();
                let start = offset as usize;
                data.copy_from_slice(&mem[start..start + data.len()]);
            }
            RegionBacking::Rom(image) => {
                self.check_valid_offset(offset, count)
                    .with_context(|| format!("Failed to read Rom region {}", self.name))?;
                let start = offset as usize;
                data.copy_from_slice(&image[start..start + data.len()]);
            }
        }
        Ok(())
    }

    /// Write data to this region from `data`.
    ///
    /// # Arguments
    ///
    /// * `data` - Source buffer, its length is the access size.
    /// * `base` - Base address of the range this region is installed at.
    /// * `offset` - Offset of the access inside this region.
    pub fn write(&self, data: &[u8], base: GuestAddress, offset: u64) -> Result<()> {
        let count = data.len() as u64;
        match &self.backing {
            RegionBacking::Ops(ops) => {
                let write_ops = ops.write.as_ref();
                if !write_ops(data, base, offset) {
                    return Err(anyhow!(AddressSpaceError::IoAccess(
                        base.raw_value(),
                        offset,
                        count
                    )));
                }
            }
            RegionBacking::Ram(mem) => {
                self.check_valid_offset(offset, count)
                    .with_context(|| format!("Failed to write Ram region {}", self.name))?;
                let mut mem = mem.write().unwrap();
                let start = offset as usize;
                mem[start..start + data.len()].copy_from_slice(data);
            }
            RegionBacking::Rom(_) => {
                return Err(anyhow!(AddressSpaceError::RegionType(RegionType::Rom)));
            }
        }
        Ok(())
    }

    /// Get the region type name, used by `mtree` output.
    pub fn get_region_type_name(&self) -> &'static str {
        match self.region_type {
            RegionType::Ram => "ram",
            RegionType::IO => "i/o",
            RegionType::Rom => "rom",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn echo_ops() -> RegionOps {
        RegionOps {
            read: Arc::new(|data: &mut [u8], _base: GuestAddress, offset: u64| {
                for (i, byte) in data.iter_mut().enumerate() {
                    *byte = offset as u8 + i as u8;
                }
                true
            }),
            write: Arc::new(|_data: &[u8], _base: GuestAddress, offset: u64| offset < 4),
        }
    }

    #[test]
    fn test_io_region() {
        let region = Region::init_io_region(8, echo_ops(), "echo");
        assert_eq!(region.region_type(), RegionType::IO);
        assert_eq!(region.get_region_type_name(), "i/o");

        let mut data = [0_u8; 2];
        region.read(&mut data, GuestAddress(0x100), 4).unwrap();
        assert_eq!(data, [4, 5]);
        assert!(region.write(&[1], GuestAddress(0x100), 2).is_ok());
        assert!(region.write(&[1], GuestAddress(0x100), 6).is_err());
    }

    #[test]
    fn test_ram_region() {
        let mem = Arc::new(RwLock::new(vec![0_u8; 0x10]));
        let region = Region::init_ram_region_shared(mem.clone(), "ram");
        assert_eq!(region.size(), 0x10);

        region.write(&[0xaa, 0xbb], GuestAddress(0), 0xe).unwrap();
        assert_eq!(mem.read().unwrap()[0xf], 0xbb);
        assert!(region.write(&[0xaa, 0xbb], GuestAddress(0), 0xf).is_err());

        let mut data = [0_u8; 2];
        region.read(&mut data, GuestAddress(0), 0xe).unwrap();
        assert_eq!(data, [0xaa, 0xbb]);
    }

    #[test]
    fn test_rom_region() {
        let region = Region::init_rom_region(Arc::from(vec![0x55_u8, 0xaa]), "rom");
        let mut data = [0_u8; 2];
        region.read(&mut data, GuestAddress(0xc0000), 0).unwrap();
        assert_eq!(data, [0x55, 0xaa]);
        assert!(region.write(&[0], GuestAddress(0xc0000), 0).is_err());
        assert!(region.read(&mut data, GuestAddress(0xc0000), 1).is_err());
    }

    #[test]
    fn test_region_eq() {
        let a = Region::init_ram_region(0x1000, "ram");
        let b = Region::init_ram_region(0x1000, "ram");
        let c = Region::init_ram_region(0x2000, "ram");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
