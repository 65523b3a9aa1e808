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

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use log::{debug, trace};

use crate::{AddressRange, AddressSpaceError, FlatRange, GuestAddress, Region};

/// Flat map of an address space, keyed by the base of each range.
#[derive(Default, Clone)]
struct FlatView(BTreeMap<u64, FlatRange>);

impl FlatView {
    fn find(&self, addr: u64) -> Option<&FlatRange> {
        self.0
            .range(..=addr)
            .next_back()
            .map(|(_, fr)| fr)
            .filter(|fr| fr.addr_range.contains(GuestAddress(addr)))
    }

    fn next_base_after(&self, addr: u64) -> Option<u64> {
        addr.checked_add(1)
            .and_then(|a| self.0.range(a..).next().map(|(base, _)| *base))
    }

    /// Remove everything inside `range`, ranges crossing its edges are trimmed.
    fn punch(&mut self, range: AddressRange) {
        let overlapped: Vec<u64> = self
            .0
            .values()
            .filter(|fr| fr.addr_range.find_intersection(range).is_some())
            .map(|fr| fr.addr_range.base.raw_value())
            .collect();

        for base in overlapped {
            let fr = match self.0.remove(&base) {
                Some(fr) => fr,
                None => continue,
            };
            let old = fr.addr_range;
            if old.base < range.base {
                let left = FlatRange {
                    addr_range: AddressRange::new(old.base, range.base.offset_from(old.base)),
                    ..fr.clone()
                };
                self.0.insert(left.addr_range.base.raw_value(), left);
            }
            if old.last_addr() > range.last_addr() {
                let start = range.last_addr() + 1;
                let right = FlatRange {
                    addr_range: AddressRange::new(GuestAddress(start), old.last_addr() - start + 1),
                    owner: fr.owner.clone(),
                    offset_in_region: fr.offset_in_region + (start - old.base.raw_value()),
                };
                self.0.insert(start, right);
            }
        }
    }
}

/// Address Space of emulated bus.
pub struct AddressSpace {
    /// The name of this address space.
    name: String,
    /// Size of this address space, accesses must lie below it.
    size: u64,
    /// Flat view of the installed regions.
    flat_view: ArcSwap<FlatView>,
    /// Serializes updates of the flat view.
    update_lock: Mutex<()>,
}

impl AddressSpace {
    /// Create a new `AddressSpace` with nothing mapped.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of this address space.
    /// * `size` - Addressable size, accesses at or above it never hit.
    pub fn new(name: &str, size: u64) -> Arc<AddressSpace> {
        Arc::new(AddressSpace {
            name: String::from(name),
            size,
            flat_view: ArcSwap::new(Arc::new(FlatView::default())),
            update_lock: Mutex::new(()),
        })
    }

    /// Get the name of this address space.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of this address space.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_range(&self, range: AddressRange) -> Result<()> {
        if range.size == 0 {
            return Err(anyhow!(AddressSpaceError::EmptyRange(
                range.base.raw_value(),
                self.name.clone()
            )));
        }
        if (range.base.raw_value() as u128 + range.size as u128) > self.size as u128 {
            return Err(anyhow!(AddressSpaceError::OutOfSpace(
                range.base.raw_value(),
                range.size,
                self.name.clone(),
                self.size
            )));
        }
        Ok(())
    }

    fn update_view<F: FnOnce(&mut FlatView)>(&self, f: F) {
        let _guard = self.update_lock.lock().unwrap();
        let mut view = FlatView::clone(&self.flat_view.load());
        f(&mut view);
        self.flat_view.store(Arc::new(view));
    }

    /// Install `region` at `range`, replacing whatever was mapped there.
    ///
    /// The region is accessed with offsets relative to `range.base`. The range
    /// may be smaller than the region, accesses past the region end fail.
    ///
    /// # Arguments
    ///
    /// * `range` - Address range the region becomes visible at.
    /// * `region` - The region to install.
    pub fn install(&self, range: AddressRange, region: Region) -> Result<()> {
        self.check_range(range)?;
        trace!(
            "{}: install {} at 0x{:X}-0x{:X}",
            self.name,
            region.name(),
            range.base.raw_value(),
            range.last_addr()
        );
        self.update_view(|view| {
            view.punch(range);
            view.0.insert(
                range.base.raw_value(),
                FlatRange {
                    addr_range: range,
                    owner: region,
                    offset_in_region: 0,
                },
            );
        });
        Ok(())
    }

    /// Unmap everything inside `range`.
    ///
    /// Ranges crossing the edges are trimmed, a range covering the whole of
    /// `range` is split in two.
    pub fn unmap(&self, range: AddressRange) -> Result<()> {
        if range.size == 0 {
            return Ok(());
        }
        let size = std::cmp::min(
            range.size as u128,
            (self.size as u128).saturating_sub(range.base.raw_value() as u128),
        ) as u64;
        if size == 0 {
            return Ok(());
        }
        let range = AddressRange::new(range.base, size);
        trace!(
            "{}: unmap 0x{:X}-0x{:X}",
            self.name,
            range.base.raw_value(),
            range.last_addr()
        );
        self.update_view(|view| view.punch(range));
        Ok(())
    }

    /// Find the flat range covering `addr`.
    pub fn find_flat_range(&self, addr: GuestAddress) -> Option<FlatRange> {
        self.flat_view.load().find(addr.raw_value()).cloned()
    }

    /// Snapshot of all installed ranges, in address order.
    pub fn flat_ranges(&self) -> Vec<FlatRange> {
        self.flat_view.load().0.values().cloned().collect()
    }

    /// Walk the flat view for an access of `len` bytes at `addr`, calling `f`
    /// for every piece. Unmapped pieces are passed as `None`.
    fn for_each_piece<F>(&self, addr: GuestAddress, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(usize, usize, Option<(&FlatRange, u64)>) -> Result<()>,
    {
        let view = self.flat_view.load_full();
        let mut pos = 0_usize;
        let mut first_err = None;

        while pos < len {
            let cur = addr
                .checked_add(pos as u64)
                .ok_or_else(|| anyhow!(AddressSpaceError::Overflow(addr.raw_value())))?;
            let remain = (len - pos) as u64;
            let hit = if cur.raw_value() < self.size {
                view.find(cur.raw_value())
            } else {
                None
            };
            let (count, ret) = match hit {
                Some(fr) => {
                    let count =
                        std::cmp::min(fr.addr_range.last_addr() - cur.raw_value() + 1, remain);
                    let offset = fr.offset_in_region + cur.offset_from(fr.addr_range.base);
                    (count, f(pos, count as usize, Some((fr, offset))))
                }
                None => {
                    let count = view
                        .next_base_after(cur.raw_value())
                        .map_or(remain, |next| std::cmp::min(next - cur.raw_value(), remain));
                    debug!(
                        "{}: unmapped access at 0x{:X}, size {}",
                        self.name,
                        cur.raw_value(),
                        count
                    );
                    (count, f(pos, count as usize, None))
                }
            };
            if let Err(e) = ret {
                first_err.get_or_insert(e);
            }
            pos += count as usize;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read `data.len()` bytes starting at `addr`.
    ///
    /// Bytes that hit no region, or whose region refuses the access, read as
    /// all-ones. A hole is not a failure. The first region failure is returned
    /// after the whole buffer is filled.
    ///
    /// # Arguments
    ///
    /// * `data` - Destination buffer.
    /// * `addr` - Start address of the access.
    pub fn read(&self, data: &mut [u8], addr: GuestAddress) -> Result<()> {
        let len = data.len();
        self.for_each_piece(addr, len, |pos, count, hit| {
            let piece = &mut data[pos..pos + count];
            match hit {
                Some((fr, offset)) => {
                    let base = GuestAddress(
                        fr.addr_range
                            .base
                            .raw_value()
                            .wrapping_sub(fr.offset_in_region),
                    );
                    let ret = fr.owner.read(piece, base, offset);
                    if ret.is_err() {
                        piece.fill(0xff);
                    }
                    ret
                }
                None => {
                    piece.fill(0xff);
                    Ok(())
                }
            }
        })
    }

    /// Write `data` starting at `addr`.
    ///
    /// Bytes that hit no region are dropped. The first failure is returned
    /// after every piece was attempted.
    pub fn write(&self, data: &[u8], addr: GuestAddress) -> Result<()> {
        self.for_each_piece(addr, data.len(), |pos, count, hit| match hit {
            Some((fr, offset)) => {
                let base = GuestAddress(
                    fr.addr_range
                        .base
                        .raw_value()
                        .wrapping_sub(fr.offset_in_region),
                );
                fr.owner.write(&data[pos..pos + count], base, offset)
            }
            None => Ok(()),
        })
    }

    /// Print the installed ranges of this address space.
    pub fn mtree(&self) {
        println!("address-space: {}", self.name);
        for fr in self.flat_ranges() {
            println!(
                "    0x{:X} - 0x{:X}, ({}) : {} @offset 0x{:X}",
                fr.addr_range.base.raw_value(),
                fr.addr_range.last_addr(),
                fr.owner.get_region_type_name(),
                fr.owner.name(),
                fr.offset_in_region
            );
        }
    }
}
