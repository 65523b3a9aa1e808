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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use address_space::{AddressRange, AddressSpace, GuestAddress, Region, RegionOps};
use anyhow::Result;
use log::{debug, warn};
use util::num_ops::combine_u32;

use crate::bridge::BridgeState;
use crate::config::{
    Bank, BankFlags, BankMapper, ConfigField, ConfigSpaceRegisterFile, HeaderLayout,
    BAR_SPACE_UNMAPPED, COMMAND_IO_SPACE, COMMAND_MEMORY_SPACE, PCI_CONFIG_SPACE_SIZE,
    PCI_CONFIG_WINDOW_SIZE, ROM_ADDRESS_ENABLE,
};

/// Invalidation flag shared by every function of a hierarchy.
///
/// Register writes that move a decode window mark it, the owner of the
/// hierarchy regenerates the mapping before the access returns.
#[derive(Clone, Default, Debug)]
pub struct RemapHandle {
    pending: Arc<AtomicBool>,
}

impl RemapHandle {
    pub fn new() -> Self {
        RemapHandle::default()
    }

    pub fn invalidate(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Whether both handles share the same flag.
    pub fn same_as(&self, other: &RemapHandle) -> bool {
        Arc::ptr_eq(&self.pending, &other.pending)
    }
}

/// Bounds of a decode window and the offset added to addresses decoded
/// through it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecodeWindow {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
}

impl DecodeWindow {
    pub fn new(start: u64, end: u64, offset: u64) -> Self {
        DecodeWindow { start, end, offset }
    }

    /// The window as an address range, None for an empty window.
    pub fn range(&self) -> Option<AddressRange> {
        AddressRange::from_bounds(self.start, self.end)
    }
}

/// Everything a function needs to install its decode windows.
pub struct MappingContext<'a> {
    pub memory: DecodeWindow,
    pub io: DecodeWindow,
    pub memory_space: &'a AddressSpace,
    pub io_space: &'a AddressSpace,
}

/// Device specific behaviour layered on top of a `PciFunction`.
///
/// Chipset and device models implement this to claim registers outside the
/// standard header, to install fixed windows (shadow RAM, legacy ports)
/// after the generic bank pass, and to restore their own state on reset.
pub trait FunctionHooks: Send {
    /// Claim a config read. Return None to fall back to the standard layout.
    fn config_read(
        &mut self,
        _regs: &ConfigSpaceRegisterFile,
        _offset: usize,
        _width: usize,
    ) -> Option<u32> {
        None
    }

    /// Claim a config write. Return false to fall back to the standard layout.
    fn config_write(
        &mut self,
        _regs: &mut ConfigSpaceRegisterFile,
        _offset: usize,
        _width: usize,
        _value: u32,
        _mask: u32,
        _remap: &RemapHandle,
    ) -> bool {
        false
    }

    /// Install extra windows, runs after the banks of the function.
    fn map_extra(&mut self, _regs: &ConfigSpaceRegisterFile, _ctx: &MappingContext) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self, _regs: &mut ConfigSpaceRegisterFile) {}
}

/// A PCI function: endpoint, PCI-PCI bridge or host bridge.
///
/// Bridges and host bridges carry a `BridgeState` with their child table and
/// private config space. Host bridges keep the type 0 header layout.
pub struct PciFunction {
    regs: ConfigSpaceRegisterFile,
    bridge: Option<BridgeState>,
    map_first: bool,
    hooks: Option<Box<dyn FunctionHooks>>,
    remap: RemapHandle,
}

impl PciFunction {
    /// Create an endpoint function.
    pub fn new(name: &str) -> Self {
        PciFunction {
            regs: ConfigSpaceRegisterFile::new(name, HeaderLayout::Type0),
            bridge: None,
            map_first: false,
            hooks: None,
            remap: RemapHandle::new(),
        }
    }

    /// Create a PCI-PCI bridge function.
    pub fn new_bridge(name: &str) -> Self {
        PciFunction {
            regs: ConfigSpaceRegisterFile::new(name, HeaderLayout::Type1),
            bridge: Some(BridgeState::new(name)),
            map_first: false,
            hooks: None,
            remap: RemapHandle::new(),
        }
    }

    /// Create the function of a host bridge, which owns the root bus.
    pub fn new_host(name: &str) -> Self {
        PciFunction {
            regs: ConfigSpaceRegisterFile::new(name, HeaderLayout::Type0),
            bridge: Some(BridgeState::new(name)),
            map_first: false,
            hooks: None,
            remap: RemapHandle::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.regs.name()
    }

    pub fn regs(&self) -> &ConfigSpaceRegisterFile {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut ConfigSpaceRegisterFile {
        &mut self.regs
    }

    pub fn bridge(&self) -> Option<&BridgeState> {
        self.bridge.as_ref()
    }

    pub fn bridge_mut(&mut self) -> Option<&mut BridgeState> {
        self.bridge.as_mut()
    }

    pub fn is_bridge(&self) -> bool {
        self.bridge.is_some()
    }

    pub fn set_ids(&mut self, main_id: u32, revision: u8, class: u32, subsystem_id: u32) {
        self.regs.set_ids(main_id, revision, class, subsystem_id);
    }

    pub fn set_multifunction(&mut self, enable: bool) {
        self.regs.set_multifunction(enable);
    }

    pub fn is_multifunction(&self) -> bool {
        self.regs.is_multifunction()
    }

    /// Map this function before the others in every decode pass.
    pub fn set_map_first(&mut self, enable: bool) {
        self.map_first = enable;
    }

    pub fn map_first(&self) -> bool {
        self.map_first
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn FunctionHooks>) {
        self.hooks = Some(hooks);
    }

    pub fn set_remap_handle(&mut self, remap: RemapHandle) {
        self.remap = remap;
    }

    pub fn remap_handle(&self) -> &RemapHandle {
        &self.remap
    }

    /// Declare a bank, see `ConfigSpaceRegisterFile::declare_bank`.
    pub fn declare_bank(
        &mut self,
        size: u64,
        flags: BankFlags,
        mapper: BankMapper,
    ) -> Result<usize> {
        self.regs.declare_bank(size, flags, mapper)
    }

    pub fn skip_bank_regs(&mut self, count: usize) -> Result<()> {
        self.regs.skip_bank_regs(count)
    }

    pub fn declare_expansion_rom(&mut self, image: Arc<[u8]>) {
        self.regs.declare_expansion_rom(image);
    }

    /// Move bank `id` from the device side.
    pub fn set_bank_address(&mut self, id: usize, address: u64) -> Result<()> {
        self.regs.set_bank_address(id, address)?;
        self.remap.invalidate();
        Ok(())
    }

    pub fn set_bank_size(&mut self, id: usize, size: u64) -> Result<()> {
        self.regs.set_bank_size(id, size)?;
        self.remap.invalidate();
        Ok(())
    }

    pub fn set_bank_flags(&mut self, id: usize, flags: BankFlags) -> Result<()> {
        self.regs.set_bank_flags(id, flags)?;
        self.remap.invalidate();
        Ok(())
    }

    fn read_field(&self, field: ConfigField) -> u32 {
        if let Some(value) = self.regs.read_field(field) {
            return value;
        }
        match self.bridge.as_ref().and_then(|b| b.read_field(field)) {
            Some(value) => value,
            None => {
                debug!("{}: unmapped config read of {:?}", self.name(), field);
                0
            }
        }
    }

    fn write_field(&mut self, field: ConfigField, value: u32, mask: u32) -> bool {
        if let Some(remap) = self.regs.write_field(field, value, mask) {
            return remap;
        }
        let name = self.regs.name().to_string();
        match self.bridge.as_mut() {
            Some(bridge) => bridge.write_field(&name, field, value, mask).unwrap_or(false),
            None => {
                debug!("{}: unmapped config write of {:?}", name, field);
                false
            }
        }
    }

    /// Read `width` bytes of config space at `offset`, dispatched by the
    /// header layout. Registers past the 256 byte header read 0.
    pub fn read_config_field(&mut self, offset: usize, width: usize) -> u32 {
        if let Some(hooks) = self.hooks.as_mut() {
            if let Some(value) = hooks.config_read(&self.regs, offset, width) {
                return value;
            }
        }

        let end = offset + width;
        let mut value = 0_u32;
        let mut pos = offset;
        while pos < end && pos < PCI_CONFIG_SPACE_SIZE {
            match self.regs.layout().lookup(pos) {
                Some(desc) => {
                    let field_value = self.read_field(desc.field);
                    let stop = std::cmp::min(desc.start + desc.width, end);
                    for p in pos..stop {
                        let byte = (field_value >> ((p - desc.start) * 8)) & 0xff;
                        value |= byte << ((p - offset) * 8);
                    }
                    pos = stop;
                }
                None => {
                    value |= u32::from(self.regs.read_byte(pos)) << ((pos - offset) * 8);
                    pos += 1;
                }
            }
        }
        value
    }

    /// Write `width` bytes of config space at `offset`, only the bits set in
    /// `mask` are written. Marks the remap handle when a decode window moved.
    pub fn write_config_field(&mut self, offset: usize, width: usize, value: u32, mask: u32) {
        debug!(
            "{}: config write {:02x} = {:08x} & {:08x}",
            self.name(),
            offset,
            value,
            mask
        );
        if let Some(hooks) = self.hooks.as_mut() {
            if hooks.config_write(&mut self.regs, offset, width, value, mask, &self.remap) {
                return;
            }
        }

        let end = offset + width;
        let mut remap = false;
        let mut pos = offset;
        while pos < end && pos < PCI_CONFIG_SPACE_SIZE {
            match self.regs.layout().lookup(pos) {
                Some(desc) => {
                    let stop = std::cmp::min(desc.start + desc.width, end);
                    let mut field_value = 0_u32;
                    let mut field_mask = 0_u32;
                    for p in pos..stop {
                        let lane = (p - offset) * 8;
                        let shift = (p - desc.start) * 8;
                        field_value |= ((value >> lane) & 0xff) << shift;
                        field_mask |= ((mask >> lane) & 0xff) << shift;
                    }
                    if field_mask != 0 {
                        remap |= self.write_field(desc.field, field_value, field_mask);
                    }
                    pos = stop;
                }
                None => {
                    let lane = (pos - offset) * 8;
                    let byte_mask = (mask >> lane) & 0xff;
                    if byte_mask != 0 {
                        let old = u32::from(self.regs.read_byte(pos));
                        let byte = combine_u32(old, value >> lane, byte_mask) as u8;
                        self.regs.write_byte(pos, byte);
                    }
                    pos += 1;
                }
            }
        }

        if remap {
            self.remap.invalidate();
        }
    }

    /// Read config space into `data`, used by config windows.
    ///
    /// # Arguments
    ///
    /// * `offset` - Offset in configuration space.
    /// * `data` - Data buffer for reading, 1 to 4 bytes.
    pub fn read_config(&mut self, offset: usize, data: &mut [u8]) {
        let size = data.len();
        if size == 0 || size > 4 || offset + size > PCI_CONFIG_WINDOW_SIZE as usize {
            warn!(
                "{}: invalid config read, offset 0x{:x} size {}",
                self.name(),
                offset,
                size
            );
            data.fill(0xff);
            return;
        }
        let value = self.read_config_field(offset, size);
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (value >> (i * 8)) as u8;
        }
    }

    /// Write config space from `data`, used by config windows.
    ///
    /// # Arguments
    ///
    /// * `offset` - Offset in configuration space.
    /// * `data` - Data to write, 1 to 4 bytes.
    pub fn write_config(&mut self, offset: usize, data: &[u8]) {
        let size = data.len();
        if size == 0 || size > 4 || offset + size > PCI_CONFIG_WINDOW_SIZE as usize {
            warn!(
                "{}: invalid config write, offset 0x{:x} size {}",
                self.name(),
                offset,
                size
            );
            return;
        }
        let mut value = 0_u32;
        for (i, byte) in data.iter().enumerate() {
            value |= u32::from(*byte) << (i * 8);
        }
        let mask = if size == 4 {
            u32::MAX
        } else {
            (1_u32 << (size * 8)) - 1
        };
        self.write_config_field(offset, size, value, mask);
    }

    fn bank_region(&self, id: usize, bank: &Bank) -> Region {
        let name = format!("{}:{}", self.name(), bank.mapper.name);
        let inner_read = bank.mapper.ops.read.clone();
        let inner_write = bank.mapper.ops.write.clone();
        let rd_name = name.clone();
        let wr_name = name.clone();

        let read = move |data: &mut [u8], base: GuestAddress, offset: u64| -> bool {
            if !inner_read(data, base, offset) {
                debug!(
                    "{}: unmapped read from {:08x} size {} (bank {})",
                    rd_name,
                    offset,
                    data.len(),
                    id
                );
                data.fill(0xff);
            }
            true
        };
        let write = move |data: &[u8], base: GuestAddress, offset: u64| -> bool {
            if !inner_write(data, base, offset) {
                debug!(
                    "{}: unmapped write to {:08x} = {:02x?} (bank {})",
                    wr_name, offset, data, id
                );
            }
            true
        };

        Region::init_io_region(
            bank.size,
            RegionOps {
                read: Arc::new(read),
                write: Arc::new(write),
            },
            &name,
        )
    }

    fn map_banks(&self, ctx: &MappingContext) {
        let command = self.regs.command();
        for (id, bank) in self.regs.banks().iter().enumerate() {
            if bank.address as u32 >= BAR_SPACE_UNMAPPED {
                continue;
            }
            let io = bank.flags.contains(BankFlags::IO);
            let enable = if io {
                COMMAND_IO_SPACE
            } else {
                COMMAND_MEMORY_SPACE
            };
            if command & enable == 0 {
                continue;
            }
            if bank.size == 0 || bank.flags.contains(BankFlags::DISABLED) {
                continue;
            }

            let (space, window) = if io {
                (ctx.io_space, ctx.io)
            } else {
                (ctx.memory_space, ctx.memory)
            };
            let start = bank.aligned_address().wrapping_add(window.offset);
            let range = match start
                .checked_add(bank.size - 1)
                .and_then(|end| AddressRange::from_bounds(start, end))
            {
                Some(range) => range,
                None => {
                    debug!("{}: bank {} at {:x} overflows", self.name(), id, start);
                    continue;
                }
            };
            if let Err(e) = space.install(range, self.bank_region(id, bank)) {
                debug!("{}: bank {} left unmapped: {:?}", self.name(), id, e);
                continue;
            }
            let width = if io { 4 } else { 8 };
            debug!(
                "map {} at {:0w$x}-{:0w$x}",
                bank.mapper.name,
                range.base.raw_value(),
                range.last_addr(),
                w = width
            );
        }
    }

    fn map_expansion_rom(&self, ctx: &MappingContext) {
        let base = self.regs.expansion_rom_base();
        if base & ROM_ADDRESS_ENABLE == 0 {
            return;
        }
        let rom = match self.regs.expansion_rom() {
            Some(rom) if !rom.is_empty() => rom.clone(),
            _ => return,
        };
        let bounds = u64::from(base & !ROM_ADDRESS_ENABLE)
            .checked_add(ctx.memory.offset)
            .and_then(|start| Some((start, start.checked_add(rom.len() as u64 - 1)?)));
        let (start, last) = match bounds {
            Some(bounds) => bounds,
            None => {
                debug!(
                    "{}: expansion rom at {:08x} overflows the memory window",
                    self.name(),
                    base
                );
                return;
            }
        };
        let end = std::cmp::min(last, ctx.memory.end);
        let range = match AddressRange::from_bounds(start, end) {
            Some(range) => range,
            None => return,
        };
        debug!(
            "{}: map expansion rom at {:08x}-{:08x}",
            self.name(),
            start,
            end
        );
        let name = format!("{}:rom", self.name());
        if let Err(e) = ctx
            .memory_space
            .install(range, Region::init_rom_region(rom, &name))
        {
            debug!("{}: expansion rom left unmapped: {:?}", self.name(), e);
        }
    }

    /// Run the extra mapping hook of this function.
    pub fn map_extra(&mut self, ctx: &MappingContext) -> Result<()> {
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.map_extra(&self.regs, ctx)?;
        }
        Ok(())
    }

    /// Install the decode windows of this function: enabled banks, the extra
    /// mapping hook, then the expansion ROM. Bridges only run their hook,
    /// their children are mapped by the topology.
    pub fn compute_decode_windows(&mut self, ctx: &MappingContext) -> Result<()> {
        if self.bridge.is_some() {
            return self.map_extra(ctx);
        }
        self.map_banks(ctx);
        self.map_extra(ctx)?;
        self.map_expansion_rom(ctx);
        Ok(())
    }

    /// Restore command and status defaults. Bridges also clear their bus
    /// numbers and bridge control.
    pub fn reset(&mut self) {
        self.regs.reset();
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.reset();
        }
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.reset(&mut self.regs);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::{
        BAR_0, CLASS_REVISION, COMMAND, HEADER_TYPE, INTERRUPT_LINE, PRIMARY_BUS_NUM, ROM_ADDRESS,
    };
    use crate::PciError;

    /// Bank backed by a small register array, accesses past it are not claimed.
    pub fn register_mapper(name: &str, regs: Arc<Mutex<Vec<u8>>>) -> BankMapper {
        let regs_w = regs.clone();
        BankMapper::new(
            name,
            RegionOps {
                read: Arc::new(move |data: &mut [u8], _: GuestAddress, offset: u64| {
                    let regs = regs.lock().unwrap();
                    let start = offset as usize;
                    if start + data.len() > regs.len() {
                        return false;
                    }
                    data.copy_from_slice(&regs[start..start + data.len()]);
                    true
                }),
                write: Arc::new(move |data: &[u8], _: GuestAddress, offset: u64| {
                    let mut regs = regs_w.lock().unwrap();
                    let start = offset as usize;
                    if start + data.len() > regs.len() {
                        return false;
                    }
                    regs[start..start + data.len()].copy_from_slice(data);
                    true
                }),
            },
        )
    }

    fn create_spaces() -> (Arc<AddressSpace>, Arc<AddressSpace>) {
        (
            AddressSpace::new("memory", 1 << 32),
            AddressSpace::new("io", 1 << 16),
        )
    }

    fn context<'a>(mem: &'a AddressSpace, io: &'a AddressSpace) -> MappingContext<'a> {
        MappingContext {
            memory: DecodeWindow::new(0, 0xffff_ffff, 0),
            io: DecodeWindow::new(0, 0xffff, 0),
            memory_space: mem,
            io_space: io,
        }
    }

    fn ranges(space: &AddressSpace) -> Vec<(u64, u64)> {
        space
            .flat_ranges()
            .iter()
            .map(|fr| (fr.addr_range.base.raw_value(), fr.addr_range.last_addr()))
            .collect()
    }

    #[test]
    fn test_config_field_dispatch() {
        let mut func = PciFunction::new("ide");
        func.set_ids(0x1039_5513, 0xd0, 0x01018a, 0x1039_5513);

        assert_eq!(func.read_config_field(0, 4), 0x5513_1039);
        assert_eq!(func.read_config_field(CLASS_REVISION, 4), 0x0101_8ad0);
        assert_eq!(func.read_config_field(CLASS_REVISION + 1, 2), 0x018a);
        assert_eq!(func.read_config_field(COMMAND, 2), 0x0080);
        assert_eq!(func.read_config_field(HEADER_TYPE, 1), 0);
        assert_eq!(func.read_config_field(INTERRUPT_LINE, 2), 0x00ff);
        assert_eq!(func.read_config_field(0x100, 4), 0);

        let mut data = [0_u8; 4];
        func.read_config(0x0c, &mut data);
        assert_eq!(data, [0, 0, 0, 0]);
        func.read_config(0x1000, &mut data);
        assert_eq!(data, [0xff; 4]);
    }

    #[test]
    fn test_config_write_masked_lanes() {
        let mut func = PciFunction::new("dev");
        func.regs_mut().init_dword(0x40, 0, 0xffff_ffff).unwrap();

        // Byte write to interrupt line inside the 0x3c dword.
        func.write_config_field(INTERRUPT_LINE, 4, 0xaabb_cc0b, 0x0000_00ff);
        assert_eq!(func.regs().interrupt_line(), 0x0b);
        assert_eq!(func.regs().interrupt_pin(), 0);

        // Holes in the mask leave the skipped bytes alone.
        func.write_config_field(0x40, 4, 0x1122_3344, 0x00ff_00ff);
        assert_eq!(func.regs().read_dword(0x40).unwrap(), 0x0022_0044);

        func.write_config(0x42, &[0x99]);
        assert_eq!(func.read_config_field(0x40, 4), 0x0099_0044);
    }

    #[test]
    fn test_remap_on_register_writes() {
        let mut func = PciFunction::new("dev");
        let remap = RemapHandle::new();
        func.set_remap_handle(remap.clone());
        let backing = Arc::new(Mutex::new(vec![0; 16]));
        func.declare_bank(0x1000, BankFlags::MEMORY, register_mapper("regs", backing))
            .unwrap();

        func.write_config(COMMAND, &[0x80, 0x00]);
        assert!(!remap.take_pending());
        func.write_config(COMMAND, &[0x82, 0x00]);
        assert!(remap.take_pending());
        func.write_config(BAR_0, &[0x00, 0x10, 0x00, 0x00]);
        assert!(remap.take_pending());
        // Unlinked slot.
        func.write_config(BAR_0 + 4, &[0x00, 0x20, 0x00, 0x00]);
        assert!(!remap.take_pending());
        func.write_config(ROM_ADDRESS, &[0x01, 0x00, 0x0c, 0x00]);
        assert!(remap.take_pending());
        func.write_config(INTERRUPT_LINE, &[0x0a]);
        assert!(!remap.take_pending());

        func.set_bank_address(0, 0x2000).unwrap();
        assert!(remap.take_pending());
        assert!(func.set_bank_size(3, 0x10).is_err());
        assert!(!remap.is_pending());
    }

    #[test]
    fn test_bank_window_install() {
        let (mem, io) = create_spaces();
        let backing = Arc::new(Mutex::new(vec![0_u8; 16]));
        let mut func = PciFunction::new("nic");
        func.declare_bank(0x1000, BankFlags::MEMORY, register_mapper("regs", backing.clone()))
            .unwrap();
        func.write_config(BAR_0, &[0x00, 0x10, 0x00, 0x00]);

        // Memory decoding is off after reset.
        func.compute_decode_windows(&context(&mem, &io)).unwrap();
        assert!(ranges(&mem).is_empty());

        func.write_config(COMMAND, &[0x82, 0x00]);
        func.compute_decode_windows(&context(&mem, &io)).unwrap();
        assert_eq!(ranges(&mem), vec![(0x1000, 0x1fff)]);
        assert!(ranges(&io).is_empty());

        mem.write(&[0xde, 0xad], GuestAddress(0x1004)).unwrap();
        assert_eq!(backing.lock().unwrap()[4..6], [0xde, 0xad]);

        // Past the register array: logged, reads all-ones.
        let mut data = [0_u8; 4];
        mem.read(&mut data, GuestAddress(0x1800)).unwrap();
        assert_eq!(data, [0xff; 4]);
    }

    #[test]
    fn test_bank_skip_rules() {
        let (mem, io) = create_spaces();
        let mut func = PciFunction::new("dev");
        let backing = Arc::new(Mutex::new(vec![0_u8; 4]));
        func.declare_bank(0x100, BankFlags::IO, register_mapper("io", backing.clone()))
            .unwrap();
        func.declare_bank(
            0x100,
            BankFlags::IO | BankFlags::DISABLED,
            register_mapper("off", backing.clone()),
        )
        .unwrap();
        func.declare_bank(0x1000, BankFlags::MEMORY, register_mapper("zero", backing.clone()))
            .unwrap();
        func.declare_bank(0x1000, BankFlags::MEMORY, register_mapper("mem", backing))
            .unwrap();
        func.write_config(COMMAND, &[0x83, 0x00]);
        func.write_config(BAR_0, &[0x01, 0xe0, 0x00, 0x00]);
        func.write_config(BAR_0 + 4, &[0x01, 0xe1, 0x00, 0x00]);
        func.set_bank_size(2, 0).unwrap();
        // Sizing pattern left in place.
        func.write_config(BAR_0 + 12, &[0xff, 0xff, 0xff, 0xff]);

        func.compute_decode_windows(&context(&mem, &io)).unwrap();
        assert_eq!(ranges(&io), vec![(0xe000, 0xe0ff)]);
        assert!(ranges(&mem).is_empty());
    }

    #[test]
    fn test_window_offset_and_rom() {
        let (mem, io) = create_spaces();
        let mut func = PciFunction::new("vga");
        let backing = Arc::new(Mutex::new(vec![0_u8; 4]));
        func.declare_bank(0x100, BankFlags::IO, register_mapper("io", backing))
            .unwrap();
        func.declare_expansion_rom(Arc::from(vec![0x55_u8; 0x10000]));
        func.write_config(COMMAND, &[0x81, 0x00]);
        func.write_config(BAR_0, &[0x00, 0x03, 0x00, 0x00]);
        func.write_config(ROM_ADDRESS, &[0x01, 0x00, 0xff, 0xff]);

        let ctx = MappingContext {
            memory: DecodeWindow::new(0, 0xffff_7fff, 0),
            io: DecodeWindow::new(0, 0xffff, 0x1000),
            memory_space: &mem,
            io_space: &io,
        };
        func.compute_decode_windows(&ctx).unwrap();
        assert_eq!(ranges(&io), vec![(0x1300, 0x13ff)]);
        // Clipped to the memory window end.
        assert_eq!(ranges(&mem), vec![(0xffff_0000, 0xffff_7fff)]);
        let mut data = [0_u8; 2];
        mem.read(&mut data, GuestAddress(0xffff_0000)).unwrap();
        assert_eq!(data, [0x55, 0x55]);
    }

    #[test]
    fn test_rom_offset_overflow() {
        let (mem, io) = create_spaces();
        let mut func = PciFunction::new("vga");
        func.declare_expansion_rom(Arc::from(vec![0x55_u8; 0x1000]));
        func.write_config(COMMAND, &[0x82, 0x00]);
        func.write_config(ROM_ADDRESS, &[0x01, 0x00, 0x0f, 0x00]);

        // Base plus offset wraps.
        let ctx = MappingContext {
            memory: DecodeWindow::new(0, u64::MAX, u64::MAX - 0x100),
            io: DecodeWindow::new(0, 0xffff, 0),
            memory_space: &mem,
            io_space: &io,
        };
        func.compute_decode_windows(&ctx).unwrap();
        assert!(ranges(&mem).is_empty());

        // Start fits, the rom end does not.
        let ctx = MappingContext {
            memory: DecodeWindow::new(0, u64::MAX, u64::MAX - 0xf_0800),
            ..ctx
        };
        func.compute_decode_windows(&ctx).unwrap();
        assert!(ranges(&mem).is_empty());
    }

    #[test]
    fn test_bridge_function_fields() {
        let mut func = PciFunction::new_bridge("bridge");
        assert!(func.is_bridge());
        assert_eq!(func.read_config_field(HEADER_TYPE, 1), 0x01);
        assert_eq!(func.read_config_field(BAR_0, 4), 0xffff_ffff);
        func.write_config(PRIMARY_BUS_NUM, &[0x00, 0x01, 0x03, 0x40]);
        assert_eq!(func.read_config_field(PRIMARY_BUS_NUM, 4), 0xff03_0100);

        func.reset();
        assert_eq!(func.read_config_field(PRIMARY_BUS_NUM, 3), 0);

        let host = PciFunction::new_host("host");
        assert!(host.is_bridge());
        assert_eq!(host.regs().layout(), HeaderLayout::Type0);
    }

    struct FailingChipset;

    impl FunctionHooks for FailingChipset {
        fn config_read(
            &mut self,
            _regs: &ConfigSpaceRegisterFile,
            offset: usize,
            width: usize,
        ) -> Option<u32> {
            if offset == 0x70 && width == 1 {
                return Some(0x5a);
            }
            None
        }

        fn config_write(
            &mut self,
            _regs: &mut ConfigSpaceRegisterFile,
            offset: usize,
            _width: usize,
            _value: u32,
            _mask: u32,
            remap: &RemapHandle,
        ) -> bool {
            if offset == 0x70 {
                remap.invalidate();
                return true;
            }
            false
        }

        fn map_extra(
            &mut self,
            _regs: &ConfigSpaceRegisterFile,
            _ctx: &MappingContext,
        ) -> Result<()> {
            Err(PciError::Unimplemented("smram aliasing".to_string()).into())
        }
    }

    #[test]
    fn test_function_hooks() {
        let (mem, io) = create_spaces();
        let mut func = PciFunction::new("chipset");
        let remap = RemapHandle::new();
        func.set_remap_handle(remap.clone());
        func.set_hooks(Box::new(FailingChipset));

        assert_eq!(func.read_config_field(0x70, 1), 0x5a);
        assert_eq!(func.read_config_field(0x71, 1), 0);
        func.write_config(0x70, &[1]);
        assert!(remap.take_pending());

        let err = func.compute_decode_windows(&context(&mem, &io)).unwrap_err();
        assert!(err.to_string().contains("smram aliasing"));
    }
}
