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

use std::sync::Arc;

use address_space::RegionOps;
use anyhow::{anyhow, Result};
use log::debug;
use util::num_ops::{combine_u32, read_u32, write_u64_high, write_u64_low};

use crate::{le_read_u32, le_write_u32, PciError};

/// Size in bytes of the configuration space of legacy PCI device.
pub const PCI_CONFIG_SPACE_SIZE: usize = 256;
/// Size in bytes of the config window reserved for each devfn.
pub const PCI_CONFIG_WINDOW_SIZE: u64 = 0x1000;
/// Size in bytes of dword.
pub const REG_SIZE: usize = 4;
/// Max number of banks, and of base address register slots.
pub const MAX_BANKS: usize = 6;
/// Max number of function.
pub const MAX_FUNC: u8 = 8;

/// Vendor ID Register.
pub const VENDOR_ID: usize = 0x00;
/// Device ID register.
pub const DEVICE_ID: usize = 0x02;
/// Command register.
pub const COMMAND: usize = 0x04;
/// Status register.
pub const STATUS: usize = 0x06;
/// Revision ID and class code, as one dword.
pub const CLASS_REVISION: usize = 0x08;
pub const CACHE_LINE_SIZE: usize = 0x0c;
pub const LATENCY_TIMER: usize = 0x0d;
/// Header Type register.
pub const HEADER_TYPE: usize = 0x0e;
pub const BIST: usize = 0x0f;
/// Base address register 0.
pub const BAR_0: usize = 0x10;
pub const SUBSYSTEM_VENDOR_ID: usize = 0x2c;
pub const SUBSYSTEM_ID: usize = 0x2e;
/// Expansion ROM base address of a type 0 header.
pub const ROM_ADDRESS: usize = 0x30;
pub const CAPABILITY_POINTER: usize = 0x34;
/// Interrupt line register.
pub const INTERRUPT_LINE: usize = 0x3c;
/// Interrupt pin register.
pub const INTERRUPT_PIN: usize = 0x3d;

/// Primary bus number register.
pub const PRIMARY_BUS_NUM: usize = 0x18;
/// Secondary bus number register.
pub const SECONDARY_BUS_NUM: usize = 0x19;
/// Subordinate bus number register.
pub const SUBORDINATE_BUS_NUM: usize = 0x1a;
pub const SECONDARY_LATENCY: usize = 0x1b;
/// I/O base register.
pub const IO_BASE: usize = 0x1c;
pub const IO_LIMIT: usize = 0x1d;
pub const SECONDARY_STATUS: usize = 0x1e;
/// Memory base register.
pub const MEMORY_BASE: usize = 0x20;
pub const MEMORY_LIMIT: usize = 0x22;
/// Prefetchable memory base register.
pub const PREF_MEMORY_BASE: usize = 0x24;
/// Prefetchable memory limit register.
pub const PREF_MEMORY_LIMIT: usize = 0x26;
pub const PREF_MEM_BASE_UPPER: usize = 0x28;
pub const PREF_MEM_LIMIT_UPPER: usize = 0x2c;
pub const IO_BASE_UPPER: usize = 0x30;
pub const IO_LIMIT_UPPER: usize = 0x32;
/// Expansion ROM base address of a type 1 header.
pub const ROM_ADDRESS1: usize = 0x38;
/// Bridge control register.
pub const BRIDGE_CONTROL: usize = 0x3e;

/// I/O space enable.
pub const COMMAND_IO_SPACE: u16 = 0x0001;
/// Memory space enable.
pub const COMMAND_MEMORY_SPACE: u16 = 0x0002;
/// Command register value after reset.
pub const COMMAND_DEFAULT: u16 = 0x0080;
/// Writable bits of the command register.
pub const COMMAND_MASK_DEFAULT: u16 = 0x01bf;

pub const HEADER_TYPE_ENDPOINT: u8 = 0x00;
pub const HEADER_TYPE_BRIDGE: u8 = 0x01;
pub const HEADER_TYPE_MULTIFUNC: u8 = 0x80;

/// The bar is mapped in I/O space.
pub const BAR_IO_SPACE: u32 = 0x01;
/// 64-bit memory bar.
pub const BAR_MEM_64BIT: u32 = 0x04;
/// Prefetchable memory bar.
pub const BAR_PREFETCH: u32 = 0x08;
/// Addresses at or above this value in the low dword are never decoded.
pub const BAR_SPACE_UNMAPPED: u32 = 0xffff_fffc;

pub const INTERRUPT_LINE_DEFAULT: u8 = 0xff;
/// Enable bit of the expansion ROM base address.
pub const ROM_ADDRESS_ENABLE: u32 = 0x01;

bitflags::bitflags! {
    /// Type of a bank, the low bits match the base address register encoding.
    #[derive(Default)]
    pub struct BankFlags: u32 {
        const MEMORY = 0;
        const IO = BAR_IO_SPACE;
        const SIXTY_FOUR = BAR_MEM_64BIT;
        const PREFETCH = BAR_PREFETCH;
        /// Declared but never decoded.
        const DISABLED = 0x10;
    }
}

impl BankFlags {
    /// Flag bits reported in the low bits of the base address register.
    pub fn bar_bits(self) -> u32 {
        (self & (BankFlags::IO | BankFlags::SIXTY_FOUR | BankFlags::PREFETCH)).bits()
    }
}

/// Device side of a bank: the handlers that answer accesses to its window.
///
/// Offsets passed to `ops` are relative to the start of the window.
#[derive(Clone)]
pub struct BankMapper {
    pub name: String,
    pub ops: RegionOps,
}

impl BankMapper {
    pub fn new(name: &str, ops: RegionOps) -> Self {
        BankMapper {
            name: name.to_string(),
            ops,
        }
    }
}

#[derive(Clone)]
pub struct Bank {
    /// Base address as last programmed, including bits below the alignment.
    pub address: u64,
    /// Size in bytes, 0 leaves the bank undecoded.
    pub size: u64,
    pub flags: BankFlags,
    pub mapper: BankMapper,
}

impl Bank {
    /// Address of the window, aligned down to the bank size.
    pub fn aligned_address(&self) -> u64 {
        self.address & !self.size.wrapping_sub(1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BankReg {
    bank: usize,
    high: bool,
}

/// Which register layout a function exposes from 0x10 to 0x3f.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderLayout {
    /// Endpoint, type 0 header.
    Type0,
    /// PCI-PCI bridge, type 1 header.
    Type1,
}

/// Fields of the standard headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigField {
    VendorId,
    DeviceId,
    Command,
    Status,
    ClassRevision,
    CacheLineSize,
    LatencyTimer,
    HeaderType,
    Bist,
    BaseAddress(usize),
    SubsystemVendorId,
    SubsystemId,
    ExpansionRom,
    CapabilityPointer,
    InterruptLine,
    InterruptPin,
    BridgeBaseAddress(usize),
    PrimaryBus,
    SecondaryBus,
    SubordinateBus,
    SecondaryLatency,
    IoBase,
    IoLimit,
    SecondaryStatus,
    MemoryBase,
    MemoryLimit,
    PrefetchBase,
    PrefetchLimit,
    PrefetchBaseUpper,
    PrefetchLimitUpper,
    IoBaseUpper,
    IoLimitUpper,
    BridgeControl,
}

/// Location of a field in config space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDesc {
    pub field: ConfigField,
    pub start: usize,
    pub width: usize,
}

const COMMON_FIELDS: &[(usize, usize, ConfigField)] = &[
    (VENDOR_ID, 2, ConfigField::VendorId),
    (DEVICE_ID, 2, ConfigField::DeviceId),
    (COMMAND, 2, ConfigField::Command),
    (STATUS, 2, ConfigField::Status),
    (CLASS_REVISION, 4, ConfigField::ClassRevision),
    (CACHE_LINE_SIZE, 1, ConfigField::CacheLineSize),
    (LATENCY_TIMER, 1, ConfigField::LatencyTimer),
    (HEADER_TYPE, 1, ConfigField::HeaderType),
    (BIST, 1, ConfigField::Bist),
    (CAPABILITY_POINTER, 1, ConfigField::CapabilityPointer),
    (INTERRUPT_LINE, 1, ConfigField::InterruptLine),
    (INTERRUPT_PIN, 1, ConfigField::InterruptPin),
];

const TYPE0_FIELDS: &[(usize, usize, ConfigField)] = &[
    (BAR_0, 4, ConfigField::BaseAddress(0)),
    (BAR_0 + 4, 4, ConfigField::BaseAddress(1)),
    (BAR_0 + 8, 4, ConfigField::BaseAddress(2)),
    (BAR_0 + 12, 4, ConfigField::BaseAddress(3)),
    (BAR_0 + 16, 4, ConfigField::BaseAddress(4)),
    (BAR_0 + 20, 4, ConfigField::BaseAddress(5)),
    (SUBSYSTEM_VENDOR_ID, 2, ConfigField::SubsystemVendorId),
    (SUBSYSTEM_ID, 2, ConfigField::SubsystemId),
    (ROM_ADDRESS, 4, ConfigField::ExpansionRom),
];

const TYPE1_FIELDS: &[(usize, usize, ConfigField)] = &[
    (BAR_0, 4, ConfigField::BridgeBaseAddress(0)),
    (BAR_0 + 4, 4, ConfigField::BridgeBaseAddress(1)),
    (PRIMARY_BUS_NUM, 1, ConfigField::PrimaryBus),
    (SECONDARY_BUS_NUM, 1, ConfigField::SecondaryBus),
    (SUBORDINATE_BUS_NUM, 1, ConfigField::SubordinateBus),
    (SECONDARY_LATENCY, 1, ConfigField::SecondaryLatency),
    (IO_BASE, 1, ConfigField::IoBase),
    (IO_LIMIT, 1, ConfigField::IoLimit),
    (SECONDARY_STATUS, 2, ConfigField::SecondaryStatus),
    (MEMORY_BASE, 2, ConfigField::MemoryBase),
    (MEMORY_LIMIT, 2, ConfigField::MemoryLimit),
    (PREF_MEMORY_BASE, 2, ConfigField::PrefetchBase),
    (PREF_MEMORY_LIMIT, 2, ConfigField::PrefetchLimit),
    (PREF_MEM_BASE_UPPER, 4, ConfigField::PrefetchBaseUpper),
    (PREF_MEM_LIMIT_UPPER, 4, ConfigField::PrefetchLimitUpper),
    (IO_BASE_UPPER, 2, ConfigField::IoBaseUpper),
    (IO_LIMIT_UPPER, 2, ConfigField::IoLimitUpper),
    (ROM_ADDRESS1, 4, ConfigField::ExpansionRom),
    (BRIDGE_CONTROL, 2, ConfigField::BridgeControl),
];

impl HeaderLayout {
    /// Header type register value, without the multifunction bit.
    pub fn header_type(&self) -> u8 {
        match self {
            HeaderLayout::Type0 => HEADER_TYPE_ENDPOINT,
            HeaderLayout::Type1 => HEADER_TYPE_BRIDGE,
        }
    }

    /// Find the field covering `offset`, None for vendor specific or
    /// reserved bytes.
    pub fn lookup(&self, offset: usize) -> Option<FieldDesc> {
        let specific = match self {
            HeaderLayout::Type0 => TYPE0_FIELDS,
            HeaderLayout::Type1 => TYPE1_FIELDS,
        };
        COMMON_FIELDS
            .iter()
            .chain(specific.iter())
            .find(|(start, width, _)| offset >= *start && offset < start + width)
            .map(|(start, width, field)| FieldDesc {
                field: *field,
                start: *start,
                width: *width,
            })
    }
}

/// Register state shared by every PCI function: identity, command and
/// status, banks and their base address register slots, the expansion ROM,
/// the interrupt line/pin pair and the vendor specific bytes.
pub struct ConfigSpaceRegisterFile {
    name: String,
    layout: HeaderLayout,
    main_id: u32,
    revision: u8,
    class: u32,
    subsystem_id: u32,
    command: u16,
    command_mask: u16,
    command_reset: u16,
    status: u16,
    status_reset: u16,
    intr_line: u8,
    intr_pin: u8,
    multifunction: bool,
    banks: Vec<Bank>,
    bank_regs: [Option<BankReg>; MAX_BANKS],
    bank_reg_count: usize,
    rom: Option<Arc<[u8]>>,
    rom_base: u32,
    /// Backing bytes of registers outside the standard header.
    config: Vec<u8>,
    /// Writable bits of `config`.
    write_mask: Vec<u8>,
}

impl ConfigSpaceRegisterFile {
    pub fn new(name: &str, layout: HeaderLayout) -> Self {
        ConfigSpaceRegisterFile {
            name: name.to_string(),
            layout,
            main_id: 0xffff_ffff,
            revision: 0,
            class: 0x00ff_ffff,
            subsystem_id: 0xffff_ffff,
            command: COMMAND_DEFAULT,
            command_mask: COMMAND_MASK_DEFAULT,
            command_reset: COMMAND_DEFAULT,
            status: 0,
            status_reset: 0,
            intr_line: INTERRUPT_LINE_DEFAULT,
            intr_pin: 0,
            multifunction: false,
            banks: Vec::new(),
            bank_regs: [None; MAX_BANKS],
            bank_reg_count: 0,
            rom: None,
            rom_base: 0,
            config: vec![0; PCI_CONFIG_SPACE_SIZE],
            write_mask: vec![0; PCI_CONFIG_SPACE_SIZE],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> HeaderLayout {
        self.layout
    }

    /// Set identity registers.
    ///
    /// # Arguments
    ///
    /// * `main_id` - Vendor id in the high half, device id in the low half.
    /// * `revision` - Revision id.
    /// * `class` - 24-bit class code.
    /// * `subsystem_id` - Subsystem vendor id in the high half, subsystem id in the low half.
    pub fn set_ids(&mut self, main_id: u32, revision: u8, class: u32, subsystem_id: u32) {
        self.main_id = main_id;
        self.revision = revision;
        self.class = class & 0x00ff_ffff;
        self.subsystem_id = subsystem_id;
    }

    pub fn vendor_id(&self) -> u16 {
        (self.main_id >> 16) as u16
    }

    pub fn device_id(&self) -> u16 {
        self.main_id as u16
    }

    pub fn class_code(&self) -> u32 {
        self.class
    }

    pub fn revision(&self) -> u8 {
        self.revision
    }

    pub fn set_multifunction(&mut self, enable: bool) {
        self.multifunction = enable;
    }

    pub fn is_multifunction(&self) -> bool {
        self.multifunction
    }

    pub fn header_type(&self) -> u8 {
        let mf = if self.multifunction {
            HEADER_TYPE_MULTIFUNC
        } else {
            0
        };
        self.layout.header_type() | mf
    }

    pub fn command(&self) -> u16 {
        self.command
    }

    /// Override the writable bits of the command register.
    pub fn set_command_mask(&mut self, mask: u16) {
        self.command_mask = mask;
    }

    /// Override the command and status values restored by `reset`.
    pub fn set_reset_values(&mut self, command: u16, status: u16) {
        self.command_reset = command;
        self.status_reset = status;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn interrupt_line(&self) -> u8 {
        self.intr_line
    }

    pub fn interrupt_pin(&self) -> u8 {
        self.intr_pin
    }

    pub fn set_interrupt_pin(&mut self, pin: u8) {
        self.intr_pin = pin;
    }

    /// Restore command and status defaults.
    pub fn reset(&mut self) {
        self.command = self.command_reset;
        self.status = self.status_reset;
    }

    /// Declare a bank and link it to the next free base address register
    /// slot, or the next two for a 64-bit bank. Banks start at address 0.
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the window, a multiple of 4.
    /// * `flags` - Type of the bank.
    /// * `mapper` - Handlers of the window.
    pub fn declare_bank(
        &mut self,
        size: u64,
        flags: BankFlags,
        mapper: BankMapper,
    ) -> Result<usize> {
        if self.banks.len() >= MAX_BANKS {
            return Err(anyhow!(PciError::BankOverflow(
                self.name.clone(),
                self.banks.len()
            )));
        }
        if size & 3 != 0 {
            return Err(anyhow!(PciError::BankSize(self.name.clone(), size)));
        }
        let slots = if flags.contains(BankFlags::SIXTY_FOUR) {
            2
        } else {
            1
        };
        if self.bank_reg_count + slots > MAX_BANKS {
            return Err(anyhow!(PciError::RegisterSlots(
                self.name.clone(),
                self.bank_reg_count
            )));
        }

        let id = self.banks.len();
        for i in 0..slots {
            self.bank_regs[self.bank_reg_count + i] = Some(BankReg {
                bank: id,
                high: i == 1,
            });
        }
        self.bank_reg_count += slots;
        debug!(
            "Device {} has 0x{:x} bytes of {} named {}",
            self.name,
            size,
            if flags.contains(BankFlags::IO) {
                "io"
            } else {
                "memory"
            },
            mapper.name
        );
        self.banks.push(Bank {
            address: 0,
            size,
            flags,
            mapper,
        });
        Ok(id)
    }

    /// Leave `count` base address register slots unlinked.
    pub fn skip_bank_regs(&mut self, count: usize) -> Result<()> {
        if self.bank_reg_count + count > MAX_BANKS {
            return Err(anyhow!(PciError::RegisterSlots(
                self.name.clone(),
                self.bank_reg_count
            )));
        }
        self.bank_reg_count += count;
        Ok(())
    }

    pub fn banks(&self) -> &[Bank] {
        &self.banks
    }

    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    pub fn bank_reg_count(&self) -> usize {
        self.bank_reg_count
    }

    fn bank_mut(&mut self, id: usize) -> Result<&mut Bank> {
        let name = self.name.clone();
        self.banks
            .get_mut(id)
            .ok_or_else(|| anyhow!(PciError::InvalidBank(name, id)))
    }

    pub fn set_bank_address(&mut self, id: usize, address: u64) -> Result<()> {
        self.bank_mut(id)?.address = address;
        Ok(())
    }

    pub fn set_bank_size(&mut self, id: usize, size: u64) -> Result<()> {
        self.bank_mut(id)?.size = size;
        Ok(())
    }

    pub fn set_bank_flags(&mut self, id: usize, flags: BankFlags) -> Result<()> {
        self.bank_mut(id)?.flags = flags;
        Ok(())
    }

    /// Value of base address register `slot`.
    ///
    /// Unlinked slots read 0. The high slot of a 64-bit bank returns the high
    /// half of the address with no flag bits.
    pub fn read_bank_reg(&self, slot: usize) -> u32 {
        let reg = match self.bank_regs.get(slot).copied().flatten() {
            Some(reg) => reg,
            None => return 0,
        };
        let bank = &self.banks[reg.bank];
        if reg.high {
            return read_u32(bank.address, 1);
        }
        bank.aligned_address() as u32 | bank.flags.bar_bits()
    }

    /// Write base address register `slot`.
    ///
    /// Returns true if the slot is linked to a bank, in which case the
    /// mapping must be regenerated.
    pub fn write_bank_reg(&mut self, slot: usize, value: u32, mask: u32) -> bool {
        let reg = match self.bank_regs.get(slot).copied().flatten() {
            Some(reg) => reg,
            None => {
                debug!(
                    "{}: write to address base ({}, {:08x}) not linked to any bank",
                    self.name, slot, value
                );
                return false;
            }
        };
        let bank = &mut self.banks[reg.bank];
        if reg.high {
            let high = combine_u32(read_u32(bank.address, 1), value, mask);
            bank.address = write_u64_high(bank.address, high);
        } else {
            let low = combine_u32(read_u32(bank.address, 0), value, mask);
            bank.address = write_u64_low(bank.address, low);
        }
        debug!(
            "{}: bank {} address = {:x}",
            self.name, reg.bank, bank.address
        );
        true
    }

    /// Attach an expansion ROM image, its size is the image length.
    pub fn declare_expansion_rom(&mut self, image: Arc<[u8]>) {
        debug!(
            "Device {} has 0x{:x} bytes of expansion rom",
            self.name,
            image.len()
        );
        self.rom = Some(image);
        self.rom_base = 0;
    }

    pub fn expansion_rom(&self) -> Option<&Arc<[u8]>> {
        self.rom.as_ref()
    }

    pub fn expansion_rom_size(&self) -> u32 {
        self.rom.as_ref().map_or(0, |rom| rom.len() as u32)
    }

    pub fn expansion_rom_base(&self) -> u32 {
        self.rom_base
    }

    /// Write the expansion ROM base register.
    ///
    /// Without a ROM the register stays 0. Otherwise the address resolution
    /// follows the ROM size with a minimal granularity of 0x800, and the
    /// enable bit is kept.
    pub fn write_expansion_rom_base(&mut self, value: u32, mask: u32) {
        let mut base = combine_u32(self.rom_base, value, mask);
        let size = self.expansion_rom_size();
        if size == 0 {
            base = 0;
        } else {
            base &= 0xffff_f801 & 1_u32.wrapping_sub(size);
        }
        self.rom_base = base;
        debug!("{}: expansion rom base = {:08x}", self.name, base);
    }

    /// Read a standard field, None if the field does not belong to the
    /// register file.
    pub fn read_field(&self, field: ConfigField) -> Option<u32> {
        let value = match field {
            ConfigField::VendorId => u32::from(self.vendor_id()),
            ConfigField::DeviceId => u32::from(self.device_id()),
            ConfigField::Command => u32::from(self.command),
            ConfigField::Status => u32::from(self.status),
            ConfigField::ClassRevision => (self.class << 8) | u32::from(self.revision),
            ConfigField::CacheLineSize
            | ConfigField::LatencyTimer
            | ConfigField::Bist
            | ConfigField::CapabilityPointer => 0,
            ConfigField::HeaderType => u32::from(self.header_type()),
            ConfigField::BaseAddress(slot) => self.read_bank_reg(slot),
            ConfigField::SubsystemVendorId => self.subsystem_id >> 16,
            ConfigField::SubsystemId => self.subsystem_id & 0xffff,
            ConfigField::ExpansionRom => self.rom_base,
            ConfigField::InterruptLine => u32::from(self.intr_line),
            ConfigField::InterruptPin => u32::from(self.intr_pin),
            _ => return None,
        };
        Some(value)
    }

    /// Write a standard field, None if the field does not belong to the
    /// register file. `Some(true)` asks for the mapping to be regenerated.
    ///
    /// # Arguments
    ///
    /// * `field` - The field to write.
    /// * `value` - Value aligned to the start of the field.
    /// * `mask` - Bits of `value` to write.
    pub fn write_field(&mut self, field: ConfigField, value: u32, mask: u32) -> Option<bool> {
        let remap = match field {
            ConfigField::Command => {
                let old = self.command;
                let mask = mask & u32::from(self.command_mask);
                self.command = combine_u32(u32::from(old), value, mask) as u16;
                debug!("{}: command = {:04x}", self.name, self.command);
                (old ^ self.command) & (COMMAND_IO_SPACE | COMMAND_MEMORY_SPACE) != 0
            }
            ConfigField::BaseAddress(slot) => self.write_bank_reg(slot, value, mask),
            ConfigField::ExpansionRom => {
                self.write_expansion_rom_base(value, mask);
                true
            }
            ConfigField::InterruptLine => {
                self.intr_line = combine_u32(u32::from(self.intr_line), value, mask) as u8;
                debug!("{}: interrupt_line_w {:02x}", self.name, self.intr_line);
                false
            }
            ConfigField::InterruptPin => {
                self.intr_pin = combine_u32(u32::from(self.intr_pin), value, mask) as u8;
                debug!("{}: interrupt_pin_w {:02x}", self.name, self.intr_pin);
                false
            }
            ConfigField::VendorId
            | ConfigField::DeviceId
            | ConfigField::Status
            | ConfigField::ClassRevision
            | ConfigField::CacheLineSize
            | ConfigField::LatencyTimer
            | ConfigField::HeaderType
            | ConfigField::Bist
            | ConfigField::SubsystemVendorId
            | ConfigField::SubsystemId
            | ConfigField::CapabilityPointer => {
                debug!(
                    "{}: ignored write {:08x} & {:08x} to read-only {:?}",
                    self.name, value, mask, field
                );
                false
            }
            _ => return None,
        };
        Some(remap)
    }

    /// Preset a register outside the standard header.
    ///
    /// # Arguments
    ///
    /// * `offset` - Offset of the dword, below 256.
    /// * `value` - Reset value.
    /// * `writable` - Bits the guest may change.
    pub fn init_dword(&mut self, offset: usize, value: u32, writable: u32) -> Result<()> {
        le_write_u32(&mut self.config, offset, value)?;
        le_write_u32(&mut self.write_mask, offset, writable)?;
        Ok(())
    }

    /// Read a dword of the backing bytes.
    pub fn read_dword(&self, offset: usize) -> Result<u32> {
        le_read_u32(&self.config, offset)
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        self.config.get(offset).copied().unwrap_or(0)
    }

    /// Write one backing byte through the writable mask.
    pub fn write_byte(&mut self, offset: usize, value: u8) {
        if offset >= PCI_CONFIG_SPACE_SIZE {
            return;
        }
        let writable = self.write_mask[offset];
        if writable == 0 {
            debug!(
                "{}: unmapped config write {:02x} at {:02x}",
                self.name, value, offset
            );
            return;
        }
        self.config[offset] = (self.config[offset] & !writable) | (value & writable);
    }
}
