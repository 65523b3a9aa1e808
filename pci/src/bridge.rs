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

use std::sync::{Arc, Mutex};

use address_space::{AddressRange, AddressSpace, GuestAddress, Region, RegionOps};
use anyhow::{anyhow, Result};
use log::{debug, warn};
use util::num_ops::{combine_u32, mask_runs};

use crate::config::{ConfigField, PCI_CONFIG_WINDOW_SIZE};
use crate::function::{MappingContext, PciFunction, RemapHandle};
use crate::topology::{FunctionId, PciTopology};
use crate::{format_bdf, PciError, DEVFN_MAX};

/// Size of the private config space of a bridge, 4 KiB per devfn.
pub const BRIDGE_CONFIG_SPACE_SIZE: u64 = 1 << 20;

/// Bridge side of a PCI-PCI bridge or host bridge: bus numbers, window
/// registers, the table of functions on the secondary bus and the config
/// space they are mapped in.
pub struct BridgeState {
    primary_bus: u8,
    secondary_bus: u8,
    subordinate_bus: u8,
    iobase: u8,
    iolimit: u8,
    memory_base: u16,
    memory_limit: u16,
    prefetch_base: u16,
    prefetch_limit: u16,
    prefetch_baseu: u32,
    prefetch_limitu: u32,
    iobaseu: u16,
    iolimitu: u16,
    bridge_control: u16,
    /// Function at each devfn of the secondary bus.
    sub_devices: Vec<Option<FunctionId>>,
    /// Present functions in ascending devfn order.
    all_devices: Vec<FunctionId>,
    /// Present bridges other than this one, in ascending devfn order.
    all_bridges: Vec<FunctionId>,
    config_space: Arc<AddressSpace>,
}

impl BridgeState {
    pub fn new(name: &str) -> Self {
        BridgeState {
            primary_bus: 0,
            secondary_bus: 0,
            subordinate_bus: 0,
            iobase: 0,
            iolimit: 0,
            memory_base: 0,
            memory_limit: 0,
            prefetch_base: 0,
            prefetch_limit: 0,
            prefetch_baseu: 0,
            prefetch_limitu: 0,
            iobaseu: 0,
            iolimitu: 0,
            bridge_control: 0,
            sub_devices: vec![None; DEVFN_MAX],
            all_devices: Vec::new(),
            all_bridges: Vec::new(),
            config_space: AddressSpace::new(&format!("{} config", name), BRIDGE_CONFIG_SPACE_SIZE),
        }
    }

    pub fn primary_bus(&self) -> u8 {
        self.primary_bus
    }

    pub fn secondary_bus(&self) -> u8 {
        self.secondary_bus
    }

    pub fn subordinate_bus(&self) -> u8 {
        self.subordinate_bus
    }

    pub fn bridge_control(&self) -> u16 {
        self.bridge_control
    }

    /// Whether `bus` sits below the secondary bus of this bridge.
    pub fn forwards(&self, bus: u8) -> bool {
        bus > self.secondary_bus && bus <= self.subordinate_bus
    }

    pub fn sub_device(&self, devfn: u8) -> Option<FunctionId> {
        self.sub_devices[devfn as usize]
    }

    pub fn all_devices(&self) -> &[FunctionId] {
        &self.all_devices
    }

    pub fn all_bridges(&self) -> &[FunctionId] {
        &self.all_bridges
    }

    pub fn config_space(&self) -> &Arc<AddressSpace> {
        &self.config_space
    }

    /// Clear bus numbers and bridge control.
    pub fn reset(&mut self) {
        self.primary_bus = 0;
        self.secondary_bus = 0;
        self.subordinate_bus = 0;
        self.bridge_control = 0;
    }

    /// Clear the forwarding window registers.
    pub fn reset_windows(&mut self) {
        self.iobase = 0;
        self.iolimit = 0;
        self.memory_base = 0;
        self.memory_limit = 0;
        self.prefetch_base = 0;
        self.prefetch_limit = 0;
        self.prefetch_baseu = 0;
        self.prefetch_limitu = 0;
        self.iobaseu = 0;
        self.iolimitu = 0;
    }

    /// Read a type 1 field, None for fields held by the register file.
    pub fn read_field(&self, field: ConfigField) -> Option<u32> {
        let value = match field {
            ConfigField::BridgeBaseAddress(i) => {
                debug!("b_address_base_r {}", i);
                0xffff_ffff
            }
            ConfigField::PrimaryBus => u32::from(self.primary_bus),
            ConfigField::SecondaryBus => u32::from(self.secondary_bus),
            ConfigField::SubordinateBus => u32::from(self.subordinate_bus),
            ConfigField::SecondaryLatency => 0xff,
            ConfigField::IoBase => u32::from(self.iobase),
            ConfigField::IoLimit => u32::from(self.iolimit),
            ConfigField::SecondaryStatus => 0xffff,
            ConfigField::MemoryBase => u32::from(self.memory_base),
            ConfigField::MemoryLimit => u32::from(self.memory_limit),
            ConfigField::PrefetchBase => u32::from(self.prefetch_base),
            ConfigField::PrefetchLimit => u32::from(self.prefetch_limit),
            ConfigField::PrefetchBaseUpper => self.prefetch_baseu,
            ConfigField::PrefetchLimitUpper => self.prefetch_limitu,
            ConfigField::IoBaseUpper => u32::from(self.iobaseu),
            ConfigField::IoLimitUpper => u32::from(self.iolimitu),
            ConfigField::BridgeControl => u32::from(self.bridge_control),
            _ => return None,
        };
        Some(value)
    }

    /// Write a type 1 field. The registers are stored and logged, forwarding
    /// windows are not decoded so the mapping never needs regenerating.
    pub fn write_field(
        &mut self,
        name: &str,
        field: ConfigField,
        value: u32,
        mask: u32,
    ) -> Option<bool> {
        macro_rules! store {
            ($reg: expr, $ty: ty) => {{
                $reg = combine_u32(u32::from($reg), value, mask) as $ty;
                debug!("{}: {:?} = {:x}", name, field, $reg);
            }};
        }

        match field {
            ConfigField::BridgeBaseAddress(i) => {
                debug!("{}: b_address_base_w {}, {:08x}", name, i, value);
            }
            ConfigField::PrimaryBus => store!(self.primary_bus, u8),
            ConfigField::SecondaryBus => store!(self.secondary_bus, u8),
            ConfigField::SubordinateBus => store!(self.subordinate_bus, u8),
            ConfigField::SecondaryLatency => {
                debug!("{}: secondary_latency_w {:02x}", name, value);
            }
            ConfigField::IoBase => store!(self.iobase, u8),
            ConfigField::IoLimit => store!(self.iolimit, u8),
            ConfigField::SecondaryStatus => {
                debug!("{}: secondary_status_w {:04x}", name, value);
            }
            ConfigField::MemoryBase => store!(self.memory_base, u16),
            ConfigField::MemoryLimit => store!(self.memory_limit, u16),
            ConfigField::PrefetchBase => store!(self.prefetch_base, u16),
            ConfigField::PrefetchLimit => store!(self.prefetch_limit, u16),
            ConfigField::PrefetchBaseUpper => {
                self.prefetch_baseu = combine_u32(self.prefetch_baseu, value, mask);
                debug!("{}: {:?} = {:x}", name, field, self.prefetch_baseu);
            }
            ConfigField::PrefetchLimitUpper => {
                self.prefetch_limitu = combine_u32(self.prefetch_limitu, value, mask);
                debug!("{}: {:?} = {:x}", name, field, self.prefetch_limitu);
            }
            ConfigField::IoBaseUpper => store!(self.iobaseu, u16),
            ConfigField::IoLimitUpper => store!(self.iolimitu, u16),
            ConfigField::BridgeControl => store!(self.bridge_control, u16),
            _ => return None,
        }
        Some(false)
    }
}

/// Config window of one function inside a bridge config space.
fn config_window_ops(function: &Arc<Mutex<PciFunction>>) -> RegionOps {
    let read_fn = Arc::downgrade(function);
    let write_fn = Arc::downgrade(function);

    let read = move |data: &mut [u8], _base: GuestAddress, offset: u64| -> bool {
        match read_fn.upgrade() {
            Some(function) => {
                function.lock().unwrap().read_config(offset as usize, data);
                true
            }
            None => false,
        }
    };
    let write = move |data: &[u8], _base: GuestAddress, offset: u64| -> bool {
        match write_fn.upgrade() {
            Some(function) => {
                function.lock().unwrap().write_config(offset as usize, data);
                true
            }
            None => false,
        }
    };

    RegionOps {
        read: Arc::new(read),
        write: Arc::new(write),
    }
}

impl PciTopology {
    fn with_bridge<R, F>(&self, id: FunctionId, f: F) -> Result<R>
    where
        F: FnOnce(&mut BridgeState) -> R,
    {
        let function = self.function(id)?;
        let mut locked = function.lock().unwrap();
        let name = locked.name().to_string();
        match locked.bridge_mut() {
            Some(bridge) => Ok(f(bridge)),
            None => Err(anyhow!(PciError::NotBridge(name))),
        }
    }

    /// Build the child table of `bridge` from the functions registered on its
    /// secondary bus. Function 0 of every slot holding more than one function
    /// is flagged multifunction.
    pub fn discover_children(&self, bridge: FunctionId) -> Result<()> {
        let mut sub_devices: Vec<Option<FunctionId>> = vec![None; DEVFN_MAX];
        for (devfn, id) in self.children_of(bridge) {
            sub_devices[devfn as usize] = Some(id);
        }

        let mut all_devices = Vec::new();
        let mut all_bridges = Vec::new();
        for devfn in 0..DEVFN_MAX {
            let id = match sub_devices[devfn] {
                Some(id) => id,
                None => continue,
            };
            if devfn & 7 != 0 {
                if let Some(first) = sub_devices[devfn & !7] {
                    self.function(first)?.lock().unwrap().set_multifunction(true);
                }
            }
            all_devices.push(id);
            if id != bridge && self.is_bridge(id)? {
                all_bridges.push(id);
            }
        }

        debug!(
            "{}: {} functions, {} bridges",
            self.tag(bridge).unwrap_or("?"),
            all_devices.len(),
            all_bridges.len()
        );
        self.with_bridge(bridge, |b| {
            b.sub_devices = sub_devices;
            b.all_devices = all_devices;
            b.all_bridges = all_bridges;
        })
    }

    /// Hand `remap` to `bridge` and every function below it.
    pub fn set_remap_handle(&self, bridge: FunctionId, remap: &RemapHandle) -> Result<()> {
        self.function(bridge)?
            .lock()
            .unwrap()
            .set_remap_handle(remap.clone());
        let devices = self.with_bridge(bridge, |b| b.all_devices.clone())?;
        for id in devices {
            if id == bridge {
                continue;
            }
            if self.is_bridge(id)? {
                self.set_remap_handle(id, remap)?;
            } else {
                self.function(id)?
                    .lock()
                    .unwrap()
                    .set_remap_handle(remap.clone());
            }
        }
        Ok(())
    }

    /// Rebuild the config space of `bridge`: every present function gets a
    /// 4 KiB window at `devfn << 12`.
    pub fn config_space_map(&self, bridge: FunctionId) -> Result<()> {
        let (space, children) = self.with_bridge(bridge, |b| {
            let children: Vec<(u8, FunctionId)> = b
                .sub_devices
                .iter()
                .enumerate()
                .filter_map(|(devfn, id)| id.map(|id| (devfn as u8, id)))
                .collect();
            (b.config_space.clone(), children)
        })?;

        space.unmap(AddressRange::new(GuestAddress(0), BRIDGE_CONFIG_SPACE_SIZE))?;
        for (devfn, id) in children {
            let function = self.function(id)?;
            let range = AddressRange::new(
                GuestAddress(u64::from(devfn) << 12),
                PCI_CONFIG_WINDOW_SIZE,
            );
            let name = format!("{} config", self.tag(id).unwrap_or("?"));
            space.install(
                range,
                Region::init_io_region(PCI_CONFIG_WINDOW_SIZE, config_window_ops(&function), &name),
            )?;
        }
        Ok(())
    }

    /// Config read on bus `bus` as seen from `bridge`.
    pub fn config_read(
        &self,
        bridge: FunctionId,
        bus: u8,
        devfn: u8,
        reg: u16,
        mask: u32,
    ) -> Result<u32> {
        let (secondary, forwards) =
            self.with_bridge(bridge, |b| (b.secondary_bus, b.forwards(bus)))?;
        if bus == secondary {
            return self.do_config_read(bridge, bus, devfn, reg, mask);
        }
        if forwards {
            return self.propagate_config_read(bridge, bus, devfn, reg, mask);
        }
        Ok(0xffff_ffff)
    }

    /// Config write on bus `bus` as seen from `bridge`.
    pub fn config_write(
        &self,
        bridge: FunctionId,
        bus: u8,
        devfn: u8,
        reg: u16,
        data: u32,
        mask: u32,
    ) -> Result<()> {
        let (secondary, forwards) =
            self.with_bridge(bridge, |b| (b.secondary_bus, b.forwards(bus)))?;
        if bus == secondary {
            self.do_config_write(bridge, bus, devfn, reg, data, mask)
        } else if forwards {
            self.propagate_config_write(bridge, bus, devfn, reg, data, mask)
        } else {
            Ok(())
        }
    }

    /// Read the dword at `reg` of `devfn` on the secondary bus. Lanes outside
    /// `mask` and absent functions read all-ones.
    pub fn do_config_read(
        &self,
        bridge: FunctionId,
        bus: u8,
        devfn: u8,
        reg: u16,
        mask: u32,
    ) -> Result<u32> {
        let (space, present) =
            self.with_bridge(bridge, |b| (b.config_space.clone(), b.sub_device(devfn).is_some()))?;
        if !present {
            return Ok(0xffff_ffff);
        }

        let base = (u64::from(devfn) << 12) | u64::from(reg & 0xffc);
        let mut bytes = [0xff_u8; 4];
        for (start, len) in mask_runs(mask) {
            let piece = &mut bytes[start..start + len];
            if let Err(e) = space.read(piece, GuestAddress(base + start as u64)) {
                warn!("config_read {} {:02x}: {:?}", format_bdf(bus, devfn), reg, e);
            }
        }
        let data = u32::from_le_bytes(bytes);
        debug!(
            "config_read {}:{:02x} {:08x} @ {:08x}",
            format_bdf(bus, devfn),
            reg,
            data,
            mask
        );
        Ok(data)
    }

    /// Write the lanes of `data` selected by `mask` to the dword at `reg` of
    /// `devfn` on the secondary bus. Absent functions drop the write.
    pub fn do_config_write(
        &self,
        bridge: FunctionId,
        bus: u8,
        devfn: u8,
        reg: u16,
        data: u32,
        mask: u32,
    ) -> Result<()> {
        let (space, present) =
            self.with_bridge(bridge, |b| (b.config_space.clone(), b.sub_device(devfn).is_some()))?;
        if !present {
            return Ok(());
        }

        let base = (u64::from(devfn) << 12) | u64::from(reg & 0xffc);
        let bytes = data.to_le_bytes();
        for (start, len) in mask_runs(mask) {
            space.write(&bytes[start..start + len], GuestAddress(base + start as u64))?;
        }
        debug!(
            "config_write {}:{:02x} {:08x} @ {:08x}",
            format_bdf(bus, devfn),
            reg,
            data,
            mask
        );
        Ok(())
    }

    /// AND of the reads of every child bridge.
    pub fn propagate_config_read(
        &self,
        bridge: FunctionId,
        bus: u8,
        devfn: u8,
        reg: u16,
        mask: u32,
    ) -> Result<u32> {
        let bridges = self.with_bridge(bridge, |b| b.all_bridges.clone())?;
        let mut data = 0xffff_ffff;
        for child in bridges {
            data &= self.config_read(child, bus, devfn, reg, mask)?;
        }
        Ok(data)
    }

    /// Send the write to every child bridge.
    pub fn propagate_config_write(
        &self,
        bridge: FunctionId,
        bus: u8,
        devfn: u8,
        reg: u16,
        data: u32,
        mask: u32,
    ) -> Result<()> {
        let bridges = self.with_bridge(bridge, |b| b.all_bridges.clone())?;
        for child in bridges {
            self.config_write(child, bus, devfn, reg, data, mask)?;
        }
        Ok(())
    }

    fn collect_mapping_order(&self, bridge: FunctionId, order: &mut Vec<FunctionId>) -> Result<()> {
        let devices = self.with_bridge(bridge, |b| b.all_devices.clone())?;
        for id in devices.into_iter().rev() {
            if id == bridge {
                continue;
            }
            if self.is_bridge(id)? {
                self.collect_mapping_order(id, order)?;
            }
            order.push(id);
        }
        Ok(())
    }

    /// Install the decode windows of every function below `bridge`.
    ///
    /// Functions are visited in reverse devfn order, nested bridges after
    /// their own children. Functions flagged `map_first` go in a first pass,
    /// the rest in a second one, so later installs shadow them.
    pub fn map_subtree(&self, bridge: FunctionId, ctx: &MappingContext) -> Result<()> {
        let mut order = Vec::new();
        self.collect_mapping_order(bridge, &mut order)?;
        for first_pass in [true, false] {
            for id in order.iter() {
                let function = self.function(*id)?;
                let mut locked = function.lock().unwrap();
                if locked.map_first() == first_pass {
                    locked.compute_decode_windows(ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Map the subtree of `bridge`, then its own extra windows.
    pub fn compute_decode_windows(&self, bridge: FunctionId, ctx: &MappingContext) -> Result<()> {
        self.map_subtree(bridge, ctx)?;
        self.function(bridge)?.lock().unwrap().map_extra(ctx)
    }

    /// Clear the window registers of `bridge` and of every bridge below it.
    pub fn reset_all_mappings(&self, bridge: FunctionId) -> Result<()> {
        let devices = self.with_bridge(bridge, |b| {
            b.reset_windows();
            b.all_devices.clone()
        })?;
        for id in devices {
            if id != bridge && self.is_bridge(id)? {
                self.reset_all_mappings(id)?;
            }
        }
        Ok(())
    }

    /// Reset `bridge`: command and status, bus numbers and bridge control,
    /// then rebuild its config space.
    pub fn reset_bridge(&self, bridge: FunctionId) -> Result<()> {
        self.function(bridge)?.lock().unwrap().reset();
        self.config_space_map(bridge)
    }
}
