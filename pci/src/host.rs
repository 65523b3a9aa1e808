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

use std::sync::{Arc, Mutex, Weak};

use address_space::{AddressRange, AddressSpace, GuestAddress, Region, RegionOps};
use anyhow::{anyhow, Context, Result};
use log::{error, info};
use util::num_ops::{combine_u32, lane_mask};

use crate::function::{DecodeWindow, MappingContext, PciFunction, RemapHandle};
use crate::topology::{FunctionId, PciTopology};
use crate::{le_read_u32, le_write_u32, PciError};

const CONFIG_ADDRESS_ENABLE_MASK: u32 = 0x8000_0000;
const PIO_BUS_SHIFT: u32 = 16;
const PIO_DEVFN_SHIFT: u32 = 8;
const PIO_OFFSET_MASK: u32 = 0xfc;
const CONFIG_BUS_MASK: u32 = 0xff;
const CONFIG_DEVFN_MASK: u32 = 0xff;
const ECAM_BUS_SHIFT: u32 = 20;
const ECAM_DEVFN_SHIFT: u32 = 12;
const ECAM_OFFSET_MASK: u64 = 0xfff;
/// Size of each of the config address and config data port blocks.
const PIO_PORT_SIZE: u64 = 4;

/// Decode windows of the host bridge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostWindows {
    pub memory: DecodeWindow,
    pub io: DecodeWindow,
}

/// PCI host bridge: owns the root bus, the config address latch and the
/// decode windows every function of the hierarchy is mapped in.
pub struct PciHost {
    topology: PciTopology,
    root: FunctionId,
    memory_space: Arc<AddressSpace>,
    io_space: Arc<AddressSpace>,
    windows: HostWindows,
    config_address: u32,
    remap: RemapHandle,
    /// Base of the config address port, the data port follows it.
    legacy_ports: Option<u64>,
    /// Base address and length of the ECAM window.
    ecam_range: Option<(u64, u64)>,
    self_ref: Weak<Mutex<PciHost>>,
}

impl PciHost {
    /// Construct PCI host.
    ///
    /// # Arguments
    ///
    /// * `topology` - Functions of the hierarchy.
    /// * `root` - Function owning the root bus, must carry bridge state.
    /// * `memory_space` - Memory space the host bridge maps.
    /// * `io_space` - IO space the host bridge maps.
    /// * `windows` - Memory and IO decode windows.
    pub fn create(
        topology: PciTopology,
        root: FunctionId,
        memory_space: &Arc<AddressSpace>,
        io_space: &Arc<AddressSpace>,
        windows: HostWindows,
    ) -> Result<Arc<Mutex<PciHost>>> {
        if !topology.is_bridge(root)? {
            return Err(anyhow!(PciError::NotBridge(
                topology.tag(root).unwrap_or_default().to_string()
            )));
        }
        Ok(Arc::new_cyclic(|self_ref| {
            Mutex::new(PciHost {
                topology,
                root,
                memory_space: memory_space.clone(),
                io_space: io_space.clone(),
                windows,
                config_address: 0,
                remap: RemapHandle::new(),
                legacy_ports: None,
                ecam_range: None,
                self_ref: self_ref.clone(),
            })
        }))
    }

    pub fn topology(&self) -> &PciTopology {
        &self.topology
    }

    pub fn root(&self) -> FunctionId {
        self.root
    }

    pub fn memory_space(&self) -> &Arc<AddressSpace> {
        &self.memory_space
    }

    pub fn io_space(&self) -> &Arc<AddressSpace> {
        &self.io_space
    }

    pub fn windows(&self) -> HostWindows {
        self.windows
    }

    /// Change the decode windows, effective on the next regeneration.
    pub fn set_windows(&mut self, windows: HostWindows) {
        self.windows = windows;
        self.remap.invalidate();
    }

    /// Answer config address/data ports at `base` and `base + 4` of the IO space.
    pub fn set_legacy_ports(&mut self, base: Option<u64>) {
        self.legacy_ports = base;
        self.remap.invalidate();
    }

    /// Answer ECAM accesses in the memory space.
    pub fn set_ecam_range(&mut self, range: Option<(u64, u64)>) {
        self.ecam_range = range;
        self.remap.invalidate();
    }

    /// Build the child tables of every bridge and link the hierarchy to the
    /// remap handle of this host.
    pub fn realize(&mut self) -> Result<()> {
        let bridges = self.topology.bridges();
        for bridge in bridges.iter() {
            self.topology.discover_children(*bridge)?;
        }
        self.topology.set_remap_handle(self.root, &self.remap)?;
        self.topology.reset_all_mappings(self.root)?;
        for bridge in bridges {
            self.topology.config_space_map(bridge)?;
        }
        info!(
            "PCI host {} realized with {} functions",
            self.topology.tag(self.root).unwrap_or_default(),
            self.topology.len()
        );
        Ok(())
    }

    /// Reset every function, clear the bridge windows and the config address
    /// latch, then rebuild the mapping.
    pub fn reset(&mut self) -> Result<()> {
        let ids: Vec<FunctionId> = self.topology.ids().collect();
        for id in ids {
            if self.topology.is_bridge(id)? {
                self.topology
                    .reset_bridge(id)
                    .with_context(|| format!("Failed to reset {:?}", self.topology.tag(id)))?;
            } else {
                self.topology.function(id)?.lock().unwrap().reset();
            }
        }
        self.topology.reset_all_mappings(self.root)?;
        self.config_address = 0;
        self.remap.take_pending();
        self.regenerate_mapping()
    }

    fn map_host_ports(&self) -> Result<()> {
        if let Some(base) = self.legacy_ports {
            let addr_region = Region::init_io_region(
                PIO_PORT_SIZE,
                Self::pio_addr_ops(self.self_ref.clone()),
                "PCI config address",
            );
            self.io_space
                .install(AddressRange::new(GuestAddress(base), PIO_PORT_SIZE), addr_region)
                .with_context(|| "Failed to map PCI config address port")?;
            let data_region = Region::init_io_region(
                PIO_PORT_SIZE,
                Self::pio_data_ops(self.self_ref.clone()),
                "PCI config data",
            );
            self.io_space
                .install(
                    AddressRange::new(GuestAddress(base + PIO_PORT_SIZE), PIO_PORT_SIZE),
                    data_region,
                )
                .with_context(|| "Failed to map PCI config data port")?;
        }
        if let Some((base, size)) = self.ecam_range {
            let region = Region::init_io_region(
                size,
                Self::mmconfig_ops(self.self_ref.clone()),
                "PCI ECAM",
            );
            self.memory_space
                .install(AddressRange::new(GuestAddress(base), size), region)
                .with_context(|| "Failed to map PCI ECAM window")?;
        }
        Ok(())
    }

    /// Unmap both decode windows and install the decode windows of every
    /// function again, then the host ports and the extra windows of the
    /// host bridge function. Bridge config spaces are rebuilt last.
    pub fn regenerate_mapping(&mut self) -> Result<()> {
        info!("Regenerating mapping");
        if let Some(range) = self.windows.memory.range() {
            self.memory_space.unmap(range)?;
        }
        if let Some(range) = self.windows.io.range() {
            self.io_space.unmap(range)?;
        }

        let ctx = MappingContext {
            memory: self.windows.memory,
            io: self.windows.io,
            memory_space: &self.memory_space,
            io_space: &self.io_space,
        };
        self.topology.map_subtree(self.root, &ctx)?;
        self.map_host_ports()?;
        self.topology
            .function(self.root)?
            .lock()
            .unwrap()
            .map_extra(&ctx)?;

        for bridge in self.topology.bridges() {
            self.topology.config_space_map(bridge)?;
        }
        Ok(())
    }

    /// Regenerate the mapping if a register write asked for it.
    pub fn flush_remap(&mut self) -> Result<()> {
        if self.remap.take_pending() {
            self.regenerate_mapping()?;
        }
        Ok(())
    }

    pub fn legacy_config_address_read(&self) -> u32 {
        self.config_address
    }

    pub fn legacy_config_address_write(&mut self, value: u32, mask: u32) {
        self.config_address = combine_u32(self.config_address, value, mask);
    }

    fn decode_config_address(&self) -> Option<(u8, u8, u16)> {
        if self.config_address & CONFIG_ADDRESS_ENABLE_MASK == 0 {
            return None;
        }
        let bus = ((self.config_address >> PIO_BUS_SHIFT) & CONFIG_BUS_MASK) as u8;
        let devfn = ((self.config_address >> PIO_DEVFN_SHIFT) & CONFIG_DEVFN_MASK) as u8;
        let reg = (self.config_address & PIO_OFFSET_MASK) as u16;
        Some((bus, devfn, reg))
    }

    /// Read the config data port, all-ones while the enable bit is clear.
    pub fn legacy_config_data_read(&self, mask: u32) -> Result<u32> {
        match self.decode_config_address() {
            Some((bus, devfn, reg)) => self.root_config_read(bus, devfn, reg, mask),
            None => Ok(0xffff_ffff),
        }
    }

    /// Write the config data port, dropped while the enable bit is clear.
    pub fn legacy_config_data_write(&mut self, value: u32, mask: u32) -> Result<()> {
        match self.decode_config_address() {
            Some((bus, devfn, reg)) => self.root_config_write(bus, devfn, reg, value, mask),
            None => Ok(()),
        }
    }

    /// Config read from the host side: bus 0 is the root bus, other buses
    /// are looked for below the root bridges.
    pub fn root_config_read(&self, bus: u8, devfn: u8, reg: u16, mask: u32) -> Result<u32> {
        if bus == 0 {
            return self.topology.do_config_read(self.root, bus, devfn, reg, mask);
        }
        self.topology
            .propagate_config_read(self.root, bus, devfn, reg, mask)
    }

    pub fn root_config_write(
        &mut self,
        bus: u8,
        devfn: u8,
        reg: u16,
        value: u32,
        mask: u32,
    ) -> Result<()> {
        if bus == 0 {
            self.topology
                .do_config_write(self.root, bus, devfn, reg, value, mask)?;
        } else {
            self.topology
                .propagate_config_write(self.root, bus, devfn, reg, value, mask)?;
        }
        self.flush_remap()
    }

    /// Run `f` on a function from the device side, then regenerate the
    /// mapping if it moved a bank.
    pub fn with_function<R, F>(&mut self, id: FunctionId, f: F) -> Result<R>
    where
        F: FnOnce(&mut PciFunction) -> R,
    {
        let ret = {
            let function = self.topology.function(id)?;
            let mut locked = function.lock().unwrap();
            f(&mut locked)
        };
        self.flush_remap()?;
        Ok(ret)
    }

    fn sub_device_of(&self, bridge: FunctionId, devfn: u8) -> Option<FunctionId> {
        let function = self.topology.function(bridge).ok()?;
        let locked = function.lock().unwrap();
        locked.bridge()?.sub_device(devfn)
    }

    fn secondary_bus_of(&self, bridge: FunctionId) -> Option<u8> {
        let function = self.topology.function(bridge).ok()?;
        let locked = function.lock().unwrap();
        locked.bridge().map(|b| b.secondary_bus())
    }

    /// Find the function answering config accesses at `bus`/`devfn`.
    pub fn find_function(&self, bus: u8, devfn: u8) -> Option<FunctionId> {
        if bus == 0 {
            return self.sub_device_of(self.root, devfn);
        }
        self.topology
            .bridges()
            .into_iter()
            .filter(|id| *id != self.root)
            .find(|id| self.secondary_bus_of(*id) == Some(bus))
            .and_then(|id| self.sub_device_of(id, devfn))
    }

    /// Build RegionOps for configuration space access by mmconfig.
    ///
    /// # Arguments
    ///
    /// * `host_bridge` - Host bridge device.
    pub fn build_mmconfig_ops(host_bridge: &Arc<Mutex<Self>>) -> RegionOps {
        Self::mmconfig_ops(Arc::downgrade(host_bridge))
    }

    fn mmconfig_ops(host_bridge: Weak<Mutex<Self>>) -> RegionOps {
        let cloned_hb = host_bridge.clone();
        let read = move |data: &mut [u8], _addr: GuestAddress, offset: u64| -> bool {
            let (bus, devfn, reg) = decode_ecam(offset);
            let lane = usize::from(reg & 3);
            let mask = match lane_mask(lane, data.len()) {
                Ok(mask) => mask,
                Err(_) => {
                    data.fill(0xff);
                    return true;
                }
            };
            let value = match cloned_hb.upgrade() {
                Some(hb) => hb.lock().unwrap().root_config_read(bus, devfn, reg & !3, mask),
                None => return false,
            };
            match value {
                Ok(value) => fill_lanes(data, lane, value),
                Err(e) => {
                    error!("Failed to read PCI config through ECAM: {:?}", e);
                    data.fill(0xff);
                }
            }
            true
        };
        let write = move |data: &[u8], _addr: GuestAddress, offset: u64| -> bool {
            let (bus, devfn, reg) = decode_ecam(offset);
            let lane = usize::from(reg & 3);
            let mask = match lane_mask(lane, data.len()) {
                Ok(mask) => mask,
                Err(_) => return true,
            };
            let hb = match host_bridge.upgrade() {
                Some(hb) => hb,
                None => return false,
            };
            let mut locked_hb = hb.lock().unwrap();
            if let Err(e) =
                locked_hb.root_config_write(bus, devfn, reg & !3, collect_lanes(data, lane), mask)
            {
                error!("Failed to write PCI config through ECAM: {:?}", e);
                return false;
            }
            true
        };
        RegionOps {
            read: Arc::new(read),
            write: Arc::new(write),
        }
    }

    /// Build RegionOps for access at 0xCF8.
    ///
    /// # Arguments
    ///
    /// * `host_bridge` - Host bridge device.
    pub fn build_pio_addr_ops(host_bridge: &Arc<Mutex<Self>>) -> RegionOps {
        Self::pio_addr_ops(Arc::downgrade(host_bridge))
    }

    fn pio_addr_ops(host_bridge: Weak<Mutex<Self>>) -> RegionOps {
        let cloned_hb = host_bridge.clone();
        let read = move |data: &mut [u8], _addr: GuestAddress, offset: u64| -> bool {
            if offset != 0 || data.len() != 4 {
                return true;
            }
            match cloned_hb.upgrade() {
                Some(hb) => {
                    le_write_u32(data, 0, hb.lock().unwrap().legacy_config_address_read()).is_ok()
                }
                None => false,
            }
        };
        let write = move |data: &[u8], _addr: GuestAddress, offset: u64| -> bool {
            if offset != 0 || data.len() != 4 {
                return true;
            }
            let value = match le_read_u32(data, 0) {
                Ok(value) => value,
                Err(_) => return false,
            };
            match host_bridge.upgrade() {
                Some(hb) => {
                    hb.lock().unwrap().legacy_config_address_write(value, u32::MAX);
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

    /// Build RegionOps for access at 0xCFC.
    ///
    /// # Arguments
    ///
    /// * `host_bridge` - Host bridge device.
    pub fn build_pio_data_ops(host_bridge: &Arc<Mutex<Self>>) -> RegionOps {
        Self::pio_data_ops(Arc::downgrade(host_bridge))
    }

    fn pio_data_ops(host_bridge: Weak<Mutex<Self>>) -> RegionOps {
        let cloned_hb = host_bridge.clone();
        let read = move |data: &mut [u8], _addr: GuestAddress, offset: u64| -> bool {
            let lane = offset as usize;
            let mask = match lane_mask(lane, data.len()) {
                Ok(mask) => mask,
                Err(_) => {
                    data.fill(0xff);
                    return true;
                }
            };
            let value = match cloned_hb.upgrade() {
                Some(hb) => hb.lock().unwrap().legacy_config_data_read(mask),
                None => return false,
            };
            match value {
                Ok(value) => fill_lanes(data, lane, value),
                Err(e) => {
                    error!("Failed to read PCI config data: {:?}", e);
                    data.fill(0xff);
                }
            }
            true
        };
        let write = move |data: &[u8], _addr: GuestAddress, offset: u64| -> bool {
            let lane = offset as usize;
            let mask = match lane_mask(lane, data.len()) {
                Ok(mask) => mask,
                Err(_) => return true,
            };
            let hb = match host_bridge.upgrade() {
                Some(hb) => hb,
                None => return false,
            };
            let mut locked_hb = hb.lock().unwrap();
            if let Err(e) = locked_hb.legacy_config_data_write(collect_lanes(data, lane), mask) {
                error!("Failed to write PCI config data: {:?}", e);
                return false;
            }
            true
        };

        RegionOps {
            read: Arc::new(read),
            write: Arc::new(write),
        }
    }
}

fn decode_ecam(offset: u64) -> (u8, u8, u16) {
    let bus = ((offset as u32 >> ECAM_BUS_SHIFT) & CONFIG_BUS_MASK) as u8;
    let devfn = ((offset as u32 >> ECAM_DEVFN_SHIFT) & CONFIG_DEVFN_MASK) as u8;
    (bus, devfn, (offset & ECAM_OFFSET_MASK) as u16)
}

fn fill_lanes(data: &mut [u8], lane: usize, value: u32) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (value >> ((lane + i) * 8)) as u8;
    }
}

fn collect_lanes(data: &[u8], lane: usize) -> u32 {
    data.iter()
        .enumerate()
        .fold(0, |acc, (i, byte)| acc | u32::from(*byte) << ((lane + i) * 8))
}

#[cfg(test)]
pub mod tests {
    use byteorder::{ByteOrder, LittleEndian};

    use super::*;
    use crate::config::{BAR_0, COMMAND, PRIMARY_BUS_NUM};
    use crate::{BankFlags, BankMapper, FunctionHooks};

    /// Bank answering reads of its first 16 bytes with the offset.
    fn counting_mapper(name: &str) -> BankMapper {
        BankMapper::new(
            name,
            RegionOps {
                read: Arc::new(|data: &mut [u8], _: GuestAddress, offset: u64| {
                    if offset >= 16 {
                        return false;
                    }
                    for (i, byte) in data.iter_mut().enumerate() {
                        *byte = offset as u8 + i as u8;
                    }
                    true
                }),
                write: Arc::new(|_: &[u8], _: GuestAddress, _: u64| true),
            },
        )
    }

    struct ShadowRam;

    impl FunctionHooks for ShadowRam {
        fn map_extra(
            &mut self,
            _regs: &crate::ConfigSpaceRegisterFile,
            ctx: &MappingContext,
        ) -> Result<()> {
            ctx.memory_space.install(
                AddressRange::new(GuestAddress(0), 0x1000),
                Region::init_ram_region(0x1000, "low ram"),
            )
        }
    }

    pub struct TestHost {
        pub host: Arc<Mutex<PciHost>>,
        pub mem: Arc<AddressSpace>,
        pub io: Arc<AddressSpace>,
        pub nic: FunctionId,
        pub bridge: FunctionId,
        pub leaf: FunctionId,
    }

    /// Host bridge at 00.0, a NIC at 02.0 with one memory and one IO bank,
    /// a bridge at 1e.0 holding one function at 02.0 of its secondary bus.
    pub fn create_pci_host() -> TestHost {
        let mem = AddressSpace::new("memory", 1 << 32);
        let io = AddressSpace::new("io", 1 << 16);

        let mut topology = PciTopology::new();
        let mut host_fn = PciFunction::new_host("host");
        host_fn.set_ids(0x8086_1237, 0x02, 0x060000, 0);
        host_fn.set_hooks(Box::new(ShadowRam));
        let root = topology.add_root("pci:00.0", host_fn).unwrap();

        let mut nic_fn = PciFunction::new("nic");
        nic_fn.set_ids(0x10ec_8139, 0x10, 0x020000, 0x10ec_8139);
        nic_fn
            .declare_bank(0x1000, BankFlags::MEMORY, counting_mapper("nic mmio"))
            .unwrap();
        nic_fn
            .declare_bank(0x100, BankFlags::IO, counting_mapper("nic io"))
            .unwrap();
        let nic = topology.attach(root, "pci:02.0", nic_fn).unwrap();

        let bridge = topology
            .attach(root, "pci:1e.0", PciFunction::new_bridge("bridge"))
            .unwrap();
        let mut leaf_fn = PciFunction::new("leaf");
        leaf_fn.set_ids(0x1af4_1000, 0, 0x020000, 0);
        let leaf = topology.attach(bridge, "pci:1e.0:02.0", leaf_fn).unwrap();

        let windows = HostWindows {
            memory: DecodeWindow::new(0, 0xffff_ffff, 0),
            io: DecodeWindow::new(0, 0xffff, 0),
        };
        let host = PciHost::create(topology, root, &mem, &io, windows).unwrap();
        {
            let mut locked = host.lock().unwrap();
            locked.set_legacy_ports(Some(0xcf8));
            locked.set_ecam_range(Some((0xe000_0000, 0x1000_0000)));
            locked.realize().unwrap();
            locked.reset().unwrap();
        }
        TestHost {
            host,
            mem,
            io,
            nic,
            bridge,
            leaf,
        }
    }

    fn io_write32(io: &AddressSpace, port: u64, value: u32) {
        io.write(&value.to_le_bytes(), GuestAddress(port)).unwrap();
    }

    fn io_read32(io: &AddressSpace, port: u64) -> u32 {
        let mut data = [0_u8; 4];
        io.read(&mut data, GuestAddress(port)).unwrap();
        u32::from_le_bytes(data)
    }

    /// None when nothing is mapped at `addr`.
    fn mem_read8(mem: &AddressSpace, addr: u64) -> Option<u8> {
        mem.find_flat_range(GuestAddress(addr))?;
        let mut data = [0_u8; 1];
        mem.read(&mut data, GuestAddress(addr)).unwrap();
        Some(data[0])
    }

    #[test]
    fn test_pio_ops() {
        let t = create_pci_host();
        let pio_addr_ops = PciHost::build_pio_addr_ops(&t.host);
        let pio_data_ops = PciHost::build_pio_data_ops(&t.host);

        let mut data = [0_u8; 4];
        let addr: u32 = CONFIG_ADDRESS_ENABLE_MASK | 0x10 << PIO_DEVFN_SHIFT;
        LittleEndian::write_u32(&mut data, addr);
        (pio_addr_ops.write)(&data, GuestAddress(0), 0);
        let mut buf = [0_u8; 4];
        (pio_addr_ops.read)(&mut buf, GuestAddress(0), 0);
        assert_eq!(buf, data);
        let mut buf = [0_u8; 4];
        (pio_data_ops.read)(&mut buf, GuestAddress(0), 0);
        assert_eq!(LittleEndian::read_u32(&buf), 0x8139_10ec);
        let mut buf = [0_u8; 2];
        (pio_data_ops.read)(&mut buf, GuestAddress(0), 2);
        assert_eq!(LittleEndian::read_u16(&buf), 0x8139);

        // Non-DWORD access on CONFIG_ADDR.
        let data = [0x12, 0x34];
        (pio_addr_ops.write)(&data, GuestAddress(0), 0);
        let data = [0x12, 0x34, 0x56, 0x78];
        (pio_addr_ops.write)(&data, GuestAddress(0), 1);
        assert_eq!(t.host.lock().unwrap().legacy_config_address_read(), addr);
        let mut buf = [0_u8; 2];
        (pio_addr_ops.read)(&mut buf, GuestAddress(0), 0);
        assert_eq!(buf, [0_u8; 2]);

        // Access crossing the data port.
        let mut buf = [0_u8; 4];
        (pio_data_ops.read)(&mut buf, GuestAddress(0), 2);
        assert_eq!(buf, [0xff_u8; 4]);

        // Enable bit of CONFIG_ADDR is not set.
        let mut data = [0_u8; 4];
        LittleEndian::write_u32(&mut data, 0x10 << PIO_DEVFN_SHIFT);
        (pio_addr_ops.write)(&data, GuestAddress(0), 0);
        let mut buf = [0_u8; 4];
        (pio_data_ops.read)(&mut buf, GuestAddress(0), 0);
        assert_eq!(buf, [0xff_u8; 4]);

        // Access non-exist device.
        LittleEndian::write_u32(&mut data, CONFIG_ADDRESS_ENABLE_MASK | 1 << PIO_DEVFN_SHIFT);
        (pio_addr_ops.write)(&data, GuestAddress(0), 0);
        let mut buf = [0_u8; 4];
        (pio_data_ops.read)(&mut buf, GuestAddress(0), 0);
        assert_eq!(buf, [0xff_u8; 4]);
    }

    #[test]
    fn test_config_cycle_through_ports() {
        let t = create_pci_host();

        // Class/revision of 00:02.0.
        io_write32(&t.io, 0xcf8, 0x8000_1008);
        assert_eq!(io_read32(&t.io, 0xcfc), 0x0200_0010);
        assert_eq!(t.host.lock().unwrap().legacy_config_address_read(), 0x8000_1008);

        // Byte read of the header type lane.
        io_write32(&t.io, 0xcf8, 0x8000_000c);
        let mut data = [0_u8; 1];
        t.io.read(&mut data, GuestAddress(0xcfe)).unwrap();
        assert_eq!(data[0], 0x00);
    }

    #[test]
    fn test_bank_decode_follows_command() {
        let t = create_pci_host();

        io_write32(&t.io, 0xcf8, 0x8000_1000 | BAR_0 as u32);
        io_write32(&t.io, 0xcfc, 0x0000_1000);
        io_write32(&t.io, 0xcf8, 0x8000_1000 | BAR_0 as u32 + 4);
        io_write32(&t.io, 0xcfc, 0x0000_2001);
        assert_eq!(io_read32(&t.io, 0xcfc), 0x0000_2001);

        // Decoding still disabled.
        assert_eq!(mem_read8(&t.mem, 0x1004), None);

        io_write32(&t.io, 0xcf8, 0x8000_1000 | COMMAND as u32);
        io_write32(&t.io, 0xcfc, 0x0000_0083);
        assert_eq!(mem_read8(&t.mem, 0x1004), Some(4));
        // Past the handled registers of the bank.
        assert_eq!(mem_read8(&t.mem, 0x1800), Some(0xff));
        let mut data = [0_u8; 2];
        t.io.read(&mut data, GuestAddress(0x2002)).unwrap();
        assert_eq!(data, [2, 3]);

        io_write32(&t.io, 0xcfc, 0x0000_0081);
        assert_eq!(mem_read8(&t.mem, 0x1004), None);
        t.io.read(&mut data, GuestAddress(0x2002)).unwrap();
        assert_eq!(data, [2, 3]);

        // Host bridge extra mapping survives every regeneration.
        assert!(t.mem.write(&[0x5a], GuestAddress(0x10)).is_ok());
        assert_eq!(mem_read8(&t.mem, 0x10), Some(0x5a));
    }

    #[test]
    fn test_regenerate_idempotent() {
        let t = create_pci_host();
        t.host
            .lock()
            .unwrap()
            .with_function(t.nic, |f| {
                f.write_config(BAR_0, &[0x00, 0x00, 0x00, 0xd0]);
                f.write_config(COMMAND, &[0x83, 0x00]);
            })
            .unwrap();
        let first = t.mem.flat_ranges();
        let first_io = t.io.flat_ranges();
        assert!(first
            .iter()
            .any(|fr| fr.addr_range.base.raw_value() == 0xd000_0000));

        t.host.lock().unwrap().regenerate_mapping().unwrap();
        assert_eq!(t.mem.flat_ranges(), first);
        assert_eq!(t.io.flat_ranges(), first_io);
    }

    #[test]
    fn test_bridge_forwarding_through_ecam() {
        let t = create_pci_host();
        let ecam = |bus: u64, devfn: u64, reg: u64| 0xe000_0000 + (bus << 20 | devfn << 12 | reg);

        // Bus 1 is not behind any bridge yet.
        let mut data = [0_u8; 4];
        t.mem.read(&mut data, GuestAddress(ecam(1, 0x10, 0))).unwrap();
        assert_eq!(data, [0xff; 4]);

        t.mem
            .write(&[0x00, 0x01, 0x01], GuestAddress(ecam(0, 0xf0, PRIMARY_BUS_NUM as u64)))
            .unwrap();
        t.mem.read(&mut data, GuestAddress(ecam(1, 0x10, 0))).unwrap();
        assert_eq!(LittleEndian::read_u32(&data), 0x1000_1af4);
        // Other devfn and a bus past the subordinate one.
        t.mem.read(&mut data, GuestAddress(ecam(1, 0x18, 0))).unwrap();
        assert_eq!(data, [0xff; 4]);
        t.mem.read(&mut data, GuestAddress(ecam(2, 0x10, 0))).unwrap();
        assert_eq!(data, [0xff; 4]);

        // Extended registers read 0.
        t.mem.read(&mut data, GuestAddress(ecam(1, 0x10, 0x100))).unwrap();
        assert_eq!(data, [0; 4]);

        let host = t.host.lock().unwrap();
        assert_eq!(host.find_function(1, 0x10), Some(t.leaf));
        assert_eq!(host.find_function(0, 0xf0), Some(t.bridge));
        assert_eq!(host.find_function(0, 0x10), Some(t.nic));
        assert_eq!(host.find_function(2, 0x10), None);
    }

    #[test]
    fn test_sixty_four_bit_bank() {
        let t = create_pci_host();
        let mut host = t.host.lock().unwrap();
        let bank = host
            .with_function(t.leaf, |f| {
                let flags = BankFlags::MEMORY | BankFlags::SIXTY_FOUR;
                f.declare_bank(0x4000, flags, counting_mapper("bar64"))
            })
            .unwrap()
            .unwrap();
        assert_eq!(bank, 0);

        host.root_config_write(0, 0xf0, PRIMARY_BUS_NUM as u16, 0x0001_0100, 0x00ff_ffff)
            .unwrap();
        host.root_config_write(1, 0x10, BAR_0 as u16, 0x1234_8000, u32::MAX)
            .unwrap();
        host.root_config_write(1, 0x10, BAR_0 as u16 + 4, 0x0000_0001, u32::MAX)
            .unwrap();
        assert_eq!(host.root_config_read(1, 0x10, BAR_0 as u16, u32::MAX).unwrap(), 0x1234_8004);
        assert_eq!(host.root_config_read(1, 0x10, BAR_0 as u16 + 4, u32::MAX).unwrap(), 1);
        // Slot 2 is free.
        assert_eq!(host.root_config_read(1, 0x10, BAR_0 as u16 + 8, u32::MAX).unwrap(), 0);
    }

    #[test]
    fn test_reset_clears_state() {
        let t = create_pci_host();
        io_write32(&t.io, 0xcf8, 0x8000_1000 | BAR_0 as u32);
        io_write32(&t.io, 0xcfc, 0x0000_1000);
        io_write32(&t.io, 0xcf8, 0x8000_1000 | COMMAND as u32);
        io_write32(&t.io, 0xcfc, 0x0000_0082);
        assert_eq!(mem_read8(&t.mem, 0x1001), Some(1));

        t.host.lock().unwrap().reset().unwrap();
        assert_eq!(t.host.lock().unwrap().legacy_config_address_read(), 0);
        assert_eq!(mem_read8(&t.mem, 0x1001), None);
        // Bank address is kept, only decoding is off.
        let host = t.host.lock().unwrap();
        assert_eq!(host.root_config_read(0, 0x10, BAR_0 as u16, u32::MAX).unwrap(), 0x1000);
        assert_eq!(host.root_config_read(0, 0x10, COMMAND as u16, 0xffff).unwrap() & 0xffff, 0x80);
    }

    #[test]
    fn test_create_requires_bridge() {
        let mem = AddressSpace::new("memory", 1 << 32);
        let io = AddressSpace::new("io", 1 << 16);
        let mut topology = PciTopology::new();
        let root = topology.add_root("pci:00.0", PciFunction::new_host("host")).unwrap();
        let dev = topology.attach(root, "pci:01.0", PciFunction::new("dev")).unwrap();
        assert!(PciHost::create(topology, dev, &mem, &io, HostWindows::default()).is_err());
    }
}
