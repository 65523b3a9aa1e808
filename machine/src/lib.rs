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

pub mod config;
pub mod error;

pub use error::MachineError;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use address_space::{AddressRange, AddressSpace, GuestAddress, Region, RegionOps};
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use pci::config::{
    CLASS_REVISION, HEADER_TYPE, HEADER_TYPE_BRIDGE, HEADER_TYPE_MULTIFUNC, PRIMARY_BUS_NUM,
    SUBORDINATE_BUS_NUM, VENDOR_ID,
};
use pci::{
    format_bdf, pci_devfn, BankFlags, BankMapper, ConfigSpaceRegisterFile, DecodeWindow,
    FunctionHooks, FunctionId, HostWindows, MappingContext, PciFunction, PciHost, PciRoot,
    PciTopology,
};
use util::num_ops::lane_mask;

use crate::config::{
    get_pci_df, BankBacking, BankConfig, ConfigCheck, FunctionConfig, FunctionKind,
    MachineConfig, WindowConfig,
};

/// Port of the config address register, the data register follows it.
pub const LEGACY_CONFIG_PORT: u64 = 0xcf8;
const ECAM_BUS_SHIFT: u64 = 20;
const ECAM_DEVFN_SHIFT: u64 = 12;
/// Id of the host bridge in the function table.
pub const HOST_BRIDGE_ID: &str = "host";

/// System RAM installed at address 0 by the host bridge.
struct SystemRam {
    mem: Arc<RwLock<Vec<u8>>>,
}

impl FunctionHooks for SystemRam {
    fn map_extra(&mut self, _regs: &ConfigSpaceRegisterFile, ctx: &MappingContext) -> Result<()> {
        let size = self.mem.read().unwrap().len() as u64;
        ctx.memory_space
            .install(
                AddressRange::new(GuestAddress(0), size),
                Region::init_ram_region_shared(self.mem.clone(), "system ram"),
            )
            .with_context(|| "Failed to map system ram")
    }
}

fn ram_bank_mapper(name: &str, size: u64) -> BankMapper {
    let mem = Arc::new(RwLock::new(vec![0_u8; size as usize]));
    let mem_w = mem.clone();
    BankMapper::new(
        name,
        RegionOps {
            read: Arc::new(move |data: &mut [u8], _: GuestAddress, offset: u64| {
                let mem = mem.read().unwrap();
                let start = offset as usize;
                match mem.get(start..start + data.len()) {
                    Some(src) => {
                        data.copy_from_slice(src);
                        true
                    }
                    None => false,
                }
            }),
            write: Arc::new(move |data: &[u8], _: GuestAddress, offset: u64| {
                let mut mem = mem_w.write().unwrap();
                let start = offset as usize;
                match mem.get_mut(start..start + data.len()) {
                    Some(dst) => {
                        dst.copy_from_slice(data);
                        true
                    }
                    None => false,
                }
            }),
        },
    )
}

fn empty_bank_mapper(name: &str) -> BankMapper {
    BankMapper::new(
        name,
        RegionOps {
            read: Arc::new(|_: &mut [u8], _: GuestAddress, _: u64| false),
            write: Arc::new(|_: &[u8], _: GuestAddress, _: u64| false),
        },
    )
}

fn bank_flags(bank: &BankConfig) -> BankFlags {
    let mut flags = if bank.io {
        BankFlags::IO
    } else {
        BankFlags::MEMORY
    };
    if bank.sixty_four {
        flags = flags | BankFlags::SIXTY_FOUR;
    }
    if bank.prefetch {
        flags = flags | BankFlags::PREFETCH;
    }
    if bank.disabled {
        flags = flags | BankFlags::DISABLED;
    }
    flags
}

fn build_function(config: &FunctionConfig) -> Result<PciFunction> {
    let mut function = match config.kind {
        FunctionKind::Endpoint => PciFunction::new(&config.id),
        FunctionKind::Bridge => PciFunction::new_bridge(&config.id),
    };
    let (main_id, class, subsystem_id) = config.ids()?;
    function.set_ids(main_id, config.revision, class, subsystem_id);
    function.set_map_first(config.map_first);
    if let Some(mask) = config.command_mask {
        function.regs_mut().set_command_mask(mask);
    }
    if config.interrupt_pin != 0 {
        function.regs_mut().set_interrupt_pin(config.interrupt_pin);
    }
    for (i, bank) in config.banks.iter().enumerate() {
        if bank.skip_slots != 0 {
            function.skip_bank_regs(bank.skip_slots)?;
        }
        let name = format!("bank{}", i);
        let mapper = match bank.backing {
            BankBacking::Ram => ram_bank_mapper(&name, bank.size),
            BankBacking::None => empty_bank_mapper(&name),
        };
        function
            .declare_bank(bank.size, bank_flags(bank), mapper)
            .with_context(|| format!("Failed to declare bank {} of {}", i, config.id))?;
    }
    if config.rom_size != 0 {
        let image: Arc<[u8]> = Arc::from(vec![0_u8; config.rom_size as usize]);
        function.declare_expansion_rom(image);
    }
    Ok(function)
}

fn decode_window(config: WindowConfig, space: &AddressSpace) -> DecodeWindow {
    DecodeWindow::new(
        config.start,
        config.end.min(space.size() - 1),
        config.offset,
    )
}

/// One function found by `Machine::scan_bus`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanEntry {
    pub bus: u8,
    pub devfn: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u32,
    pub header_type: u8,
    /// Secondary and subordinate bus assigned to a bridge.
    pub buses: Option<(u8, u8)>,
}

impl fmt::Display for ScanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:06x}]: {:04x}:{:04x}",
            format_bdf(self.bus, self.devfn),
            self.class,
            self.vendor_id,
            self.device_id
        )?;
        if let Some((secondary, subordinate)) = self.buses {
            write!(f, " bus {:02x}-{:02x}", secondary, subordinate)?;
        }
        Ok(())
    }
}

/// A PCI hierarchy with the address spaces it decodes into.
pub struct Machine {
    root: PciRoot,
    memory_space: Arc<AddressSpace>,
    io_space: Arc<AddressSpace>,
    host: Arc<Mutex<PciHost>>,
    functions: BTreeMap<String, FunctionId>,
    legacy_ports: bool,
    ecam_base: Option<u64>,
}

impl Machine {
    /// Build the hierarchy described by `config` and power it on.
    pub fn new(config: &MachineConfig) -> Result<Self> {
        config.check()?;
        let memory_space = AddressSpace::new("memory", config.memory_space_size);
        let io_space = AddressSpace::new("io", config.io_space_size);
        let root = PciRoot::new(&config.name);

        let mut topology = PciTopology::new();
        let mut functions = BTreeMap::new();

        let (slot, func) = get_pci_df(&config.host.addr)?;
        let (main_id, class) = config.host.ids()?;
        let mut host_fn = PciFunction::new_host(HOST_BRIDGE_ID);
        host_fn.set_ids(main_id, config.host.revision, class, 0);
        if config.ram_size != 0 {
            host_fn.set_hooks(Box::new(SystemRam {
                mem: Arc::new(RwLock::new(vec![0_u8; config.ram_size as usize])),
            }));
        }
        let host_id = topology.add_root(&root.child_tag(slot, func), host_fn)?;
        functions.insert(HOST_BRIDGE_ID.to_string(), host_id);

        for fc in config.functions.iter() {
            let parent = match &fc.parent {
                Some(parent) => *functions.get(parent).ok_or_else(|| {
                    anyhow!(MachineError::UnknownParent(parent.clone(), fc.id.clone()))
                })?,
                None => host_id,
            };
            let (slot, func) = get_pci_df(&fc.addr)?;
            let tag = if parent == host_id {
                root.child_tag(slot, func)
            } else {
                let parent_tag = topology.tag(parent).unwrap_or_default();
                format!("{}:{:02x}.{}", parent_tag, slot, func)
            };
            let id = topology
                .attach(parent, &tag, build_function(fc)?)
                .with_context(|| format!("Failed to add function {}", fc.id))?;
            if functions.insert(fc.id.clone(), id).is_some() {
                return Err(anyhow!(MachineError::IdRepeat(
                    fc.id.clone(),
                    "function".to_string()
                )));
            }
        }

        let windows = HostWindows {
            memory: decode_window(config.host.memory_window, &memory_space),
            io: decode_window(config.host.io_window, &io_space),
        };
        let host = PciHost::create(topology, host_id, &memory_space, &io_space, windows)?;
        {
            let mut locked_host = host.lock().unwrap();
            if config.host.legacy_ports {
                locked_host.set_legacy_ports(Some(LEGACY_CONFIG_PORT));
            }
            locked_host.set_ecam_range(config.host.ecam.map(|r| (r.base, r.size)));
            locked_host.realize()?;
        }

        let machine = Machine {
            root,
            memory_space,
            io_space,
            host,
            functions,
            legacy_ports: config.host.legacy_ports,
            ecam_base: config.host.ecam.map(|r| r.base),
        };
        machine.reset()?;
        info!(
            "Machine {} created with {} functions",
            machine.root.name(),
            machine.functions.len()
        );
        Ok(machine)
    }

    pub fn reset(&self) -> Result<()> {
        self.root.reset();
        self.host.lock().unwrap().reset()
    }

    pub fn host(&self) -> &Arc<Mutex<PciHost>> {
        &self.host
    }

    pub fn memory_space(&self) -> &Arc<AddressSpace> {
        &self.memory_space
    }

    pub fn io_space(&self) -> &Arc<AddressSpace> {
        &self.io_space
    }

    /// Find a function by its configuration id.
    pub fn function_id(&self, id: &str) -> Option<FunctionId> {
        self.functions.get(id).copied()
    }

    /// Run `f` on the function with configuration id `id`.
    pub fn with_function<R, F>(&self, id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut PciFunction) -> R,
    {
        let fid = self.function_id(id).ok_or_else(|| {
            anyhow!(MachineError::InvalidParam(
                id.to_string(),
                "function".to_string()
            ))
        })?;
        self.host.lock().unwrap().with_function(fid, f)
    }

    pub fn io_read(&self, port: u64, data: &mut [u8]) -> Result<()> {
        self.io_space.read(data, GuestAddress(port))
    }

    pub fn io_write(&self, port: u64, data: &[u8]) -> Result<()> {
        self.io_space.write(data, GuestAddress(port))
    }

    pub fn mem_read(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        self.memory_space.read(data, GuestAddress(addr))
    }

    pub fn mem_write(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.memory_space.write(data, GuestAddress(addr))
    }

    /// Config read of `len` bytes at `reg`, through the config ports if
    /// present, else through ECAM, else straight into the host bridge.
    pub fn config_read(&self, bus: u8, devfn: u8, reg: u16, len: usize) -> Result<u32> {
        let lane = usize::from(reg & 3);
        let mask = lane_mask(lane, len)?;
        let mut data = vec![0_u8; len];
        if self.legacy_ports {
            self.io_write(LEGACY_CONFIG_PORT, &config_address(bus, devfn, reg).to_le_bytes())?;
            self.io_read(LEGACY_CONFIG_PORT + 4 + lane as u64, &mut data)?;
        } else if let Some(base) = self.ecam_base {
            self.mem_read(base + ecam_offset(bus, devfn, reg), &mut data)?;
        } else {
            let value = self
                .host
                .lock()
                .unwrap()
                .root_config_read(bus, devfn, reg & !3, mask)?;
            return Ok((value & mask) >> (lane * 8));
        }
        Ok(data
            .iter()
            .rev()
            .fold(0, |acc, byte| acc << 8 | u32::from(*byte)))
    }

    /// Config write of the low `len` bytes of `value` at `reg`.
    pub fn config_write(&self, bus: u8, devfn: u8, reg: u16, len: usize, value: u32) -> Result<()> {
        let lane = usize::from(reg & 3);
        let mask = lane_mask(lane, len)?;
        let data = &value.to_le_bytes()[..len];
        if self.legacy_ports {
            self.io_write(LEGACY_CONFIG_PORT, &config_address(bus, devfn, reg).to_le_bytes())?;
            self.io_write(LEGACY_CONFIG_PORT + 4 + lane as u64, data)
        } else if let Some(base) = self.ecam_base {
            self.mem_write(base + ecam_offset(bus, devfn, reg), data)
        } else {
            self.host.lock().unwrap().root_config_write(
                bus,
                devfn,
                reg & !3,
                value << (lane * 8),
                mask,
            )
        }
    }

    /// Enumerate the hierarchy the way firmware does, numbering the buses
    /// behind every bridge depth first.
    pub fn scan_bus(&self) -> Result<Vec<ScanEntry>> {
        let mut entries = Vec::new();
        let mut next_bus: u16 = 1;
        self.scan_one_bus(0, &mut next_bus, &mut entries)?;
        Ok(entries)
    }

    fn scan_one_bus(
        &self,
        bus: u8,
        next_bus: &mut u16,
        entries: &mut Vec<ScanEntry>,
    ) -> Result<()> {
        for slot in 0..32 {
            for func in 0..8 {
                let devfn = pci_devfn(slot, func);
                let ids = self.config_read(bus, devfn, VENDOR_ID as u16, 4)?;
                if ids & 0xffff == 0xffff {
                    if func == 0 {
                        break;
                    }
                    continue;
                }
                let class = self.config_read(bus, devfn, CLASS_REVISION as u16, 4)? >> 8;
                let header_type = self.config_read(bus, devfn, HEADER_TYPE as u16, 1)? as u8;
                debug!("Found {} {:08x}", format_bdf(bus, devfn), ids);

                let index = entries.len();
                entries.push(ScanEntry {
                    bus,
                    devfn,
                    vendor_id: ids as u16,
                    device_id: (ids >> 16) as u16,
                    class,
                    header_type,
                    buses: None,
                });

                if header_type & !HEADER_TYPE_MULTIFUNC == HEADER_TYPE_BRIDGE {
                    if *next_bus > u16::from(u8::MAX) {
                        bail!("Out of bus numbers behind {}", format_bdf(bus, devfn));
                    }
                    let secondary = *next_bus as u8;
                    *next_bus += 1;
                    let numbers = u32::from(bus) | u32::from(secondary) << 8 | 0xff << 16;
                    self.config_write(bus, devfn, PRIMARY_BUS_NUM as u16, 4, numbers)?;
                    self.scan_one_bus(secondary, next_bus, entries)?;
                    let subordinate = (*next_bus - 1) as u8;
                    self.config_write(
                        bus,
                        devfn,
                        SUBORDINATE_BUS_NUM as u16,
                        1,
                        u32::from(subordinate),
                    )?;
                    entries[index].buses = Some((secondary, subordinate));
                }

                if func == 0 && header_type & HEADER_TYPE_MULTIFUNC == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Print the flat view of both address spaces.
    pub fn mtree(&self) {
        self.memory_space.mtree();
        self.io_space.mtree();
    }
}

fn config_address(bus: u8, devfn: u8, reg: u16) -> u32 {
    0x8000_0000 | u32::from(bus) << 16 | u32::from(devfn) << 8 | u32::from(reg & 0xfc)
}

fn ecam_offset(bus: u8, devfn: u8, reg: u16) -> u64 {
    u64::from(bus) << ECAM_BUS_SHIFT | u64::from(devfn) << ECAM_DEVFN_SHIFT | u64::from(reg)
}

#[cfg(test)]
mod tests {
    use pci::config::{BAR_0, COMMAND, ROM_ADDRESS, SECONDARY_BUS_NUM};

    use super::*;

    const CONFIG: &str = r#"{
        "name": "pci",
        "ram_size": 4096,
        "host": { "ecam": { "base": 3758096384, "size": 268435456 } },
        "functions": [
            {
                "id": "nic", "addr": "02.0",
                "main_id": "0x10ec8139", "class": "0x020000",
                "banks": [
                    { "size": 4096, "backing": "ram" },
                    { "size": 256, "io": true }
                ],
                "rom_size": 2048
            },
            { "id": "nic-fn1", "addr": "02.1", "main_id": "0x10ec8139" },
            {
                "id": "br0", "addr": "1e.0", "kind": "bridge",
                "main_id": "0x8086244e", "class": "0x060400"
            },
            { "id": "br1", "parent": "br0", "addr": "01.0", "kind": "bridge" },
            {
                "id": "disk", "parent": "br1", "addr": "00.0",
                "main_id": "0x1af41001", "class": "0x010000"
            },
            {
                "id": "gpu", "parent": "br0", "addr": "05.0",
                "main_id": "0x12341111", "class": "0x030000"
            }
        ]
    }"#;

    fn create_machine(json: &str) -> Machine {
        Machine::new(&MachineConfig::from_json(json).unwrap()).unwrap()
    }

    #[test]
    fn test_scan_bus() {
        let machine = create_machine(CONFIG);
        let entries = machine.scan_bus().unwrap();
        let found: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            found,
            vec![
                "00:00.0 [060000]: 8086:1237",
                "00:02.0 [020000]: 10ec:8139",
                "00:02.1 [000000]: 10ec:8139",
                "00:1e.0 [060400]: 8086:244e bus 01-02",
                "01:01.0 [000000]: 0000:0000 bus 02-02",
                "02:00.0 [010000]: 1af4:1001",
                "01:05.0 [030000]: 1234:1111",
            ]
        );
        assert_eq!(entries[1].header_type, HEADER_TYPE_MULTIFUNC);

        // Bus numbers landed in the bridges.
        assert_eq!(machine.config_read(0, 0xf0, SECONDARY_BUS_NUM as u16, 2).unwrap(), 0x0201);
        assert_eq!(machine.config_read(1, 0x08, SECONDARY_BUS_NUM as u16, 2).unwrap(), 0x0202);
    }

    #[test]
    fn test_config_access_paths() {
        let machine = create_machine(CONFIG);
        machine.scan_bus().unwrap();
        let ports = machine.config_read(2, 0x00, 0, 4).unwrap();
        assert_eq!(ports, 0x1001_1af4);

        let mut data = [0_u8; 4];
        machine
            .mem_read(0xe000_0000 + ecam_offset(2, 0x00, 0), &mut data)
            .unwrap();
        assert_eq!(u32::from_le_bytes(data), ports);

        let direct = machine
            .host()
            .lock()
            .unwrap()
            .root_config_read(2, 0x00, 0, u32::MAX)
            .unwrap();
        assert_eq!(direct, ports);
        assert_eq!(machine.config_read(2, 0x00, 2, 2).unwrap(), 0x1001);
    }

    #[test]
    fn test_ram_bank_and_rom() {
        let machine = create_machine(CONFIG);
        machine
            .config_write(0, 0x10, BAR_0 as u16, 4, 0x8000_0000)
            .unwrap();
        machine
            .config_write(0, 0x10, BAR_0 as u16 + 4, 4, 0x0000_c000)
            .unwrap();
        machine
            .config_write(0, 0x10, ROM_ADDRESS as u16, 4, 0x9000_0001)
            .unwrap();
        assert_eq!(
            machine.config_read(0, 0x10, BAR_0 as u16 + 4, 4).unwrap(),
            0x0000_c001
        );
        machine.config_write(0, 0x10, COMMAND as u16, 2, 0x83).unwrap();

        machine.mem_write(0x8000_0010, &[1, 2, 3, 4]).unwrap();
        let mut data = [0_u8; 4];
        machine.mem_read(0x8000_0010, &mut data).unwrap();
        assert_eq!(data, [1, 2, 3, 4]);

        // Empty IO bank reads all-ones.
        let mut data = [0_u8; 2];
        machine.io_read(0xc000, &mut data).unwrap();
        assert_eq!(data, [0xff, 0xff]);

        let mut data = [0xaa_u8; 4];
        machine.mem_read(0x9000_0000, &mut data).unwrap();
        assert_eq!(data, [0; 4]);

        // System ram of the host bridge.
        machine.mem_write(0x100, &[0x5a]).unwrap();
        let mut data = [0_u8; 1];
        machine.mem_read(0x100, &mut data).unwrap();
        assert_eq!(data, [0x5a]);

        // Turning decoding off hides the bank.
        machine.config_write(0, 0x10, COMMAND as u16, 2, 0x80).unwrap();
        let mut data = [0_u8; 4];
        machine.mem_read(0x8000_0010, &mut data).unwrap();
        assert_eq!(data, [0xff; 4]);
    }

    #[test]
    fn test_reset_forgets_bus_numbers() {
        let machine = create_machine(CONFIG);
        machine.scan_bus().unwrap();
        assert_eq!(machine.config_read(2, 0x00, 0, 4).unwrap(), 0x1001_1af4);
        machine.reset().unwrap();
        assert_eq!(machine.config_read(2, 0x00, 0, 4).unwrap(), 0xffff_ffff);
        assert_eq!(machine.scan_bus().unwrap().len(), 7);
    }

    #[test]
    fn test_direct_config_access() {
        let json = r#"{ "host": { "legacy_ports": false },
            "functions": [ { "id": "dev", "addr": "03.0", "main_id": "0x12340001" } ] }"#;
        let machine = create_machine(json);
        assert_eq!(machine.config_read(0, 0x18, 0, 2).unwrap(), 0x1234);
        assert_eq!(machine.config_read(0, 0x18, 2, 2).unwrap(), 0x0001);
        machine.config_write(0, 0x18, COMMAND as u16, 2, 0x81).unwrap();
        assert_eq!(machine.config_read(0, 0x18, COMMAND as u16, 2).unwrap(), 0x81);

        let mut data = [0_u8; 4];
        machine.io_read(LEGACY_CONFIG_PORT, &mut data).unwrap();
        assert_eq!(data, [0xff; 4]);
        assert_eq!(machine.scan_bus().unwrap().len(), 2);
    }

    #[test]
    fn test_with_function() {
        let machine = create_machine(CONFIG);
        let disk = machine.function_id("disk").unwrap();
        assert_ne!(machine.function_id("nic"), Some(disk));
        assert!(machine.with_function("missing", |_| ()).is_err());
        let name = machine.with_function("disk", |f| f.name().to_string()).unwrap();
        assert_eq!(name, "disk");
    }

    #[test]
    fn test_default_machine() {
        let machine = Machine::new(&MachineConfig::default()).unwrap();
        let entries = machine.scan_bus().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].to_string(), "00:00.0 [060000]: 8086:1237");
        assert_eq!(machine.config_read(0, 0, 0, 2).unwrap(), 0x8086);
        assert_eq!(machine.config_read(0, 0, 2, 2).unwrap(), 0x1237);

        // Nothing decodes there, the access still completes.
        let mut data = [0_u8; 4];
        machine.mem_read(0x4000_0000, &mut data).unwrap();
        assert_eq!(data, [0xff; 4]);
        machine.mem_write(0x4000_0000, &data).unwrap();
        let mut data = [0_u8; 2];
        machine.io_read(0x5000, &mut data).unwrap();
        assert_eq!(data, [0xff; 2]);
    }

    #[test]
    fn test_devfn_conflict() {
        let json = r#"{ "functions": [ { "id": "a", "addr": "00.0" } ] }"#;
        let config = MachineConfig::from_json(json).unwrap();
        assert!(Machine::new(&config).is_err());
    }
}
