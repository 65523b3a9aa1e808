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

use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use util::num_ops::str_to_num;

use crate::error::MachineError;

/// Max length of names and ids in the configuration.
pub const MAX_STRING_LENGTH: usize = 255;
const MAX_BANKS: usize = 6;
const DEFAULT_MEMORY_SPACE_SIZE: u64 = 1 << 32;
const DEFAULT_IO_SPACE_SIZE: u64 = 1 << 16;

/// Check if the config is valid.
pub trait ConfigCheck: Send + Sync + std::fmt::Debug {
    fn check(&self) -> Result<()>;
}

fn check_string_length(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(anyhow!(MachineError::InvalidParam(
            value.to_string(),
            name.to_string()
        )));
    }
    if value.len() > MAX_STRING_LENGTH {
        return Err(anyhow!(MachineError::StringLengthTooLong(
            name.to_string(),
            MAX_STRING_LENGTH
        )));
    }
    Ok(())
}

/// Parse the `SS.F` address of a function into slot and function numbers.
///
/// The function part may be left out, `02` is function 0 of slot 2.
pub fn get_pci_df(addr: &str) -> Result<(u8, u8)> {
    let addr_vec: Vec<&str> = addr.split('.').collect();
    if addr_vec.len() > 2 {
        bail!(
            "The number of args for addr is supported to be no more than two, find :{}",
            addr_vec.len()
        );
    }
    let slot = addr_vec[0];
    let without_prefix = slot.trim_start_matches("0x");
    let slot = u8::from_str_radix(without_prefix, 16)
        .with_context(|| format!("Invalid slot num: {}", slot))?;
    if slot > 31 {
        bail!("Invalid slot num: {}", slot);
    }
    let func = match addr_vec.get(1) {
        Some(function) => {
            let without_prefix = function.trim_start_matches("0x");
            u8::from_str_radix(without_prefix, 16)
                .with_context(|| format!("Invalid function num: {}", function))?
        }
        None => 0,
    };
    if func > 7 {
        bail!("Invalid function num: {}", func);
    }
    Ok((slot, func))
}

fn parse_hex_u32(name: &str, value: &str) -> Result<u32> {
    str_to_num::<u32>(value).with_context(|| format!("Invalid {}: {}", name, value))
}

/// Address range decoded by the host bridge.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    pub start: u64,
    pub end: u64,
    #[serde(default)]
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    pub base: u64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub addr: String,
    /// Vendor id in the high half, device id in the low half.
    pub main_id: String,
    pub class: String,
    pub revision: u8,
    pub memory_window: WindowConfig,
    pub io_window: WindowConfig,
    /// Answer the 0xcf8/0xcfc config ports.
    pub legacy_ports: bool,
    pub ecam: Option<RangeConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            addr: "00.0".to_string(),
            main_id: "0x80861237".to_string(),
            class: "0x060000".to_string(),
            revision: 0x02,
            memory_window: WindowConfig {
                start: 0,
                end: DEFAULT_MEMORY_SPACE_SIZE - 1,
                offset: 0,
            },
            io_window: WindowConfig {
                start: 0,
                end: DEFAULT_IO_SPACE_SIZE - 1,
                offset: 0,
            },
            legacy_ports: true,
            ecam: None,
        }
    }
}

impl HostConfig {
    pub fn ids(&self) -> Result<(u32, u32)> {
        Ok((
            parse_hex_u32("main_id", &self.main_id)?,
            parse_hex_u32("class", &self.class)?,
        ))
    }
}

impl ConfigCheck for HostConfig {
    fn check(&self) -> Result<()> {
        get_pci_df(&self.addr)?;
        self.ids()?;
        let windows = [
            ("memory_window", self.memory_window),
            ("io_window", self.io_window),
        ];
        for (name, window) in windows {
            if window.start > window.end {
                return Err(anyhow!(MachineError::InvalidParam(
                    format!("0x{:x}-0x{:x}", window.start, window.end),
                    name.to_string()
                )));
            }
            // Bus addresses of the window must stay inside 64 bits.
            if window.end.checked_add(window.offset).is_none() {
                return Err(anyhow!(MachineError::InvalidParam(
                    format!("offset 0x{:x}", window.offset),
                    name.to_string()
                )));
            }
        }
        if let Some(ecam) = self.ecam {
            if ecam.size == 0 || ecam.base.checked_add(ecam.size).is_none() {
                return Err(anyhow!(MachineError::InvalidParam(
                    format!("0x{:x}+0x{:x}", ecam.base, ecam.size),
                    "ecam".to_string()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    #[default]
    Endpoint,
    Bridge,
}

/// What answers accesses inside a bank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BankBacking {
    /// Plain memory of the bank size.
    Ram,
    /// Nothing, reads return all-ones.
    #[default]
    None,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BankConfig {
    pub size: u64,
    pub io: bool,
    pub sixty_four: bool,
    pub prefetch: bool,
    pub disabled: bool,
    pub backing: BankBacking,
    /// Base address registers left free before this bank.
    pub skip_slots: usize,
}

impl ConfigCheck for BankConfig {
    fn check(&self) -> Result<()> {
        if self.io && (self.sixty_four || self.prefetch) {
            bail!("IO bank can't be 64-bit or prefetchable");
        }
        if self.size != 0 && !self.size.is_power_of_two() {
            return Err(anyhow!(MachineError::InvalidParam(
                format!("0x{:x}", self.size),
                "bank size".to_string()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FunctionConfig {
    pub id: String,
    /// Id of the bridge owning the bus, the root bus if absent.
    pub parent: Option<String>,
    pub addr: String,
    pub kind: FunctionKind,
    /// Vendor id in the high half, device id in the low half.
    pub main_id: String,
    pub class: String,
    /// Subsystem vendor id in the high half, subsystem id in the low half.
    pub subsystem_id: String,
    pub revision: u8,
    pub map_first: bool,
    pub command_mask: Option<u16>,
    pub interrupt_pin: u8,
    pub banks: Vec<BankConfig>,
    /// Size of a zero-filled expansion ROM image.
    pub rom_size: u32,
}

impl FunctionConfig {
    /// Parse the id strings, absent ones read as 0.
    pub fn ids(&self) -> Result<(u32, u32, u32)> {
        let parse = |name: &str, value: &str| -> Result<u32> {
            if value.is_empty() {
                return Ok(0);
            }
            parse_hex_u32(name, value)
        };
        Ok((
            parse("main_id", &self.main_id)?,
            parse("class", &self.class)?,
            parse("subsystem_id", &self.subsystem_id)?,
        ))
    }
}

impl ConfigCheck for FunctionConfig {
    fn check(&self) -> Result<()> {
        check_string_length("id", &self.id)?;
        if let Some(parent) = &self.parent {
            check_string_length("parent", parent)?;
        }
        get_pci_df(&self.addr).with_context(|| format!("Function {}", self.id))?;
        self.ids()?;
        if self.interrupt_pin > 4 {
            return Err(anyhow!(MachineError::InvalidParam(
                self.interrupt_pin.to_string(),
                "interrupt_pin".to_string()
            )));
        }
        if self.kind == FunctionKind::Bridge && !self.banks.is_empty() {
            bail!("Bridge {} can't declare banks", self.id);
        }
        let slots: usize = self
            .banks
            .iter()
            .map(|b| b.skip_slots + if b.sixty_four { 2 } else { 1 })
            .sum();
        if slots > MAX_BANKS {
            bail!("Function {} uses {} bank registers, at most {}", self.id, slots, MAX_BANKS);
        }
        for bank in self.banks.iter() {
            bank.check()?;
        }
        if self.rom_size != 0 && (!self.rom_size.is_power_of_two() || self.rom_size < 0x800) {
            return Err(anyhow!(MachineError::InvalidParam(
                format!("0x{:x}", self.rom_size),
                "rom_size".to_string()
            )));
        }
        Ok(())
    }
}

/// Description of the PCI machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    /// Name of the root bus, prefix of every function tag.
    pub name: String,
    /// System RAM mapped at address 0 by the host bridge.
    pub ram_size: u64,
    pub memory_space_size: u64,
    pub io_space_size: u64,
    pub host: HostConfig,
    pub functions: Vec<FunctionConfig>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            name: "pci".to_string(),
            ram_size: 0,
            memory_space_size: DEFAULT_MEMORY_SPACE_SIZE,
            io_space_size: DEFAULT_IO_SPACE_SIZE,
            host: HostConfig::default(),
            functions: Vec::new(),
        }
    }
}

impl MachineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(MachineError::from)?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: MachineConfig = serde_json::from_str(content).map_err(MachineError::from)?;
        config.check()?;
        Ok(config)
    }
}

impl ConfigCheck for MachineConfig {
    fn check(&self) -> Result<()> {
        check_string_length("name", &self.name)?;
        if self.name.contains(':') {
            return Err(anyhow!(MachineError::InvalidParam(
                self.name.clone(),
                "name".to_string()
            )));
        }
        if self.memory_space_size == 0 || self.io_space_size == 0 {
            bail!("Address spaces must not be empty");
        }
        if self.ram_size > self.memory_space_size {
            return Err(anyhow!(MachineError::InvalidParam(
                format!("0x{:x}", self.ram_size),
                "ram_size".to_string()
            )));
        }
        self.host.check()?;

        let mut ids = HashSet::new();
        let mut bridges = HashSet::new();
        for function in self.functions.iter() {
            function.check()?;
            if !ids.insert(function.id.as_str()) {
                return Err(anyhow!(MachineError::IdRepeat(
                    function.id.clone(),
                    "function".to_string()
                )));
            }
            if let Some(parent) = &function.parent {
                if !bridges.contains(parent.as_str()) {
                    return Err(anyhow!(MachineError::UnknownParent(
                        parent.clone(),
                        function.id.clone()
                    )));
                }
            }
            if function.kind == FunctionKind::Bridge {
                bridges.insert(function.id.as_str());
            }
        }
        Ok(())
    }
}
