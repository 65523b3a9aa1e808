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

use log::debug;

/// Top level anchor of a PCI hierarchy.
///
/// It holds no registers and decodes nothing. Host bridges are named below
/// it, e.g. `pci:00.0` for the host bridge of root `pci`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PciRoot {
    name: String,
}

impl PciRoot {
    pub fn new(name: &str) -> Self {
        PciRoot {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag of the function at `slot.func` on the root bus.
    pub fn child_tag(&self, slot: u8, func: u8) -> String {
        format!("{}:{:02x}.{}", self.name, slot, func)
    }

    pub fn reset(&self) {
        debug!("{}: reset", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_devfn_tag;

    #[test]
    fn test_child_tag() {
        let root = PciRoot::new("pci");
        assert_eq!(root.name(), "pci");
        assert_eq!(root.child_tag(0x1e, 1), "pci:1e.1");
        assert_eq!(parse_devfn_tag(&root.child_tag(7, 0)).unwrap(), 0x38);
    }
}
