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

use anyhow::{anyhow, Result};
use log::debug;

use crate::{parse_devfn_tag, PciError, PciFunction};

/// Handle of a function in a `PciTopology`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(usize);

impl FunctionId {
    pub fn index(&self) -> usize {
        self.0
    }
}

struct TopologyNode {
    tag: String,
    /// Function owning the bus this one sits on. The root bus owner points
    /// at itself.
    bus_owner: FunctionId,
    devfn: u8,
    function: Arc<Mutex<PciFunction>>,
}

/// Arena of the functions of a PCI hierarchy.
///
/// Functions are registered with a tag whose last component gives their
/// devfn, and with the bridge owning the bus they live on. Child tables are
/// built from this by `PciTopology::discover_children`.
#[derive(Default)]
pub struct PciTopology {
    nodes: Vec<TopologyNode>,
}

impl PciTopology {
    pub fn new() -> Self {
        PciTopology::default()
    }

    fn node(&self, id: FunctionId) -> Result<&TopologyNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| anyhow!(PciError::UnknownFunction(id.0)))
    }

    fn check_devfn_free(&self, bus_owner: FunctionId, devfn: u8, tag: &str) -> Result<()> {
        if let Some(other) = self
            .nodes
            .iter()
            .find(|n| n.bus_owner == bus_owner && n.devfn == devfn)
        {
            let bus = self.node(bus_owner)?.tag.clone();
            return Err(anyhow!(PciError::DevfnInUse(
                devfn,
                bus,
                format!("{} (adding {})", other.tag, tag)
            )));
        }
        Ok(())
    }

    /// Register the bridge owning the root bus. It sits on its own bus.
    pub fn add_root(&mut self, tag: &str, function: PciFunction) -> Result<FunctionId> {
        if !function.is_bridge() {
            return Err(anyhow!(PciError::NotBridge(tag.to_string())));
        }
        let devfn = parse_devfn_tag(tag)?;
        let id = FunctionId(self.nodes.len());
        debug!("{}: root bus owner at devfn {:02x}", tag, devfn);
        self.nodes.push(TopologyNode {
            tag: tag.to_string(),
            bus_owner: id,
            devfn,
            function: Arc::new(Mutex::new(function)),
        });
        Ok(id)
    }

    /// Register `function` on the secondary bus of `parent`.
    pub fn attach(
        &mut self,
        parent: FunctionId,
        tag: &str,
        function: PciFunction,
    ) -> Result<FunctionId> {
        let parent_node = self.node(parent)?;
        let parent_tag = parent_node.tag.clone();
        if !parent_node.function.lock().unwrap().is_bridge() {
            return Err(anyhow!(PciError::NotBridge(parent_tag)));
        }
        let devfn = parse_devfn_tag(tag)?;
        self.check_devfn_free(parent, devfn, tag)?;

        let id = FunctionId(self.nodes.len());
        debug!("{}: attached below {} at devfn {:02x}", tag, parent_tag, devfn);
        self.nodes.push(TopologyNode {
            tag: tag.to_string(),
            bus_owner: parent,
            devfn,
            function: Arc::new(Mutex::new(function)),
        });
        Ok(id)
    }

    pub fn function(&self, id: FunctionId) -> Result<Arc<Mutex<PciFunction>>> {
        Ok(self.node(id)?.function.clone())
    }

    pub fn tag(&self, id: FunctionId) -> Option<&str> {
        self.nodes.get(id.0).map(|n| n.tag.as_str())
    }

    pub fn devfn(&self, id: FunctionId) -> Option<u8> {
        self.nodes.get(id.0).map(|n| n.devfn)
    }

    /// The bridge owning the bus of `id`, None for the root bus owner.
    pub fn parent(&self, id: FunctionId) -> Option<FunctionId> {
        self.nodes
            .get(id.0)
            .map(|n| n.bus_owner)
            .filter(|owner| *owner != id)
    }

    pub fn find_by_tag(&self, tag: &str) -> Option<FunctionId> {
        self.nodes
            .iter()
            .position(|n| n.tag == tag)
            .map(FunctionId)
    }

    pub fn ids(&self) -> impl Iterator<Item = FunctionId> + '_ {
        (0..self.nodes.len()).map(FunctionId)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_bridge(&self, id: FunctionId) -> Result<bool> {
        Ok(self.node(id)?.function.lock().unwrap().is_bridge())
    }

    /// Every function carrying bridge state, in registration order.
    pub fn bridges(&self) -> Vec<FunctionId> {
        self.ids()
            .filter(|id| self.is_bridge(*id).unwrap_or(false))
            .collect()
    }

    /// Functions living on the secondary bus of `bus_owner`, with their devfn.
    pub(crate) fn children_of(&self, bus_owner: FunctionId) -> Vec<(u8, FunctionId)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.bus_owner == bus_owner)
            .map(|(i, n)| (n.devfn, FunctionId(i)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach() {
        let mut topo = PciTopology::new();
        let host = topo.add_root("pci:00.0", PciFunction::new_host("host")).unwrap();
        let isa = topo.attach(host, "pci:07.0", PciFunction::new("isa")).unwrap();
        let bridge = topo.attach(host, "pci:1e.0", PciFunction::new_bridge("bridge")).unwrap();
        let nic = topo
            .attach(bridge, "pci:1e.0:03.1", PciFunction::new("nic"))
            .unwrap();

        assert_eq!(topo.len(), 4);
        assert_eq!(topo.devfn(isa), Some(0x38));
        assert_eq!(topo.devfn(nic), Some(0x19));
        assert_eq!(topo.parent(host), None);
        assert_eq!(topo.parent(nic), Some(bridge));
        assert_eq!(topo.find_by_tag("pci:07.0"), Some(isa));
        assert_eq!(topo.tag(bridge), Some("pci:1e.0"));
        assert_eq!(topo.bridges(), vec![host, bridge]);

        let mut children = topo.children_of(host);
        children.sort();
        assert_eq!(children, vec![(0x00, host), (0x38, isa), (0xf0, bridge)]);
    }

    #[test]
    fn test_attach_errors() {
        let mut topo = PciTopology::new();
        assert!(topo.add_root("pci:00.0", PciFunction::new("dev")).is_err());

        let host = topo.add_root("pci:00.0", PciFunction::new_host("host")).unwrap();
        let dev = topo.attach(host, "pci:01.0", PciFunction::new("dev")).unwrap();

        // Host bridge already occupies 00.0 on its own bus.
        assert!(topo.attach(host, "pci:00.0", PciFunction::new("dup")).is_err());
        assert!(topo.attach(host, "pci:01.0", PciFunction::new("dup")).is_err());
        assert!(topo.attach(dev, "pci:01.0:00.0", PciFunction::new("child")).is_err());
        assert!(topo.attach(host, "pci:1.0", PciFunction::new("bad")).is_err());
        assert!(topo.function(FunctionId(10)).is_err());
    }
}
