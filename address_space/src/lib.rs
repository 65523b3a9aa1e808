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

//! # Address Space
//!
//! Simulated address spaces for the emulated bus.
//!
//! An `AddressSpace` holds a flat, non-overlapping map from address ranges to
//! `Region`s. Installing a region punches a hole in whatever was mapped at
//! that range before, unmapping trims or splits the ranges it covers. Readers
//! work on an immutable snapshot of the map, so a handler may install or
//! unmap ranges while an access is in flight.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use address_space::{AddressRange, AddressSpace, GuestAddress, Region, RegionOps};
//!
//! let space = AddressSpace::new("io", 0x1_0000);
//! let latch = Arc::new(Mutex::new(0_u8));
//! let latch_w = latch.clone();
//! let ops = RegionOps {
//!     read: Arc::new(move |data: &mut [u8], _base: GuestAddress, _offset: u64| {
//!         data.fill(*latch.lock().unwrap());
//!         true
//!     }),
//!     write: Arc::new(move |data: &[u8], _base: GuestAddress, _offset: u64| {
//!         *latch_w.lock().unwrap() = data[0];
//!         true
//!     }),
//! };
//! let region = Region::init_io_region(4, ops, "latch");
//! space
//!     .install(AddressRange::from((0x80, 4)), region)
//!     .unwrap();
//!
//! space.write(&[0x5a], GuestAddress(0x80)).unwrap();
//! let mut data = [0_u8; 1];
//! space.read(&mut data, GuestAddress(0x81)).unwrap();
//! assert_eq!(data[0], 0x5a);
//! ```

pub mod error;

mod address;
mod address_space;
mod region;

pub use crate::address_space::AddressSpace;
pub use address::{AddressRange, GuestAddress};
pub use error::AddressSpaceError;
pub use region::{FlatRange, Region, RegionType};

type ReadFn = std::sync::Arc<dyn Fn(&mut [u8], GuestAddress, u64) -> bool + Send + Sync>;

type WriteFn = std::sync::Arc<dyn Fn(&[u8], GuestAddress, u64) -> bool + Send + Sync>;

/// Provide Some operations of `Region`, mainly used by Vm's devices.
///
/// Both callbacks receive the base address of the range the region is
/// installed at and the offset of the access inside the region. Returning
/// `false` means the access was not claimed.
#[derive(Clone)]
pub struct RegionOps {
    /// Read data from Region to argument `data`,
    /// return `true` if read successfully, or return `false`.
    pub read: ReadFn,
    /// Write data to Region from argument `data`,
    /// return `true` if write successfully, or return `false`.
    pub write: WriteFn,
}
