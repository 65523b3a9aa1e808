// Copyright (c) 2022 Huawei Technologies Co.,Ltd. All rights reserved.
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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AddressSpaceError {
    #[error("Util")]
    Util {
        #[from]
        source: util::error::UtilError,
    },
    #[error("Address overflows, addr is 0x{0:X}")]
    Overflow(u64),
    #[error("Range 0x{0:X} size 0x{1:X} lies outside address space {2} of size 0x{3:X}")]
    OutOfSpace(u64, u64, String, u64),
    #[error("Empty range at 0x{0:X} in address space {1}")]
    EmptyRange(u64, String),
    #[error("Failed to access IO-type region, region base 0x{0:X}, offset 0x{1:X}, size 0x{2:X}")]
    IoAccess(u64, u64, u64),
    #[error("Wrong region type, {0:#?}")]
    RegionType(crate::RegionType),
    #[error("Invalid offset: offset 0x{0:X}, data length 0x{1:X}, region size 0x{2:X}")]
    InvalidOffset(u64, u64, u64),
}
