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
pub enum PciError {
    #[error("AddressSpace")]
    AddressSpace {
        #[from]
        source: address_space::error::AddressSpaceError,
    },
    #[error("Util")]
    Util {
        #[from]
        source: util::error::UtilError,
    },
    #[error("Function {0} already declares {1} banks")]
    BankOverflow(String, usize),
    #[error("Function {0}: bank size 0x{1:x} is not a multiple of 4")]
    BankSize(String, u64),
    #[error("Function {0}: no base address register slot left, {1} in use")]
    RegisterSlots(String, usize),
    #[error("Function {0} has no bank {1}")]
    InvalidBank(String, usize),
    #[error("Invalid PCI tag \"{0}\", expected a \"SS.F\" suffix")]
    InvalidTag(String),
    #[error("Devfn {0:#04x} on {1} is already occupied by {2}")]
    DevfnInUse(u8, String, String),
    #[error("Function {0} is not a bridge")]
    NotBridge(String),
    #[error("Unknown function id {0}")]
    UnknownFunction(usize),
    #[error("Not implemented: {0}")]
    Unimplemented(String),
}
