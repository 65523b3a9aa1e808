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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("AddressSpace")]
    AddressSpace {
        #[from]
        source: address_space::error::AddressSpaceError,
    },
    #[error("PciErr")]
    PciErr {
        #[from]
        source: pci::error::PciError,
    },
    #[error("Util")]
    Util {
        #[from]
        source: util::error::UtilError,
    },
    #[error("JsonSerde")]
    JsonSerde {
        #[from]
        source: serde_json::Error,
    },
    #[error("Io")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Input {0} string's length must be no more than {1}.")]
    StringLengthTooLong(String, usize),
    #[error("Invalid parameter \'{0}\' for \'{1}\'")]
    InvalidParam(String, String),
    #[error("Input id \'{0}\' for {1} repeat.")]
    IdRepeat(String, String),
    #[error("Parent \'{0}\' of function \'{1}\' is not a bridge declared before it")]
    UnknownParent(String, String),
}
