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

use anyhow::Result;
use nix::time::{clock_gettime, ClockId};

use crate::UtilError;

pub const NANOSECONDS_PER_SECOND: u64 = 1_000_000_000;

/// Get the realtime clock as `(seconds, nanoseconds)`.
pub fn gettime() -> Result<(u64, u64)> {
    let ts = clock_gettime(ClockId::CLOCK_REALTIME).map_err(|e| UtilError::GetTime(e as i32))?;
    Ok((ts.tv_sec() as u64, ts.tv_nsec() as u64))
}

/// Split seconds since the epoch into local
/// `[year, month, day, hour, minute, second]`.
///
/// Returns all zeros if the conversion fails.
pub fn get_format_time(sec: i64) -> [i32; 6] {
    match local_time(sec) {
        Ok(tm) => [
            tm.tm_year + 1900,
            tm.tm_mon + 1,
            tm.tm_mday,
            tm.tm_hour,
            tm.tm_min,
            tm.tm_sec,
        ],
        Err(_) => [0; 6],
    }
}

fn local_time(sec: i64) -> Result<libc::tm> {
    let time: libc::time_t = sec as libc::time_t;
    // SAFETY: tm is plain old data, zero is a valid bit pattern.
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    // SAFETY: both pointers are valid for the duration of the call.
    let ret = unsafe { libc::localtime_r(&time, &mut tm) };
    if ret.is_null() {
        return Err(UtilError::LocalTime(sec).into());
    }
    Ok(tm)
}
