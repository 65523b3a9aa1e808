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

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use machine::config::MachineConfig;
use machine::Machine;
use util::logger;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pcemu", version = util::VERSION)]
struct Args {
    /// JSON description of the machine, the default machine if absent.
    #[arg(long)]
    config: Option<String>,
    /// Log to this file instead of stderr.
    #[arg(long = "log-file", default_value = "")]
    log_file: String,
    /// Enumerate the buses and print every function found.
    #[arg(long)]
    scan: bool,
    /// Print the memory and IO address spaces.
    #[arg(long)]
    mtree: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => {
            info!("pcemu exits normally");
            ExitCode::SUCCESS
        }
        Err(ref e) => {
            if log::log_enabled!(log::Level::Error) {
                error!("{}", format!("{:?}\r\n", e));
            } else {
                eprintln!("{}", format!("{:?}\r\n", e));
            }
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::try_parse()?;
    logger::init_log(args.log_file.clone()).with_context(|| "Failed to init logger.")?;

    let config = match &args.config {
        Some(path) => MachineConfig::from_file(path)?,
        None => MachineConfig::default(),
    };
    let machine = Machine::new(&config).with_context(|| "Failed to build machine")?;

    if args.scan {
        for entry in machine.scan_bus()? {
            println!("{}", entry);
        }
    }
    if args.mtree {
        machine.mtree();
    }
    Ok(())
}
