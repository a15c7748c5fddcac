// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Entry point for the timefs clock file server.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use clap::Parser;
use log::error;
use timefs::bootstrap;
use timefs::config::{init_logging, Cli, Config};

fn main() {
    let cli = Cli::parse();
    let config = Config::from_cli(&cli);
    init_logging(config.log_level);
    if let Err(err) = bootstrap::run(&config) {
        error!("timefs: {err:#}");
        std::process::exit(1);
    }
}
