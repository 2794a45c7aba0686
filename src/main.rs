use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};
use teslabms_lib::manager::BusManager;
use teslabms_lib::params::ParamTable;
use teslabms_lib::serialport::SerialUart;

mod commandline;
mod config;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let bus_config = config::BusConfig::load(&args.config)
        .with_context(|| format!("Cannot load bus config '{}'", args.config))?;
    let mut params = ParamTable::new();
    bus_config.apply(&mut params);

    let transport = SerialUart::open_transport(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    let mut bus = BusManager::new(transport);

    match args.command {
        CliCommands::Discover => {
            bus.discover_sequential();
            println!("Modules found: {}", bus.found_modules());
            for module in bus.existing_modules() {
                println!("Module {}", module.address());
            }
        }
        CliCommands::Renumber => {
            bus.renumber_and_setup();
            println!("Modules addressed: {}", bus.found_modules());
        }
        CliCommands::ClearFaults => {
            bus.clear_faults();
            println!("Faults cleared");
        }
        CliCommands::Status => {
            bus.discover_sequential();
            bus.refresh_status();
            for module in bus.existing_modules() {
                println!(
                    "Module {}: alerts={:08b} faults={:08b} cov={:08b} cuv={:08b}",
                    module.address(),
                    module.alerts(),
                    module.faults(),
                    module.cov_faults(),
                    module.cuv_faults()
                );
            }
        }
        CliCommands::Poll => {
            bus.discover_sequential();
            let action = bus.tick(&mut params);
            daemon::print_pack(bus.pack());
            daemon::print_modules(&bus);
            println!("Balancing: {action:?}");
        }
        CliCommands::Daemon {
            output,
            interval,
            renumber,
        } => {
            if renumber {
                bus.renumber_and_setup();
            } else {
                bus.discover_sequential();
            }
            info!("{} modules on the bus", bus.found_modules());
            daemon::run(bus, params, output, interval)?;
        }
    }

    Ok(())
}
