use crate::{config, mqtt};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Probe every address and list the boards that answer
    Discover,
    /// Reset all board addresses and assign new ones in chain order
    Renumber,
    /// Clear latched alerts and faults on every board
    ClearFaults,
    /// Show alert, fault, over- and under-voltage bitmasks of every board
    Status,
    /// Run a single poll cycle and show the pack and module readings
    Poll,
    /// Run in daemon mode, periodically polling the pack and outputting the readings
    Daemon {
        /// Output destination for the readings
        #[command(subcommand)]
        output: DaemonOutput,
        /// Poll interval (e.g., "100ms", "1s")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "100ms")]
        interval: Duration,
        /// Renumber the boards on start up instead of probing the existing addresses
        #[clap(long, action)]
        renumber: bool,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously poll the pack and print the readings to the standard output (console).
    Console,
    /// Continuously poll the pack and publish the readings to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "Tesla Model S/X battery module bus command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Bus configuration file with the balancing settings
    #[arg(short, long, default_value_t = config::BusConfig::DEFAULT_CONFIG_FILE.to_string())]
    pub config: String,

    #[command(subcommand)]
    pub command: CliCommands,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_defaults() {
        let args = CliArgs::parse_from(["teslabms", "daemon", "console"]);
        assert_eq!(args.config, "teslabms.yaml");
        assert_eq!(
            args.command,
            CliCommands::Daemon {
                output: DaemonOutput::Console,
                interval: Duration::from_millis(100),
                renumber: false,
            }
        );
    }

    #[test]
    fn daemon_mqtt_options() {
        let args = CliArgs::parse_from([
            "teslabms",
            "--device",
            "/dev/ttyS1",
            "daemon",
            "--interval",
            "1s",
            "--renumber",
            "mqtt",
            "--format",
            "json",
        ]);
        assert_eq!(args.device, "/dev/ttyS1");
        let CliCommands::Daemon {
            output,
            interval,
            renumber,
        } = args.command
        else {
            panic!("expected daemon command");
        };
        assert_eq!(interval, Duration::from_secs(1));
        assert!(renumber);
        assert_eq!(
            output,
            DaemonOutput::Mqtt {
                config_file: "mqtt.yaml".to_string(),
                format: MqttFormat::Json,
            }
        );
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }
}
