use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;
use teslabms_lib::manager::{BalanceAction, BusManager};
use teslabms_lib::module::BatteryModule;
use teslabms_lib::pack::PackState;
use teslabms_lib::params::ParamTable;
use teslabms_lib::protocol::CELLS_PER_MODULE;
use teslabms_lib::transport::{Clock, Uart};

use crate::{commandline, mqtt};

/// Everything published after one tick.
#[derive(Debug, Serialize)]
struct Snapshot<'a> {
    timestamp: String,
    balancing: bool,
    pack: &'a PackState,
    params: &'a ParamTable,
    modules: Vec<&'a BatteryModule>,
}

impl<'a> Snapshot<'a> {
    fn new<U: Uart, C: Clock>(
        bus: &'a BusManager<U, C>,
        params: &'a ParamTable,
        action: BalanceAction,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            balancing: action == BalanceAction::Balance,
            pack: bus.pack(),
            params,
            modules: bus.existing_modules().collect(),
        }
    }
}

/// Flattens `value` into one `(topic, payload)` pair per leaf below `base_topic`.
fn simple_format_messages(base_topic: &str, value: &serde_json::Value) -> Vec<(String, String)> {
    fn collect(topic: String, val: &serde_json::Value, messages: &mut Vec<(String, String)>) {
        match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    collect(format!("{topic}/{k}"), v, messages);
                }
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    collect(format!("{topic}/{i}"), v, messages);
                }
            }
            serde_json::Value::String(s) => messages.push((topic, s.clone())),
            serde_json::Value::Number(n) => messages.push((topic, n.to_string())),
            serde_json::Value::Bool(b) => messages.push((topic, b.to_string())),
            serde_json::Value::Null => {
                // Do not publish null values
            }
        }
    }
    let mut messages = Vec::new();
    collect(base_topic.to_string(), value, &mut messages);
    messages
}

pub fn print_modules<U: Uart, C: Clock>(bus: &BusManager<U, C>) {
    for module in bus.existing_modules() {
        println!(
            "Module {}: {:7.3}V cells={:.3?} temperatures={:.1?}",
            module.address(),
            module.module_voltage(),
            module.cell_voltages(),
            [module.temperature(0), module.temperature(1)]
        );
        let seen: Vec<String> = (0..CELLS_PER_MODULE)
            .map(|cell| {
                format!(
                    "{:.3}..{:.3}",
                    module.lowest_cell_voltage(cell),
                    module.highest_cell_voltage(cell)
                )
            })
            .collect();
        println!("  seen cell range: {}", seen.join(" "));
    }
}

pub fn print_pack(pack: &PackState) {
    println!(
        "Pack: {:.3}V, {} modules, {} cells, SOC {:.0}%",
        pack.pack_voltage,
        pack.module_count,
        pack.total_cells,
        pack.estimated_soc()
    );
    println!(
        "  cell min={:.3}V max={:.3}V avg={:.3}V",
        pack.low_cell_voltage,
        pack.high_cell_voltage,
        pack.average_cell_voltage()
    );
    println!(
        "  temperature min={:.1} max={:.1} avg={:.1}",
        pack.low_temperature, pack.high_temperature, pack.avg_temperature
    );
}

fn publish_messages(publisher: &mqtt::MqttPublisher, messages: &[(String, String)]) {
    for (topic, payload) in messages {
        if let Err(e) = publisher.publish(topic, payload) {
            error!("Failed to publish message to topic {topic}: {e}");
        }
    }
}

pub fn run<U: Uart, C: Clock>(
    mut bus: BusManager<U, C>,
    mut params: ParamTable,
    output: commandline::DaemonOutput,
    interval: std::time::Duration,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, interval={interval:?}");

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;

    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        let publisher =
            mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?;
        info!("MQTT Publisher created successfully.");
        mqtt_publisher = Some(publisher);
    }

    loop {
        let Some(action) = bus.tick(&mut params) else {
            warn!("Bus is not polling, nothing to output");
            std::thread::sleep(interval);
            continue;
        };

        match &output {
            commandline::DaemonOutput::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                print_pack(bus.pack());
                print_modules(&bus);
                println!("Balancing: {}", action == BalanceAction::Balance);
                println!("--------------------------");
            }
            commandline::DaemonOutput::Mqtt { format, .. } => {
                if let Some(publisher) = &mqtt_publisher {
                    match format {
                        commandline::MqttFormat::Json => {
                            let snapshot = Snapshot::new(&bus, &params, action);
                            match serde_json::to_string(&snapshot) {
                                Ok(json_payload) => {
                                    if let Err(e) =
                                        publisher.publish(publisher.topic(), &json_payload)
                                    {
                                        error!("Failed to publish data to MQTT: {e:?}");
                                    }
                                }
                                Err(e) => {
                                    error!("Failed to serialize data to JSON string: {e}");
                                }
                            }
                        }
                        commandline::MqttFormat::Simple => match serde_json::to_value(&params) {
                            Ok(mut value) => {
                                if let serde_json::Value::Object(map) = &mut value {
                                    let balancing = action == BalanceAction::Balance;
                                    map.insert("Balancing".to_string(), json!(balancing));
                                }
                                let messages = simple_format_messages(publisher.topic(), &value);
                                publish_messages(publisher, &messages);
                            }
                            Err(e) => error!("Failed to serialize parameters: {e}"),
                        },
                    }
                } else {
                    warn!(
                        "MQTT output selected, but publisher is not initialized. Skipping publish."
                    );
                }
            }
        }
        std::thread::sleep(interval);
    }
}
