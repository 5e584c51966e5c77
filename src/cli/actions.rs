use anyhow::{anyhow, Result};
use serde::Serialize;
use std::time::Duration;

use clap::ArgMatches;

use super::config::BridgeBootConfig;
use crate::{
    api::genibus::{BridgeBuilder, GenibusMaster, TaskUpdate, TaskValue},
    utils::ports::enumerate_ports,
};

/// How often the foreground loop looks at Ctrl-C and the worker state.
const FOREGROUND_POLL: Duration = Duration::from_millis(200);

/// Dispatch the parsed command line.
pub fn run(matches: &ArgMatches) -> Result<()> {
    let want_json = matches.get_flag("json");

    if matches.get_flag("list-ports") {
        return list_ports(want_json);
    }
    if let Some(config_file) = matches.get_one::<String>("check-config") {
        return check_config(config_file, want_json);
    }
    if let Some(config_file) = matches.get_one::<String>("config") {
        let mut config = BridgeBootConfig::from_file(config_file)?;
        if let Some(port) = matches.get_one::<String>("port") {
            config.port_name = port.clone();
        }
        let max_cycles = matches.get_one::<u64>("cycles").copied();
        return run_bridge(&config, max_cycles, want_json);
    }

    Err(anyhow!(
        "Nothing to do. Pass --config <FILE> to run the bridge (see --help)"
    ))
}

fn list_ports(want_json: bool) -> Result<()> {
    let ports = enumerate_ports();
    if want_json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
    } else {
        for port in &ports {
            println!("{}", port.port_name);
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct DeviceSummary<'a> {
    id: &'a str,
    address: u8,
    tasks: usize,
}

#[derive(Serialize)]
struct ConfigSummary<'a> {
    port_name: &'a str,
    baud_rate: u32,
    source_address: u8,
    cycle_time_ms: u64,
    devices: Vec<DeviceSummary<'a>>,
}

fn check_config(config_file: &str, want_json: bool) -> Result<()> {
    let config = BridgeBootConfig::from_file(config_file)?;
    // builds every task, so unsupported head classes are caught here
    let devices = config.to_devices()?;

    let summary = ConfigSummary {
        port_name: &config.port_name,
        baud_rate: config.baud_rate,
        source_address: config.source_address,
        cycle_time_ms: config.tuning.cycle_time_ms,
        devices: config
            .devices
            .iter()
            .zip(&devices)
            .map(|(device, built)| DeviceSummary {
                id: &device.id,
                address: device.address,
                tasks: built.tasks().len(),
            })
            .collect(),
    };

    if want_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Configuration OK: port {} at {} baud, cycle time {} ms",
            summary.port_name, summary.baud_rate, summary.cycle_time_ms
        );
        for device in &summary.devices {
            println!(
                "  device {} at address {}: {} task(s)",
                device.id, device.address, device.tasks
            );
        }
    }
    Ok(())
}

fn format_update(update: &TaskUpdate) -> String {
    let value = match &update.value {
        TaskValue::Number(number) => number.to_string(),
        TaskValue::Text(text) => format!("{text:?}"),
        TaskValue::Unavailable => "n/a".to_string(),
    };
    format!(
        "{} {} {} ({}/{}) = {}{}",
        update.timestamp.to_rfc3339(),
        update.device_id,
        update.name,
        update.head_class,
        update.address,
        value,
        update
            .unit
            .as_deref()
            .map(|unit| format!(" {unit}"))
            .unwrap_or_default()
    )
}

fn print_update(update: &TaskUpdate, want_json: bool) -> Result<()> {
    if want_json {
        println!("{}", serde_json::to_string(update)?);
    } else {
        println!("{}", format_update(update));
    }
    Ok(())
}

/// Run the bridge in the foreground until Ctrl-C, the cycle limit, or the worker ending on its own.
fn run_bridge(config: &BridgeBootConfig, max_cycles: Option<u64>, want_json: bool) -> Result<()> {
    let mut builder = BridgeBuilder::new()
        .with_port(&config.port_name)
        .with_baud_rate(config.baud_rate)
        .with_source_address(config.source_address)
        .with_tuning(config.tuning.clone());
    for device in config.to_devices()? {
        builder = builder.add_device(device);
    }
    let master = GenibusMaster::spawn(builder.build()?, max_cycles)?;

    let (interrupt_tx, interrupt_rx) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .map_err(|err| anyhow!("Failed to install Ctrl-C handler: {err}"))?;

    let mut stopping = false;
    loop {
        if !stopping && interrupt_rx.try_recv().is_ok() {
            log::info!("Interrupted, stopping the bridge");
            stopping = true;
            if let Err(err) = master.stop() {
                log::debug!("Bridge already stopped: {}", err);
            }
        }
        match master.receiver().recv_timeout(FOREGROUND_POLL) {
            Ok(update) => print_update(&update, want_json)?,
            Err(flume::RecvTimeoutError::Timeout) => {
                if master.is_finished() {
                    break;
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    while let Some(update) = master.try_recv() {
        print_update(&update, want_json)?;
    }
    master.join()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_format_update() {
        let update = TaskUpdate {
            device_id: "pump".to_string(),
            head_class: 2,
            address: 37,
            name: "head".to_string(),
            value: TaskValue::Number(2.5),
            unit: Some("m".to_string()),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        };
        assert_eq!(
            format_update(&update),
            "2024-01-02T03:04:05+00:00 pump head (2/37) = 2.5 m"
        );

        let unavailable = TaskUpdate {
            value: TaskValue::Unavailable,
            unit: None,
            ..update
        };
        assert!(format_update(&unavailable).ends_with("= n/a"));
    }
}
