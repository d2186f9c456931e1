//! Vigor Synchronization Service (vigorsrv)
//!
//! Keeps one Vigor ventilation unit in sync over Modbus and reports its state.

mod config;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use vigor_modbus::{Engine, EngineState, SemanticValue};

#[derive(Parser, Debug)]
#[command(name = "vigorsrv", version, about = "Vigor ventilation unit synchronization service")]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, default_value = "vigor.yaml")]
    config: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Poll one cycle, print the readings and exit
    #[arg(long)]
    once: bool,

    /// Write a field after startup (repeatable)
    #[arg(long = "write", value_name = "FIELD=VALUE", value_parser = parse_assignment)]
    writes: Vec<(String, String)>,

    /// Trigger an action after startup (repeatable)
    #[arg(long = "action", value_name = "NAME")]
    actions: Vec<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

fn parse_assignment(s: &str) -> std::result::Result<(String, String), String> {
    let (field, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got '{s}'"))?;
    let field = field.trim();
    if field.is_empty() {
        return Err(format!("missing field name in '{s}'"));
    }
    Ok((field.to_string(), value.trim().to_string()))
}

/// Numbers are passed as numbers, anything else as a label
fn parse_value(raw: &str) -> SemanticValue {
    if let Ok(n) = raw.parse::<i64>() {
        SemanticValue::Integer(n)
    } else if let Ok(f) = raw.parse::<f64>() {
        SemanticValue::Float(f)
    } else {
        SemanticValue::Text(raw.to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, !args.no_color)?;

    let config = config::load(&args.config)?;
    if args.validate {
        println!("{}", serde_yaml::to_string(&config)?);
        info!("Validation completed successfully");
        return Ok(());
    }

    let poll_interval = config.sync.poll_interval();
    let engine = Engine::start(config)
        .await
        .context("Failed to start engine")?;

    let result = run(&engine, &args, poll_interval).await;
    engine.close().await;
    result
}

async fn run(engine: &Engine, args: &Args, poll_interval: std::time::Duration) -> Result<()> {
    for (field, value) in &args.writes {
        let ack = engine
            .submit_write(field, parse_value(value))
            .await
            .with_context(|| format!("Write {field}={value} failed"))?;
        info!("Wrote {}={} (register {}={})", field, value, ack.address, ack.raw);
    }
    for action in &args.actions {
        engine
            .trigger_action(action)
            .await
            .with_context(|| format!("Action {action} failed"))?;
        info!("Triggered {}", action);
    }

    if args.once {
        engine.refresh().await.context("Poll failed")?;
        print_readings(engine)?;
        return Ok(());
    }

    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reported_cycle = 0;
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                return Ok(());
            },
            _ = ticker.tick() => {},
        }

        let status = engine.status();
        match status.state {
            EngineState::Closed => {
                warn!("Engine closed unexpectedly");
                return Ok(());
            },
            EngineState::LinkDown => {
                warn!("Link down after {} failed cycles; reconnecting", status.consecutive_failures);
                if let Err(e) = engine.reconnect().await {
                    error!("Reconnect failed: {}", e);
                }
            },
            EngineState::Running => {
                let cycle = engine.snapshot().cycle();
                if cycle != reported_cycle {
                    reported_cycle = cycle;
                    report(engine, cycle);
                }
            },
        }
    }
}

fn reading(engine: &Engine, name: &str) -> String {
    match engine.read(name) {
        Ok(Some(reading)) => match reading.unit {
            Some(unit) => format!("{} {}", reading.current(), unit),
            None => reading.current().to_string(),
        },
        _ => "-".to_string(),
    }
}

fn report(engine: &Engine, cycle: u64) {
    info!(
        "Cycle {}: mode {}, function {}, outside {}, dwelling {}, supply {}, filter {}",
        cycle,
        reading(engine, "airflow_mode"),
        reading(engine, "active_function"),
        reading(engine, "outside_temperature"),
        reading(engine, "dwelling_temperature"),
        reading(engine, "supply_airflow_actual"),
        reading(engine, "filter_status"),
    );
}

fn print_readings(engine: &Engine) -> Result<()> {
    let readings: BTreeMap<&str, String> = engine
        .readings()
        .into_iter()
        .map(|r| {
            let value = match r.unit {
                Some(unit) => format!("{} {}", r.current(), unit),
                None => r.current().to_string(),
            };
            (r.field, value)
        })
        .collect();
    println!("{}", serde_yaml::to_string(&readings)?);
    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on Unix
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("desired_flow_rate=200").unwrap(),
            ("desired_flow_rate".to_string(), "200".to_string())
        );
        assert_eq!(
            parse_assignment("airflow_mode = High").unwrap().1,
            "High"
        );
        assert!(parse_assignment("standby").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("200"), SemanticValue::Integer(200));
        assert_eq!(parse_value("22.5"), SemanticValue::Float(22.5));
        assert_eq!(parse_value("Open"), SemanticValue::Text("Open".to_string()));
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "vigorsrv",
            "--config",
            "/etc/vigor.toml",
            "--write",
            "standby=Normal",
            "--write",
            "desired_flow_rate=150",
            "--action",
            "filter_reset",
            "--once",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/vigor.toml"));
        assert_eq!(args.writes.len(), 2);
        assert_eq!(args.actions, vec!["filter_reset".to_string()]);
        assert!(args.once);
        assert!(!args.validate);
    }
}
