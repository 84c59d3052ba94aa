use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use safety_guard::SafetyRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use uuid::Uuid;

use servo_bus::{ControlTable, MockBus, Param, ParamValue, ServoBus, ServoId};
use servo_control::{
    self as control, Actuator, ActuatorHandle, ActuatorServices, Controller, ControllerHandle,
    ControllerServices, LocalBus, MetricsHub, PositionCommand,
};

#[derive(Parser, Debug)]
#[command(
    name = "servo",
    version,
    about = "Serial-bus servo controller CLI",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available bus ports
    Ports,
    /// Ping every id on a bus and list the servos that answer
    Scan {
        /// Port; `mock` or `mock:N` for the simulated bus
        #[arg(long, default_value = "mock")]
        port: String,
        #[arg(long, default_value_t = 1_000_000)]
        baud: u32,
        /// Highest id to probe
        #[arg(long, default_value_t = 20)]
        max_id: u8,
    },
    /// Read one parameter by name
    Get {
        #[arg(long, default_value = "mock")]
        port: String,
        #[arg(long)]
        id: u8,
        /// Parameter name, e.g. present_voltage
        #[arg(long)]
        param: String,
        /// Print the raw register value instead of physical units
        #[arg(long, action = ArgAction::SetTrue)]
        raw: bool,
    },
    /// Write one parameter by name
    Set {
        #[arg(long, default_value = "mock")]
        port: String,
        #[arg(long)]
        id: u8,
        #[arg(long)]
        param: String,
        /// true/false, an integer, or a float
        #[arg(long)]
        value: String,
    },
    /// Validate a robot description YAML
    Validate {
        #[arg(long)]
        file: String,
        /// Print the parsed description as JSON
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Run a scripted arm/move/disarm session on the simulated bus
    Demo {
        #[arg(long, default_value = "configs/arm.yaml")]
        file: String,
        /// Time to let each move settle
        #[arg(long, default_value_t = 500)]
        step_ms: u64,
        /// Targets as fractions of each joint's half-range
        #[arg(long, value_delimiter = ',', default_value = "0.5,-0.5,0.0")]
        sweep: Vec<f64>,
        /// Print prometheus metrics at the end
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ports => ports(),
        Commands::Scan {
            port,
            baud,
            max_id,
        } => scan(&port, baud, max_id),
        Commands::Get {
            port,
            id,
            param,
            raw,
        } => get(&port, id, &param, raw),
        Commands::Set {
            port,
            id,
            param,
            value,
        } => set(&port, id, &param, &value),
        Commands::Validate { file, json } => validate(&file, json),
        Commands::Demo {
            file,
            step_ms,
            sweep,
            metrics,
        } => demo(&file, Duration::from_millis(step_ms), &sweep, metrics).await,
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn open(port: &str, baud: u32) -> Result<MockBus> {
    MockBus::open(port, baud, ControlTable::sts3215())
        .with_context(|| format!("opening bus {port}"))
}

fn servo_id(raw: u8) -> Result<ServoId> {
    ServoId::new(raw).with_context(|| format!("invalid servo id {raw} (expected 1..=253)"))
}

fn ports() -> Result<()> {
    for port in MockBus::list_ports()? {
        println!("{}\t{}", port.name, port.driver);
    }
    Ok(())
}

fn scan(port: &str, baud: u32, max_id: u8) -> Result<()> {
    let mut bus = open(port, baud)?;
    let mut found = 0;
    for raw in 1..=max_id.min(ServoId::MAX) {
        let id = servo_id(raw)?;
        if let Ok(status) = bus.ping(id) {
            let model = bus
                .read(id, Param::ModelNumber)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| "?".to_string());
            println!("{id}\tmodel={model}\tstatus=0x{:02X}", status.status);
            found += 1;
        }
    }
    println!("found {found} servo(s) on {port}");
    bus.stop();
    Ok(())
}

fn parse_value(s: &str) -> Result<ParamValue> {
    if let Ok(b) = s.parse::<bool>() {
        return Ok(ParamValue::Bool(b));
    }
    if let Ok(i) = s.parse::<i64>() {
        return Ok(ParamValue::Int(i));
    }
    s.parse::<f64>()
        .map(ParamValue::Float)
        .with_context(|| format!("not a bool, integer or float: {s}"))
}

fn get(port: &str, id: u8, param: &str, raw: bool) -> Result<()> {
    let mut bus = open(port, 1_000_000)?;
    let id = servo_id(id)?;
    let param: Param = param.parse()?;
    if raw {
        println!("{}", bus.read_raw(id, param)?);
    } else {
        println!("{}", bus.read(id, param)?);
    }
    Ok(())
}

fn set(port: &str, id: u8, param: &str, value: &str) -> Result<()> {
    let mut bus = open(port, 1_000_000)?;
    let id = servo_id(id)?;
    let param: Param = param.parse()?;
    let value = parse_value(value)?;
    let category = bus.control_table().spec(param)?.category;
    bus.write(id, param, value, true)?;
    println!("ok: {param} = {value} ({category:?})");
    Ok(())
}

fn validate(file: &str, json: bool) -> Result<()> {
    let desc = control::load_description_file(file)?;
    println!(
        "ok: {} ({} joints, {} controllers, {} actuators)",
        desc.robot,
        desc.joints.len(),
        desc.controllers.len(),
        desc.actuators.len()
    );
    if json {
        println!("{}", serde_json::to_string_pretty(&desc)?);
    }
    Ok(())
}

async fn demo(file: &str, step: Duration, sweep: &[f64], print_metrics: bool) -> Result<()> {
    let desc = control::load_description_file(file)?;
    let model = desc.model();

    let safety = Arc::new(SafetyRegistry::new());
    safety.set_event_callback(|event| {
        println!("safety\t{}\t{}", event.event_type, event.message);
    });
    let messages = Arc::new(LocalBus::new());
    let hub = MetricsHub::new();

    let mut tap = messages.tap();
    let printer = tokio::spawn(async move {
        loop {
            match tap.recv().await {
                Ok(env) => println!(
                    "{}\t{}",
                    env.topic,
                    serde_json::to_string(&env.message).unwrap_or_default()
                ),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut controllers: BTreeMap<String, ControllerHandle> = BTreeMap::new();
    for spec in &desc.controllers {
        let services = ControllerServices {
            safety: safety.clone(),
            messages: messages.clone(),
            metrics: hub.controller(&spec.name).map_err(anyhow::Error::msg)?,
        };
        let handle = Controller::start::<MockBus>(desc.controller_config(spec), services)
            .with_context(|| format!("starting controller {}", spec.name))?;
        controllers.insert(spec.name.clone(), handle);
    }

    let mut actuators: Vec<ActuatorHandle> = Vec::new();
    for spec in &desc.actuators {
        let controller = controllers
            .get(&spec.controller)
            .with_context(|| format!("no controller named {}", spec.controller))?;
        let services = ActuatorServices {
            safety: safety.clone(),
            messages: messages.clone(),
        };
        let handle = Actuator::start(
            desc.actuator_config(spec),
            &model,
            controller.clone(),
            services,
        )
        .await
        .with_context(|| format!("starting actuator {}", spec.joint))?;
        actuators.push(handle);
    }
    info!(
        controllers = controllers.len(),
        actuators = actuators.len(),
        "demo ready"
    );

    tokio::time::sleep(step).await;
    safety.arm();
    tokio::time::sleep(step).await;

    for fraction in sweep {
        for actuator in &actuators {
            let state = actuator.state().await?;
            let target = state.center_angle + fraction * state.range / 2.0;
            let motion = actuator
                .call(PositionCommand::with_correlation(target, Uuid::new_v4()))
                .await
                .with_context(|| format!("moving {}", actuator.joint()))?;
            info!(
                joint = actuator.joint(),
                from = motion.initial_position,
                to = motion.target_position,
                "move started"
            );
        }
        tokio::time::sleep(step).await;
    }

    let report = safety.disarm();
    println!(
        "disarmed: {} hook(s) run, {} failed",
        report.hooks_run,
        report.failed.len()
    );

    for actuator in &actuators {
        actuator.stop().await?;
    }
    for controller in controllers.values() {
        controller.stop().await?;
    }
    printer.abort();

    if print_metrics {
        print!("{}", hub.encode_text());
    }
    Ok(())
}
