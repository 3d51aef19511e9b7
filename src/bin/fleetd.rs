//! fleetd - Robot fleet control plane
//!
//! Runs the controller gateway, heartbeat monitor and command router, and
//! doubles as the operator client for a running daemon.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! fleetd start --config ./fleetd.toml
//!
//! # Route a command to every online wheel driver
//! fleetd route wheel-driver forward --payload '{"speed": 40}'
//!
//! # Move one servo channel
//! fleetd servo servoscontroller 2 135
//!
//! # Inspect the running daemon
//! fleetd devices
//! fleetd device servoscontroller
//! fleetd interlock
//! fleetd commands --device-type wheel-driver --status ack_error
//! fleetd connections wheels --limit 20
//! fleetd servos servo-driver
//! ```

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use fleet_core::{CommandId, CommandStatus, DeviceId, DeviceType};
use fleet_protocol::{ControlRequest, ControlResponse};
use fleetd::history::spawn_history_forwarder;
use fleetd::server::ControlContext;
use fleetd::{
    spawn_registry, CommandRouter, ConnectionRegistry, ControlServer, FleetConfig,
    GatewayContext, GatewayServer, HeartbeatMonitor, HistoryFanout, HistorySink, MemoryHistory,
    StateManager, TracingHistory,
};

/// fleetd - robot fleet control plane
#[derive(Parser, Debug)]
#[command(name = "fleetd", version, about)]
struct Args {
    /// Config file (defaults to ~/.config/fleet/fleetd.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon in the foreground
    Start,
    /// Route a named command to every online device of a type
    Route {
        device_type: String,
        command_name: String,
        /// JSON object sent as the command payload
        #[arg(short, long)]
        payload: Option<String>,
    },
    /// Move one servo channel to an angle in degrees
    Servo {
        device_type: String,
        channel: u8,
        angle: f64,
    },
    /// List every known device
    Devices,
    /// Show one device and its latest status report
    Device { device_id: String },
    /// Show whether the wheel interlock is held
    Interlock,
    /// Show one routed command and its status
    Command { command_id: String },
    /// List recently routed commands
    Commands {
        #[arg(long)]
        device_type: Option<String>,
        /// e.g. sent, no_devices, ack_success, ack_error
        #[arg(long, value_parser = parse_status)]
        status: Option<CommandStatus>,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show status reports received from a device
    States {
        device_id: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show connects and disconnects of a device
    Connections {
        device_id: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show known servo channel positions for a device type
    Servos { device_type: String },
}

fn parse_status(text: &str) -> Result<CommandStatus, String> {
    serde_json::from_value(serde_json::Value::String(text.to_string()))
        .map_err(|_| format!("unknown command status: {text}"))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        FleetConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let command = args.command.unwrap_or(Command::Start);

    let request = match command {
        Command::Start => return run_daemon(config),
        Command::Route {
            device_type,
            command_name,
            payload,
        } => {
            let payload = match payload {
                Some(text) => {
                    serde_json::from_str(&text).context("--payload is not valid JSON")?
                }
                None => serde_json::Value::Null,
            };
            ControlRequest::Route {
                device_type: DeviceType::new(device_type),
                command_name,
                payload,
            }
        }
        Command::Servo {
            device_type,
            channel,
            angle,
        } => ControlRequest::ServoAngle {
            device_type: DeviceType::new(device_type),
            channel,
            angle,
        },
        Command::Devices => ControlRequest::ListDevices,
        Command::Device { device_id } => ControlRequest::Device {
            device_id: DeviceId::new(device_id),
        },
        Command::Interlock => ControlRequest::Interlock,
        Command::Command { command_id } => ControlRequest::Command {
            command_id: CommandId::new(command_id),
        },
        Command::Commands {
            device_type,
            status,
            limit,
        } => ControlRequest::CommandLog {
            device_type: device_type.map(DeviceType::new),
            status,
            limit,
        },
        Command::States { device_id, limit } => ControlRequest::StateHistory {
            device_id: DeviceId::new(device_id),
            limit,
        },
        Command::Connections { device_id, limit } => ControlRequest::ConnectionHistory {
            device_id: DeviceId::new(device_id),
            limit,
        },
        Command::Servos { device_type } => ControlRequest::ServoState {
            device_type: DeviceType::new(device_type),
        },
    };

    let response = send_request(&config.control_socket, &request)?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if let ControlResponse::Error { .. } = response {
        process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn send_request(socket_path: &Path, request: &ControlRequest) -> Result<ControlResponse> {
    let stream = UnixStream::connect(socket_path).await.with_context(|| {
        format!(
            "Failed to connect to {} (is fleetd running?)",
            socket_path.display()
        )
    })?;
    let (reader, mut writer) = stream.into_split();

    let json = serde_json::to_string(request)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut line = String::new();
    let read = BufReader::new(reader).read_line(&mut line).await?;
    if read == 0 {
        bail!("Daemon closed the control connection without answering");
    }

    serde_json::from_str(line.trim()).context("Daemon sent an unreadable response")
}

#[tokio::main]
async fn run_daemon(config: FleetConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fleetd=info".parse()?)
                .add_directive("fleet_core=info".parse()?)
                .add_directive("fleet_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "fleetd starting"
    );

    let actuation = Arc::new(config.actuation_model()?);
    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = spawn_registry();
    let connections = ConnectionRegistry::new();
    let ledger = Arc::new(MemoryHistory::new(config.history_capacity));
    let sinks: Vec<Arc<dyn HistorySink>> = vec![Arc::new(TracingHistory), ledger.clone()];
    let history: Arc<dyn HistorySink> = Arc::new(HistoryFanout::new(sinks));
    let state = Arc::new(StateManager::new());
    info!("Device registry started");

    let router = CommandRouter::new(
        registry.clone(),
        connections.clone(),
        history.clone(),
        state.clone(),
        actuation.clone(),
        config.router_config(),
        cancel_token.clone(),
    );

    let monitor = HeartbeatMonitor::new(
        registry.clone(),
        connections.clone(),
        config.monitor_config(),
    );
    let mut tasks = vec![
        ("monitor", monitor.spawn(cancel_token.clone())),
        (
            "history forwarder",
            spawn_history_forwarder(&registry, history.clone(), cancel_token.clone()),
        ),
    ];

    let control_ctx = ControlContext {
        router,
        registry: registry.clone(),
        history: ledger,
        state: state.clone(),
    };
    let control = ControlServer::new(
        config.control_socket.clone(),
        control_ctx,
        cancel_token.clone(),
    );
    tasks.push((
        "control socket",
        tokio::spawn(async move {
            if let Err(e) = control.run().await {
                error!(error = %e, "Control socket error");
            }
        }),
    ));

    let ctx = GatewayContext::new(
        registry,
        connections,
        history,
        state,
        actuation,
        config.gateway_config(),
    );
    let result = match GatewayServer::bind(&config.listen, ctx, cancel_token.clone()).await {
        Ok(gateway) => gateway.run().await,
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        error!(error = %e, "Gateway error");
    }

    cancel_token.cancel();
    join_tasks(tasks).await;

    result?;
    info!("fleetd stopped");
    Ok(())
}

/// Waits for background tasks so an in-flight sweep or forward completes.
async fn join_tasks(tasks: Vec<(&'static str, JoinHandle<()>)>) {
    for (name, handle) in tasks {
        match handle.await {
            Ok(()) => debug!(task = name, "Task stopped"),
            Err(e) => error!(task = name, error = %e, "Task failed"),
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
