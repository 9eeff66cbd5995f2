use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::Read as _;
use std::sync::Arc;
use tracing::{error, info, warn};

use studio_relay::command_proxy::{CommandProxy, COMMAND_TIMEOUT};
use studio_relay::config::{default_data_dir, EndpointConfig, RelayServerConfig};
use studio_relay::control::{ControlAction, ControlPolicy, RemoteControlFsm};
use studio_relay::endpoint::{pairing_flow::PairingFlow, qr, EndpointEvent, RelayClient};
use studio_relay::identity;
use studio_relay::protocol::{ClientFrame, InnerFrame};
use studio_relay::server;
use studio_relay::storage::Storage;

const RELAY_CONFIG_SETTING: &str = "relay_config";

#[derive(Parser)]
#[command(name = "studio-relay", about = "Paired-device E2EE relay", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "STUDIO_RELAY_LOG")]
    log: Option<String>,

    /// Data directory for config, SQLite database, and device identity
    #[arg(long, global = true, env = "STUDIO_RELAY_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server.
    ///
    /// Holds no plaintext and no long-lived device state beyond the current
    /// process: connections, pairing offers, and the pair graph all live in
    /// memory and are rebuilt from scratch on restart.
    ///
    /// Examples:
    ///   studio-relay serve --port 4300
    Serve {
        #[arg(long, env = "STUDIO_RELAY_PORT")]
        port: Option<u16>,
        #[arg(long, env = "STUDIO_RELAY_JWT_SECRET")]
        jwt_secret: Option<String>,
    },
    /// Run an endpoint: connect to the relay, restore any paired sessions,
    /// and stay connected until killed.
    ///
    /// On a desktop this also drives the remote-control state machine and
    /// the command-proxy dispatcher; on a mobile it only surfaces decrypted
    /// frames as log lines, since there is no UI in this build to hand them
    /// to.
    ///
    /// Examples:
    ///   studio-relay run --device-type desktop --server-url wss://relay.example.com --token eyJ...
    Run {
        #[arg(long, value_parser = ["desktop", "mobile"])]
        device_type: String,
        #[arg(long, env = "STUDIO_RELAY_SERVER_URL")]
        server_url: Option<String>,
        #[arg(long, env = "STUDIO_RELAY_TOKEN")]
        token: Option<String>,
        #[arg(long)]
        device_name: Option<String>,
    },
    /// Desktop-only: generate a pairing offer and print its QR code.
    ///
    /// Blocks until a mobile claims the code, then falls through into the
    /// same long-lived loop as `run`.
    ///
    /// Examples:
    ///   studio-relay pair --server-url wss://relay.example.com --token eyJ...
    Pair {
        #[arg(long, env = "STUDIO_RELAY_SERVER_URL")]
        server_url: Option<String>,
        #[arg(long, env = "STUDIO_RELAY_TOKEN")]
        token: Option<String>,
        #[arg(long)]
        device_name: Option<String>,
    },
    /// Mobile-only: claim a pairing offer from a QR payload read as JSON on
    /// stdin (a stand-in for the camera-scan UI). Saves the relay URL and
    /// token so a later `run` needs no flags.
    ///
    /// Examples:
    ///   studio-relay claim < qr-payload.json
    Claim {
        #[arg(long)]
        device_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).compact().init();

    let data_dir = args.data_dir.clone();

    let result = match args.command {
        Some(Command::Serve { port, jwt_secret }) => run_serve(port, data_dir, args.log, jwt_secret).await,
        Some(Command::Run { device_type, server_url, token, device_name }) => {
            run_endpoint(device_type, server_url, token, device_name, data_dir, args.log).await
        }
        Some(Command::Pair { server_url, token, device_name }) => {
            run_pair(server_url, token, device_name, data_dir, args.log).await
        }
        Some(Command::Claim { device_name }) => run_claim(device_name, data_dir, args.log).await,
        None => {
            eprintln!("no subcommand given — run `studio-relay --help`");
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(2);
    }
    Ok(())
}

async fn run_serve(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
    jwt_secret: Option<String>,
) -> Result<()> {
    let config = RelayServerConfig::new(port, data_dir, log, jwt_secret);
    server::run(config).await
}

/// Opens storage and identity, layers in any previously saved `relay_config`
/// (mobile) when flags are absent, builds the `RelayClient`, and restores
/// persisted E2EE sessions. Does not start the connection loop.
async fn bootstrap_endpoint(
    device_type: &'static str,
    server_url: Option<String>,
    token: Option<String>,
    device_name: Option<String>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
) -> Result<(Arc<RelayClient>, tokio::sync::mpsc::UnboundedReceiver<EndpointEvent>, Storage)> {
    let dir = data_dir.unwrap_or_else(default_data_dir);
    let storage = Storage::new(&dir).await.context("failed to open endpoint database")?;
    let device_id = identity::get_or_create(&storage).await?;

    let (server_url, token) = if server_url.is_some() && token.is_some() {
        (server_url, token)
    } else if let Some(saved) = storage.get_setting(RELAY_CONFIG_SETTING).await? {
        let parsed: serde_json::Value = serde_json::from_str(&saved).unwrap_or_default();
        (
            server_url.or_else(|| parsed.get("serverUrl").and_then(|v| v.as_str()).map(String::from)),
            token.or_else(|| parsed.get("token").and_then(|v| v.as_str()).map(String::from)),
        )
    } else {
        (server_url, token)
    };

    let config = EndpointConfig::new(server_url, token, device_name, Some(dir), log)
        .context("failed to load endpoint configuration")?;

    let (relay, events) = RelayClient::new(config, storage.clone(), device_id.clone(), device_type);
    let relay = Arc::new(relay);

    for device in storage.list_paired_devices().await? {
        if let Some(session) = storage.load_session(&device.device_id).await? {
            relay.install_session(&device.device_id, session).await?;
        }
    }

    Ok((relay, events, storage))
}

async fn save_relay_config(storage: &Storage, server_url: &str, token: &str) -> Result<()> {
    let payload = json!({ "serverUrl": server_url, "token": token }).to_string();
    storage.set_setting(RELAY_CONFIG_SETTING, &payload).await
}

async fn run_endpoint(
    device_type: String,
    server_url: Option<String>,
    token: Option<String>,
    device_name: Option<String>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
) -> Result<()> {
    let device_type = parse_device_type(&device_type)?;
    let (relay, events, storage) =
        bootstrap_endpoint(device_type, server_url, token, device_name, data_dir, log).await?;
    info!(device_id = relay.device_id(), device_type, "endpoint: starting");

    let run_task = tokio::spawn(Arc::clone(&relay).run());
    drive_endpoint(relay, events, storage, device_type).await;
    run_task.abort();
    Ok(())
}

async fn run_pair(
    server_url: Option<String>,
    token: Option<String>,
    device_name: Option<String>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
) -> Result<()> {
    let (relay, mut events, storage) =
        bootstrap_endpoint("desktop", server_url.clone(), token.clone(), device_name.clone(), data_dir, log).await?;
    let run_task = tokio::spawn(Arc::clone(&relay).run());

    let server_url = server_url
        .or_else(|| Some(relay.config().server_url.clone()))
        .unwrap_or_default();
    let token = token.or_else(|| Some(relay.config().token.clone())).unwrap_or_default();

    let pairing_flow = Arc::new(PairingFlow::new());
    let qr_payload = pairing_flow
        .desktop_create_offer(
            &relay,
            server_url,
            token,
            relay.device_id().to_string(),
            device_name,
        )
        .await
        .context("failed to create pairing offer")?;

    println!("{}", qr::render_terminal(&qr_payload)?);
    println!("Waiting for a mobile device to scan this code...");
    println!("Raw payload (if you'd rather pipe it to `claim` on another machine):");
    println!("{}", qr::encode_json(&qr_payload)?);

    let command_proxy = CommandProxy::new(Arc::clone(&relay));
    loop {
        match events.recv().await {
            Some(EndpointEvent::PairingAccepted { device_id, public_key, device_name }) => {
                pairing_flow
                    .desktop_on_pairing_accepted(&relay, &device_id, &public_key)
                    .await?;
                storage.upsert_paired_device(&device_id, device_name.as_deref(), "mobile").await?;
                info!(peer = %device_id, "pair: mobile device paired");
                println!("Paired with mobile device {device_id}.");
                break;
            }
            Some(other) => handle_desktop_event(&relay, &storage, None, &command_proxy, other).await,
            None => anyhow::bail!("relay event channel closed before pairing completed"),
        }
    }

    drive_endpoint(relay, events, storage, "desktop").await;
    run_task.abort();
    Ok(())
}

async fn run_claim(
    device_name: Option<String>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
) -> Result<()> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read QR payload from stdin")?;
    let qr_payload = qr::decode_json(raw.trim()).context("invalid QR payload")?;

    let (relay, mut events, storage) = bootstrap_endpoint(
        "mobile",
        Some(qr_payload.s.clone()),
        Some(qr_payload.t.clone()),
        device_name,
        data_dir,
        log,
    )
    .await?;
    let run_task = tokio::spawn(Arc::clone(&relay).run());

    let pairing_flow = Arc::new(PairingFlow::new());
    pairing_flow
        .mobile_claim(&relay, &qr_payload)
        .await
        .context("failed to send claim-pairing frame")?;

    loop {
        match events.recv().await {
            Some(EndpointEvent::PairingAccepted { device_id, .. }) if device_id == qr_payload.d => {
                pairing_flow.mobile_on_pairing_accepted(&relay, &device_id).await?;
                storage.upsert_paired_device(&device_id, None, "desktop").await?;
                save_relay_config(&storage, &qr_payload.s, &qr_payload.t).await?;
                info!(peer = %device_id, "claim: paired with desktop");
                println!("Paired with desktop device {device_id}.");
                break;
            }
            Some(EndpointEvent::ServerError { message }) => {
                anyhow::bail!("relay rejected claim: {message}");
            }
            Some(_) => {}
            None => anyhow::bail!("relay event channel closed before claim completed"),
        }
    }

    drive_endpoint(relay, events, storage, "mobile").await;
    run_task.abort();
    Ok(())
}

fn parse_device_type(s: &str) -> Result<&'static str> {
    match s {
        "desktop" => Ok("desktop"),
        "mobile" => Ok("mobile"),
        other => anyhow::bail!("unknown device type {other}"),
    }
}

/// The steady-state event loop shared by `run`, `pair` (after handshake),
/// and `claim` (after handshake). Runs until the relay's event channel
/// closes, which only happens if the process is being torn down.
async fn drive_endpoint(
    relay: Arc<RelayClient>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<EndpointEvent>,
    storage: Storage,
    device_type: &'static str,
) {
    let pairing_flow = Arc::new(PairingFlow::new());
    let command_proxy = CommandProxy::new(Arc::clone(&relay));
    let control = if device_type == "desktop" {
        let cfg = relay.config();
        Some(Arc::new(RemoteControlFsm::new(ControlPolicy {
            allow_remote_control: cfg.allow_remote_control,
            unlock_secret: cfg.unlock_secret.clone(),
            auto_lock_timeout_ms: cfg.auto_lock_timeout_ms,
        })))
    } else {
        None
    };

    while let Some(event) = events.recv().await {
        match device_type {
            "desktop" => {
                if let EndpointEvent::PairingAccepted { device_id, public_key, device_name } = &event {
                    if let Err(e) = pairing_flow
                        .desktop_on_pairing_accepted(&relay, device_id, public_key)
                        .await
                    {
                        warn!("pairing: late desktop handshake failed: {e:#}");
                    } else {
                        let _ = storage.upsert_paired_device(device_id, device_name.as_deref(), "mobile").await;
                    }
                    continue;
                }
                handle_desktop_event(&relay, &storage, control.as_ref(), &command_proxy, event).await;
            }
            _ => handle_mobile_event(&relay, &pairing_flow, &storage, event).await,
        }
    }
}

async fn handle_desktop_event(
    relay: &Arc<RelayClient>,
    storage: &Storage,
    control: Option<&Arc<RemoteControlFsm>>,
    command_proxy: &CommandProxy,
    event: EndpointEvent,
) {
    match event {
        EndpointEvent::Decrypted { from, plaintext } => {
            let inner: InnerFrame = match serde_json::from_slice(&plaintext) {
                Ok(f) => f,
                Err(e) => {
                    warn!(peer = %from, "command-proxy: unparseable inner frame: {e}");
                    return;
                }
            };
            if let InnerFrame::Command { id, channel, args } = inner {
                let response = match tokio::time::timeout(
                    COMMAND_TIMEOUT,
                    command_proxy.handle_command(&from, &id, &channel, &args),
                )
                .await
                {
                    Ok(response) => response,
                    Err(_) => {
                        warn!(peer = %from, channel, "command-proxy: handler exceeded 15s budget");
                        InnerFrame::Response {
                            id: id.clone(),
                            result: None,
                            error: Some("command timed out".to_string()),
                        }
                    }
                };
                if let Ok(bytes) = serde_json::to_vec(&response) {
                    if let Err(e) = relay.send_encrypted(&from, &bytes).await {
                        warn!(peer = %from, "command-proxy: failed to send response: {e:#}");
                    }
                }
            }
        }
        EndpointEvent::ControlRequest { from, device_name } => {
            let Some(control) = control else { return };
            let has_session = relay.has_session(&from).await;
            let action = control.on_control_request(from.clone(), device_name, has_session).await;
            let accepted = matches!(action, ControlAction::AcceptRequest);
            let _ = relay.sender().send(ClientFrame::ControlAck { to: from.clone(), accepted });
            if accepted {
                let grace = control.grace_delay();
                if !grace.is_zero() {
                    let control = Arc::clone(control);
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        control.enter_remote_after_grace(from, None).await;
                    });
                }
            }
        }
        EndpointEvent::DeviceOffline { device_id } => {
            // Liveness signal only: the peer dropped its connection, but the
            // pair itself (and its derived session key) is still valid, so
            // only the control state needs to release it.
            if let Some(control) = control {
                control.force_local(&device_id).await;
            }
            info!(peer = %device_id, "relay: peer offline");
        }
        EndpointEvent::PairingRevoked { device_id } => {
            if let Some(control) = control {
                control.force_local(&device_id).await;
            }
            let _ = storage.remove_paired_device(&device_id).await;
        }
        EndpointEvent::ReauthRequired { peer } => {
            warn!(peer = %peer, "endpoint: session invalidated, re-pair required");
        }
        EndpointEvent::ServerError { message } => warn!("relay: server error: {message}"),
        EndpointEvent::DeviceOnline { device_id } => info!(peer = %device_id, "relay: peer online"),
        EndpointEvent::PairingAccepted { .. } | EndpointEvent::ControlAck { .. } | EndpointEvent::ControlRevoked { .. } => {}
    }
}

async fn handle_mobile_event(
    relay: &Arc<RelayClient>,
    pairing_flow: &Arc<PairingFlow>,
    storage: &Storage,
    event: EndpointEvent,
) {
    match event {
        EndpointEvent::PairingAccepted { device_id, public_key: _, device_name } => {
            if let Err(e) = pairing_flow.mobile_on_pairing_accepted(relay, &device_id).await {
                warn!("pairing: late mobile handshake failed: {e:#}");
            } else {
                let _ = storage.upsert_paired_device(&device_id, device_name.as_deref(), "desktop").await;
            }
        }
        EndpointEvent::Decrypted { from, plaintext } => {
            info!(peer = %from, bytes = plaintext.len(), "endpoint: decrypted frame (no local UI to hand it to)");
        }
        EndpointEvent::ControlAck { from, accepted } => info!(peer = %from, accepted, "control: ack received"),
        EndpointEvent::ControlRevoked { from } => info!(peer = %from, "control: revoked"),
        EndpointEvent::DeviceOffline { device_id } => info!(peer = %device_id, "relay: peer offline"),
        EndpointEvent::PairingRevoked { device_id } => {
            let _ = storage.remove_paired_device(&device_id).await;
        }
        EndpointEvent::ReauthRequired { peer } => warn!(peer = %peer, "endpoint: session invalidated, re-pair required"),
        EndpointEvent::ServerError { message } => warn!("relay: server error: {message}"),
        EndpointEvent::DeviceOnline { device_id } => info!(peer = %device_id, "relay: peer online"),
        EndpointEvent::ControlRequest { .. } => {}
    }
}
