//! Broadcast CLI - session lifecycle driver
//!
//! Commands:
//!   broadcast demo                 → Scripted wallet + messaging lifecycle, JSON transcript
//!   broadcast serve [--port N]     → HTTP read-model/actions over simulated collaborators
//!   broadcast networks             → Print the network registry
//!
//! Options:
//!   --app <name>         App name (default: BROADCAST_APP or "broadcast")
//!   --provider <kind>    injected | relay-pairing
//!   --account <address>  Account the simulated wallet authorizes
//!   --json               Compact JSON (default for non-tty)
//!   --pretty             Pretty-print JSON (default for tty)
//!
//! A `.env` file in the working directory is loaded first; variables already
//! set in the environment win.

use anyhow::{anyhow, Context};
use broadcast_core::chain::POLYGON;
use broadcast_core::config::load_env_file;
use broadcast_core::logging::init_logging;
use broadcast_core::sim::{SimulatedNetwork, SimulatedWallet};
use broadcast_core::{CoreConfig, Orchestrator, ProviderKind, WalletProvider};
use serde_json::{json, Value};
use std::env;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DEMO_ACCOUNT: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
const DEMO_PEER: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";

fn main() {
    match load_env_file(Path::new(".env")) {
        Ok(applied) => debug!(applied, "loaded .env"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => eprintln!("warning: could not read .env: {e}"),
    }
    init_logging();

    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);

    if opts.help {
        print_usage();
        return;
    }

    if opts.version {
        println!("broadcast {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let result = match opts.command.as_deref() {
        Some("demo") => cmd_demo(&opts),
        Some("serve") => cmd_serve(&opts),
        Some("networks") => cmd_networks(&opts),
        Some(cmd) => Err(anyhow!("Unknown command: {cmd}")),
        None => {
            print_usage();
            return;
        }
    };

    let pretty = opts.pretty || (!opts.json && std::io::stdout().is_terminal());
    match result {
        Ok(output) => println!("{}", render(&output, pretty)),
        Err(e) => {
            eprintln!("{}", render(&json!({"error": format!("{e:#}")}), pretty));
            std::process::exit(1);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    rendered.unwrap_or_else(|_| value.to_string())
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    app: Option<String>,
    provider: Option<String>,
    account: Option<String>,
    port: Option<u16>,
    json: bool,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];
            match arg.as_str() {
                "--help" | "-h" => opts.help = true,
                "--version" | "-V" => opts.version = true,
                "--json" => opts.json = true,
                "--pretty" => opts.pretty = true,
                "--app" | "-a" => {
                    if i + 1 < args.len() {
                        opts.app = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--provider" => {
                    if i + 1 < args.len() {
                        opts.provider = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--account" => {
                    if i + 1 < args.len() {
                        opts.account = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--port" | "-p" => {
                    if i + 1 < args.len() {
                        opts.port = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                _ if !arg.starts_with('-') => positional.push(arg.clone()),
                _ => {}
            }
            i += 1;
        }

        opts.command = positional.first().cloned();
        opts
    }

    fn config(&self) -> anyhow::Result<CoreConfig> {
        let mut config = CoreConfig::from_env();
        if let Some(app) = &self.app {
            config.app = app.clone();
        }
        if let Some(raw) = &self.provider {
            let kind = ProviderKind::from_str(raw).ok_or_else(|| anyhow!("unknown provider kind '{raw}'"))?;
            config = config.with_default_provider(kind);
        }
        Ok(config)
    }
}

fn print_usage() {
    eprintln!(
        r#"broadcast - wallet and messaging session driver

USAGE:
    broadcast <command> [options]

COMMANDS:
    demo        Run a scripted session against simulated collaborators
    serve       Serve the HTTP surface (simulated collaborators)
    networks    Print the network registry

OPTIONS:
    -a, --app <name>         App name
        --provider <kind>    injected | relay-pairing
        --account <address>  Account for the simulated wallet
    -p, --port <port>        Server port (default: 8080)
        --json               Compact JSON output
        --pretty             Pretty JSON output
    -h, --help               Show this help
    -V, --version            Show version

ENVIRONMENT:
    BROADCAST_APP, BROADCAST_PROVIDER, BROADCAST_CONNECT_TIMEOUT_MS,
    BROADCAST_HANDSHAKE_TIMEOUT_MS, BROADCAST_AUTO_CONNECT,
    BROADCAST_MESSAGING_ENV, BROADCAST_LOG_JSON"#
    );
}

/// Orchestrator over one simulated wallet per provider kind and a shared
/// simulated network.
fn simulated_core(opts: &ParsedArgs) -> anyhow::Result<(Orchestrator, SimulatedNetwork)> {
    let config = opts.config()?;
    let account = opts.account.clone().unwrap_or_else(|| DEMO_ACCOUNT.to_string());
    let providers: Vec<Arc<dyn WalletProvider>> = [ProviderKind::Injected, ProviderKind::RelayPairing]
        .into_iter()
        .map(|kind| {
            Arc::new(
                SimulatedWallet::new(kind)
                    .with_account(&account)
                    .with_balance(&account, 1, "1.25")
                    .with_balance(&account, POLYGON, "42.0")
                    .with_name(&account, "broadcast.eth"),
            ) as Arc<dyn WalletProvider>
        })
        .collect();
    let network = SimulatedNetwork::new()
        .with_env(config.messaging_env)
        .with_registered(DEMO_PEER)
        .with_history(DEMO_PEER, &account, "gm, welcome to Broadcast");
    let core = Orchestrator::from_parts(config, providers, Arc::new(network.clone()));
    Ok((core, network))
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create runtime")
}

fn cmd_networks(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let config = opts.config()?;
    Ok(serde_json::to_value(&config.networks)?)
}

fn cmd_demo(opts: &ParsedArgs) -> anyhow::Result<Value> {
    let (core, network) = simulated_core(opts)?;
    runtime()?.block_on(async move {
        core.start();
        let mut transcript = Vec::new();

        let session = core.connect_wallet(None).await?;
        info!(address = %session.address, "demo wallet connected");
        transcript.push(json!({"step": "connect_wallet", "session": session}));

        let mut messaging = core.messaging().watch();
        tokio::time::timeout(Duration::from_secs(5), messaging.wait_for(|m| m.is_connected || m.error.is_some()))
            .await
            .context("messaging did not connect in time")?
            .context("messaging state channel closed")?;
        transcript.push(json!({"step": "messaging_ready", "messaging": core.messaging().state()}));

        core.switch_network(POLYGON).await?;
        transcript.push(json!({"step": "switch_network", "wallet": core.wallet().state()}));

        let reachable = core.can_message(DEMO_PEER).await;
        let sent = core.send_message(DEMO_PEER, "hello from the demo").await?;
        transcript.push(json!({"step": "send_message", "reachable": reachable, "message": sent}));

        network.inject(DEMO_PEER, &session.address, "reply from peer");
        let history = core.get_messages(DEMO_PEER, Some(10)).await?;
        transcript.push(json!({"step": "get_messages", "messages": history}));

        let signature = core.sign_message("Broadcast demo").await?;
        transcript.push(json!({"step": "sign_message", "signature": signature}));

        core.disconnect_wallet().await;
        transcript.push(json!({"step": "disconnect_wallet", "snapshot": core.snapshot()}));

        Ok(json!({"app": core.config().app, "transcript": transcript}))
    })
}

fn cmd_serve(opts: &ParsedArgs) -> anyhow::Result<Value> {
    use broadcast_core::install_signal_handlers;
    use broadcast_core::server::create_router_with_name;

    let port = opts.port.unwrap_or(8080);
    let (core, _network) = simulated_core(opts)?;
    let app_name = core.config().app.clone();

    runtime()?.block_on(async move {
        let shutdown = install_signal_handlers();
        core.start();

        let router = create_router_with_name(core.clone(), &app_name);
        let addr = format!("0.0.0.0:{port}");

        info!("Broadcast server listening on http://{}", addr);
        info!("Endpoints:");
        info!("  GET  /health              - Health check");
        info!("  GET  /state               - Wallet + messaging snapshot");
        info!("  POST /wallet/connect      - Connect wallet");
        debug!("  GET  /messages/:peer      - Message history");
        debug!("  POST /messages            - Send message");

        let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("Failed to bind {addr}"))?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.wait())
            .await
            .context("Server error")?;

        info!("Shutdown signal received, disconnecting sessions...");
        core.disconnect_wallet().await;
        Ok(json!({"status": "stopped"}))
    })
}
