//! clawdbot CLI: workspace init, one-shot and interactive agent turns,
//! session management, cron administration, and the `up` daemon that
//! wires the gateway, scheduler, bridge, and discovery together.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use clawdbot_auth::PairingStore;
use clawdbot_bridge::{BridgeServer, BridgeServerConfig};
use clawdbot_bus::EventBus;
use clawdbot_core::{
    AgentRunner, AgentWorkspace, Config, HeartbeatDriver, ReplyDispatcher, Runtime, RunParams,
    ThinkLevel,
};
use clawdbot_discovery::{Beacon, BeaconPublisher, UdpMulticastTransport};
use clawdbot_gateway::{spawn_bridge_listener, spawn_cron_listener, spawn_wake_listener, Gateway};
use clawdbot_provider::{register_builtin_backends, BackendRegistry};
use clawdbot_scheduler::{spawn_completion_listener, CronScheduler, JobInput, JobPatch};
use clawdbot_schema::{SessionKey, Topic, WakeMode};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "clawdbot", version, about = "Personal-assistant gateway")]
struct Cli {
    /// Config file path (overrides CLAWD_CONFIG_PATH).
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Materialize the agent workspace and bootstrap files.
    Init {
        #[arg(short = 'd', long)]
        dir: Option<PathBuf>,
    },
    /// Interactive chat. `/quit` exits; `/new` and `/reset` are local.
    Chat {
        #[arg(short = 's', long)]
        session: Option<String>,
        #[arg(short = 't', long)]
        thinking: Option<String>,
    },
    /// One-shot agent turn.
    Agent {
        #[arg(short = 'm', long)]
        message: String,
        #[arg(short = 's', long)]
        session: Option<String>,
        #[arg(short = 't', long)]
        thinking: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List sessions.
    Sessions,
    /// Reset a session (new id, zeroed counters).
    Reset {
        #[arg(short = 's', long)]
        session: Option<String>,
    },
    /// Cron job administration.
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },
    /// Run the gateway daemon: cron, heartbeat, bridge, discovery.
    Up,
}

#[derive(Subcommand)]
enum CronAction {
    Status,
    List {
        #[arg(long)]
        include_disabled: bool,
    },
    /// Add a job from a JSON spec (see docs for the shape).
    Add {
        #[arg(long)]
        job: String,
    },
    Update {
        id: Uuid,
        #[arg(long)]
        patch: String,
    },
    Remove {
        id: Uuid,
    },
    /// Fire a job now (skipped if already running).
    Run {
        id: Uuid,
    },
    /// Wake the agent (optionally with a message).
    Wake {
        #[arg(long, default_value = "now")]
        mode: String,
        #[arg(long)]
        text: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn build_runner(runtime: &Runtime, config: &Config) -> Arc<AgentRunner> {
    let mut backends = BackendRegistry::new();
    register_builtin_backends(&mut backends);
    Arc::new(AgentRunner::new(
        "clawd",
        runtime.clone(),
        config.clone(),
        backends,
    ))
}

async fn run(cli: Cli) -> Result<()> {
    let runtime = Runtime::from_env();
    let config = Config::load_or_default(cli.config.as_deref(), runtime.state_dir())?;

    match cli.command {
        Command::Init { dir } => {
            let workspace = match dir {
                Some(dir) => AgentWorkspace::new(dir),
                None => AgentWorkspace::resolve(
                    config.agent.workspace.as_deref(),
                    runtime.profile(),
                ),
            };
            let report = workspace.ensure_bootstrap()?;
            if report.created.is_empty() {
                println!("workspace ready at {}", workspace.root().display());
            } else {
                println!(
                    "initialized {} ({})",
                    workspace.root().display(),
                    report.created.join(", ")
                );
            }
            Ok(())
        }

        Command::Agent {
            message,
            session,
            thinking,
            json,
        } => {
            let runner = build_runner(&runtime, &config);
            let mut params = RunParams::message(message);
            params.session_key = session.map(SessionKey);
            params.thinking_override = parse_thinking(thinking.as_deref())?;
            let outcome = runner.run(params).await?;

            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "response": outcome.response,
                        "sessionId": outcome.session_id,
                        "sessionKey": outcome.session_key.as_str(),
                        "model": outcome.model,
                    })
                );
            } else {
                println!("{}", outcome.response);
            }
            Ok(())
        }

        Command::Chat { session, thinking } => {
            let runner = build_runner(&runtime, &config);
            let thinking = parse_thinking(thinking.as_deref())?;
            let session_key = session
                .map(SessionKey)
                .unwrap_or_else(|| runner.main_session_key());

            let stdin = std::io::stdin();
            let mut stdout = std::io::stdout();
            loop {
                print!("> ");
                stdout.flush()?;
                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 {
                    return Ok(());
                }
                let line = line.trim();
                match line {
                    "" => continue,
                    "/quit" => return Ok(()),
                    "/new" | "/reset" => {
                        runner.sessions().reset(session_key.as_str())?;
                        println!("session reset");
                        continue;
                    }
                    _ => {}
                }
                let mut params = RunParams::message(line);
                params.session_key = Some(session_key.clone());
                params.thinking_override = thinking;
                match runner.run(params).await {
                    Ok(outcome) => println!("{}", outcome.response),
                    Err(err) => eprintln!("error: {err:#}"),
                }
            }
        }

        Command::Sessions => {
            let runner = build_runner(&runtime, &config);
            for (key, session) in runner.sessions().list() {
                println!(
                    "{key}  id={}  tokens={}  updated={}",
                    session.id, session.total_tokens, session.updated_at
                );
            }
            Ok(())
        }

        Command::Reset { session } => {
            let runner = build_runner(&runtime, &config);
            let key = session
                .map(SessionKey)
                .unwrap_or_else(|| runner.main_session_key());
            let fresh = runner.sessions().reset(key.as_str())?;
            println!("{key} reset (new id {})", fresh.id);
            Ok(())
        }

        Command::Cron { action } => {
            let bus = EventBus::new(16);
            let scheduler = CronScheduler::new(
                &runtime.cron_dir(),
                bus.publisher(),
                CancellationToken::new(),
                config.cron.max_concurrent_runs,
            );
            run_cron_action(scheduler, action).await
        }

        Command::Up => up(runtime, config).await,
    }
}

async fn run_cron_action(scheduler: CronScheduler, action: CronAction) -> Result<()> {
    match action {
        CronAction::Status => {
            let status = scheduler.status();
            println!(
                "{}",
                serde_json::json!({
                    "jobs": status.jobs,
                    "enabled": status.enabled,
                    "running": status.running,
                    "nextRunAtMs": status.next_run_at_ms,
                })
            );
        }
        CronAction::List { include_disabled } => {
            let jobs = scheduler.list(include_disabled);
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        CronAction::Add { job } => {
            let input: JobInput =
                serde_json::from_str(&job).map_err(|e| anyhow!("invalid job spec: {e}"))?;
            let job = scheduler.add(&input).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        CronAction::Update { id, patch } => {
            let patch: JobPatch =
                serde_json::from_str(&patch).map_err(|e| anyhow!("invalid patch: {e}"))?;
            let job = scheduler.update(id, &patch).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        CronAction::Remove { id } => {
            if scheduler.remove(id).await? {
                println!("removed {id}");
            } else {
                println!("no such job {id}");
            }
        }
        CronAction::Run { id } => {
            let outcome = scheduler.run_now(id).await?;
            println!("{outcome:?}");
        }
        CronAction::Wake { mode, text } => {
            let mode = match mode.as_str() {
                "now" => WakeMode::Now,
                "next-heartbeat" => WakeMode::NextHeartbeat,
                other => return Err(anyhow!("unknown wake mode: {other}")),
            };
            scheduler.wake(mode, text, Some("cli".into())).await;
            println!("wake requested");
        }
    }
    Ok(())
}

/// The long-running daemon: every subsystem on its own task, one
/// cancellation token for shutdown.
async fn up(runtime: Runtime, config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let bus = EventBus::new(64);
    let runner = build_runner(&runtime, &config);
    let pairing = Arc::new(PairingStore::open(runtime.pairing_path()));

    let scheduler = if config.cron_enabled() {
        let scheduler = Arc::new(CronScheduler::new(
            &runtime.cron_dir(),
            bus.publisher(),
            cancel.child_token(),
            config.cron.max_concurrent_runs,
        ));
        let completion_rx = bus.subscribe(Topic::CronCompleted).await;
        spawn_completion_listener(scheduler.clone(), completion_rx);
        tokio::spawn(scheduler.clone().run());
        Some(scheduler)
    } else {
        None
    };

    let gateway = Gateway::new(
        runner.clone(),
        pairing.clone(),
        scheduler.clone(),
        bus.publisher(),
    );
    spawn_cron_listener(gateway.clone(), &bus);
    spawn_wake_listener(gateway.clone(), &bus);

    // Heartbeat delivers to stdout when no chat surface is attached yet.
    let heartbeat_dispatcher = ReplyDispatcher::spawn(
        Arc::new(StdoutSink),
        Default::default(),
        Default::default(),
    );
    let heartbeat = Arc::new(HeartbeatDriver::new(
        runner.clone(),
        heartbeat_dispatcher,
        &config.heartbeat,
        cancel.child_token(),
    )?);
    tokio::spawn(heartbeat.run());

    let bridge = config.bridge_effective();
    if bridge.enabled {
        let (server, admissions) = BridgeServer::new(
            BridgeServerConfig {
                bind: bridge.bind.clone(),
                port: bridge.port,
                server_name: "clawdbot".into(),
                ..Default::default()
            },
            pairing.clone(),
            cancel.child_token(),
        );
        let listener = server.bind().await?;
        tracing::info!("bridge listening on {}:{}", bridge.bind, bridge.port);
        tokio::spawn(server.serve(listener));
        spawn_bridge_listener(gateway.clone(), admissions);

        if config.discovery_enabled() {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "clawdbot".into());
            let mut beacon = Beacon::gateway(format!("{host} Gateway"), host);
            beacon.bridge_port = Some(bridge.port);
            beacon.tailnet_dns = std::env::var("CLAWDBOT_TAILNET_DNS").ok();
            beacon.cli_path = std::env::var("CLAWDBOT_CLI_PATH").ok();
            beacon.gateway_port = std::env::var("CLAWDBOT_GATEWAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok());
            beacon.ssh_port = std::env::var("CLAWDBOT_SSH_PORT")
                .ok()
                .and_then(|p| p.parse().ok());

            let publisher = Arc::new(BeaconPublisher::new(
                Arc::new(UdpMulticastTransport::new()),
                beacon,
                bridge.port,
                config.discovery.wide_area.enabled,
                cancel.child_token(),
            ));
            tokio::spawn(publisher.run());
        }
    }

    tracing::info!("clawdbot up; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    Ok(())
}

struct StdoutSink;

#[async_trait::async_trait]
impl clawdbot_core::ReplySink for StdoutSink {
    async fn deliver(&self, reply: clawdbot_core::OutboundReply) -> Result<()> {
        println!("{}", reply.text);
        Ok(())
    }
}

fn parse_thinking(raw: Option<&str>) -> Result<Option<ThinkLevel>> {
    raw.map(str::parse).transpose()
}
