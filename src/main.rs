//! huddle -- console group chat over a serverless peer-to-peer group.
//!
//! Reads chat lines from stdin and prints group events to stdout; logs go
//! to stderr.  Ctrl-C, SIGTERM, `/quit` or end of input announce the
//! departure to the group before exiting.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::info;

use huddle::config::{load_config, Config, LoggingConfig};
use huddle::{AutoApprove, GroupEvent, JoinApprover, Member, Node};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "huddle", version, about = "Serverless peer-to-peer group chat")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Username to join with.
    #[arg(short, long)]
    username: Option<String>,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the listening port.
    #[arg(short, long)]
    port: Option<u16>,

    /// host:port of any existing member.  Omit to found a new group.
    #[arg(short, long)]
    join: Option<String>,

    /// Ask before admitting each join request.
    #[arg(long)]
    confirm_joins: bool,
}

/// Asks the operator on the console whether to admit a newcomer.  The
/// answer is the next line typed; no answer within the timeout declines.
struct ConsoleApprover {
    pending: Arc<Mutex<Option<oneshot::Sender<bool>>>>,
    gate: tokio::sync::Mutex<()>,
    timeout: Duration,
}

impl JoinApprover for ConsoleApprover {
    fn approve(&self, candidate: Member) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            // One question at a time.
            let _turn = self.gate.lock().await;
            let (tx, rx) = oneshot::channel();
            *self.pending.lock().expect("mutex poisoned") = Some(tx);
            println!(
                "{} ({}:{}) wants to join. Accept? [y/n]",
                candidate.username, candidate.address, candidate.port
            );

            let answer = tokio::time::timeout(self.timeout, rx).await;
            self.pending.lock().expect("mutex poisoned").take();
            match answer {
                Ok(Ok(accepted)) => accepted,
                _ => {
                    println!("No answer, declined {}.", candidate.username);
                    false
                }
            }
        })
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(username) = &cli.username {
        config.node.username = username.clone();
    }
    if let Some(host) = &cli.host {
        config.node.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.node.port = port;
    }
    if let Some(join) = &cli.join {
        config.group.join = Some(join.clone());
    }
    if cli.confirm_joins {
        config.group.auto_accept = false;
    }
}

fn print_event(event: GroupEvent) {
    match event {
        GroupEvent::MessageReceived(message) => println!("{message}"),
        GroupEvent::MemberJoined(member) => println!("* {} joined.", member.username),
        GroupEvent::MemberLeft(member) => println!("* {} left.", member.username),
        GroupEvent::CoordinatorChanged(member) => {
            println!("* {} is the coordinator.", member.username)
        }
        GroupEvent::Notice(text) => println!("* {text}"),
    }
}

fn print_members(node: &Node) {
    let me = node.me();
    println!("* {} (you, {})", me, node.role());
    for member in node.roster() {
        println!("* {member}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &cli);
    init_tracing(&config.logging);

    if config.observability.metrics {
        huddle::metrics::init_metrics()?;
        huddle::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let pending = Arc::new(Mutex::new(None));
    let approver: Arc<dyn JoinApprover> = if config.group.auto_accept {
        Arc::new(AutoApprove)
    } else {
        Arc::new(ConsoleApprover {
            pending: pending.clone(),
            gate: tokio::sync::Mutex::new(()),
            timeout: config.network.join_timeout(),
        })
    };

    let (node, mut events) = Node::start(config, approver).await.map_err(|e| {
        if e.is_retryable() {
            anyhow::anyhow!(
                "{} ({}); try another join target, username or port",
                e,
                e.code()
            )
        } else {
            anyhow::anyhow!("{} ({})", e, e.code())
        }
    })?;
    println!(
        "* You are {} on {}. Type /members to list the group, /quit to leave.",
        node.me(),
        node.local_addr()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => break,
            Some(event) = events.recv() => print_event(event),
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim();

                let answer = pending.lock().expect("mutex poisoned").take();
                if let Some(answer) = answer {
                    let _ = answer.send(matches!(line, "y" | "Y" | "yes"));
                    continue;
                }

                match line {
                    "" => {}
                    "/quit" => break,
                    "/members" => print_members(&node),
                    text => {
                        let message = node.submit(text)?;
                        println!("{message}");
                    }
                }
            }
        }
    }

    node.leave().await;
    info!("huddle shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, leaving group");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, leaving group");
        },
    }
}
