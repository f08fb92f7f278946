use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stockflow_agent::{
    BrokerService, CheckpointStore, InMemoryCheckpointStore, RunResult, SqliteCheckpointStore,
};
use stockflow_core::approval::ApprovalDecision;
use stockflow_core::config::AppConfig;
use stockflow_core::event::EventBus;
use stockflow_core::types::{AgentEvent, ChatMessage, PurchaseDetails};
use stockflow_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "stockflow", version, about = "Stock-broker agent with human purchase approval")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stockflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the broker agent something
    Chat {
        /// Do not prompt for purchase approval; leave the run suspended
        #[arg(long)]
        no_confirm: bool,
        /// The message to send (read from stdin if empty)
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Approve a suspended purchase
    Approve {
        /// Resume token, or a unique prefix of it
        token: String,
    },
    /// Reject a suspended purchase
    Reject {
        /// Resume token, or a unique prefix of it
        token: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// List runs waiting for approval
    Pending,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stockflow=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let event_bus = Arc::new(EventBus::default());
    let service = build_service(&config, event_bus.clone())?;

    match cli.command {
        Commands::Chat { no_confirm, prompt } => {
            let text = if prompt.is_empty() {
                io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                prompt.join(" ")
            };
            if text.trim().is_empty() {
                anyhow::bail!("nothing to send: pass a prompt or pipe one on stdin");
            }
            chat(&service, &event_bus, text, no_confirm).await?;
        }
        Commands::Approve { token } => {
            let token = resolve_token(&service, &token)?;
            let printer = spawn_event_printer(&event_bus);
            let result = service.resume_run(&token, ApprovalDecision::Approved).await;
            printer.abort();
            print_result(&result?);
        }
        Commands::Reject { token, reason } => {
            let token = resolve_token(&service, &token)?;
            let printer = spawn_event_printer(&event_bus);
            let result = service
                .resume_run(&token, ApprovalDecision::Rejected { reason })
                .await;
            printer.abort();
            print_result(&result?);
        }
        Commands::Pending => {
            let pending = service.pending()?;
            if pending.is_empty() {
                println!("No runs waiting for approval.");
            }
            for run in pending {
                let purchase = run
                    .purchase
                    .as_ref()
                    .map(describe_purchase)
                    .unwrap_or_else(|| "(no purchase details)".to_string());
                println!(
                    "{}  {}  {}",
                    run.token,
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    purchase
                );
            }
        }
        Commands::Config => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".stockflow").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    Ok(AppConfig::from_env()?)
}

fn build_service(config: &AppConfig, event_bus: Arc<EventBus>) -> anyhow::Result<BrokerService> {
    let llm: Arc<dyn stockflow_core::traits::LlmClient> =
        Arc::from(stockflow_llm::client_from_config(config)?);
    let tools = Arc::new(ToolRegistry::with_config(config, None));

    let store: Arc<dyn CheckpointStore> = if config.checkpoint.enabled {
        let path = config.checkpoint_path();
        info!(path = %path.display(), "Using persistent checkpoint store");
        Arc::new(SqliteCheckpointStore::open(&path)?)
    } else {
        Arc::new(InMemoryCheckpointStore::new())
    };

    Ok(BrokerService::from_config(
        config, llm, tools, store, event_bus,
    )?)
}

async fn chat(
    service: &BrokerService,
    event_bus: &EventBus,
    text: String,
    no_confirm: bool,
) -> anyhow::Result<()> {
    let printer = spawn_event_printer(event_bus);
    let mut result = service.start_run(vec![ChatMessage::user(text)]).await;

    loop {
        let current = match result {
            Ok(r) => r,
            Err(e) => {
                printer.abort();
                return Err(e.into());
            }
        };
        let RunResult::AwaitingApproval {
            ref token,
            ref pending_purchase,
            ..
        } = current
        else {
            printer.abort();
            print_result(&current);
            return Ok(());
        };

        if no_confirm {
            printer.abort();
            print_result(&current);
            return Ok(());
        }

        let prompt = format!("Purchase {}?", describe_purchase(pending_purchase));
        let approved = tokio::task::spawn_blocking(move || {
            dialoguer::Confirm::new()
                .with_prompt(prompt)
                .default(false)
                .interact()
                .unwrap_or(false)
        })
        .await?;

        let decision = if approved {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Rejected {
                reason: Some("declined by user".into()),
            }
        };
        result = service.resume_run(token, decision).await;
    }
}

fn resolve_token(service: &BrokerService, prefix: &str) -> anyhow::Result<String> {
    service
        .find_by_prefix(prefix)?
        .ok_or_else(|| anyhow::anyhow!("no suspended run matches '{}'", prefix))
}

fn spawn_event_printer(event_bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                AgentEvent::ToolStart { name, .. } => {
                    eprintln!("[tool: {}]", name);
                }
                AgentEvent::ToolEnd { name, result } => {
                    if result.is_error {
                        eprintln!("[{}: ERROR] {}", name, truncate(&result.content, 200));
                    } else {
                        eprintln!("[{}: ok] {}", name, truncate(&result.content, 200));
                    }
                }
                AgentEvent::ApprovalResolved { approved, .. } => {
                    eprintln!("[approval: {}]", if approved { "approved" } else { "declined" });
                }
                AgentEvent::RunError { error, .. } => {
                    eprintln!("[error] {}", error);
                }
                _ => {}
            }
        }
    })
}

fn print_result(result: &RunResult) {
    match result {
        RunResult::Completed { .. } => {
            if let Some(reply) = result.reply() {
                println!("{}", reply);
            }
        }
        RunResult::AwaitingApproval {
            token,
            pending_purchase,
            prompt_for_user,
            ..
        } => {
            println!("{}", prompt_for_user);
            println!("  {}", describe_purchase(pending_purchase));
            println!("  approve: stockflow approve {}", token);
            println!("  reject:  stockflow reject {}", token);
        }
    }
}

fn describe_purchase(p: &PurchaseDetails) -> String {
    format!(
        "{} share(s) of {} at up to ${}/share",
        p.quantity, p.ticker, p.max_purchase_price
    )
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
