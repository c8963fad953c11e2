mod sim;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use switchyard_core::domain::{AgentId, AgentSpec, MessagePayload, Priority, Recipient, TaskPayload};
use switchyard_core::impls::MemoryResultSink;
use switchyard_core::{DispatcherBuilder, SwitchyardConfig};

use crate::sim::{LoggingInbox, SimulatedExecutor};

#[derive(Parser)]
#[command(name = "switchyard", about = "Priority task dispatcher for capability-tagged agents")]
struct Cli {
    /// Path to a TOML config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload against simulated agents and print the final status
    Demo {
        #[arg(long, default_value_t = 20)]
        tasks: usize,
        #[arg(long, default_value_t = 3)]
        agents: usize,
        /// Concurrent tasks per agent
        #[arg(long, default_value_t = 2)]
        capacity: u32,
        /// Comma-separated categories
        #[arg(long, value_delimiter = ',', default_value = "ocr,draft,review")]
        categories: Vec<String>,
        /// Share of invokes failing transiently
        #[arg(long, default_value_t = 0.2)]
        fail_rate: f64,
        /// Share of invokes failing permanently
        #[arg(long, default_value_t = 0.02)]
        permanent_rate: f64,
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,
        /// Give up waiting for the workload after this long
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
    /// Validate the config file and print the effective configuration
    CheckConfig,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SwitchyardConfig> {
    match path {
        Some(path) => SwitchyardConfig::load(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(SwitchyardConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Demo {
            tasks,
            agents,
            capacity,
            categories,
            fail_rate,
            permanent_rate,
            latency_ms,
            timeout_secs,
        } => {
            anyhow::ensure!(!categories.is_empty(), "at least one category is required");
            anyhow::ensure!(agents > 0, "at least one agent is required");
            let demo = Demo {
                tasks,
                agents,
                capacity,
                categories,
                executor: SimulatedExecutor {
                    latency: Duration::from_millis(latency_ms),
                    transient_rate: fail_rate,
                    permanent_rate,
                },
                timeout: Duration::from_secs(timeout_secs),
            };
            demo.run(config).await
        }
    }
}

struct Demo {
    tasks: usize,
    agents: usize,
    capacity: u32,
    categories: Vec<String>,
    executor: SimulatedExecutor,
    timeout: Duration,
}

impl Demo {
    async fn run(self, config: SwitchyardConfig) -> anyhow::Result<()> {
        let sink = Arc::new(MemoryResultSink::new());
        let expected: Vec<&str> = self.categories.iter().map(String::as_str).collect();

        // agent i covers categories i and i+1 (round robin)
        let mut builder = DispatcherBuilder::new(Arc::new(self.executor))
            .config(config)
            .result_sink(sink.clone());
        for i in 0..self.agents {
            let id = format!("agent-{i}");
            let n = self.categories.len();
            let spec = AgentSpec::new(id.clone(), self.capacity)
                .capability(self.categories[i % n].clone())
                .capability(self.categories[(i + 1) % n].clone());
            builder = builder
                .agent(spec)
                .subscriber(id, Arc::new(LoggingInbox));
        }
        let dispatcher = builder.expect_categories(&expected).build()?;

        let mut events = dispatcher.subscribe_events();
        let event_log = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                debug!(?event, "lifecycle event");
            }
        });

        let handle = dispatcher.spawn();

        for i in 0..self.tasks {
            let (priority, category) = {
                let mut rng = rand::thread_rng();
                let priority = Priority::ALL[rng.gen_range(0..Priority::ALL.len())];
                let category = self.categories[rng.gen_range(0..self.categories.len())].clone();
                (priority, category)
            };
            dispatcher
                .enqueue(
                    category,
                    priority,
                    TaskPayload::prompt(format!("demo task #{i}")),
                )
                .await;
        }
        dispatcher
            .send(
                AgentId::new("dispatcher"),
                Recipient::Broadcast,
                10,
                MessagePayload::Collaborate {
                    topic: "demo workload".to_string(),
                    participants: (0..self.agents)
                        .map(|i| AgentId::new(format!("agent-{i}")))
                        .collect(),
                    task: None,
                },
            )
            .await;
        info!(tasks = self.tasks, agents = self.agents, "workload submitted");

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted");
                    break;
                }
                _ = ticker.tick() => {}
            }
            let status = dispatcher.status().await;
            if status.is_idle() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight = status.in_flight, "timed out waiting for the workload");
                break;
            }
        }

        handle.shutdown_and_join().await;
        event_log.abort();

        let status = dispatcher.status().await;
        info!(
            completed = status.task_counts.completed,
            failed = status.task_counts.failed,
            stored = sink.len(),
            "demo finished"
        );
        println!("{}", serde_json::to_string_pretty(&status)?);
        Ok(())
    }
}
