mod corpus;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pc_core::{Agent, Collaborators, CoreConfig, DivergencePolicy, Response, SystemClock};
use pc_store::{CONFIG_FILE, SessionStore};

use crate::corpus::CorpusRetriever;

#[derive(Parser)]
#[command(name = "pc", about = "Signal-triggered control agent over a paraconsistent fact store")]
struct Cli {
    /// Session name (one database per session)
    #[arg(long, global = true)]
    session: Option<String>,

    /// Configuration file (defaults to config.toml in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory of .txt/.md files used as the retrieval corpus
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,

    /// Print responses as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one input line per stdin line
    Run,

    /// Process a single input
    Ask {
        /// Fact, command or question
        text: String,
    },

    /// Advance the field integrator without processing input
    Evolve {
        #[arg(long, default_value_t = 100)]
        steps: usize,

        /// Step size (defaults to the configured dt)
        #[arg(long)]
        dt: Option<f64>,

        /// Cancel after this many seconds
        #[arg(long)]
        timeout_secs: Option<f64>,

        /// Stop at the first step whose norm exceeds the divergence bound
        #[arg(long)]
        halt_on_divergence: bool,
    },

    /// Show the most recent logged cycles
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Show agent and store statistics
    Stats,

    /// Print the effective configuration as TOML
    Config,

    /// Discard the saved agent state (the cycle log is kept)
    Reset,
}

fn data_dir() -> PathBuf {
    std::env::var("PC_DATA_DIR")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(pc_store::default_base_dir)
}

fn open_session(cli: &Cli) -> Result<SessionStore> {
    SessionStore::open(cli.session.as_deref(), Some(&data_dir()))
        .context("failed to open session store")
}

fn load_config(cli: &Cli) -> Result<CoreConfig> {
    match &cli.config {
        Some(path) => pc_store::load_config(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => {
            let path = data_dir().join(CONFIG_FILE);
            pc_store::load_config_or_default(&path)
                .with_context(|| format!("failed to load config {}", path.display()))
        }
    }
}

/// Build the agent for this session, resuming from its last snapshot.
fn open_agent(cli: &Cli, session: &SessionStore) -> Result<Agent> {
    let config = load_config(cli)?;
    let mut collab = Collaborators::default()
        .with_sink(session.sink().context("failed to open cycle log")?);
    if let Some(dir) = &cli.corpus {
        collab = collab.with_retriever(CorpusRetriever::load(dir)?);
    }

    let snapshot = session
        .store()
        .load_snapshot()
        .context("failed to load agent state")?;
    let agent = match snapshot {
        Some(snapshot) => Agent::restore(config, collab, SystemClock, snapshot).context(
            "saved state does not fit the configuration (run `pc reset` to start over)",
        )?,
        None => Agent::new(config, collab, SystemClock).context("invalid configuration")?,
    };
    Ok(agent)
}

fn save(session: &SessionStore, agent: &Agent) -> Result<()> {
    session
        .store()
        .save_snapshot(&agent.snapshot())
        .context("failed to save agent state")
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Run => cmd_run(&cli),
        Commands::Ask { text } => cmd_ask(&cli, text),
        Commands::Evolve {
            steps,
            dt,
            timeout_secs,
            halt_on_divergence,
        } => cmd_evolve(&cli, *steps, *dt, *timeout_secs, *halt_on_divergence).await,
        Commands::History { limit } => cmd_history(&cli, *limit),
        Commands::Stats => cmd_stats(&cli),
        Commands::Config => cmd_config(&cli),
        Commands::Reset => cmd_reset(&cli),
    }
}

fn print_response(cli: &Cli, response: &Response) -> Result<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string(response).context("failed to serialize response")?
        );
    } else {
        println!("[{}] {}", response.action, response.text);
    }
    if cli.verbose {
        let s = &response.signals;
        eprintln!(
            "--- cycle {}: contradiction={:.3} gap={:.3} novelty={:.3} torsion={:.3} coherence={:.3} ---",
            response.cycle, s.contradiction, s.gap, s.novelty, s.torsion, s.coherence
        );
    }
    Ok(())
}

fn cmd_run(cli: &Cli) -> Result<()> {
    let session = open_session(cli)?;
    let mut agent = open_agent(cli, &session)?;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = agent.process(&line);
        print_response(cli, &response)?;
    }

    save(&session, &agent)
}

fn cmd_ask(cli: &Cli, text: &str) -> Result<()> {
    let session = open_session(cli)?;
    let mut agent = open_agent(cli, &session)?;
    let response = agent.process(text);
    print_response(cli, &response)?;
    save(&session, &agent)
}

async fn cmd_evolve(
    cli: &Cli,
    steps: usize,
    dt: Option<f64>,
    timeout_secs: Option<f64>,
    halt_on_divergence: bool,
) -> Result<()> {
    let session = open_session(cli)?;
    let mut agent = open_agent(cli, &session)?;
    let dt = dt.unwrap_or(agent.config().field.dt);
    if !(dt > 0.0) || !dt.is_finite() {
        anyhow::bail!("--dt must be finite and > 0, got {dt}");
    }
    let limit = agent.config().field.max_stable_dt();
    if dt > limit {
        anyhow::bail!("--dt {dt} exceeds the stable step limit {limit:.4}");
    }
    let timeout = match timeout_secs {
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid --timeout-secs {secs}"))?,
        ),
        None => None,
    };
    let on_divergence = if halt_on_divergence {
        DivergencePolicy::Halt
    } else {
        DivergencePolicy::Continue
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let watcher = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            let expired = async {
                match timeout {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::warn!("interrupted, stopping evolution"),
                _ = expired => tracing::warn!("timeout reached, stopping evolution"),
            }
            cancel.store(true, Ordering::Relaxed);
        })
    };

    let flag = Arc::clone(&cancel);
    let (agent, report) = tokio::task::spawn_blocking(move || {
        let report = agent.evolve(steps, dt, &flag, on_divergence);
        (agent, report)
    })
    .await
    .context("evolution task failed")?;
    watcher.abort();

    let (norm_s, norm_l) = agent.field().norms();
    println!("steps:      {}/{}", report.completed, report.requested);
    println!("cancelled:  {}", report.cancelled);
    println!("halted:     {}", report.halted);
    match report.first_divergence {
        Some(step) => println!("diverged:   at step {step}"),
        None => println!("diverged:   no"),
    }
    println!("t:          {:.3}", agent.field().time());
    println!("norms:      S={norm_s:.6} L={norm_l:.6}");

    save(&session, &agent)
}

fn cmd_history(cli: &Cli, limit: usize) -> Result<()> {
    let session = open_session(cli)?;
    let records = session
        .store()
        .recent_cycles(limit)
        .context("failed to read cycle log")?;

    if records.is_empty() && !cli.json {
        println!("(no cycles logged)");
        return Ok(());
    }
    for record in &records {
        if cli.json {
            println!(
                "{}",
                serde_json::to_string(record).context("failed to serialize record")?
            );
        } else {
            println!(
                "#{} {} [{}] {} -> {}",
                record.cycle,
                pc_core::unix_to_iso8601(record.timestamp),
                record.action,
                record.input,
                record.response
            );
        }
    }
    Ok(())
}

fn cmd_stats(cli: &Cli) -> Result<()> {
    let session = open_session(cli)?;
    let agent = open_agent(cli, &session)?;
    let store = session.store();
    let summary = agent.summary();
    let kpis = agent.kpis();
    let logged = store.cycle_count().context("failed to count cycles")?;
    let actions = store
        .action_counts()
        .context("failed to count actions")?
        .into_iter()
        .map(|(action, n)| format!("{action}={n}"))
        .collect::<Vec<_>>()
        .join(" ");

    println!("session:        {}", session.name());
    println!("cycle:          {}", agent.cycle());
    println!("facts:          {}", summary.facts);
    println!("contradictions: {}", summary.contradictions);
    println!("gaps:           {}", summary.gaps);
    println!("pending steps:  {}", summary.pending_steps);
    println!("logged cycles:  {logged}");
    println!("actions:        {actions}");
    println!(
        "kpis:           handler_failures={} divergences={} collaborator_failures={} gaps_opened={} gaps_resolved={}",
        kpis.handler_failures,
        kpis.divergences,
        kpis.collaborator_failures,
        kpis.gaps_opened,
        kpis.gaps_resolved
    );
    println!(
        "db_size:        {:.1}MB",
        store.db_size() as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let rendered = pc_store::config_to_toml(&config).context("failed to render config")?;
    print!("{rendered}");
    Ok(())
}

fn cmd_reset(cli: &Cli) -> Result<()> {
    let session = open_session(cli)?;
    session
        .store()
        .clear_snapshot()
        .context("failed to clear agent state")?;
    println!("reset session '{}'", session.name());
    Ok(())
}
