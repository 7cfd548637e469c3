use clap::{Parser, Subcommand};
use ctf_jobs::config::AppConfig;
use ctf_jobs::history;
use ctf_jobs::signals::SignalListener;
use ctf_jobs::{JobHandle, JobOutcome, JobRuntime, JobSpec, ToolCatalog, ToolCategory};
use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
#[cfg(feature = "serve")]
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Run CTF tools as supervised background jobs: each one in its own process
/// group, with timeouts, bounded output capture and a job history.
#[derive(Parser, Debug)]
#[command(name = "ctf-jobs", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "ctf-jobs.toml", global = true)]
    config: PathBuf,

    /// Debug logging (registry, reaper and signal decisions)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List catalog tools by category
    Tools {
        /// Include tools that are not installed
        #[arg(long)]
        all: bool,
    },
    /// Run a catalog tool and wait for it
    Run {
        tool: String,

        /// Template parameter, e.g. -p file=challenge.png
        #[arg(short = 'p', long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Job name (default: the tool name)
        #[arg(long)]
        name: Option<String>,

        /// Timeout in seconds (overrides config)
        #[arg(long)]
        timeout: Option<u64>,

        /// Challenge this job belongs to
        #[arg(long)]
        challenge: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run an arbitrary command as a job and wait for it
    Exec {
        /// Job name (default: the program name)
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = "misc")]
        category: String,

        /// Timeout in seconds (overrides config)
        #[arg(long)]
        timeout: Option<u64>,

        #[arg(long)]
        challenge: Option<String>,

        #[arg(long)]
        json: bool,

        /// Program followed by its arguments
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
    /// Show recently finished jobs
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },
    /// Serve the job panel HTTP API
    #[cfg(feature = "serve")]
    Serve {
        #[arg(long)]
        bind: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "ctf_jobs=debug"
    } else {
        "ctf_jobs=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match AppConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Tools { all } => cmd_tools(&config, all).map(|_| 0),
        Commands::Run {
            tool,
            params,
            name,
            timeout,
            challenge,
            json,
        } => cmd_run(&config, &tool, params, name, timeout, challenge, json).await,
        Commands::Exec {
            name,
            category,
            timeout,
            challenge,
            json,
            command,
        } => cmd_exec(&config, name, &category, timeout, challenge, json, command).await,
        Commands::History { limit, json } => cmd_history(&config, limit, json).map(|_| 0),
        #[cfg(feature = "serve")]
        Commands::Serve { bind, port } => cmd_serve(config, bind, port).await.map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

fn catalog(config: &AppConfig) -> ToolCatalog {
    ToolCatalog::with_builtins(&config.catalog.tools, config.catalog.allow_network_tools)
}

fn cmd_tools(config: &AppConfig, all: bool) -> Result<(), Box<dyn Error>> {
    let catalog = catalog(config);
    for (category, tools) in catalog.by_category() {
        let shown: Vec<_> = tools
            .into_iter()
            .map(|t| (t, t.is_available()))
            .filter(|(_, available)| all || *available)
            .collect();
        if shown.is_empty() {
            continue;
        }
        println!("{category}");
        for (tool, available) in shown {
            let params = tool
                .placeholders()
                .iter()
                .map(|p| format!("{p}=..."))
                .collect::<Vec<_>>()
                .join(" ");
            let marker = if available { "" } else { " (not installed)" };
            println!("  {:<16} {}{}", tool.name, tool.description, marker);
            if !params.is_empty() {
                println!("  {:<16} -p {}", "", params);
            }
        }
    }
    Ok(())
}

async fn cmd_run(
    config: &AppConfig,
    tool: &str,
    params: Vec<(String, String)>,
    name: Option<String>,
    timeout: Option<u64>,
    challenge: Option<String>,
    json: bool,
) -> Result<i32, Box<dyn Error>> {
    let catalog = catalog(config);
    let params: HashMap<String, String> = params.into_iter().collect();
    let runtime = JobRuntime::from_config(Handle::current(), config);
    let name = name.unwrap_or_else(|| tool.to_string());

    let handle = runtime.run_tool(
        &catalog,
        tool,
        &name,
        &params,
        timeout.map(Duration::from_secs),
        challenge.as_deref(),
    )?;
    supervise_foreground(&runtime, config, handle, json).await
}

async fn cmd_exec(
    config: &AppConfig,
    name: Option<String>,
    category: &str,
    timeout: Option<u64>,
    challenge: Option<String>,
    json: bool,
    command: Vec<String>,
) -> Result<i32, Box<dyn Error>> {
    let mut parts = command.into_iter();
    let program = parts.next().ok_or("no program given")?;
    let name = name.unwrap_or_else(|| {
        std::path::Path::new(&program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone())
    });

    let mut spec = JobSpec::new(name, ToolCategory::from(category), program, parts);
    if let Some(secs) = timeout {
        spec = spec.timeout(Duration::from_secs(secs));
    }
    if let Some(challenge) = challenge {
        spec = spec.challenge(challenge);
    }

    let runtime = JobRuntime::from_config(Handle::current(), config);
    let handle = runtime.start(spec)?;
    supervise_foreground(&runtime, config, handle, json).await
}

/// Wait for `handle`, turning SIGINT/SIGTERM into a runtime shutdown. A
/// second signal during shutdown skips the grace period.
async fn supervise_foreground(
    runtime: &JobRuntime,
    config: &AppConfig,
    handle: JobHandle,
    json: bool,
) -> Result<i32, Box<dyn Error>> {
    let mut signals = SignalListener::install()?;

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        signal = signals.recv() => {
            eprintln!("{signal}: stopping {} (again to force)", handle.name());
            tokio::select! {
                _ = runtime.shutdown() => {}
                _ = signals.recv() => {
                    runtime.registry().kill_all_now();
                }
            }
            handle.wait().await
        }
    };
    runtime.shutdown().await;

    record_history(config, &outcome);
    report(&outcome, json)?;
    Ok(if outcome.state.is_success() { 0 } else { 1 })
}

fn record_history(config: &AppConfig, outcome: &JobOutcome) {
    let result = history::open_or_create(&config.storage.history_db)
        .and_then(|conn| history::record(&conn, outcome));
    if let Err(e) = result {
        tracing::warn!(
            db = %config.storage.history_db.display(),
            error = %e,
            "failed to record job history"
        );
    }
}

fn report(outcome: &JobOutcome, json: bool) -> Result<(), Box<dyn Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    print!("{}", outcome.stdout.text());
    eprint!("{}", outcome.stderr.text());
    for (stream, captured) in [("stdout", &outcome.stdout), ("stderr", &outcome.stderr)] {
        if captured.truncated {
            eprintln!(
                "[{stream} truncated: kept {} of {} bytes]",
                captured.bytes.len(),
                captured.total_bytes
            );
        }
    }
    eprintln!(
        "{}: {} in {:.1}s",
        outcome.name,
        outcome.state,
        outcome.duration.as_secs_f64()
    );
    Ok(())
}

fn cmd_history(config: &AppConfig, limit: usize, json: bool) -> Result<(), Box<dyn Error>> {
    let conn = history::open_or_create(&config.storage.history_db)?;
    let entries = history::recent(&conn, limit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No jobs recorded yet.");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{:>5}  {}  {:<20} {:<10} {:>8.1}s  {}",
            entry.id,
            entry.started,
            entry.name,
            entry.category,
            entry.duration_ms as f64 / 1000.0,
            entry.summary
        );
    }
    let totals = history::tally(&conn)?;
    println!(
        "\n{} jobs: {} completed, {} failed, {} timed out, {} cancelled, {} stopped on shutdown",
        totals.total(),
        totals.completed,
        totals.failed,
        totals.timed_out,
        totals.cancelled,
        totals.shutdown
    );
    Ok(())
}

#[cfg(feature = "serve")]
async fn cmd_serve(
    mut config: AppConfig,
    bind: Option<String>,
    port: Option<u16>,
) -> Result<(), Box<dyn Error>> {
    use ctf_jobs::serve::{self, AppState};

    if let Some(bind) = bind {
        config.serve.bind = bind;
    }
    if let Some(port) = port {
        config.serve.port = port;
    }

    let runtime = Arc::new(JobRuntime::from_config(Handle::current(), &config));
    let state = AppState::new(Arc::clone(&runtime), Arc::new(catalog(&config)))
        .with_history(config.storage.history_db.clone());

    // First signal: stop every job, end the event streams and drain. A
    // second one kills whatever is left and exits without waiting.
    let mut signals = SignalListener::install()?;
    let shutdown = {
        let runtime = Arc::clone(&runtime);
        async move {
            let signal = signals.recv().await;
            eprintln!("{signal}: stopping all jobs (again to force exit)");
            tokio::spawn(async move {
                signals.recv().await;
                runtime.registry().kill_all_now();
                std::process::exit(130);
            });
        }
    };
    serve::run(state, &config.serve, shutdown).await?;

    runtime.shutdown().await;
    Ok(())
}
