use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use seqmirror_core::{CompletionOracle, RunLayout, ShutdownSignal};
use seqmirror_runner::{
    install_signal_handlers, load_or_bootstrap_history, validate_store, EngineSummary,
    LocalRunSource, MirrorConfig, PullProcessor, PullSettings, PushProcessor, PushSettings,
    RemoteRunSource, SyncEngine, Transferer,
};
use seqmirror_store::ObjectStore;

#[derive(Parser)]
#[command(
    name = "seqmirror",
    version,
    about = "Mirror sequencing runs to and from object storage while the instrument writes them"
)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides).
    #[arg(long, global = true)]
    verbose: bool,
    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct MirrorArgs {
    #[arg(long)]
    bucket: String,
    #[arg(long, default_value = "seqmirror.yaml")]
    config_file: PathBuf,
    /// Relative paths are taken from the watched directory.
    #[arg(long, default_value = ".seqmirror.history.json")]
    history_file: PathBuf,
    /// Seconds between two scans for new runs.
    #[arg(long, default_value_t = 300)]
    interval: u64,
    #[arg(long, default_value_t = 10)]
    file_poll: u64,
    #[arg(long, default_value_t = 30)]
    cycle_poll: u64,
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
    lanes: u32,
    #[arg(long, default_value_t = 300)]
    settle_secs: u64,
    #[arg(long)]
    force: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a local output directory and upload every new run.
    Push {
        source_dir: PathBuf,
        #[command(flatten)]
        args: MirrorArgs,
    },
    /// Watch the bucket and download every new run.
    Pull {
        dest_dir: PathBuf,
        #[command(flatten)]
        args: MirrorArgs,
    },
    /// Report completion verdicts for one run directory.
    Status {
        run_dir: PathBuf,
        #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
        lanes: u32,
        #[arg(long, default_value_t = 300)]
        settle_secs: u64,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log.as_deref())?;
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool, log: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow!("log_unwritable: {}: {}", path.display(), e))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Push { source_dir, args } => {
            if !source_dir.is_dir() {
                return Err(anyhow!("source_dir not found: {}", source_dir.display()));
            }
            let (config, store) = connect(&args)?;
            let shutdown = Arc::new(ShutdownSignal::new());
            let source = LocalRunSource::new(&source_dir);
            let history =
                load_or_bootstrap_history(&history_path(&source_dir, &args.history_file), &source)?;
            let engine = SyncEngine::new(history, Arc::clone(&shutdown), secs(args.interval));
            install_signal_handlers(engine.handle())?;
            let transferer = Transferer::new(
                store,
                &source_dir,
                args.force,
                config.multipart_threshold_bytes,
                Arc::clone(&shutdown),
            );
            let settings = PushSettings {
                lane_count: args.lanes,
                file_poll: secs(args.file_poll),
                cycle_poll: secs(args.cycle_poll),
                settle_window: secs(args.settle_secs),
            };
            let mut processor = PushProcessor::new(&source_dir, settings, transferer, shutdown);
            info!(
                source = %source_dir.display(),
                bucket = %args.bucket,
                dry_run = args.dry_run,
                "watching for runs to push"
            );
            let summary = engine.run(&source, &mut processor)?;
            finish("push", &summary, args.json)
        }
        Commands::Pull { dest_dir, args } => {
            std::fs::create_dir_all(&dest_dir)
                .map_err(|e| anyhow!("dest_dir unusable: {}: {}", dest_dir.display(), e))?;
            let (config, store) = connect(&args)?;
            let shutdown = Arc::new(ShutdownSignal::new());
            let source = RemoteRunSource::new(Arc::clone(&store));
            let history =
                load_or_bootstrap_history(&history_path(&dest_dir, &args.history_file), &source)?;
            let engine = SyncEngine::new(history, Arc::clone(&shutdown), secs(args.interval));
            install_signal_handlers(engine.handle())?;
            let transferer = Transferer::new(
                store,
                &dest_dir,
                args.force,
                config.multipart_threshold_bytes,
                Arc::clone(&shutdown),
            );
            let settings = PullSettings {
                lane_count: args.lanes,
                remote_poll: secs(args.file_poll),
                settle_window: secs(args.settle_secs),
            };
            let mut processor = PullProcessor::new(&dest_dir, settings, transferer, shutdown);
            info!(
                dest = %dest_dir.display(),
                bucket = %args.bucket,
                dry_run = args.dry_run,
                "watching for runs to pull"
            );
            let summary = engine.run(&source, &mut processor)?;
            finish("pull", &summary, args.json)
        }
        Commands::Status {
            run_dir,
            lanes,
            settle_secs,
            json,
        } => {
            if !run_dir.is_dir() {
                return Err(anyhow!("run_dir not found: {}", run_dir.display()));
            }
            let oracle = CompletionOracle::new(RunLayout::new(&run_dir, lanes), secs(settle_secs));
            let status = oracle.status()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "status": serde_json::to_value(&status)?
                })));
            }
            println!("run_id: {}", status.run_id);
            match status.cycle_count {
                Some(cycles) => println!("cycles: {}", cycles),
                None => println!("cycles: unknown"),
            }
            match status.expected_data_files {
                Some(expected) => println!("data_files: {}/{}", status.data_files, expected),
                None => println!("data_files: {}", status.data_files),
            }
            println!("sequencing_finished: {}", status.sequencing_finished);
            println!("all_files_present: {}", status.all_files_present);
            println!("run_complete: {}", status.run_complete);
            Ok(None)
        }
    }
}

/// Load the config, connect the store and prove the credentials work.
fn connect(args: &MirrorArgs) -> Result<(MirrorConfig, Arc<dyn ObjectStore>)> {
    let config = MirrorConfig::load(&args.config_file)?;
    let store = config.build_store(&args.bucket, args.dry_run)?;
    validate_store(store.as_ref())?;
    Ok((config, store))
}

fn history_path(watched: &Path, history_file: &Path) -> PathBuf {
    if history_file.is_absolute() {
        history_file.to_path_buf()
    } else {
        watched.join(history_file)
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn finish(command: &str, summary: &EngineSummary, json: bool) -> Result<Option<Value>> {
    if summary.interrupted {
        return Err(anyhow!(
            "interrupted: forced shutdown abandoned the run in progress (completed: {})",
            summary.completed.len()
        ));
    }
    if json {
        return Ok(Some(json!({
            "ok": true,
            "command": command,
            "completed": summary.completed
        })));
    }
    for run_id in &summary.completed {
        println!("mirrored: {}", run_id);
    }
    println!("stopped");
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Push { args, .. } | Commands::Pull { args, .. } => args.json,
        Commands::Status { json, .. } => *json,
    }
}
