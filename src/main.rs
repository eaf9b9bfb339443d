use clap::Parser;
use procwatch::supervisor::{CancelToken, RunEvent, RunResult, Supervisor};
use procwatch::{config, launch, resolver, LaunchSpec, OutputKind, StreamTag};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Launch a Python program under a real interpreter and supervise its whole
/// process tree: stream its output, sample CPU/memory/threads at a fixed
/// cadence, and report any leaked processes when it exits.
#[derive(Parser, Debug)]
#[command(name = "procwatch", version, about)]
struct Cli {
    /// Target Python script to run
    script: PathBuf,

    /// Config file path
    #[arg(short, long, default_value = "procwatch.toml")]
    config: PathBuf,

    /// Python interpreter (overrides config and auto-detection)
    #[arg(long)]
    python: Option<PathBuf>,

    /// Working directory (default: the script's directory)
    #[arg(short = 'd', long)]
    cwd: Option<PathBuf>,

    /// Extra PYTHONPATH directories, separator-joined
    #[arg(short, long)]
    paths: Option<String>,

    /// Extra arguments for the target, shell-quoted
    #[arg(short, long)]
    args: Option<String>,

    /// Sampling interval in milliseconds (overrides config)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Emit every event as a JSON line instead of human-readable output
    #[arg(long)]
    json: bool,

    /// Also print per-tick resource samples in human-readable mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "procwatch=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("procwatch: {e}");
            std::process::exit(2);
        }
    };
    if let Some(interval) = cli.interval_ms {
        config.sampler.interval_ms = interval;
    }

    let interpreter = cli
        .python
        .or_else(|| config.python.interpreter.clone())
        .or_else(resolver::resolve);
    let Some(interpreter) = interpreter else {
        eprintln!(
            "procwatch: no python interpreter found; set --python or {}",
            resolver::INTERPRETER_OVERRIDE_VAR
        );
        std::process::exit(2);
    };

    let extra_paths = cli
        .paths
        .as_deref()
        .map(launch::split_path_list)
        .unwrap_or_default();
    let extra_args = match cli.args.as_deref().map(launch::split_args).transpose() {
        Ok(args) => args.unwrap_or_default(),
        Err(e) => {
            eprintln!("procwatch: bad --args value: {e}");
            std::process::exit(2);
        }
    };

    let spec = match LaunchSpec::new(&cli.script, cli.cwd.clone()) {
        Ok(spec) => spec.with_extra_paths(extra_paths).with_extra_args(extra_args),
        Err(e) => {
            eprintln!("procwatch: cannot resolve {}: {e}", cli.script.display());
            std::process::exit(2);
        }
    };
    if !spec.script.is_file() {
        eprintln!("procwatch: script not found: {}", spec.script.display());
        std::process::exit(2);
    }

    let cancel = CancelToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling run");
            ctrl_c_cancel.cancel();
        }
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let supervisor = Supervisor::with_config(interpreter, &config);
    let run = tokio::spawn(async move { supervisor.run(&spec, &events_tx, cancel).await });

    while let Some(event) = events_rx.recv().await {
        print_event(&event, cli.json, cli.verbose);
    }

    let result = match run.await {
        Ok(result) => result,
        Err(e) => {
            eprintln!("procwatch: supervisor task failed: {e}");
            std::process::exit(2);
        }
    };
    print_result(&result, cli.json);

    let code = result.exit_code();
    std::process::exit(if code < 0 { 1 } else { code });
}

fn print_event(event: &RunEvent, json: bool, verbose: bool) {
    if json {
        let payload = match event {
            RunEvent::Started { pid } => {
                serde_json::json!({"event": "started", "pid": pid})
            }
            RunEvent::Sample(sample) => {
                serde_json::json!({"event": "sample", "sample": sample})
            }
            RunEvent::Output(output) => {
                serde_json::json!({"event": "output", "output": output})
            }
            RunEvent::Log(line) => {
                serde_json::json!({"event": "log", "line": line})
            }
        };
        println!("{payload}");
        return;
    }

    match event {
        RunEvent::Started { pid } => tracing::info!(pid, "child started"),
        RunEvent::Sample(sample) => {
            if verbose {
                tracing::info!(
                    elapsed_secs = sample.elapsed_secs,
                    mem_mb = sample.memory_bytes / (1024 * 1024),
                    cpu_percent = sample.cpu_percent,
                    threads = sample.threads,
                    children = sample.children,
                    "sample"
                );
            }
        }
        RunEvent::Output(output) => {
            if let OutputKind::Line(line) = &output.kind {
                match output.stream {
                    StreamTag::Out => println!("{line}"),
                    StreamTag::Err => eprintln!("{line}"),
                }
            }
        }
        RunEvent::Log(line) => tracing::info!("{line}"),
    }
}

fn print_result(result: &RunResult, json: bool) {
    if json {
        let payload = match result {
            RunResult::LaunchFailed { error } => serde_json::json!({
                "event": "finished",
                "exit_code": -1,
                "error": error.to_string(),
                "leaked": [],
            }),
            RunResult::Completed {
                pid,
                exit_code,
                duration,
                leaked,
                ..
            } => serde_json::json!({
                "event": "finished",
                "pid": pid,
                "exit_code": exit_code.unwrap_or(-1),
                "duration_secs": duration.as_secs_f64(),
                "leaked": leaked,
            }),
        };
        println!("{payload}");
        return;
    }

    match result {
        RunResult::LaunchFailed { error } => {
            eprintln!("procwatch: launch failed: {error}");
        }
        RunResult::Completed {
            exit_code,
            duration,
            leaked,
            ..
        } => {
            match exit_code {
                Some(code) => tracing::info!(
                    exit_code = code,
                    duration_secs = duration.as_secs_f64(),
                    "run finished"
                ),
                None => tracing::info!(
                    duration_secs = duration.as_secs_f64(),
                    "run finished (killed by signal)"
                ),
            }
            if leaked.is_empty() {
                tracing::info!("no leaked processes");
            } else {
                for descriptor in leaked {
                    tracing::warn!("leaked: {descriptor}");
                }
            }
        }
    }
}
