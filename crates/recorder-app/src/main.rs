//! Drone Recorder - Main Entry Point

use std::io::BufRead;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use recorder::{Command, Recorder, RecorderState, RecordingMode, ShutdownSignal};
use recorder_app::{build_recorder, init_logging, load_settings};
use tokio::sync::mpsc;
use tokio::{signal, task};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "drone-recorder", version, about = "Stereo depth camera field recorder")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, default_value = "drone-recorder.toml")]
    config: PathBuf,

    /// Use the simulated camera
    #[arg(long)]
    simulate: bool,

    /// Session length in seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Recording mode (compressed_only, svo_depth_info, raw, ...)
    #[arg(long)]
    mode: Option<RecordingMode>,

    /// Read commands from stdin instead of recording straight away
    #[arg(long)]
    console: bool,

    /// Override the storage root
    #[arg(long)]
    storage_root: Option<PathBuf>,
}

/// Run a blocking recorder call off the async runtime
async fn blocking<T, F>(recorder: &Recorder, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(Recorder) -> T + Send + 'static,
{
    let recorder = recorder.clone();
    Ok(task::spawn_blocking(move || f(recorder)).await?)
}

/// Stdin is read on a detached thread so a pending read never holds up exit
fn stdin_lines() -> anyhow::Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::Builder::new()
        .name("console-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

async fn run_console(recorder: Recorder) -> anyhow::Result<()> {
    info!("Console ready: start [secs] | stop | mode <m> | depth <level> | resolution <p> | exposure <n> | gain <n> | depth-rate <hz> | rotate | snapshot [view] [path] | status | quit");
    let mut lines = stdin_lines()?;

    while let Some(line) = lines.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };
        let outcome = blocking(&recorder, move |r| r.execute(command)).await?;
        match serde_json::to_string(&outcome) {
            Ok(json) => info!(target: "console", "{}", json),
            Err(e) => warn!("Outcome not serializable: {}", e),
        }
    }
    Ok(())
}

async fn run_headless(recorder: Recorder, duration: Option<u64>) -> anyhow::Result<()> {
    let duration = duration.map(Duration::from_secs);
    let dir = blocking(&recorder, move |r| r.start(duration)).await??;
    info!(dir = %dir.display(), "Headless recording started");

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        if recorder.state() == RecorderState::Idle {
            break;
        }
    }
    if let Some(summary) = recorder.last_summary() {
        info!(
            frames = summary.frames,
            segments = summary.segments,
            "Session finished in {:.1}s",
            summary.duration_secs
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(&cli.config)?;
    settings.simulate |= cli.simulate;
    if let Some(mode) = cli.mode {
        settings.recorder.mode = mode;
    }
    if let Some(root) = cli.storage_root {
        settings.storage_root = root;
    }

    init_logging(&settings.log_level, settings.log_format);
    info!("=== Drone Recorder v{} ===", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownSignal::new();
    let recorder = build_recorder(&settings, shutdown.clone())?;

    if let Err(e) = blocking(&recorder, |r| r.initialize()).await? {
        warn!("Camera not ready at startup, will retry on start: {}", e);
    }

    let session = if cli.console {
        tokio::spawn(run_console(recorder.clone()))
    } else {
        tokio::spawn(run_headless(recorder.clone(), cli.duration))
    };

    tokio::select! {
        _ = signal::ctrl_c() => info!("Interrupt received"),
        result = session => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{:#}", e),
            Err(e) => error!("Session task failed: {}", e),
        },
    }

    shutdown.trigger();
    blocking(&recorder, |r| r.shutdown()).await?;
    info!("Goodbye");
    Ok(())
}
