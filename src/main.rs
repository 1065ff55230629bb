use clap::Parser;
use drowsiness_agent::alert::{AlertSink, LogAlertSink, TerminalBell};
use drowsiness_agent::classifier::GeminiClassifier;
use drowsiness_agent::config::{AppConfig, LoggingConfig};
use drowsiness_agent::frame::{FileFrameSource, FrameSource};
use drowsiness_agent::{AgentError, AgentResult, Scheduler, StatusSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Watches a camera snapshot and alarms on sustained drowsiness
#[derive(Parser)]
#[command(name = "drowsiness-agent")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "DROWSY_CONFIG")]
    config: Option<String>,

    /// Image file kept up to date by an external capture process
    #[arg(short, long, env = "DROWSY_FRAME_PATH")]
    frame_path: String,

    /// Consecutive drowsy observations that raise the alarm
    #[arg(short, long)]
    threshold: Option<u32>,

    /// Milliseconds between analysis cycles
    #[arg(short, long)]
    interval_ms: Option<u64>,

    /// Ring the terminal bell while alarmed
    #[arg(long)]
    bell: bool,

    /// Seconds to wait for the first frame before giving up
    #[arg(long, default_value_t = 10)]
    ready_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "DROWSY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("drowsiness-agent: {}", err);
            std::process::exit(2);
        }
    };

    init_logging(&config.logging);

    if let Err(err) = run(cli, config).await {
        error!(error = %err, "Agent exited with error");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> AgentResult<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref())?;

    if let Some(threshold) = cli.threshold {
        config.monitor.drowsiness_threshold = threshold;
    }
    if let Some(interval_ms) = cli.interval_ms {
        config.monitor.analysis_interval_ms = interval_ms;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json {
        config.logging.json = true;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: Cli, config: AppConfig) -> AgentResult<()> {
    let classifier = GeminiClassifier::new(&config.classifier)
        .map_err(|e| AgentError::Config(e.to_string()))?;
    let frames = Arc::new(FileFrameSource::new(&cli.frame_path));
    let alert: Arc<dyn AlertSink> = if cli.bell {
        Arc::new(TerminalBell::default())
    } else {
        Arc::new(LogAlertSink)
    };

    info!(
        model = classifier.model(),
        frame_path = %frames.path().display(),
        "Starting drowsiness agent"
    );

    wait_for_frames(frames.as_ref(), Duration::from_secs(cli.ready_timeout_secs)).await;

    let scheduler = Scheduler::new(
        config.monitor.clone(),
        frames,
        Arc::new(classifier),
        alert.clone(),
    );
    scheduler.start()?;
    println!("commands: [r] reset alert  [s] start/stop  [q] quit");

    let mut status = scheduler.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_printed = None;
    let mut stdin_open = true;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                print_status(&snapshot, &mut last_printed);
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => match line.trim() {
                        "r" => scheduler.reset_alert(),
                        "s" if scheduler.is_active() => scheduler.stop(),
                        "s" => {
                            if let Err(err) = scheduler.start() {
                                println!("cannot start: {}", err);
                            }
                        }
                        "q" => break,
                        "" => {}
                        other => println!("unknown command: {}", other),
                    },
                    // stdin closed: keep running until Ctrl-C
                    Ok(None) => stdin_open = false,
                    Err(err) => {
                        error!(error = %err, "Failed to read stdin");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    scheduler.stop();
    alert.end_alert();
    info!("Drowsiness agent stopped");
    Ok(())
}

/// Polls until the frame source is ready or the timeout elapses. `start()`
/// reports `NotReady` if it is still missing afterwards.
async fn wait_for_frames(frames: &dyn FrameSource, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !frames.is_ready() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Prints a line when the user-visible part of the status changes.
fn print_status(snapshot: &StatusSnapshot, last: &mut Option<String>) {
    let line = match &snapshot.error {
        Some(err) => format!("[{:?}] error: {} (press s to restart)", snapshot.state, err),
        None if snapshot.alarm => format!(
            "[{:?}] DROWSINESS DETECTED - press r to acknowledge",
            snapshot.state
        ),
        None => format!(
            "[{:?}] {} ({} consecutive)",
            snapshot.state, snapshot.observation, snapshot.drowsy_count
        ),
    };

    if last.as_deref() != Some(line.as_str()) {
        println!("{}", line);
        *last = Some(line);
    }
}
