//! capture-agent
//!
//! Records camera video on a headless device. Commands arrive on stdin (or
//! a single timed recording runs with `--duration`); events are printed to
//! stdout as JSON lines.

use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use capture_agent::capture::BackendKind;
use capture_agent::config::Config;
use capture_agent::events::{Event, EventBus};
use capture_agent::logging;
use capture_agent::session::{SessionController, SessionState};

/// How long to keep printing events after the controller is gone
const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default, PartialEq)]
struct Args {
    help: bool,
    config: Option<PathBuf>,
    backend: Option<BackendKind>,
    duration_secs: Option<u64>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "-c" | "--config" => {
                let path = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "-b" | "--backend" => {
                let value = args.next().context("--backend needs a value")?;
                parsed.backend = Some(match value.as_str() {
                    "sdk" => BackendKind::Sdk,
                    "process" => BackendKind::Process,
                    other => bail!("Unknown backend '{}' (expected sdk or process)", other),
                });
            }
            "-d" | "--duration" => {
                let value = args.next().context("--duration needs a number of seconds")?;
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid duration: {}", value))?;
                if secs == 0 {
                    bail!("--duration must be at least one second");
                }
                parsed.duration_secs = Some(secs);
            }
            other => bail!("Unknown argument '{}' (see --help)", other),
        }
    }

    Ok(parsed)
}

/// Commands accepted on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentCommand {
    Toggle,
    Start,
    Stop,
    Status,
    List,
    Background,
    Foreground,
    Quit,
}

impl FromStr for AgentCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "toggle" | "t" => Ok(AgentCommand::Toggle),
            "start" => Ok(AgentCommand::Start),
            "stop" => Ok(AgentCommand::Stop),
            "status" => Ok(AgentCommand::Status),
            "list" | "ls" => Ok(AgentCommand::List),
            "background" | "bg" => Ok(AgentCommand::Background),
            "foreground" | "fg" => Ok(AgentCommand::Foreground),
            "quit" | "exit" | "q" => Ok(AgentCommand::Quit),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }

    // Held until exit so buffered log lines reach the file
    let _log_guard = logging::init_logging()?;
    info!("capture-agent starting...");
    if let Ok(dir) = logging::get_log_dir() {
        debug!("Writing logs to {:?}", dir);
    }

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded from {:?}", config.config_path()?);

    if let Some(backend) = args.backend {
        config.capture.backend = backend;
    }
    if let Some(secs) = args.duration_secs {
        config.capture.duration_ms = secs * 1000;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    // Set up Ctrl+C handler that asks the agent loop to shut down
    let ctrl_c_tx = cmd_tx.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let _ = ctrl_c_tx.send(AgentCommand::Quit);
    })?;

    if args.duration_secs.is_none() {
        spawn_stdin_reader(cmd_tx);
    }

    let timed = args.duration_secs.map(Duration::from_secs);
    runtime.block_on(run(config, timed, cmd_rx))?;

    info!("Shutdown complete");
    Ok(())
}

/// Forward stdin lines as commands; end of input means quit
fn spawn_stdin_reader(tx: mpsc::UnboundedSender<AgentCommand>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<AgentCommand>() {
                Ok(command) => {
                    if tx.send(command).is_err() {
                        return;
                    }
                }
                Err(e) => eprintln!(
                    "{} (try: toggle, start, stop, status, list, background, foreground, quit)",
                    e
                ),
            }
        }
        let _ = tx.send(AgentCommand::Quit);
    });
}

async fn run(
    config: Config,
    timed: Option<Duration>,
    mut commands: mpsc::UnboundedReceiver<AgentCommand>,
) -> Result<()> {
    let bus = EventBus::new(config.events.capacity);
    let printer = tokio::spawn(print_events(bus.subscribe()));

    let controller = SessionController::from_config(&config, bus);
    info!("Using {} backend", controller.backend_kind());

    let result = match timed {
        Some(duration) => run_timed(&controller, duration, &mut commands).await,
        None => {
            run_interactive(&controller, &mut commands).await;
            Ok(())
        }
    };

    controller.shutdown().await;
    drop(controller);

    // The printer ends once every publisher is gone
    if tokio::time::timeout(EVENT_FLUSH_TIMEOUT, printer).await.is_err() {
        debug!("Event printer still busy at exit");
    }

    result
}

/// Record once for `duration`, or until the capture ends on its own
async fn run_timed(
    controller: &SessionController,
    duration: Duration,
    commands: &mut mpsc::UnboundedReceiver<AgentCommand>,
) -> Result<()> {
    controller
        .start()
        .await
        .context("Failed to start recording")?;

    let mut session = controller.watch_session();
    let finished = session.wait_for(|s| s.as_ref().map_or(false, |s| s.state.is_terminal()));

    tokio::select! {
        _ = finished => {}
        _ = tokio::time::sleep(duration) => {}
        _ = wait_for_quit(commands) => info!("Interrupted before the recording finished"),
    }

    if controller.current_state() == SessionState::Recording {
        finish(controller).await?;
    }

    let snapshot = controller.snapshot();
    match snapshot.as_ref().and_then(|s| s.final_output_path.as_ref()) {
        Some(path) => {
            info!("Recording saved to {:?}", path);
            Ok(())
        }
        None => match snapshot.and_then(|s| s.last_error) {
            Some(err) => bail!("Recording failed ({}): {}", err.kind, err.message),
            None => bail!("Recording did not complete"),
        },
    }
}

/// Stop the timed recording. Losing the race to a capture that just ended on
/// its own is fine; the snapshot tells how that session went.
async fn finish(controller: &SessionController) -> Result<()> {
    match controller.stop().await {
        Ok(_) => Ok(()),
        Err(e) if e.is_rejected() => {
            debug!("Stop not needed: {}", e);
            Ok(())
        }
        Err(e) => Err(e).context("Failed to finish recording"),
    }
}

async fn wait_for_quit(commands: &mut mpsc::UnboundedReceiver<AgentCommand>) {
    while let Some(command) = commands.recv().await {
        if command == AgentCommand::Quit {
            return;
        }
        warn!("Ignoring {:?} during a timed recording", command);
    }
}

async fn run_interactive(
    controller: &SessionController,
    commands: &mut mpsc::UnboundedReceiver<AgentCommand>,
) {
    info!("Ready. Commands: toggle, start, stop, status, list, background, foreground, quit");

    while let Some(command) = commands.recv().await {
        debug!("Command: {:?}", command);
        match command {
            AgentCommand::Toggle => match controller.toggle().await {
                Ok(state) => info!("Session is now {}", state),
                Err(e) => warn!("toggle: {}", e),
            },
            AgentCommand::Start => {
                if let Err(e) = controller.start().await {
                    warn!("start: {}", e);
                }
            }
            AgentCommand::Stop => match controller.stop().await {
                Ok(path) => info!("Recording saved to {:?}", path),
                Err(e) => warn!("stop: {}", e),
            },
            AgentCommand::Status => match serde_json::to_string_pretty(&controller.snapshot()) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Failed to serialize status: {}", e),
            },
            AgentCommand::List => match controller.list_recordings().await {
                Ok(recordings) if recordings.is_empty() => println!("(no recordings)"),
                Ok(recordings) => {
                    for path in recordings {
                        println!("{}", path.display());
                    }
                }
                Err(e) => warn!("list: {}", e),
            },
            AgentCommand::Background => {
                if let Err(e) = controller.enter_background().await {
                    warn!("background: {}", e);
                }
            }
            AgentCommand::Foreground => {
                if let Err(e) = controller.enter_foreground().await {
                    warn!("foreground: {}", e);
                }
            }
            AgentCommand::Quit => break,
        }
    }
}

/// Print every event as one JSON line
async fn print_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to serialize event {}: {}", event.seq, e),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Event printer fell behind, {} events skipped", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_help() {
    println!("capture-agent - headless camera recording");
    println!();
    println!("USAGE:");
    println!("    capture-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help               Print this help message");
    println!("    -c, --config <PATH>      Use this config file instead of the default");
    println!("    -b, --backend <KIND>     Capture backend: sdk or process");
    println!("    -d, --duration <SECS>    Record once for SECS seconds, then exit");
    println!();
    println!("COMMANDS (stdin, without --duration):");
    println!("    toggle, start, stop, status, list, background, foreground, quit");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                 Set log level (e.g., debug, info, warn)");
    println!("    CAPTURE_AGENT_LOG_PATH   Override the log directory");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args() {
        let args = parse(&["--backend", "sdk", "-d", "10", "--config", "/etc/agent.toml"]).unwrap();
        assert_eq!(
            args,
            Args {
                help: false,
                config: Some(PathBuf::from("/etc/agent.toml")),
                backend: Some(BackendKind::Sdk),
                duration_secs: Some(10),
            }
        );
        assert_eq!(parse(&[]).unwrap(), Args::default());
    }

    #[test]
    fn test_parse_args_rejects_bad_values() {
        assert!(parse(&["--backend", "webcam"]).is_err());
        assert!(parse(&["--duration", "0"]).is_err());
        assert!(parse(&["--duration"]).is_err());
        assert!(parse(&["--record"]).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_finish_after_capture_ended_on_its_own() {
        use capture_agent::capture::{ProcessBackend, ProcessCaptureSettings, StreamConfig};
        use capture_agent::storage::PathResolver;
        use capture_agent::supervisor::{StopSignal, Supervisor};
        use capture_agent::ControllerSettings;

        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(64);
        let supervisor = Supervisor::new(
            bus.clone(),
            StopSignal::Terminate,
            Duration::from_millis(300),
        );
        let settings = ProcessCaptureSettings {
            program: "sh".to_string(),
            args: [
                "-c",
                "printf 'frames' > \"$1\"; sleep 0.3",
                "sh",
                "{output}",
                "{width}",
                "{height}",
                "{fps}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            output_extension: "h264".to_string(),
            liveness_check: Duration::from_millis(100),
            accept_exit_codes: vec![0],
        };
        let backend = ProcessBackend::new(supervisor, settings, StreamConfig::new(640, 480, 30), None);
        let controller = SessionController::new(
            Box::new(backend),
            bus,
            ControllerSettings {
                resolver: PathResolver::new(Some(dir.path().to_path_buf())),
                ..Default::default()
            },
        );

        controller.start().await.unwrap();
        let mut session = controller.watch_session();
        tokio::time::timeout(
            Duration::from_secs(10),
            session.wait_for(|s| s.as_ref().map_or(false, |s| s.state.is_terminal())),
        )
        .await
        .unwrap()
        .unwrap();

        // The stop arrives after the session completed and is not an error
        finish(&controller).await.unwrap();
        assert_eq!(controller.current_state(), SessionState::Completed);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("toggle".parse::<AgentCommand>(), Ok(AgentCommand::Toggle));
        assert_eq!(" STOP ".parse::<AgentCommand>(), Ok(AgentCommand::Stop));
        assert_eq!("bg".parse::<AgentCommand>(), Ok(AgentCommand::Background));
        assert!("record".parse::<AgentCommand>().is_err());
    }
}
