mod app;
mod backup;
mod cli;
mod config;
mod conflict;
mod engine;
mod health;
mod input;
mod k8s;
mod supervisor;
mod ui;

use anyhow::{Context, Result};
use app::App;
use clap::Parser;
use cli::{CliArgs, Command};
use crossterm::event::{Event, EventStream, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use futures::StreamExt;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::ForwardManager;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const DEFAULT_LOG_FILE: &str = "moray.log";
const TUI_REFRESH: Duration = Duration::from_secs(1);
const STARTUP_BACKUP_WAIT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args)?;

    info!(path = %args.config.display(), "loading configuration");
    let config = config::load(&args.config)?;
    info!(
        clusters = config.clusters.len(),
        check_interval = ?config.check_interval,
        reconnect_delay = ?config.reconnect_delay,
        "configuration loaded"
    );
    info!(count = config.forward_count(), "port-forwards configured");

    if let Some(Command::Backup { dir, timeout }) = args.command {
        return backup::run_backup_command(config, dir, Duration::from_secs(timeout)).await;
    }

    info!("checking for port conflicts");
    conflict::resolve_conflicts(&config).await?;

    let manager = Arc::new(ForwardManager::init(&config).await?);
    info!("starting port-forwards");
    let tasks = manager.start();

    if config.backup_count() > 0 {
        info!(count = config.backup_count(), "scheduling database backups");
        let backup_manager = manager.clone();
        tokio::spawn(async move {
            let runner =
                match backup::BackupRunner::new(backup_manager, "backups", STARTUP_BACKUP_WAIT) {
                    Ok(runner) => runner,
                    Err(init_error) => {
                        error!(error = %init_error, "failed to initialize backup runner");
                        return;
                    }
                };
            if let Err(run_error) = runner.run_all().await {
                warn!(error = %run_error, "backup pass completed with errors");
            }
        });
    }

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => {
                    info!("received shutdown signal");
                    manager.stop();
                }
                Err(signal_error) => {
                    error!(error = %signal_error, "failed to listen for shutdown signals");
                }
            }
        });
    }

    run(&manager).await?;

    manager.stop();
    for task in tasks {
        let _ = task.await;
    }
    info!("moray shutdown complete");
    Ok(())
}

fn init_tracing(args: &CliArgs) -> Result<()> {
    let directive = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_new(directive).context("failed to initialize tracing filter")?;

    let path = args
        .log
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .with_writer(std::sync::Mutex::new(file))
        .try_init();

    println!("Logging to: {}", path.display());
    Ok(())
}

async fn wait_for_shutdown_signal() -> io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

async fn run(manager: &Arc<ForwardManager>) -> Result<()> {
    let mut terminal = init_terminal()?;
    let run_result = run_loop(&mut terminal, manager).await;
    let restore_result = restore_terminal(&mut terminal);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(run_error), _) => Err(run_error),
        (_, Err(restore_error)) => Err(restore_error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_terminal() -> Result<TuiTerminal> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut TuiTerminal) -> Result<()> {
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn run_loop(terminal: &mut TuiTerminal, manager: &ForwardManager) -> Result<()> {
    let mut app = App::new(manager.snapshot());
    let mut reader = EventStream::new();
    let mut ticker = interval(TUI_REFRESH);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut updates = manager
        .take_updates()
        .context("update channel already taken")?;
    let shutdown = manager.shutdown_token();

    loop {
        terminal
            .draw(|frame| ui::render(frame, &app))
            .context("failed to render terminal frame")?;

        if app.quitting() {
            break;
        }

        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        match input::map_key(key) {
                            Some(input::Action::Quit) => {
                                app.begin_shutdown();
                                manager.stop();
                            }
                            Some(input::Action::Refresh) => app.set_rows(manager.snapshot()),
                            None => {}
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(event_error)) => {
                        return Err(event_error).context("terminal event stream failed");
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => app.set_rows(manager.snapshot()),
            maybe_update = updates.recv() => {
                if maybe_update.is_some() {
                    app.set_rows(manager.snapshot());
                }
            }
            _ = shutdown.cancelled() => app.begin_shutdown(),
        }
    }

    Ok(())
}
