use tracing_subscriber::{prelude::*, EnvFilter, Registry};
use tracing_subscriber::fmt as subscriber_fmt;
use tracing_subscriber::filter::LevelFilter;
use tracing::{info, warn, debug, error};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use cyclepaper_common::{CheckInfo, Request, Response, ScreenInfo, StatusInfo};

mod builder;
mod candidate;
mod config;
mod cycler;
mod error;
mod filter;
mod gate;
mod history;
mod mode;
mod picker;
mod pool;
mod sink;
mod topology;
mod x11;

use crate::builder::ImageCompositor;
use crate::cycler::{CycleEvent, CycleRequest, CycleSettings, Cycler, CyclerParts};
use crate::gate::BuildGate;
use crate::pool::DirectoryPool;
use crate::sink::CommandSink;
use crate::topology::{ConfigTopology, TopologyProvider};

use chrono::Local;

struct CustomTimer;

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Show version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Log level 1-4 (warn, info, debug, trace); also writes a log file
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=4))]
    log: Option<u8>,
}

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 1. Initialize Logging
    let log_level = args.log;
    let _guards = {
        let filter = match log_level {
            Some(1) => LevelFilter::WARN,
            Some(2) => LevelFilter::INFO,
            Some(3) => LevelFilter::DEBUG,
            Some(4) => LevelFilter::TRACE,
            _ => LevelFilter::INFO,
        };

        let env_filter = EnvFilter::builder()
            .with_default_directive(filter.into())
            .from_env_lossy()
            .add_directive("x11rb=warn".parse()?);

        if let Some(level) = log_level {
            let log_dir = dirs::config_dir()
                .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
                .join("cyclepaper")
                .join("logs");
            std::fs::create_dir_all(&log_dir)?;

            let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
            let log_path = log_dir.join(format!("cyclepaper-daemon-{}.log", timestamp));
            let file = std::fs::File::create(&log_path)?;
            println!("Logging to file: {}", log_path.display());
            let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file);
            let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

            let file_layer = subscriber_fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_timer(CustomTimer);

            let stdout_layer = subscriber_fmt::layer()
                .with_writer(non_blocking_stdout)
                .with_timer(CustomTimer);

            Registry::default()
                .with(env_filter)
                .with(file_layer)
                .with(stdout_layer)
                .init();

            info!("cyclepaper daemon starting... (Level {}, File: {})", level, log_dir.display());
            (Some(file_guard), Some(stdout_guard))
        } else {
            let stdout_layer = subscriber_fmt::layer()
                .with_writer(std::io::stdout)
                .with_timer(CustomTimer);

            Registry::default()
                .with(env_filter)
                .with(stdout_layer)
                .init();
            info!("cyclepaper daemon starting...");
            (None, None)
        }
    };

    // 2. Load Configuration
    let mut config = match config::Config::load().await {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("Failed to load configuration: {:#}. Using defaults.", e);
            config::Config::default()
        }
    };

    // 3. Build the cycler
    let gate = BuildGate::new();
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let mut cycler = Cycler::new(cycler_parts(&config, &gate)?, report_tx);
    spawn_event_logger(cycler.subscribe());

    let (screen_tx, mut screen_rx) = mpsc::unbounded_channel();
    if config.output.detect_screens && std::env::var("DISPLAY").is_ok() {
        x11::spawn_change_watcher(screen_tx.clone());
    }

    // 4. IPC
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<(Request, oneshot::Sender<Response>)>();
    let socket_path = socket_path();
    spawn_ipc_listener(&socket_path, cmd_tx)?;
    info!("[IPC] Listening on {}", socket_path.display());

    if config.cycle.autostart {
        cycler.start_cycling()?;
    }
    if let Err(e) = cycler.cycle_next_randomly(None) {
        warn!("[CYCLE] Initial cycle failed: {}", e);
    }

    loop {
        let deadline = cycler.deadline();
        tokio::select! {
            _ = sleep_until(deadline) => {
                cycler.tick(Instant::now());
            }
            Some(report) = report_rx.recv() => {
                cycler.handle_build_report(report);
            }
            Some(()) = screen_rx.recv() => {
                // RandR sends bursts, one refresh covers them all
                while screen_rx.try_recv().is_ok() {}
                info!("[SCREENS] Display configuration changed");
                if let Err(e) = cycler.refresh_topology() {
                    warn!("[SCREENS] Refresh failed: {}", e);
                }
            }
            Some((req, resp)) = cmd_rx.recv() => {
                let kill = matches!(req, Request::Kill);
                let response = handle_command(req, &mut cycler, &mut config, &gate).await;
                let _ = resp.send(response);
                if kill {
                    info!("[IPC] Kill requested");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Received shutdown signal, cleaning up...");
                break;
            }
        }
    }

    cycler.dispose();
    drop(screen_tx);
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn cycler_parts(config: &config::Config, gate: &Arc<BuildGate>) -> anyhow::Result<CyclerParts> {
    let mut topology = ConfigTopology::new(config.screens.clone(), config.output.detect_screens);
    topology.refresh_bounds()?;

    Ok(CyclerParts {
        pool: Box::new(DirectoryPool::new(config.clone())),
        topology: Box::new(topology),
        compositor: Arc::new(ImageCompositor),
        sink: Arc::new(CommandSink::new(config.output.command.clone())),
        gate: Arc::clone(gate),
        output: config.output_path()?,
        settings: CycleSettings::from(&config.cycle),
    })
}

fn socket_path() -> PathBuf {
    dirs::runtime_dir()
        .map(|d| d.join("cyclepaper.sock"))
        .unwrap_or_else(|| {
            let uid = std::env::var("USER").unwrap_or_else(|_| "cyclepaper".to_string());
            PathBuf::from(format!("/tmp/cyclepaper-{}.sock", uid))
        })
}

fn spawn_ipc_listener(
    socket_path: &Path,
    cmd_tx: mpsc::UnboundedSender<(Request, oneshot::Sender<Response>)>,
) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(socket_path) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(socket_path, perms);
        }
    }

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("[IPC] Accept failed: {}", e);
                    continue;
                }
            };
            let cmd_tx = cmd_tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
                let n = match stream.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("[IPC] Read failed: {}", e);
                        return;
                    }
                };
                let response = match serde_json::from_slice::<Request>(&buf[..n]) {
                    Ok(req) => {
                        debug!("[IPC] {:?}", req);
                        let (tx, rx) = oneshot::channel();
                        if cmd_tx.send((req, tx)).is_err() {
                            return;
                        }
                        match rx.await {
                            Ok(resp) => resp,
                            Err(_) => return,
                        }
                    }
                    Err(e) => Response::Error(format!("invalid request: {}", e)),
                };
                match serde_json::to_vec(&response) {
                    Ok(bytes) => {
                        let _ = stream.write_all(&bytes).await;
                    }
                    Err(e) => error!("[IPC] Failed to encode response: {}", e),
                }
            });
        }
    });
    Ok(())
}

fn spawn_event_logger(mut events: broadcast::Receiver<CycleEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CycleEvent::ActiveWallpapersChanged(paths)) => {
                    let names: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                    info!("[CYCLE] Now showing: {}", names.join(", "));
                }
                Ok(CycleEvent::BuildFault(msg)) => error!("[BUILD] {}", msg),
                Ok(event) => debug!("[CYCLE] {:?}", event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[CYCLE] Event logger skipped {} event(s)", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn respond(result: Result<(), error::CycleError>) -> Response {
    match result {
        Ok(()) => Response::Ok,
        Err(e) => Response::Error(e.to_string()),
    }
}

async fn handle_command(
    req: Request,
    cycler: &mut Cycler,
    config: &mut config::Config,
    gate: &Arc<BuildGate>,
) -> Response {
    match req {
        Request::Status => Response::Status(status(cycler)),
        Request::Next => respond(cycler.cycle(CycleRequest::Random(None))),
        Request::Set { paths } => {
            let mut images = Vec::with_capacity(paths.len());
            for p in paths {
                let path = PathBuf::from(&p);
                if !path.is_file() {
                    return Response::Error(format!("{} is not a file", p));
                }
                images.push(config.candidate_for(&path));
            }
            respond(cycler.cycle(CycleRequest::Explicit(images)))
        }
        Request::Start => respond(cycler.start_cycling()),
        Request::Stop => respond(cycler.stop_cycling()),
        Request::Reset => respond(cycler.reset_autocycling()),
        Request::Interval { interval } => respond(cycler.set_interval(interval)),
        Request::HistorySize { percent } => respond(cycler.set_history_percent(percent)),
        Request::BuildMode { mode } => respond(cycler.set_build_mode(mode.into())),
        Request::Check => {
            let pool = match cycler.request_pool() {
                Ok(pool) => pool,
                Err(e) => {
                    return Response::Check(CheckInfo {
                        ok: false,
                        pool_size: 0,
                        eligible: 0,
                        message: Some(e.to_string()),
                    })
                }
            };
            let pool_size = pool.len();
            let eligible = pool.iter().filter(|c| c.is_eligible()).count();
            match cycler.check_wallpaper_list_integrity(Some(pool)) {
                Ok(ok) => Response::Check(CheckInfo {
                    ok,
                    pool_size,
                    eligible,
                    message: (!ok).then(|| "not enough usable wallpapers for the current screens".to_string()),
                }),
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::History => Response::History(
            cycler
                .recent()
                .iter()
                .map(|c| c.path.display().to_string())
                .collect(),
        ),
        Request::Refresh => respond(cycler.refresh_topology()),
        Request::Reload => {
            let new_config = match config::Config::load().await {
                Ok(cfg) => cfg,
                Err(e) => return Response::Error(format!("{:#}", e)),
            };
            let parts = match cycler_parts(&new_config, gate) {
                Ok(parts) => parts,
                Err(e) => return Response::Error(format!("{:#}", e)),
            };
            *config = new_config;
            info!("[CYCLE] Configuration reloaded");
            respond(cycler.reconfigure(parts))
        }
        Request::Kill => Response::Ok,
    }
}

fn status(cycler: &Cycler) -> StatusInfo {
    let settings = cycler.settings();
    StatusInfo {
        autocycling: cycler.is_autocycling(),
        interval: settings.interval,
        remaining: cycler.time_until_next_cycle(),
        since_last_cycle: cycler.last_cycle().map(|t| t.elapsed()),
        history_percent: settings.history_percent,
        build_mode: settings.build_mode.into(),
        building: cycler.is_building(),
        screens: cycler
            .topology()
            .screens
            .iter()
            .map(|s| ScreenInfo {
                name: s.name.clone(),
                x: s.bounds.x,
                y: s.bounds.y,
                width: s.bounds.width,
                height: s.bounds.height,
                random: s.is_random(),
            })
            .collect(),
        active: cycler
            .active_set()
            .iter()
            .map(|c| c.path.display().to_string())
            .collect(),
        last_error: cycler.last_error().map(str::to_string),
    }
}
