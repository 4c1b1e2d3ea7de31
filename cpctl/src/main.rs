use anyhow::Context;
use clap::{Parser, Subcommand};
use cyclepaper_common::{BuildModeName, Request, Response, StatusInfo};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(
    name = "cpctl",
    version,
    disable_version_flag = true,
    about = "cyclepaper control utility - drive the wallpaper cycler",
    long_about = r#"
cyclepaper Control Utility (cpctl)
══════════════════════════════════

A CLI tool to control the cyclepaper daemon.

Pool directories, screens and per-image rules live in the config file at
~/.config/cyclepaper/config.toml

EXAMPLES:
  cpctl next                          Pick new random wallpapers now
  cpctl set ~/walls/a.png ~/walls/b.png
                                      Show exactly these images
  cpctl interval 15m                  Cycle every 15 minutes
  cpctl build-mode one-by-one         Replace one screen per cycle
  cpctl check                         Verify the pool can fill every screen
"#,
    after_help = "Use 'cpctl <command> --help' for more info on a specific command."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon socket path (defaults to XDG_RUNTIME_DIR/cyclepaper.sock or /tmp/cyclepaper-{USER}.sock)
    #[arg(short, long, global = true)]
    socket: Option<String>,

    /// Show version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cycler state, screens and active wallpapers
    #[command(visible_alias = "st")]
    Status,

    /// Cycle to new randomly picked wallpapers
    #[command(visible_alias = "n")]
    Next,

    /// Show exactly the given images
    ///
    /// Either one spanning image, or one image per randomly cycled screen.
    Set {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Start automatic cycling
    Start,

    /// Stop automatic cycling
    Stop,

    /// Restart the autocycle countdown
    Reset,

    /// Set the autocycle interval (e.g. "90s", "10m", "1h 30m")
    Interval {
        #[arg(value_parser = humantime::parse_duration)]
        interval: Duration,
    },

    /// Set how much of the eligible pool is remembered as recently shown, in percent
    #[command(name = "history-size")]
    HistorySize {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        percent: u8,
    },

    /// Choose how per-screen wallpapers are replaced
    ///
    /// replace-all, replace-all-cloned or replace-one-by-one
    #[command(name = "build-mode")]
    BuildMode {
        #[arg(value_parser = parse_build_mode)]
        mode: BuildModeName,
    },

    /// Check whether the pool can fill every randomly cycled screen
    Check,

    /// Show recently shown wallpapers
    #[command(visible_alias = "h")]
    History,

    /// Re-read screen geometry
    Refresh,

    /// Validate configuration file without contacting the daemon
    #[command(name = "check-config", visible_alias = "cc")]
    CheckConfig,

    /// Reload configuration from disk
    Reload,

    /// Stop the daemon gracefully
    Kill,
}

fn parse_build_mode(s: &str) -> Result<BuildModeName, String> {
    s.parse()
}

fn default_socket() -> String {
    dirs::runtime_dir()
        .map(|d| d.join("cyclepaper.sock").to_string_lossy().to_string())
        .unwrap_or_else(|| {
            let uid = std::env::var("USER").unwrap_or_else(|_| "cyclepaper".to_string());
            format!("/tmp/cyclepaper-{}.sock", uid)
        })
}

fn check_config() -> anyhow::Result<()> {
    let config_path = dirs::config_dir()
        .map(|p| p.join("cyclepaper").join("config.toml"))
        .unwrap_or_else(|| std::path::PathBuf::from("config.toml"));

    if !config_path.exists() {
        println!("✓ No config file found at {:?} (using defaults)", config_path);
        return Ok(());
    }

    let content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {:?}", config_path))?;
    let value = match toml::from_str::<toml::Value>(&content) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let mut problems = Vec::new();
    if let Some(interval) = value.get("cycle").and_then(|c| c.get("interval")) {
        match interval.as_str().map(humantime::parse_duration) {
            Some(Ok(_)) => {}
            Some(Err(e)) => problems.push(format!("cycle.interval: {}", e)),
            None => problems.push("cycle.interval: expected a duration string".to_string()),
        }
    }
    if let Some(mode) = value.get("cycle").and_then(|c| c.get("build-mode")) {
        if let Err(e) = mode.clone().try_into::<BuildModeName>() {
            problems.push(format!("cycle.build-mode: {}", e));
        }
    }
    let has_paths = value
        .get("pool")
        .and_then(|p| p.get("paths"))
        .and_then(|p| p.as_array())
        .is_some_and(|p| !p.is_empty());
    if !has_paths {
        println!("! No pool.paths configured, random cycling will have nothing to show");
    }

    if problems.is_empty() {
        println!("✓ Configuration valid: {:?}", config_path);
        Ok(())
    } else {
        for p in problems {
            eprintln!("✗ {}", p);
        }
        std::process::exit(1);
    }
}

fn absolute(path: String) -> String {
    std::fs::canonicalize(&path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or(path)
}

fn print_status(status: StatusInfo) {
    println!(
        "Autocycling: {}",
        if status.autocycling { "on" } else { "off" }
    );
    println!("Interval:    {}", humantime::format_duration(status.interval));
    if let Some(remaining) = status.remaining {
        let secs = Duration::from_secs(remaining.as_secs());
        println!("Next cycle:  in {}", humantime::format_duration(secs));
    }
    if let Some(since) = status.since_last_cycle {
        let secs = Duration::from_secs(since.as_secs());
        println!("Last cycle:  {} ago", humantime::format_duration(secs));
    }
    println!("History:     {}% of the eligible pool", status.history_percent);
    println!("Build mode:  {}", status.build_mode.as_str());
    if status.building {
        println!("Building:    yes");
    }
    if let Some(err) = status.last_error {
        println!("Last error:  {}", err);
    }

    println!();
    println!("{:<12} | {:<22} | {:<6}", "Screen", "Geometry", "Cycled");
    println!("{}", "-".repeat(46));
    for s in status.screens {
        println!(
            "{:<12} | {:<22} | {:<6}",
            s.name,
            format!("{}x{}+{}+{}", s.width, s.height, s.x, s.y),
            if s.random { "yes" } else { "no" }
        );
    }

    println!();
    if status.active.is_empty() {
        println!("Active: none");
    } else {
        println!("Active:");
        for path in status.active {
            println!(" - {}", path);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::CheckConfig => return check_config(),
        Commands::Status => Request::Status,
        Commands::Next => Request::Next,
        Commands::Set { paths } => Request::Set {
            paths: paths.into_iter().map(absolute).collect(),
        },
        Commands::Start => Request::Start,
        Commands::Stop => Request::Stop,
        Commands::Reset => Request::Reset,
        Commands::Interval { interval } => Request::Interval { interval },
        Commands::HistorySize { percent } => Request::HistorySize { percent },
        Commands::BuildMode { mode } => Request::BuildMode { mode },
        Commands::Check => Request::Check,
        Commands::History => Request::History,
        Commands::Refresh => Request::Refresh,
        Commands::Reload => Request::Reload,
        Commands::Kill => Request::Kill,
    };

    let socket_path = cli.socket.unwrap_or_else(default_socket);

    let mut stream = match UnixStream::connect(&socket_path).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Failed to connect to daemon at {}: {}", socket_path, e);
            eprintln!("Is cyclepaper-daemon running?");
            std::process::exit(1);
        }
    };

    let req_json = serde_json::to_vec(&request)?;
    stream
        .write_all(&req_json)
        .await
        .context("Failed to send request")?;

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .context("Failed to read response")?;

    if response.is_empty() {
        println!("OK");
        return Ok(());
    }

    match serde_json::from_str::<Response>(&response) {
        Ok(Response::Ok) => println!("OK"),
        Ok(Response::Error(e)) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
        Ok(Response::Status(status)) => print_status(status),
        Ok(Response::Check(check)) => {
            let mark = if check.ok { "✓" } else { "✗" };
            println!(
                "{} {} image(s) in pool, {} eligible",
                mark, check.pool_size, check.eligible
            );
            if let Some(message) = check.message {
                println!("  {}", message);
            }
        }
        Ok(Response::History(paths)) => {
            println!("History (most recent last):");
            for (i, path) in paths.iter().enumerate() {
                println!(" {:>2}. {}", i + 1, path);
            }
        }
        Err(_) => println!("{}", response),
    }

    Ok(())
}
