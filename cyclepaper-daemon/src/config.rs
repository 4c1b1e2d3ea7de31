use crate::candidate::{Candidate, Placement, TimeWindow};
use anyhow::{Context, Result};
use chrono::NaiveTime;
use cyclepaper_common::BuildModeName;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ScreenCycle {
    #[default]
    Random,
    Static,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default, rename = "screen")]
    pub screens: Vec<ScreenConfig>,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CycleConfig {
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_serde", default = "default_min_interval")]
    pub min_interval: Duration,
    #[serde(default = "default_history_percent")]
    pub history_percent: u8,
    #[serde(default)]
    pub build_mode: BuildModeName,
    #[serde(default = "default_true")]
    pub autostart: bool,
    /// Walk the pool directories again before every cycle.
    #[serde(default = "default_true")]
    pub rescan_on_cycle: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            min_interval: default_min_interval(),
            history_percent: default_history_percent(),
            build_mode: BuildModeName::default(),
            autostart: true,
            rescan_on_cycle: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolConfig {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub multiscreen: bool,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default, rename = "image")]
    pub images: Vec<ImageOverride>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            recursive: true,
            priority: default_priority(),
            multiscreen: false,
            placement: Placement::default(),
            images: Vec::new(),
        }
    }
}

/// Per-image settings, matched against a path exactly, by file name, or
/// by regex when prefixed with `re:`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ImageOverride {
    #[serde(rename = "match")]
    pub pattern: String,
    pub activated: Option<bool>,
    pub priority: Option<i32>,
    pub multiscreen: Option<bool>,
    pub window: Option<WindowConfig>,
    pub disabled_screens: Option<Vec<usize>>,
    pub placement: Option<Placement>,
    pub scale: Option<u32>,
    pub offset: Option<[i32; 2]>,
    pub background: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    pub start: String,
    pub stop: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScreenConfig {
    pub name: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub cycle: ScreenCycle,
    pub image: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    pub path: Option<PathBuf>,
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default = "default_true")]
    pub detect_screens: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: None,
            command: default_command(),
            detect_screens: true,
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_min_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_history_percent() -> u8 {
    30
}

fn default_priority() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_command() -> Vec<String> {
    ["feh", "--no-fehbg", "--bg-tile", "{path}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn config_path() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .context("Failed to get config directory")?
        .join("cyclepaper")
        .join("config.toml"))
}

impl Config {
    pub async fn load() -> Result<Self> {
        let config_path = config_path()?;

        if !config_path.exists() {
            tracing::warn!("No config file found at {:?}, using defaults", config_path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
        let config = Self::parse(&content)?;

        tracing::info!(
            "Loaded config: {} pool path(s), {} image override(s), {} screen(s)",
            config.pool.paths.len(),
            config.pool.images.len(),
            config.screens.len()
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).with_context(|| "Failed to parse config TOML")?;
        config.normalize();
        Ok(config)
    }

    /// Clamp values the cycler would otherwise reject.
    fn normalize(&mut self) {
        if self.cycle.history_percent > 100 {
            tracing::warn!(
                "history-percent {} is above 100, clamping",
                self.cycle.history_percent
            );
            self.cycle.history_percent = 100;
        }
        if self.cycle.interval < self.cycle.min_interval {
            tracing::warn!(
                "interval {:?} is below min-interval {:?}, raising it",
                self.cycle.interval,
                self.cycle.min_interval
            );
            self.cycle.interval = self.cycle.min_interval;
        }
        for path in &mut self.pool.paths {
            *path = expand_home(path);
        }
    }

    pub fn output_path(&self) -> Result<PathBuf> {
        match &self.output.path {
            Some(p) => Ok(expand_home(p)),
            None => Ok(dirs::cache_dir()
                .context("Failed to get cache directory")?
                .join("cyclepaper")
                .join("wallpaper.png")),
        }
    }

    /// Build a candidate for `path` with pool defaults and the first matching override.
    pub fn candidate_for(&self, path: &Path) -> Candidate {
        let mut candidate = Candidate::new(path);
        candidate.priority = self.pool.priority;
        candidate.multiscreen = self.pool.multiscreen;
        candidate.placement = self.pool.placement;

        if let Some(ov) = self.pool.images.iter().find(|o| o.matches(path)) {
            ov.apply(&mut candidate);
        }
        candidate
    }
}

impl ImageOverride {
    pub fn matches(&self, path: &Path) -> bool {
        if let Some(pattern) = self.pattern.strip_prefix("re:") {
            return match Regex::new(pattern) {
                Ok(re) => re.is_match(&path.to_string_lossy()),
                Err(e) => {
                    tracing::warn!("Invalid image match regex '{}': {}", pattern, e);
                    false
                }
            };
        }
        let wanted = expand_home(Path::new(&self.pattern));
        if wanted == path {
            return true;
        }
        path.file_name()
            .map(|n| n.to_string_lossy() == self.pattern)
            .unwrap_or(false)
    }

    fn apply(&self, c: &mut Candidate) {
        if let Some(v) = self.activated {
            c.activated = v;
        }
        if let Some(v) = self.priority {
            c.priority = v;
        }
        if let Some(v) = self.multiscreen {
            c.multiscreen = v;
        }
        if let Some(w) = &self.window {
            match w.parse() {
                Ok(window) => c.window = Some(window),
                Err(e) => tracing::warn!("Ignoring window for '{}': {}", self.pattern, e),
            }
        }
        if let Some(screens) = &self.disabled_screens {
            c.disabled_screens = screens.iter().copied().collect();
        }
        if let Some(v) = self.placement {
            c.placement = v;
        }
        if let Some(v) = self.scale {
            c.scale = v;
        }
        if let Some([x, y]) = self.offset {
            c.offset = (x, y);
        }
        if let Some(hex) = &self.background {
            match parse_hex_color(hex) {
                Some(color) => c.background = color,
                None => tracing::warn!("Ignoring invalid background colour '{}'", hex),
            }
        }
    }
}

impl WindowConfig {
    pub fn parse(&self) -> Result<TimeWindow> {
        Ok(TimeWindow::new(parse_time(&self.start)?, parse_time(&self.stop)?))
    }
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .with_context(|| format!("Invalid time of day '{}' (expected HH:MM)", s))
}

pub fn parse_hex_color(hex: &str) -> Option<[u8; 4]> {
    let hex = hex.trim_start_matches('#').trim_start_matches("0x");
    if hex.len() != 6 && hex.len() != 8 {
        return None;
    }
    let r = u8::from_str_radix(hex.get(0..2)?, 16).ok()?;
    let g = u8::from_str_radix(hex.get(2..4)?, 16).ok()?;
    let b = u8::from_str_radix(hex.get(4..6)?, 16).ok()?;
    let a = if hex.len() == 8 {
        u8::from_str_radix(hex.get(6..8)?, 16).ok()?
    } else {
        255
    };
    Some([r, g, b, a])
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
