use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "next")]
    Next,
    /// Apply exactly these images (all spanning or all per-screen).
    #[serde(rename = "set")]
    Set { paths: Vec<String> },
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "reset")]
    Reset,
    #[serde(rename = "interval")]
    Interval {
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    #[serde(rename = "history-size")]
    HistorySize { percent: u8 },
    #[serde(rename = "build-mode")]
    BuildMode { mode: BuildModeName },
    #[serde(rename = "check")]
    Check,
    #[serde(rename = "history")]
    History,
    #[serde(rename = "refresh")]
    Refresh,
    #[serde(rename = "reload")]
    Reload,
    #[serde(rename = "kill")]
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BuildModeName {
    #[default]
    ReplaceAll,
    ReplaceAllCloned,
    ReplaceOneByOne,
}

impl BuildModeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildModeName::ReplaceAll => "replace-all",
            BuildModeName::ReplaceAllCloned => "replace-all-cloned",
            BuildModeName::ReplaceOneByOne => "replace-one-by-one",
        }
    }
}

impl std::str::FromStr for BuildModeName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace-all" | "all" => Ok(BuildModeName::ReplaceAll),
            "replace-all-cloned" | "cloned" => Ok(BuildModeName::ReplaceAllCloned),
            "replace-one-by-one" | "one-by-one" => Ok(BuildModeName::ReplaceOneByOne),
            other => Err(format!(
                "unknown build mode '{}' (expected replace-all, replace-all-cloned or replace-one-by-one)",
                other
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Response {
    Ok,
    Error(String),
    Status(StatusInfo),
    Check(CheckInfo),
    History(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub autocycling: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Remaining time until the next automatic cycle, if the timer is armed.
    #[serde(with = "humantime_serde", default)]
    pub remaining: Option<Duration>,
    /// Time since the last cycle started, if any ran.
    #[serde(with = "humantime_serde", default)]
    pub since_last_cycle: Option<Duration>,
    pub history_percent: u8,
    pub build_mode: BuildModeName,
    pub building: bool,
    pub screens: Vec<ScreenInfo>,
    pub active: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenInfo {
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub random: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInfo {
    pub ok: bool,
    pub pool_size: usize,
    pub eligible: usize,
    pub message: Option<String>,
}
