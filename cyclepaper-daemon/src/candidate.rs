use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// How an image is laid into its target rectangle by the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    /// Cover the rectangle, cropping what overflows
    #[default]
    Fill,
    /// Fit inside the rectangle, padding with the background colour
    Fit,
    Stretch,
    /// Keep the native size, centred
    Center,
    Tile,
}

/// Daily window during which an image may be picked.
///
/// The window is cyclic: `22:00 -> 06:00` spans midnight. Equal start and
/// stop means the image is always eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub stop: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, stop: NaiveTime) -> Self {
        Self { start, stop }
    }

    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start == self.stop {
            return true;
        }
        if self.start < self.stop {
            now >= self.start && now < self.stop
        } else {
            now >= self.start || now < self.stop
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub path: PathBuf,
    pub activated: bool,
    /// Spans all screens instead of fitting a single one.
    pub multiscreen: bool,
    pub priority: i32,
    pub window: Option<TimeWindow>,
    pub placement: Placement,
    /// Percent of the fitted size.
    pub scale: u32,
    pub offset: (i32, i32),
    pub background: [u8; 4],
    pub disabled_screens: BTreeSet<usize>,
}

impl Candidate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            activated: true,
            multiscreen: false,
            priority: 100,
            window: None,
            placement: Placement::default(),
            scale: 100,
            offset: (0, 0),
            background: [0, 0, 0, 255],
            disabled_screens: BTreeSet::new(),
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.activated && self.priority > 0
    }

    /// Time-of-day condition. Images without a window always pass.
    pub fn condition_holds(&self, now: NaiveTime) -> bool {
        self.window.map_or(true, |w| w.contains(now))
    }

    pub fn allowed_on(&self, screen: usize) -> bool {
        !self.disabled_screens.contains(&screen)
    }

    /// Identity used by the recency window and the active set.
    pub fn same_image(&self, other: &Candidate) -> bool {
        self.path == other.path
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}
