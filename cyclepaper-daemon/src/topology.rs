use crate::config::{ScreenConfig, ScreenCycle};
use anyhow::Result;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, (right - x) as u32, (bottom - y) as u32)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreenSettings {
    pub name: String,
    pub bounds: Rect,
    pub cycle: ScreenCycle,
    /// Image shown on a static screen.
    pub static_image: Option<PathBuf>,
}

impl ScreenSettings {
    pub fn is_random(&self) -> bool {
        self.cycle == ScreenCycle::Random
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScreenTopology {
    pub screens: Vec<ScreenSettings>,
}

impl ScreenTopology {
    pub fn new(screens: Vec<ScreenSettings>) -> Self {
        Self { screens }
    }

    pub fn count(&self) -> usize {
        self.screens.len()
    }

    pub fn random_cycled_screen_count(&self) -> usize {
        self.screens.iter().filter(|s| s.is_random()).count()
    }

    pub fn random_screen_indices(&self) -> Vec<usize> {
        self.screens
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_random())
            .map(|(i, _)| i)
            .collect()
    }

    /// Bounding box of every screen, i.e. the canvas of a composite.
    pub fn union_bounds(&self) -> Rect {
        let mut iter = self.screens.iter().map(|s| s.bounds);
        match iter.next() {
            Some(first) => iter.fold(first, |acc, r| acc.union(&r)),
            None => Rect::default(),
        }
    }

    /// Bounding box of the randomly cycled screens, the area a spanning image covers.
    pub fn random_bounds(&self) -> Rect {
        let mut iter = self.screens.iter().filter(|s| s.is_random()).map(|s| s.bounds);
        match iter.next() {
            Some(first) => iter.fold(first, |acc, r| acc.union(&r)),
            None => Rect::default(),
        }
    }
}

/// Source of the screen layout.
pub trait TopologyProvider: Send {
    fn topology(&self) -> ScreenTopology;

    /// Re-read screen bounds after a display configuration change.
    fn refresh_bounds(&mut self) -> Result<()>;
}

/// Screens declared in the config, optionally re-measured through RandR.
pub struct ConfigTopology {
    configured: Vec<ScreenConfig>,
    detect: bool,
    current: ScreenTopology,
}

impl ConfigTopology {
    pub fn new(configured: Vec<ScreenConfig>, detect: bool) -> Self {
        let current = Self::from_config(&configured);
        Self {
            configured,
            detect,
            current,
        }
    }

    fn from_config(configured: &[ScreenConfig]) -> ScreenTopology {
        ScreenTopology::new(
            configured
                .iter()
                .map(|s| ScreenSettings {
                    name: s.name.clone(),
                    bounds: Rect::new(s.x, s.y, s.width, s.height),
                    cycle: s.cycle,
                    static_image: s.image.clone(),
                })
                .collect(),
        )
    }

    /// Merge detected monitors with configured settings.
    ///
    /// Monitors are matched by name; unmatched monitors cycle randomly.
    fn merge_detected(&self, detected: Vec<(String, Rect)>) -> ScreenTopology {
        let screens = detected
            .into_iter()
            .map(|(name, bounds)| {
                let configured = self.configured.iter().find(|c| c.name == name);
                ScreenSettings {
                    cycle: configured.map(|c| c.cycle).unwrap_or(ScreenCycle::Random),
                    static_image: configured.and_then(|c| c.image.clone()),
                    name,
                    bounds,
                }
            })
            .collect();
        ScreenTopology::new(screens)
    }
}

impl TopologyProvider for ConfigTopology {
    fn topology(&self) -> ScreenTopology {
        self.current.clone()
    }

    fn refresh_bounds(&mut self) -> Result<()> {
        if !self.detect || std::env::var("DISPLAY").is_err() {
            self.current = Self::from_config(&self.configured);
            debug!("[SCREENS] Using {} configured screen(s)", self.current.count());
            return Ok(());
        }

        match crate::x11::detect_monitors() {
            Ok(detected) if !detected.is_empty() => {
                self.current = self.merge_detected(detected);
                info!(
                    "[SCREENS] Detected {} monitor(s), {} randomly cycled",
                    self.current.count(),
                    self.current.random_cycled_screen_count()
                );
            }
            Ok(_) => {
                warn!("[SCREENS] RandR reported no monitors, keeping configured layout");
                self.current = Self::from_config(&self.configured);
            }
            Err(e) => {
                warn!("[SCREENS] Monitor detection failed: {}. Keeping configured layout", e);
                self.current = Self::from_config(&self.configured);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// `random` screens side by side at 1920x1080, followed by `fixed` static ones.
    pub fn row(random: usize, fixed: usize) -> ScreenTopology {
        let mut screens = Vec::new();
        for i in 0..random + fixed {
            screens.push(ScreenSettings {
                name: format!("OUT-{}", i),
                bounds: Rect::new(i as i32 * 1920, 0, 1920, 1080),
                cycle: if i < random {
                    ScreenCycle::Random
                } else {
                    ScreenCycle::Static
                },
                static_image: None,
            });
        }
        ScreenTopology::new(screens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen(name: &str, cycle: ScreenCycle) -> ScreenConfig {
        ScreenConfig {
            name: name.to_string(),
            x: 0,
            y: 0,
            width: 1280,
            height: 1024,
            cycle,
            image: None,
        }
    }

    #[test]
    fn test_union_bounds_handles_negative_origin() {
        let topo = ScreenTopology::new(vec![
            ScreenSettings {
                name: "left".into(),
                bounds: Rect::new(-1280, 200, 1280, 1024),
                cycle: ScreenCycle::Random,
                static_image: None,
            },
            ScreenSettings {
                name: "main".into(),
                bounds: Rect::new(0, 0, 2560, 1440),
                cycle: ScreenCycle::Static,
                static_image: None,
            },
        ]);
        assert_eq!(topo.union_bounds(), Rect::new(-1280, 0, 3840, 1440));
        assert_eq!(topo.random_bounds(), Rect::new(-1280, 200, 1280, 1024));
    }

    #[test]
    fn test_random_screen_count() {
        let topo = testing::row(2, 1);
        assert_eq!(topo.count(), 3);
        assert_eq!(topo.random_cycled_screen_count(), 2);
        assert_eq!(topo.random_screen_indices(), vec![0, 1]);
    }

    #[test]
    fn test_merge_detected_keeps_configured_cycle() {
        let provider = ConfigTopology::new(
            vec![screen("DP-1", ScreenCycle::Static), screen("HDMI-1", ScreenCycle::Random)],
            true,
        );
        let merged = provider.merge_detected(vec![
            ("DP-1".into(), Rect::new(0, 0, 1920, 1080)),
            ("eDP-1".into(), Rect::new(1920, 0, 1920, 1200)),
        ]);
        assert_eq!(merged.count(), 2);
        assert!(!merged.screens[0].is_random());
        assert!(merged.screens[1].is_random());
        assert_eq!(merged.screens[1].bounds.height, 1200);
    }

    #[test]
    fn test_refresh_without_detection_uses_config() {
        let mut provider = ConfigTopology::new(vec![screen("A", ScreenCycle::Random)], false);
        provider.refresh_bounds().unwrap();
        assert_eq!(provider.topology().count(), 1);
    }
}
