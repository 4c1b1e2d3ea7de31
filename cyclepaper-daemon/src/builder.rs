use crate::candidate::{Candidate, Placement};
use crate::topology::{Rect, ScreenTopology};
use anyhow::{Context, Result};
use cyclepaper_common::BuildModeName;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use std::sync::Arc;

/// How a cycle changes the desktop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// Every randomly cycled screen gets a fresh image.
    #[default]
    ReplaceAll,
    /// One fresh image, cloned onto every randomly cycled screen.
    ReplaceAllCloned,
    /// Only one screen changes per cycle, in turn.
    ReplaceOneByOne,
}

impl From<BuildModeName> for BuildMode {
    fn from(name: BuildModeName) -> Self {
        match name {
            BuildModeName::ReplaceAll => BuildMode::ReplaceAll,
            BuildModeName::ReplaceAllCloned => BuildMode::ReplaceAllCloned,
            BuildModeName::ReplaceOneByOne => BuildMode::ReplaceOneByOne,
        }
    }
}

impl From<BuildMode> for BuildModeName {
    fn from(mode: BuildMode) -> Self {
        match mode {
            BuildMode::ReplaceAll => BuildModeName::ReplaceAll,
            BuildMode::ReplaceAllCloned => BuildModeName::ReplaceAllCloned,
            BuildMode::ReplaceOneByOne => BuildModeName::ReplaceOneByOne,
        }
    }
}

/// One image drawn into a rectangle of the desktop.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub candidate: Arc<Candidate>,
    pub target: Rect,
}

/// Everything the compositor needs, in desktop coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildJob {
    pub canvas: Rect,
    pub layers: Vec<Layer>,
}

impl BuildJob {
    pub fn describe(&self) -> String {
        let names: Vec<String> = self
            .layers
            .iter()
            .map(|l| l.candidate.display_name())
            .collect();
        format!(
            "{}x{} canvas, [{}]",
            self.canvas.width,
            self.canvas.height,
            names.join(", ")
        )
    }
}

/// A build job together with the active set it produces.
#[derive(Debug, Clone)]
pub struct Composition {
    pub job: BuildJob,
    /// One entry per randomly cycled screen, or a single spanning image.
    pub active: Vec<Arc<Candidate>>,
}

impl BuildMode {
    /// Whether this cycle only swaps a single screen and keeps the others.
    ///
    /// Needs a complete per-screen set from the previous cycle; otherwise
    /// the first cycle fills every screen.
    pub fn replaces_one(&self, topology: &ScreenTopology, previous: &[Arc<Candidate>]) -> bool {
        let random = topology.random_cycled_screen_count();
        *self == BuildMode::ReplaceOneByOne && random > 1 && previous.len() == random
    }

    /// Images each screen needs this cycle. Static screens need none.
    pub fn required_wallpapers_by_screen(
        &self,
        topology: &ScreenTopology,
        turn: usize,
        previous: &[Arc<Candidate>],
    ) -> Vec<usize> {
        let mut required = vec![0; topology.count()];
        let random = topology.random_screen_indices();
        if random.is_empty() {
            return required;
        }

        match self {
            BuildMode::ReplaceAllCloned => required[random[0]] = 1,
            BuildMode::ReplaceOneByOne if self.replaces_one(topology, previous) => {
                required[random[turn % random.len()]] = 1
            }
            BuildMode::ReplaceAll | BuildMode::ReplaceOneByOne => {
                for screen in random {
                    required[screen] = 1;
                }
            }
        }
        required
    }

    /// A single image stretched over the bounds of every random screen.
    pub fn create_multiscreen_from_single(
        &self,
        topology: &ScreenTopology,
        image: Arc<Candidate>,
    ) -> Composition {
        let mut layers = static_layers(topology);
        layers.push(Layer {
            candidate: image.clone(),
            target: topology.random_bounds(),
        });
        Composition {
            job: BuildJob {
                canvas: topology.union_bounds(),
                layers,
            },
            active: vec![image],
        }
    }

    /// Lay out per-screen picks. `buckets` is indexed by screen as returned
    /// by the picker; `previous` is the last per-screen active set.
    pub fn create_multiscreen_from_multiple(
        &self,
        topology: &ScreenTopology,
        buckets: &[Vec<Arc<Candidate>>],
        previous: &[Arc<Candidate>],
        turn: usize,
    ) -> Composition {
        let random = topology.random_screen_indices();
        let mut per_screen: Vec<Vec<Arc<Candidate>>> = vec![Vec::new(); topology.count()];

        match self {
            BuildMode::ReplaceAllCloned => {
                if let Some(image) = buckets.iter().flatten().next() {
                    for &screen in &random {
                        per_screen[screen] = vec![image.clone()];
                    }
                }
            }
            BuildMode::ReplaceOneByOne if self.replaces_one(topology, previous) => {
                // Kept images stay on their screens; the new one takes the turn's slot
                let slot = turn % random.len();
                for (position, &screen) in random.iter().enumerate() {
                    per_screen[screen] = if position == slot {
                        buckets.get(screen).cloned().unwrap_or_default()
                    } else {
                        vec![previous[position].clone()]
                    };
                }
            }
            BuildMode::ReplaceAll | BuildMode::ReplaceOneByOne => {
                for &screen in &random {
                    per_screen[screen] = buckets.get(screen).cloned().unwrap_or_default();
                }
            }
        }

        let mut layers = static_layers(topology);
        for &screen in &random {
            layers.extend(split_screen(topology.screens[screen].bounds, &per_screen[screen]));
        }

        Composition {
            job: BuildJob {
                canvas: topology.union_bounds(),
                layers,
            },
            active: random
                .iter()
                .flat_map(|&screen| per_screen[screen].iter().cloned())
                .collect(),
        }
    }
}

/// Job for a desktop without randomly cycled screens.
pub fn static_job(topology: &ScreenTopology) -> BuildJob {
    BuildJob {
        canvas: topology.union_bounds(),
        layers: static_layers(topology),
    }
}

fn static_layers(topology: &ScreenTopology) -> Vec<Layer> {
    topology
        .screens
        .iter()
        .filter(|s| !s.is_random())
        .filter_map(|s| {
            s.static_image.as_ref().map(|path| Layer {
                candidate: Arc::new(Candidate::new(path.clone())),
                target: s.bounds,
            })
        })
        .collect()
}

/// Side by side columns when a screen holds more than one image.
fn split_screen(bounds: Rect, images: &[Arc<Candidate>]) -> Vec<Layer> {
    if images.is_empty() {
        return Vec::new();
    }
    let n = images.len() as u32;
    let column = bounds.width / n;
    images
        .iter()
        .enumerate()
        .map(|(i, image)| {
            let i = i as u32;
            let width = if i == n - 1 {
                bounds.width - column * i
            } else {
                column
            };
            Layer {
                candidate: image.clone(),
                target: Rect::new(bounds.x + (column * i) as i32, bounds.y, width, bounds.height),
            }
        })
        .collect()
}

/// Renders a build job into a single desktop-sized image.
pub trait Compositor: Send + Sync {
    fn compose(&self, job: &BuildJob) -> Result<RgbaImage>;
}

/// Compositor backed by the `image` crate.
#[derive(Debug, Default)]
pub struct ImageCompositor;

impl Compositor for ImageCompositor {
    fn compose(&self, job: &BuildJob) -> Result<RgbaImage> {
        let canvas = job.canvas;
        let mut out = RgbaImage::from_pixel(
            canvas.width.max(1),
            canvas.height.max(1),
            Rgba([0, 0, 0, 255]),
        );

        for layer in &job.layers {
            let img = image::open(layer.candidate.path()).with_context(|| {
                format!("Failed to open image {:?}", layer.candidate.path())
            })?;
            let tile = render_layer(&img, &layer.candidate, layer.target.width, layer.target.height);
            imageops::replace(
                &mut out,
                &tile,
                (layer.target.x - canvas.x) as i64,
                (layer.target.y - canvas.y) as i64,
            );
        }
        Ok(out)
    }
}

/// Draw `img` into a `width` x `height` tile following the candidate's placement.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn render_layer(img: &DynamicImage, candidate: &Candidate, width: u32, height: u32) -> RgbaImage {
    let width = width.max(1);
    let height = height.max(1);
    let mut tile = RgbaImage::from_pixel(width, height, Rgba(candidate.background));
    let (img_width, img_height) = img.dimensions();
    if img_width == 0 || img_height == 0 {
        return tile;
    }

    let scale_x = f64::from(width) / f64::from(img_width);
    let scale_y = f64::from(height) / f64::from(img_height);
    let (w, h) = match candidate.placement {
        // Cover, cropping the overflow
        Placement::Fill => {
            let s = scale_x.max(scale_y);
            (f64::from(img_width) * s, f64::from(img_height) * s)
        }
        Placement::Fit => {
            let s = scale_x.min(scale_y);
            (f64::from(img_width) * s, f64::from(img_height) * s)
        }
        Placement::Stretch => (f64::from(width), f64::from(height)),
        Placement::Center | Placement::Tile => (f64::from(img_width), f64::from(img_height)),
    };
    let factor = f64::from(candidate.scale) / 100.0;
    let w = ((w * factor).round() as u32).max(1);
    let h = ((h * factor).round() as u32).max(1);

    let scaled = if (w, h) == (img_width, img_height) {
        img.to_rgba8()
    } else {
        img.resize_exact(w, h, FilterType::CatmullRom).to_rgba8()
    };
    let (ox, oy) = (i64::from(candidate.offset.0), i64::from(candidate.offset.1));

    if candidate.placement == Placement::Tile {
        let start_x = ox.rem_euclid(i64::from(w)) - i64::from(w);
        let start_y = oy.rem_euclid(i64::from(h)) - i64::from(h);
        let mut y = start_y;
        while y < i64::from(height) {
            let mut x = start_x;
            while x < i64::from(width) {
                imageops::overlay(&mut tile, &scaled, x, y);
                x += i64::from(w);
            }
            y += i64::from(h);
        }
    } else {
        let x = (i64::from(width) - i64::from(w)) / 2 + ox;
        let y = (i64::from(height) - i64::from(h)) / 2 + oy;
        imageops::overlay(&mut tile, &scaled, x, y);
    }
    tile
}
