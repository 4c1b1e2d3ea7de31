use crate::candidate::Candidate;
use crate::config::Config;
use anyhow::Result;
use parking_lot::Mutex;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Source of the candidate images for a cycle.
pub trait PoolSupplier: Send + Sync {
    fn request_pool(&self) -> Result<Vec<Candidate>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    WebP,
    Bmp,
}

/// Sniff the image format from the file header, ignoring the extension.
#[inline]
pub fn image_kind(path: &Path) -> Option<ImageKind> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut buffer = [0u8; 12];
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }
    let header = &buffer[..filled];

    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ImageKind::Jpeg);
    }
    if header.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return Some(ImageKind::Png);
    }
    if header.starts_with(b"GIF8") {
        return Some(ImageKind::Gif);
    }
    if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
        return Some(ImageKind::WebP);
    }
    if header.starts_with(b"BM") && header.len() >= 6 {
        return Some(ImageKind::Bmp);
    }
    None
}

/// Images found under the configured pool directories.
pub struct DirectoryPool {
    config: Config,
    cached: Mutex<Option<Vec<Candidate>>>,
}

impl DirectoryPool {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cached: Mutex::new(None),
        }
    }

    fn discover(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for root in &self.config.pool.paths {
            if !root.exists() {
                warn!("[POOL] {:?} does not exist, skipping", root);
                continue;
            }
            let mut walker = WalkDir::new(root).follow_links(true);
            if !self.config.pool.recursive {
                walker = walker.max_depth(1);
            }
            for entry in walker.into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() && image_kind(entry.path()).is_some() {
                    files.push(entry.into_path());
                }
            }
        }
        files.sort();
        files.dedup();
        files
    }

    fn scan(&self) -> Vec<Candidate> {
        let candidates: Vec<Candidate> = self
            .discover()
            .iter()
            .map(|path| self.config.candidate_for(path))
            .collect();
        info!(
            "[POOL] Found {} image(s) in {} location(s)",
            candidates.len(),
            self.config.pool.paths.len()
        );
        candidates
    }
}

impl PoolSupplier for DirectoryPool {
    fn request_pool(&self) -> Result<Vec<Candidate>> {
        let mut cached = self.cached.lock();
        let pool = match cached.as_ref() {
            Some(pool) if !self.config.cycle.rescan_on_cycle => {
                debug!("[POOL] Reusing {} cached image(s)", pool.len());
                pool.clone()
            }
            _ => {
                let pool = self.scan();
                *cached = Some(pool.clone());
                pool
            }
        };

        if pool.is_empty() {
            anyhow::bail!(
                "No supported images found in {:?}",
                self.config.pool.paths
            );
        }
        Ok(pool)
    }
}
