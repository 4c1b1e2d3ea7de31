use anyhow::{Context, Result};
use image::RgbaImage;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Persists a rendered desktop and makes it the wallpaper.
pub trait WallpaperSink: Send + Sync {
    fn apply(&self, image: &RgbaImage, path: &Path) -> Result<()>;
}

/// Saves a PNG and hands it to an external setter such as `feh`.
#[derive(Debug, Clone)]
pub struct CommandSink {
    /// argv; `{path}` is replaced by the saved file.
    command: Vec<String>,
}

impl CommandSink {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn argv(&self, path: &Path) -> Vec<String> {
        let path = path.to_string_lossy();
        self.command
            .iter()
            .map(|arg| arg.replace("{path}", &path))
            .collect()
    }
}

impl WallpaperSink for CommandSink {
    fn apply(&self, image: &RgbaImage, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        image
            .save(path)
            .with_context(|| format!("Failed to save wallpaper to {:?}", path))?;

        let argv = self.argv(path);
        let Some((program, args)) = argv.split_first() else {
            debug!("[BUILD] No output command configured, only saved {:?}", path);
            return Ok(());
        };

        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run {}", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} failed: {}", program, stderr.trim());
        }
        Ok(())
    }
}
