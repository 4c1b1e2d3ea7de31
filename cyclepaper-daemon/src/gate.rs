use crate::builder::{BuildJob, Compositor};
use crate::error::CycleError;
use crate::sink::WallpaperSink;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Allows at most one wallpaper build in flight among every cycler sharing it.
#[derive(Debug, Default)]
pub struct BuildGate {
    slot: Mutex<Option<u64>>,
    next_id: AtomicU64,
}

impl BuildGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot. The returned ticket frees it when dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BuildTicket, CycleError> {
        let mut slot = self.slot.lock();
        if let Some(current) = *slot {
            debug!("[BUILD] Build #{} still running", current);
            return Err(CycleError::BuildInProgress);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        *slot = Some(id);
        Ok(BuildTicket {
            gate: Arc::clone(self),
            id,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[derive(Debug)]
pub struct BuildTicket {
    gate: Arc<BuildGate>,
    id: u64,
}

impl BuildTicket {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for BuildTicket {
    fn drop(&mut self) {
        let mut slot = self.gate.slot.lock();
        if *slot == Some(self.id) {
            *slot = None;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Applied,
    Cancelled,
    Faulted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub id: u64,
    pub outcome: BuildOutcome,
}

/// Everything a background build needs. Owns its inputs.
pub struct BuildTask {
    pub ticket: BuildTicket,
    pub job: BuildJob,
    pub compositor: Arc<dyn Compositor>,
    pub sink: Arc<dyn WallpaperSink>,
    pub output: PathBuf,
    pub cancel: Arc<AtomicBool>,
}

impl BuildTask {
    /// Compose and apply on the blocking pool, then report on `reports`.
    ///
    /// The ticket is released before the report is sent, so a cycle started
    /// from the report handler never sees a stale busy slot.
    pub fn spawn(self, reports: mpsc::UnboundedSender<BuildReport>) {
        let id = self.ticket.id();
        let handle = tokio::task::spawn_blocking(move || self.run());

        tokio::spawn(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("[BUILD] Build #{} panicked: {}", id, e);
                    BuildOutcome::Faulted(format!("build task failed: {}", e))
                }
            };
            if reports.send(BuildReport { id, outcome }).is_err() {
                debug!("[BUILD] Nobody is listening for build #{}", id);
            }
        });
    }

    fn run(self) -> BuildOutcome {
        let id = self.ticket.id();
        if self.cancel.load(Ordering::Acquire) {
            return BuildOutcome::Cancelled;
        }

        debug!("[BUILD] #{} composing {}", id, self.job.describe());
        let image = match self.compositor.compose(&self.job) {
            Ok(image) => image,
            Err(e) => return BuildOutcome::Faulted(format!("{:#}", e)),
        };

        if self.cancel.load(Ordering::Acquire) {
            info!("[BUILD] #{} cancelled before apply", id);
            return BuildOutcome::Cancelled;
        }

        match self.sink.apply(&image, &self.output) {
            Ok(()) => {
                info!("[BUILD] #{} applied {:?}", id, self.output);
                BuildOutcome::Applied
            }
            Err(e) => BuildOutcome::Faulted(format!("{:#}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Rect;
    use image::RgbaImage;
    use std::path::Path;

    struct Blank;

    impl Compositor for Blank {
        fn compose(&self, _job: &BuildJob) -> anyhow::Result<RgbaImage> {
            Ok(RgbaImage::new(1, 1))
        }
    }

    struct Failing;

    impl Compositor for Failing {
        fn compose(&self, _job: &BuildJob) -> anyhow::Result<RgbaImage> {
            anyhow::bail!("disk on fire")
        }
    }

    struct Panicking;

    impl Compositor for Panicking {
        fn compose(&self, _job: &BuildJob) -> anyhow::Result<RgbaImage> {
            panic!("boom")
        }
    }

    struct Discard;

    impl WallpaperSink for Discard {
        fn apply(&self, _image: &RgbaImage, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn task(gate: &Arc<BuildGate>, compositor: Arc<dyn Compositor>) -> BuildTask {
        BuildTask {
            ticket: gate.try_acquire().unwrap(),
            job: BuildJob {
                canvas: Rect::new(0, 0, 1, 1),
                layers: Vec::new(),
            },
            compositor,
            sink: Arc::new(Discard),
            output: PathBuf::from("/tmp/unused.png"),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn test_gate_admits_one() {
        let gate = BuildGate::new();
        let first = gate.try_acquire().unwrap();
        assert!(gate.is_busy());
        assert_eq!(gate.try_acquire().unwrap_err(), CycleError::BuildInProgress);
        drop(first);
        assert!(!gate.is_busy());
        let second = gate.try_acquire().unwrap();
        assert_eq!(second.id(), 2);
    }

    #[tokio::test]
    async fn test_successful_build_reports_applied() {
        let gate = BuildGate::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        task(&gate, Arc::new(Blank)).spawn(tx);

        let report = rx.recv().await.unwrap();
        assert_eq!(report.outcome, BuildOutcome::Applied);
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_fault_releases_gate() {
        let gate = BuildGate::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        task(&gate, Arc::new(Failing)).spawn(tx);

        let report = rx.recv().await.unwrap();
        assert!(matches!(report.outcome, BuildOutcome::Faulted(ref m) if m.contains("disk on fire")));
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_panic_releases_gate() {
        let gate = BuildGate::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        task(&gate, Arc::new(Panicking)).spawn(tx);

        let report = rx.recv().await.unwrap();
        assert!(matches!(report.outcome, BuildOutcome::Faulted(_)));
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let gate = BuildGate::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = task(&gate, Arc::new(Blank));
        t.cancel.store(true, Ordering::Release);
        t.spawn(tx);

        assert_eq!(rx.recv().await.unwrap().outcome, BuildOutcome::Cancelled);
        assert!(!gate.is_busy());
    }
}
