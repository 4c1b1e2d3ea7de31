//! The cycle orchestrator.
//!
//! A [`Cycler`] owns the recency window and the active set, drives the
//! autocycle timer and starts background builds through a shared
//! [`BuildGate`]. Builds report back on an mpsc channel; the owner feeds
//! those reports to [`Cycler::handle_build_report`].

use crate::builder::{static_job, BuildMode, Composition, Compositor};
use crate::candidate::Candidate;
use crate::config::CycleConfig;
use crate::error::CycleError;
use crate::filter::filter_candidates;
use crate::gate::{BuildGate, BuildOutcome, BuildReport, BuildTask, BuildTicket};
use crate::history::RecencyWindow;
use crate::mode::select_mode;
use crate::picker::{pick, PickRequest, Picked};
use crate::pool::PoolSupplier;
use crate::sink::WallpaperSink;
use crate::topology::{ScreenTopology, TopologyProvider};
use chrono::{Local, NaiveTime};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclerState {
    Idle,
    Autocycling,
    Disposed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleEvent {
    AutocycleFault(String),
    BuildFault(String),
    ActiveWallpapersChanged(Vec<PathBuf>),
    AutocyclingChanged(bool),
    IntervalChanged(Duration),
}

#[derive(Debug, Clone)]
pub enum CycleRequest {
    /// Pick from the given pool, or ask the pool supplier when `None`.
    Random(Option<Vec<Candidate>>),
    Explicit(Vec<Candidate>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSettings {
    pub interval: Duration,
    pub min_interval: Duration,
    pub history_percent: u8,
    pub build_mode: BuildMode,
}

impl From<&CycleConfig> for CycleSettings {
    fn from(cfg: &CycleConfig) -> Self {
        Self {
            interval: cfg.interval,
            min_interval: cfg.min_interval,
            history_percent: cfg.history_percent,
            build_mode: cfg.build_mode.into(),
        }
    }
}

/// Collaborators of a cycler.
pub struct CyclerParts {
    pub pool: Box<dyn PoolSupplier>,
    pub topology: Box<dyn TopologyProvider>,
    pub compositor: Arc<dyn Compositor>,
    pub sink: Arc<dyn WallpaperSink>,
    pub gate: Arc<BuildGate>,
    pub output: PathBuf,
    pub settings: CycleSettings,
}

struct PendingBuild {
    id: u64,
    active: Vec<Arc<Candidate>>,
    spanning: bool,
    cancel: Arc<AtomicBool>,
}

/// A successful pick that has not been committed yet.
struct Plan {
    composition: Composition,
    spanning: bool,
    recent: RecencyWindow,
    advance_turn: bool,
}

pub struct Cycler {
    pool: Box<dyn PoolSupplier>,
    topology: Box<dyn TopologyProvider>,
    compositor: Arc<dyn Compositor>,
    sink: Arc<dyn WallpaperSink>,
    gate: Arc<BuildGate>,
    output: PathBuf,
    settings: CycleSettings,
    reports: mpsc::UnboundedSender<BuildReport>,
    events: broadcast::Sender<CycleEvent>,

    state: CyclerState,
    deadline: Option<Instant>,
    last_cycle: Option<Instant>,
    recent: RecencyWindow,
    active: Vec<Arc<Candidate>>,
    active_spanning: bool,
    /// Next screen to change in one-by-one mode.
    turn: usize,
    pending: Option<PendingBuild>,
    last_error: Option<String>,
    rng: StdRng,
    clock: Box<dyn Fn() -> NaiveTime + Send>,
}

impl Cycler {
    pub fn new(parts: CyclerParts, reports: mpsc::UnboundedSender<BuildReport>) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            pool: parts.pool,
            topology: parts.topology,
            compositor: parts.compositor,
            sink: parts.sink,
            gate: parts.gate,
            output: parts.output,
            settings: parts.settings,
            reports,
            events,
            state: CyclerState::Idle,
            deadline: None,
            last_cycle: None,
            recent: RecencyWindow::new(),
            active: Vec::new(),
            active_spanning: false,
            turn: 0,
            pending: None,
            last_error: None,
            rng: StdRng::from_entropy(),
            clock: Box::new(|| Local::now().time()),
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Time of day used for image windows.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveTime + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CycleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn ensure_alive(&self) -> Result<(), CycleError> {
        if self.state == CyclerState::Disposed {
            return Err(CycleError::Disposed);
        }
        Ok(())
    }

    /// Claim the shared gate. Also refuses while this cycler's last build
    /// has not been reported, since the active set is still in flux.
    fn acquire(&self) -> Result<BuildTicket, CycleError> {
        if self.pending.is_some() {
            return Err(CycleError::BuildInProgress);
        }
        self.gate.try_acquire()
    }

    #[cfg(test)]
    pub fn state(&self) -> CyclerState {
        self.state
    }

    pub fn is_autocycling(&self) -> bool {
        self.state == CyclerState::Autocycling
    }

    pub fn is_building(&self) -> bool {
        self.pending.is_some()
    }

    pub fn active_set(&self) -> &[Arc<Candidate>] {
        &self.active
    }

    /// Recency window, oldest first.
    pub fn recent(&self) -> Vec<Arc<Candidate>> {
        self.recent.iter().cloned().collect()
    }

    pub fn settings(&self) -> CycleSettings {
        self.settings
    }

    pub fn topology(&self) -> ScreenTopology {
        self.topology.topology()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_cycle(&self) -> Option<Instant> {
        self.last_cycle
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn time_until_next_cycle(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn start_cycling(&mut self) -> Result<(), CycleError> {
        self.ensure_alive()?;
        let was = self.is_autocycling();
        self.state = CyclerState::Autocycling;
        self.deadline = Some(Instant::now() + self.settings.interval);
        if !was {
            info!("[CYCLE] Autocycling every {:?}", self.settings.interval);
            self.emit(CycleEvent::AutocyclingChanged(true));
        }
        Ok(())
    }

    pub fn stop_cycling(&mut self) -> Result<(), CycleError> {
        self.ensure_alive()?;
        self.deadline = None;
        if self.is_autocycling() {
            self.state = CyclerState::Idle;
            info!("[CYCLE] Autocycling stopped");
            self.emit(CycleEvent::AutocyclingChanged(false));
        }
        Ok(())
    }

    /// Restart the countdown without changing whether autocycling is on.
    pub fn reset_autocycling(&mut self) -> Result<(), CycleError> {
        self.ensure_alive()?;
        if self.is_autocycling() {
            self.deadline = Some(Instant::now() + self.settings.interval);
        }
        Ok(())
    }

    /// Run an autocycle if the deadline has passed. Returns whether one ran.
    ///
    /// Failures are reported as [`CycleEvent::AutocycleFault`] and retried
    /// one interval later.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.is_autocycling() {
            return false;
        }
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return false,
        }

        self.deadline = Some(now + self.settings.interval);
        debug!("[CYCLE] Timer fired");
        if let Err(e) = self.cycle_next_randomly(None) {
            self.autocycle_fault(e);
        }
        true
    }

    fn autocycle_fault(&mut self, e: CycleError) {
        if e == CycleError::BuildInProgress {
            debug!("[CYCLE] Autocycle skipped: {}", e);
        } else if e.is_recoverable() {
            warn!("[CYCLE] Autocycle failed, retrying next interval: {}", e);
        } else {
            error!("[CYCLE] Autocycle failed: {}", e);
        }
        self.last_error = Some(e.to_string());
        self.emit(CycleEvent::AutocycleFault(e.to_string()));
    }

    fn cycle_post_actions(&mut self) {
        let now = Instant::now();
        self.last_cycle = Some(now);
        if self.is_autocycling() {
            self.deadline = Some(now + self.settings.interval);
        }
    }

    pub fn set_interval(&mut self, interval: Duration) -> Result<(), CycleError> {
        self.ensure_alive()?;
        if interval < self.settings.min_interval {
            return Err(CycleError::IntervalTooShort {
                requested: interval,
                minimum: self.settings.min_interval,
            });
        }
        self.settings.interval = interval;
        info!("[CYCLE] Interval set to {:?}", interval);
        self.emit(CycleEvent::IntervalChanged(interval));
        self.reset_autocycling()
    }

    /// Share of the eligible pool kept in the recency window, applied on
    /// the next cycle.
    pub fn set_history_percent(&mut self, percent: u8) -> Result<(), CycleError> {
        self.ensure_alive()?;
        if percent > 100 {
            return Err(CycleError::InvalidArgument(format!(
                "history size must be 0-100%, got {}",
                percent
            )));
        }
        self.settings.history_percent = percent;
        Ok(())
    }

    pub fn set_build_mode(&mut self, mode: BuildMode) -> Result<(), CycleError> {
        self.ensure_alive()?;
        if self.settings.build_mode != mode {
            info!("[CYCLE] Build mode set to {:?}", mode);
            self.settings.build_mode = mode;
            self.turn = 0;
        }
        Ok(())
    }

    /// Swap every collaborator, e.g. after the config file changed.
    pub fn reconfigure(&mut self, parts: CyclerParts) -> Result<(), CycleError> {
        self.ensure_alive()?;
        let interval_changed = parts.settings.interval != self.settings.interval;
        if parts.settings.build_mode != self.settings.build_mode {
            self.turn = 0;
        }
        self.pool = parts.pool;
        self.topology = parts.topology;
        self.compositor = parts.compositor;
        self.sink = parts.sink;
        self.gate = parts.gate;
        self.output = parts.output;
        self.settings = parts.settings;
        if interval_changed {
            self.emit(CycleEvent::IntervalChanged(self.settings.interval));
        }
        self.reset_autocycling()
    }

    /// Re-measure screens after a display change and refill them when autocycling.
    pub fn refresh_topology(&mut self) -> Result<(), CycleError> {
        self.ensure_alive()?;
        if let Err(e) = self.topology.refresh_bounds() {
            warn!("[SCREENS] Failed to refresh screen bounds: {:#}", e);
        }
        if self.is_autocycling() {
            if let Err(e) = self.cycle_next_randomly(None) {
                self.autocycle_fault(e);
            }
        }
        Ok(())
    }

    pub fn cycle(&mut self, request: CycleRequest) -> Result<(), CycleError> {
        match request {
            CycleRequest::Random(pool) => self.cycle_next_randomly(pool),
            CycleRequest::Explicit(images) => self.cycle_next(images),
        }
    }

    fn resolve_pool(&self, pool: Option<Vec<Candidate>>) -> Result<Vec<Candidate>, CycleError> {
        match pool {
            Some(pool) => Ok(pool),
            None => {
                let pool = self
                    .pool
                    .request_pool()
                    .map_err(|e| CycleError::NoPool(format!("{:#}", e)))?;
                if pool.is_empty() {
                    return Err(CycleError::NoPool("the pool is empty".into()));
                }
                Ok(pool)
            }
        }
    }

    /// Ask the pool supplier for the current pool.
    pub fn request_pool(&self) -> Result<Vec<Candidate>, CycleError> {
        self.ensure_alive()?;
        self.resolve_pool(None)
    }

    /// The last per-screen active set, empty after a spanning cycle.
    fn previous_per_screen(&self) -> &[Arc<Candidate>] {
        if self.active_spanning {
            &[]
        } else {
            &self.active
        }
    }

    fn plan_random(
        &self,
        pool: &[Candidate],
        topology: &ScreenTopology,
        rng: &mut StdRng,
    ) -> Result<Plan, CycleError> {
        let eligibility = filter_candidates(pool, topology, rng)?;
        let mut recent = self.recent.clone();
        recent.resize(eligibility.len(), self.settings.history_percent);

        let mode = self.settings.build_mode;
        let previous = self.previous_per_screen();
        let required = mode.required_wallpapers_by_screen(topology, self.turn, previous);
        let decision = select_mode(&eligibility, &required, rng)?;
        debug!(
            "[CYCLE] {} eligible (usable per screen {:?}), {:?} with {} image(s)",
            eligibility.len(),
            eligibility.usable_per_screen,
            decision.mode,
            decision.required
        );

        let result = pick(
            &PickRequest {
                eligibility: &eligibility,
                mode: decision.mode,
                required_by_screen: &required,
                recent: &recent,
                now: (self.clock)(),
            },
            rng,
        )?;
        if result.relaxed {
            info!("[PICK] Pool too small for the current filters, checks were relaxed");
        }

        for image in result.picked.images() {
            recent.push(image);
        }
        let (composition, spanning) = match result.picked {
            Picked::Spanning(image) => (mode.create_multiscreen_from_single(topology, image), true),
            Picked::PerScreen(buckets) => (
                mode.create_multiscreen_from_multiple(topology, &buckets, previous, self.turn),
                false,
            ),
        };

        Ok(Plan {
            composition,
            spanning,
            recent,
            advance_turn: !spanning && mode.replaces_one(topology, previous),
        })
    }

    fn commit(&mut self, ticket: BuildTicket, plan: Plan) {
        self.recent = plan.recent;
        if plan.advance_turn {
            self.turn = self.turn.wrapping_add(1);
        }
        self.start_build(ticket, plan.composition, plan.spanning);
        self.cycle_post_actions();
    }

    /// Pick new wallpapers at random and start building them.
    ///
    /// Returns once the build has started. Nothing is mutated when picking fails.
    pub fn cycle_next_randomly(&mut self, pool: Option<Vec<Candidate>>) -> Result<(), CycleError> {
        self.ensure_alive()?;
        let topology = self.topology.topology();
        if topology.random_cycled_screen_count() == 0 {
            return self.apply_static(&topology);
        }

        let pool = self.resolve_pool(pool)?;
        let ticket = self.acquire()?;

        let mut rng = self.rng.clone();
        let plan = self.plan_random(&pool, &topology, &mut rng);
        self.rng = rng;
        let plan = plan?;

        self.commit(ticket, plan);
        Ok(())
    }

    /// Show the given images. They must all be spanning or all per-screen.
    ///
    /// Per-screen slots take the images in order; once they run out the
    /// last image fills the remaining slots.
    pub fn cycle_next(&mut self, images: Vec<Candidate>) -> Result<(), CycleError> {
        self.ensure_alive()?;
        let Some(first) = images.first() else {
            return Err(CycleError::InvalidArgument("no wallpapers given".into()));
        };
        let spanning = first.multiscreen;
        if images.iter().any(|c| c.multiscreen != spanning) {
            return Err(CycleError::InvalidArgument(
                "cannot mix spanning and per-screen wallpapers".into(),
            ));
        }

        let topology = self.topology.topology();
        if topology.random_cycled_screen_count() == 0 {
            return self.apply_static(&topology);
        }
        let ticket = self.acquire()?;

        let images: Vec<Arc<Candidate>> = images.into_iter().map(Arc::new).collect();
        let mode = self.settings.build_mode;
        let previous = self.previous_per_screen();

        let (composition, advance_turn) = if spanning {
            (mode.create_multiscreen_from_single(&topology, images[0].clone()), false)
        } else {
            let required = mode.required_wallpapers_by_screen(&topology, self.turn, previous);
            let mut buckets = vec![Vec::new(); required.len()];
            let mut next = 0;
            for (screen, &count) in required.iter().enumerate() {
                for _ in 0..count {
                    let image = &images[next.min(images.len() - 1)];
                    buckets[screen].push(image.clone());
                    next += 1;
                }
            }
            (
                mode.create_multiscreen_from_multiple(&topology, &buckets, previous, self.turn),
                mode.replaces_one(&topology, previous),
            )
        };

        let mut recent = self.recent.clone();
        for image in &images {
            recent.push(image.clone());
        }
        self.commit(
            ticket,
            Plan {
                composition,
                spanning,
                recent,
                advance_turn,
            },
        );
        Ok(())
    }

    /// All screens static: draw the static images and clear the active set.
    fn apply_static(&mut self, topology: &ScreenTopology) -> Result<(), CycleError> {
        let ticket = self.acquire()?;
        debug!("[CYCLE] No randomly cycled screens, applying static layout");
        self.start_build(
            ticket,
            Composition {
                job: static_job(topology),
                active: Vec::new(),
            },
            false,
        );
        self.cycle_post_actions();
        Ok(())
    }

    /// Whether a random cycle over `pool` would find enough images.
    ///
    /// Runs the same pick on copies of the recency window and rng, so the
    /// answer matches the next [`Cycler::cycle_next_randomly`] call and
    /// nothing is consumed.
    pub fn check_wallpaper_list_integrity(
        &self,
        pool: Option<Vec<Candidate>>,
    ) -> Result<bool, CycleError> {
        self.ensure_alive()?;
        let topology = self.topology.topology();
        if topology.random_cycled_screen_count() == 0 {
            return Ok(true);
        }
        let pool = self.resolve_pool(pool)?;
        let mut rng = self.rng.clone();
        match self.plan_random(&pool, &topology, &mut rng) {
            Ok(_) => Ok(true),
            Err(CycleError::InsufficientCandidates { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn start_build(&mut self, ticket: BuildTicket, composition: Composition, spanning: bool) {
        let id = ticket.id();
        let cancel = Arc::new(AtomicBool::new(false));
        info!("[CYCLE] Build #{}: {}", id, composition.job.describe());

        BuildTask {
            ticket,
            job: composition.job,
            compositor: Arc::clone(&self.compositor),
            sink: Arc::clone(&self.sink),
            output: self.output.clone(),
            cancel: Arc::clone(&cancel),
        }
        .spawn(self.reports.clone());

        self.pending = Some(PendingBuild {
            id,
            active: composition.active,
            spanning,
            cancel,
        });
    }

    /// Commit or discard the result of a finished build.
    pub fn handle_build_report(&mut self, report: BuildReport) {
        let pending = match self.pending.take() {
            Some(p) if p.id == report.id => p,
            other => {
                debug!("[BUILD] Ignoring report for unknown build #{}", report.id);
                self.pending = other;
                return;
            }
        };

        match report.outcome {
            BuildOutcome::Applied if self.state != CyclerState::Disposed => {
                self.active = pending.active;
                self.active_spanning = pending.spanning;
                self.last_error = None;
                let paths = self.active.iter().map(|c| c.path.clone()).collect();
                self.emit(CycleEvent::ActiveWallpapersChanged(paths));
            }
            BuildOutcome::Applied | BuildOutcome::Cancelled => {
                debug!("[BUILD] Build #{} discarded", report.id);
            }
            BuildOutcome::Faulted(msg) => {
                warn!("[BUILD] Build #{} failed: {}", report.id, msg);
                self.last_error = Some(msg.clone());
                self.emit(CycleEvent::BuildFault(msg));
            }
        }
    }

    /// Stop the timer and cancel this cycler's own build. Terminal.
    pub fn dispose(&mut self) {
        if self.state == CyclerState::Disposed {
            return;
        }
        let was_autocycling = self.is_autocycling();
        self.state = CyclerState::Disposed;
        self.deadline = None;
        if let Some(pending) = &self.pending {
            pending.cancel.store(true, Ordering::Release);
            debug!("[CYCLE] Cancelling build #{}", pending.id);
        }
        if was_autocycling {
            self.emit(CycleEvent::AutocyclingChanged(false));
        }
        info!("[CYCLE] Disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::{single, spanning};
    use crate::candidate::TimeWindow;
    use crate::topology::testing::row;
    use crate::topology::Rect;
    use image::RgbaImage;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::path::Path;

    struct FixedPool(Vec<Candidate>);

    impl PoolSupplier for FixedPool {
        fn request_pool(&self) -> anyhow::Result<Vec<Candidate>> {
            Ok(self.0.clone())
        }
    }

    struct FixedTopology(ScreenTopology);

    impl TopologyProvider for FixedTopology {
        fn topology(&self) -> ScreenTopology {
            self.0.clone()
        }

        fn refresh_bounds(&mut self) -> anyhow::Result<()> {
            for screen in &mut self.0.screens {
                screen.bounds = Rect::new(screen.bounds.x, 0, 1280, 1024);
            }
            Ok(())
        }
    }

    /// Records layer file names; blocks while `hold` is locked elsewhere.
    #[derive(Default)]
    struct Recorder {
        jobs: Mutex<Vec<Vec<String>>>,
        hold: Arc<Mutex<()>>,
        fail: bool,
    }

    impl Compositor for Recorder {
        fn compose(&self, job: &crate::builder::BuildJob) -> anyhow::Result<RgbaImage> {
            let _wait = self.hold.lock();
            if self.fail {
                anyhow::bail!("compositor exploded");
            }
            self.jobs
                .lock()
                .push(job.layers.iter().map(|l| l.candidate.display_name()).collect());
            Ok(RgbaImage::new(1, 1))
        }
    }

    struct NullSink;

    impl WallpaperSink for NullSink {
        fn apply(&self, _image: &RgbaImage, _path: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn settings() -> CycleSettings {
        CycleSettings {
            interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(10),
            history_percent: 30,
            build_mode: BuildMode::ReplaceAll,
        }
    }

    struct Harness {
        cycler: Cycler,
        reports: mpsc::UnboundedReceiver<BuildReport>,
        compositor: Arc<Recorder>,
    }

    impl Harness {
        fn new(pool: Vec<Candidate>, topology: ScreenTopology) -> Self {
            Self::with(pool, topology, Arc::new(Recorder::default()), BuildGate::new())
        }

        fn with(
            pool: Vec<Candidate>,
            topology: ScreenTopology,
            compositor: Arc<Recorder>,
            gate: Arc<BuildGate>,
        ) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let cycler = Cycler::new(
                CyclerParts {
                    pool: Box::new(FixedPool(pool)),
                    topology: Box::new(FixedTopology(topology)),
                    compositor: compositor.clone(),
                    sink: Arc::new(NullSink),
                    gate,
                    output: PathBuf::from("/tmp/cyclepaper-test.png"),
                    settings: settings(),
                },
                tx,
            )
            .with_rng(StdRng::seed_from_u64(1234))
            .with_clock(|| NaiveTime::from_hms_opt(12, 0, 0).unwrap());
            Self {
                cycler,
                reports: rx,
                compositor,
            }
        }

        /// Wait for the running build and feed its report back.
        async fn settle(&mut self) -> BuildOutcome {
            let report = self.reports.recv().await.unwrap();
            let outcome = report.outcome.clone();
            self.cycler.handle_build_report(report);
            outcome
        }

        async fn cycle(&mut self) -> Result<BuildOutcome, CycleError> {
            self.cycler.cycle_next_randomly(None)?;
            Ok(self.settle().await)
        }

        fn active_names(&self) -> Vec<String> {
            self.cycler
                .active_set()
                .iter()
                .map(|c| c.display_name())
                .collect()
        }
    }

    fn singles(n: usize) -> Vec<Candidate> {
        (0..n).map(|i| single(&format!("w{}", i), 50)).collect()
    }

    #[tokio::test]
    async fn test_never_picks_ineligible() {
        let mut off = single("off", 90);
        off.activated = false;
        let mut pool = vec![off, single("zero", 0), single("neg", -5)];
        pool.extend(singles(4));
        let mut h = Harness::new(pool, row(2, 0));

        for _ in 0..40 {
            assert_eq!(h.cycle().await.unwrap(), BuildOutcome::Applied);
            for c in h.cycler.active_set() {
                assert!(c.activated && c.priority > 0, "picked {}", c.display_name());
            }
        }
    }

    #[tokio::test]
    async fn test_no_repeat_in_consecutive_cycles() {
        let mut h = Harness::new(singles(10), row(1, 0));
        let mut last: Vec<String> = Vec::new();
        for _ in 0..30 {
            h.cycle().await.unwrap();
            let now = h.active_names();
            assert_ne!(now, last);
            assert!(h.cycler.recent().len() <= RecencyWindow::capacity_for(10, 30));
            last = now;
        }
    }

    #[tokio::test]
    async fn test_integrity_matches_cycle_outcome() {
        let cases = vec![
            (singles(6), row(3, 0), true),
            (vec![single("zero", 0), single("off", -1)], row(1, 0), false),
            (singles(2), row(3, 0), false),
            (vec![spanning("pano", 10)], row(3, 0), true),
        ];
        for (pool, topology, expected) in cases {
            let mut h = Harness::new(pool.clone(), topology);
            let recent_before = h.cycler.recent().len();
            let verdict = h.cycler.check_wallpaper_list_integrity(Some(pool.clone())).unwrap();
            assert_eq!(verdict, expected);
            assert_eq!(h.cycler.recent().len(), recent_before);
            assert!(!h.cycler.is_building());

            let result = h.cycler.cycle_next_randomly(Some(pool));
            if expected {
                assert!(result.is_ok());
                h.settle().await;
            } else {
                assert!(matches!(
                    result,
                    Err(CycleError::InsufficientCandidates { .. })
                ));
                assert!(h.cycler.active_set().is_empty());
                assert!(h.cycler.recent().is_empty());
            }
        }
    }

    fn static_parts(compositor: Arc<Recorder>, pool: Vec<Candidate>) -> CyclerParts {
        let mut topology = row(0, 2);
        topology.screens[0].static_image = Some("/wall/logo.png".into());
        CyclerParts {
            pool: Box::new(FixedPool(pool)),
            topology: Box::new(FixedTopology(topology)),
            compositor,
            sink: Arc::new(NullSink),
            gate: BuildGate::new(),
            output: PathBuf::from("/tmp/cyclepaper-test.png"),
            settings: settings(),
        }
    }

    #[tokio::test]
    async fn test_all_static_screens_clear_active_set() {
        let mut h = Harness::new(Vec::new(), row(1, 0));
        h.cycler.cycle_next(vec![single("a", 1)]).unwrap();
        h.settle().await;
        assert_eq!(h.active_names(), vec!["a.png"]);

        let parts = static_parts(h.compositor.clone(), vec![single("ignored", 1)]);
        h.cycler.reconfigure(parts).unwrap();

        for pool in [None, Some(Vec::new()), Some(singles(3))] {
            h.cycler.cycle_next_randomly(pool).unwrap();
            assert_eq!(h.settle().await, BuildOutcome::Applied);
            assert!(h.cycler.active_set().is_empty());
        }
        let jobs = h.compositor.jobs.lock();
        assert_eq!(jobs.last().unwrap(), &vec!["logo.png".to_string()]);
    }

    #[tokio::test]
    async fn test_manual_repeats_last_image() {
        let mut h = Harness::new(Vec::new(), row(3, 0));
        h.cycler.cycle_next(vec![single("only", 5)]).unwrap();
        h.settle().await;

        assert_eq!(h.active_names(), vec!["only.png"; 3]);
        let active = h.cycler.active_set();
        assert!(Arc::ptr_eq(&active[0], &active[2]));
    }

    #[tokio::test]
    async fn test_manual_fills_in_order() {
        let mut h = Harness::new(Vec::new(), row(3, 0));
        h.cycler
            .cycle_next(vec![single("a", 1), single("b", 1)])
            .unwrap();
        h.settle().await;
        assert_eq!(h.active_names(), vec!["a.png", "b.png", "b.png"]);
    }

    #[tokio::test]
    async fn test_manual_rejects_bad_input() {
        let mut h = Harness::new(Vec::new(), row(2, 0));
        assert!(matches!(
            h.cycler.cycle_next(Vec::new()),
            Err(CycleError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.cycler.cycle_next(vec![single("a", 1), spanning("b", 1)]),
            Err(CycleError::InvalidArgument(_))
        ));
        assert!(!h.cycler.is_building());
        assert!(h.cycler.recent().is_empty());
    }

    #[tokio::test]
    async fn test_second_build_rejected_while_first_runs() {
        let gate = BuildGate::new();
        let compositor = Arc::new(Recorder::default());
        let mut a = Harness::with(singles(5), row(1, 0), compositor.clone(), gate.clone());
        let mut b = Harness::with(singles(5), row(1, 0), compositor.clone(), gate.clone());

        let hold = compositor.hold.lock();
        a.cycler.cycle_next_randomly(None).unwrap();
        assert!(gate.is_busy());
        assert_eq!(
            b.cycler.cycle_next_randomly(None).unwrap_err(),
            CycleError::BuildInProgress
        );
        assert_eq!(
            a.cycler.cycle_next_randomly(None).unwrap_err(),
            CycleError::BuildInProgress
        );
        // The rejected attempt left b untouched
        assert!(b.cycler.recent().is_empty());
        drop(hold);

        assert_eq!(a.settle().await, BuildOutcome::Applied);
        assert_eq!(compositor.jobs.lock().len(), 1);
        assert!(!gate.is_busy());

        assert_eq!(b.cycle().await.unwrap(), BuildOutcome::Applied);
        assert_eq!(compositor.jobs.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_history_shrink_drops_oldest() {
        let mut h = Harness::new(singles(20), row(1, 0));
        h.cycler.set_history_percent(50).unwrap();
        for _ in 0..10 {
            h.cycle().await.unwrap();
        }
        let before: Vec<_> = h.cycler.recent().iter().map(|c| c.display_name()).collect();
        assert_eq!(before.len(), 10);

        h.cycler.set_history_percent(20).unwrap();
        h.cycle().await.unwrap();
        let after: Vec<_> = h.cycler.recent().iter().map(|c| c.display_name()).collect();
        assert_eq!(after.len(), 4);
        assert_eq!(&after[..3], &before[7..]);
        assert_eq!(after[3], h.active_names()[0]);
    }

    #[tokio::test]
    async fn test_history_percent_range() {
        let mut h = Harness::new(singles(3), row(1, 0));
        assert!(matches!(
            h.cycler.set_history_percent(101),
            Err(CycleError::InvalidArgument(_))
        ));
        assert_eq!(h.cycler.settings().history_percent, 30);
    }

    #[tokio::test]
    async fn test_build_fault_keeps_active_set() {
        let compositor = Arc::new(Recorder::default());
        let mut h = Harness::with(singles(5), row(1, 0), compositor, BuildGate::new());
        h.cycle().await.unwrap();
        let before = h.active_names();

        let failing = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        h.cycler
            .reconfigure(CyclerParts {
                pool: Box::new(FixedPool(singles(5))),
                topology: Box::new(FixedTopology(row(1, 0))),
                compositor: failing,
                sink: Arc::new(NullSink),
                gate: BuildGate::new(),
                output: PathBuf::from("/tmp/x.png"),
                settings: settings(),
            })
            .unwrap();
        let mut events = h.cycler.subscribe();

        let outcome = h.cycle().await.unwrap();
        assert!(matches!(outcome, BuildOutcome::Faulted(_)));
        assert_eq!(h.active_names(), before);
        assert!(h.cycler.last_error().unwrap().contains("compositor exploded"));
        assert!(matches!(events.try_recv(), Ok(CycleEvent::BuildFault(_))));
    }

    #[tokio::test]
    async fn test_one_by_one_changes_a_single_screen() {
        let mut h = Harness::new(singles(12), row(3, 0));
        h.cycler.set_build_mode(BuildMode::ReplaceOneByOne).unwrap();

        h.cycle().await.unwrap();
        let mut previous = h.active_names();
        assert_eq!(previous.len(), 3);

        for round in 0..6 {
            h.cycle().await.unwrap();
            let now = h.active_names();
            assert_eq!(now.len(), 3);
            let changed: Vec<usize> = (0..3).filter(|&i| now[i] != previous[i]).collect();
            assert_eq!(changed, vec![round % 3]);
            previous = now;
        }
    }

    #[tokio::test]
    async fn test_cloned_mode_shows_one_image_everywhere() {
        let mut h = Harness::new(singles(4), row(3, 0));
        h.cycler.set_build_mode(BuildMode::ReplaceAllCloned).unwrap();
        h.cycle().await.unwrap();
        let names = h.active_names();
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| n == &names[0]));
    }

    #[tokio::test]
    async fn test_time_window_respected() {
        let mut night = single("night", 90);
        night.window = Some(TimeWindow::new(
            NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        ));
        let mut pool = vec![night];
        pool.extend(singles(8));
        let mut h = Harness::new(pool, row(1, 0));
        for _ in 0..10 {
            h.cycle().await.unwrap();
            assert_ne!(h.active_names(), vec!["night.png"]);
        }
    }

    #[tokio::test]
    async fn test_timer_fires_and_rearms() {
        let mut h = Harness::new(singles(5), row(1, 0));
        let mut events = h.cycler.subscribe();
        h.cycler.start_cycling().unwrap();
        assert_eq!(events.try_recv().unwrap(), CycleEvent::AutocyclingChanged(true));

        let deadline = h.cycler.deadline().unwrap();
        assert!(!h.cycler.tick(deadline - Duration::from_secs(1)));
        assert!(h.cycler.tick(deadline));
        h.settle().await;
        assert_eq!(h.active_names().len(), 1);
        assert!(h.cycler.deadline().unwrap() >= deadline);
        assert!(h.cycler.last_cycle().is_some());

        h.cycler.stop_cycling().unwrap();
        assert!(h.cycler.deadline().is_none());
        assert!(h.cycler.time_until_next_cycle().is_none());
        assert!(!h.cycler.tick(Instant::now() + Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_autocycle_fault_is_reported() {
        let mut h = Harness::new(Vec::new(), row(1, 0));
        let mut events = h.cycler.subscribe();
        h.cycler.start_cycling().unwrap();
        let _ = events.try_recv();

        let deadline = h.cycler.deadline().unwrap();
        assert!(h.cycler.tick(deadline));
        assert!(matches!(
            events.try_recv(),
            Ok(CycleEvent::AutocycleFault(msg)) if msg.contains("no wallpapers")
        ));
        assert!(h.cycler.is_autocycling());
        assert!(h.cycler.deadline().unwrap() > deadline);
    }

    #[tokio::test]
    async fn test_interval_minimum() {
        let mut h = Harness::new(singles(2), row(1, 0));
        let mut events = h.cycler.subscribe();
        assert_eq!(
            h.cycler.set_interval(Duration::from_secs(5)).unwrap_err(),
            CycleError::IntervalTooShort {
                requested: Duration::from_secs(5),
                minimum: Duration::from_secs(10),
            }
        );
        h.cycler.set_interval(Duration::from_secs(120)).unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            CycleEvent::IntervalChanged(Duration::from_secs(120))
        );
        assert_eq!(h.cycler.settings().interval, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_disposed_rejects_everything() {
        let mut h = Harness::new(singles(3), row(1, 0));
        h.cycler.start_cycling().unwrap();
        h.cycler.dispose();

        assert_eq!(h.cycler.state(), CyclerState::Disposed);
        assert_eq!(h.cycler.cycle_next_randomly(None).unwrap_err(), CycleError::Disposed);
        assert_eq!(
            h.cycler.cycle_next(vec![single("a", 1)]).unwrap_err(),
            CycleError::Disposed
        );
        assert_eq!(h.cycler.start_cycling().unwrap_err(), CycleError::Disposed);
        assert_eq!(
            h.cycler.check_wallpaper_list_integrity(None).unwrap_err(),
            CycleError::Disposed
        );
        assert!(h.cycler.deadline().is_none());
        assert!(!h.cycler.tick(Instant::now() + Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_dispose_cancels_only_own_build() {
        let gate = BuildGate::new();
        let compositor = Arc::new(Recorder::default());
        let mut a = Harness::with(singles(3), row(1, 0), compositor.clone(), gate.clone());
        let mut b = Harness::with(singles(3), row(1, 0), compositor.clone(), gate.clone());

        // b's build is running while a gets disposed
        let hold = compositor.hold.lock();
        b.cycler.cycle_next_randomly(None).unwrap();
        a.cycler.dispose();
        drop(hold);
        assert_eq!(b.settle().await, BuildOutcome::Applied);
        assert_eq!(b.active_names().len(), 1);

        // Now a build of b's own gets cancelled by disposing b
        let hold = compositor.hold.lock();
        b.cycler.cycle_next_randomly(None).unwrap();
        b.cycler.dispose();
        drop(hold);
        assert_eq!(b.settle().await, BuildOutcome::Cancelled);
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_refresh_topology_recycles_when_autocycling() {
        let mut h = Harness::new(singles(4), row(2, 0));
        h.cycler.refresh_topology().unwrap();
        assert!(!h.cycler.is_building());
        assert_eq!(h.cycler.topology().screens[0].bounds.width, 1280);

        h.cycler.start_cycling().unwrap();
        h.cycler.refresh_topology().unwrap();
        assert!(h.cycler.is_building());
        h.settle().await;
        assert_eq!(h.active_names().len(), 2);
    }

    #[tokio::test]
    async fn test_spanning_pick_records_single_image() {
        let mut h = Harness::new(vec![spanning("pano", 10)], row(3, 1));
        h.cycle().await.unwrap();
        assert_eq!(h.active_names(), vec!["pano.png"]);
        let recent: HashSet<_> = h.cycler.recent().iter().map(|c| c.display_name()).collect();
        assert!(recent.contains("pano.png"));
    }
}
