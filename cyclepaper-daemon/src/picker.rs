use crate::candidate::Candidate;
use crate::error::CycleError;
use crate::filter::Eligibility;
use crate::history::RecencyWindow;
use crate::mode::CycleMode;
use chrono::NaiveTime;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

/// Checks the picker may drop once the pool runs dry. Only ever switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relaxation {
    pub last_actives: bool,
    pub conditions: bool,
    pub priority: bool,
    pub disabled_screens: bool,
}

impl Default for Relaxation {
    fn default() -> Self {
        Self {
            last_actives: true,
            conditions: true,
            priority: true,
            disabled_screens: true,
        }
    }
}

impl Relaxation {
    pub fn relax_all(&mut self) {
        *self = Self {
            last_actives: false,
            conditions: false,
            priority: false,
            disabled_screens: false,
        };
    }

    pub fn is_relaxed(&self) -> bool {
        !(self.last_actives || self.conditions || self.priority || self.disabled_screens)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Picked {
    Spanning(Arc<Candidate>),
    /// One bucket per screen, sized by the build mode's requirements.
    PerScreen(Vec<Vec<Arc<Candidate>>>),
}

impl Picked {
    /// Newly picked images in screen order.
    pub fn images(&self) -> Vec<Arc<Candidate>> {
        match self {
            Picked::Spanning(c) => vec![c.clone()],
            Picked::PerScreen(buckets) => buckets.iter().flatten().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PickResult {
    pub picked: Picked,
    /// Relaxation had to kick in to fill the screens.
    pub relaxed: bool,
}

pub struct PickRequest<'a> {
    pub eligibility: &'a Eligibility,
    pub mode: CycleMode,
    pub required_by_screen: &'a [usize],
    pub recent: &'a RecencyWindow,
    pub now: NaiveTime,
}

/// Weighted random pick over the eligible candidates of the chosen mode.
///
/// Every pass draws a priority threshold in `[1, max_priority]` and scans
/// the list front to back, lowest priority first. Recent or out-of-window
/// images are dropped from the list unless that would leave no more images
/// than still required, in which case every check is switched off for the
/// rest of the cycle.
pub fn pick<R: Rng + ?Sized>(req: &PickRequest<'_>, rng: &mut R) -> Result<PickResult, CycleError> {
    let spanning = req.mode.is_spanning();
    let mut list: Vec<Arc<Candidate>> = req
        .eligibility
        .candidates
        .iter()
        .filter(|c| c.multiscreen == spanning)
        .cloned()
        .collect();
    // Stable, so equal priorities keep their shuffled order
    list.sort_by_key(|c| c.priority);

    let required = if spanning {
        1
    } else {
        req.required_by_screen.iter().sum()
    };
    let max_priority = req.eligibility.max_priority(spanning).max(1);
    let mut buckets: Vec<Vec<Arc<Candidate>>> = vec![Vec::new(); req.required_by_screen.len()];
    let mut assigned = 0usize;
    let mut relax = Relaxation::default();

    if required == 0 {
        return Ok(PickResult {
            picked: Picked::PerScreen(buckets),
            relaxed: false,
        });
    }

    loop {
        if list.is_empty() {
            debug!(
                "[PICK] Ran out of candidates with {}/{} assigned",
                assigned, required
            );
            return Err(CycleError::InsufficientCandidates {
                required,
                available: assigned,
            });
        }

        let threshold = rng.gen_range(1..=max_priority);
        let mut progressed = false;
        // A candidate skipped by the threshold that a later pass could place
        let mut placeable_held_back = false;
        let mut i = 0;

        while i < list.len() {
            let remaining = required - assigned;
            let candidate = &list[i];

            let stale = (relax.last_actives && req.recent.contains(candidate))
                || (relax.conditions && !candidate.condition_holds(req.now));
            if stale {
                if list.len() - 1 <= remaining {
                    debug!(
                        "[PICK] Pool starved at {} left for {} slots, relaxing all checks",
                        list.len(),
                        remaining
                    );
                    relax.relax_all();
                } else {
                    list.remove(i);
                    continue;
                }
            }

            if relax.priority && candidate.priority < threshold {
                placeable_held_back |= spanning
                    || open_slot(&buckets, req.required_by_screen, candidate, &relax).is_some();
                i += 1;
                continue;
            }

            if spanning {
                debug!("[PICK] Spanning: {}", candidate.display_name());
                return Ok(PickResult {
                    picked: Picked::Spanning(candidate.clone()),
                    relaxed: relax.is_relaxed(),
                });
            }

            match open_slot(&buckets, req.required_by_screen, candidate, &relax) {
                Some(screen) => {
                    let candidate = list.remove(i);
                    debug!("[PICK] Screen {}: {}", screen, candidate.display_name());
                    buckets[screen].push(candidate);
                    assigned += 1;
                    progressed = true;
                    if assigned == required {
                        return Ok(PickResult {
                            picked: Picked::PerScreen(buckets),
                            relaxed: relax.is_relaxed(),
                        });
                    }
                }
                None => i += 1,
            }
        }

        // No later draw can help: only screen exclusions are in the way
        if !progressed && !placeable_held_back {
            if relax.is_relaxed() {
                return Err(CycleError::InsufficientCandidates {
                    required,
                    available: assigned,
                });
            }
            warn!("[PICK] Remaining images are excluded from every open screen, relaxing all checks");
            relax.relax_all();
        }
    }
}

/// First screen with room left that `candidate` may go on.
fn open_slot(
    buckets: &[Vec<Arc<Candidate>>],
    required_by_screen: &[usize],
    candidate: &Candidate,
    relax: &Relaxation,
) -> Option<usize> {
    (0..buckets.len()).find(|&screen| {
        buckets[screen].len() < required_by_screen[screen]
            && (!relax.disabled_screens || candidate.allowed_on(screen))
    })
}
