use crate::error::CycleError;
use crate::filter::Eligibility;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    /// One image across every randomly cycled screen.
    Spanning,
    PerScreen,
}

impl CycleMode {
    pub fn is_spanning(self) -> bool {
        self == CycleMode::Spanning
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDecision {
    pub mode: CycleMode,
    /// Images the picker has to deliver for this cycle.
    pub required: usize,
}

/// Priority-weighted choice between a spanning and a per-screen cycle.
///
/// The single-screen sum is divided by the number of per-screen slots so
/// both sides compare on a per-assignment basis. Spanning then wins with
/// probability `M / (M + S_adj)`.
pub fn select_mode<R: Rng + ?Sized>(
    eligibility: &Eligibility,
    required_by_screen: &[usize],
    rng: &mut R,
) -> Result<ModeDecision, CycleError> {
    let slots: usize = required_by_screen.iter().sum();
    let multi = eligibility.sum_priority_multi;
    let single = eligibility.sum_priority_single;

    let per_screen = ModeDecision {
        mode: CycleMode::PerScreen,
        required: slots,
    };
    let spanning = ModeDecision {
        mode: CycleMode::Spanning,
        required: 1,
    };

    match (multi, single) {
        (0, 0) => Err(CycleError::InsufficientCandidates {
            required: slots.max(1),
            available: 0,
        }),
        (0, _) => Ok(per_screen),
        (_, 0) => Ok(spanning),
        _ => {
            // A non-zero single sum keeps at least one ticket in the draw
            let adjusted_single = (single / slots.max(1) as u64).max(1);
            let draw = rng.gen_range(1..=multi + adjusted_single);
            if multi < draw {
                Ok(per_screen)
            } else {
                Ok(spanning)
            }
        }
    }
}
