//! Weight progression between reconcile ticks
//!
//! The controller does not analyse metrics. Each tick moves the canary
//! weight one `stepWeight` closer to `maxWeight`, then promotes by routing
//! everything back to the primary.

use crate::crd::canary::{CanaryPhase, CanaryStatus};
use crate::crd::Canary;
use crate::router::Weights;
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;

/// Used when `maxWeight` is unset
pub const DEFAULT_MAX_WEIGHT: u32 = 50;

/// Used when `analysis.interval` is unset or invalid
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// What the next tick should do with the route object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// `None` keeps the live split
    pub weights: Option<Weights>,
    pub phase: CanaryPhase,
}

impl Step {
    fn hold(phase: CanaryPhase) -> Self {
        Self {
            weights: None,
            phase,
        }
    }
}

/// Decide the next split from the live one
///
/// - A canary seen for the first time only gets its routes initialized.
/// - Without a positive `stepWeight` the split is never changed.
/// - A promoted canary holds while the canary weight stays at 0.
pub fn next_step(canary: &Canary, current: Weights) -> Step {
    let phase = canary
        .status
        .as_ref()
        .and_then(|s| s.phase)
        .unwrap_or_default();

    if phase == CanaryPhase::Initializing {
        return Step::hold(CanaryPhase::Initialized);
    }

    let Some(analysis) = canary.spec.analysis.as_ref() else {
        return Step::hold(phase);
    };
    let step = match analysis.step_weight {
        Some(step) if step > 0 => step.unsigned_abs(),
        _ => return Step::hold(phase),
    };

    if phase == CanaryPhase::Succeeded && current.canary == 0 {
        return Step::hold(CanaryPhase::Succeeded);
    }

    let max_weight = analysis
        .max_weight
        .filter(|w| *w > 0)
        .map(|w| w.unsigned_abs().min(100))
        .unwrap_or(DEFAULT_MAX_WEIGHT);

    if current.canary >= max_weight {
        return Step {
            weights: Some(Weights::new(100, 0)),
            phase: CanaryPhase::Succeeded,
        };
    }

    Step {
        weights: Some(Weights::from_canary(
            current.canary.saturating_add(step).min(max_weight),
        )),
        phase: CanaryPhase::Progressing,
    }
}

/// Status after a tick
///
/// `lastTransitionTime` only moves when the phase changes. `iterations`
/// counts consecutive progressing ticks.
pub fn next_status(
    previous: Option<&CanaryStatus>,
    phase: CanaryPhase,
    weights: Weights,
    now: DateTime<Utc>,
) -> CanaryStatus {
    let previous_phase = previous.and_then(|s| s.phase);
    let last_transition_time = match previous {
        Some(status) if previous_phase == Some(phase) => status.last_transition_time.clone(),
        _ => Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    };
    let iterations = match phase {
        CanaryPhase::Progressing => previous.and_then(|s| s.iterations).unwrap_or(0) + 1,
        _ => 0,
    };

    CanaryStatus {
        phase: Some(phase),
        canary_weight: i32::try_from(weights.canary).ok(),
        iterations: Some(iterations),
        last_transition_time,
    }
}

/// Time until the next tick
pub fn requeue_interval(canary: &Canary) -> Duration {
    canary
        .spec
        .analysis
        .as_ref()
        .and_then(|a| a.interval.as_deref())
        .and_then(parse_duration)
        .unwrap_or(DEFAULT_INTERVAL)
}

/// Parse `30s`, `5m` or `1h`
///
/// Zero, unit-less and overly long values are rejected: seconds and minutes
/// up to 24h, hours up to one week.
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();
    let unit = duration_str.chars().last()?;
    let number: u64 = duration_str[..duration_str.len() - unit.len_utf8()]
        .parse()
        .ok()?;

    if number == 0 {
        return None;
    }

    match unit {
        's' if number <= 86_400 => Some(Duration::from_secs(number)),
        'm' if number <= 1_440 => number.checked_mul(60).map(Duration::from_secs),
        'h' if number <= 168 => number.checked_mul(3_600).map(Duration::from_secs),
        _ => None,
    }
}
