//! Crossfade ramp timing.
//!
//! A fade of `duration_ms` runs `steps = max(6, duration_ms / 50)` ticks spaced
//! `max(40 ms, duration_ms / steps)` apart.  Step `k` puts the outgoing
//! channel at `1 - k/steps` and the incoming one at `k/steps`.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::CoreEvent;

pub const MIN_FADE_STEPS: u32 = 6;
pub const MIN_TICK: Duration = Duration::from_millis(40);
/// Longest fade accepted; longer requests are shortened to this.
pub const MAX_FADE_MS: u64 = 60_000;
const TICK_TARGET_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadePlan {
    pub duration: Duration,
    pub steps: u32,
    pub interval: Duration,
}

impl FadePlan {
    pub fn new(duration_ms: u64) -> Self {
        let duration_ms = duration_ms.min(MAX_FADE_MS);
        let steps = u32::try_from(duration_ms / TICK_TARGET_MS)
            .unwrap_or(u32::MAX)
            .max(MIN_FADE_STEPS);
        let interval = Duration::from_millis(duration_ms / steps as u64).max(MIN_TICK);
        Self {
            duration: Duration::from_millis(duration_ms),
            steps,
            interval,
        }
    }

    pub fn progress(&self, step: u32) -> f32 {
        (step as f32 / self.steps as f32).clamp(0.0, 1.0)
    }

    /// `(outgoing, incoming)` ramp volumes at `step`.
    pub fn volumes(&self, step: u32) -> (f32, f32) {
        if step >= self.steps {
            return (0.0, 1.0);
        }
        let t = self.progress(step);
        (1.0 - t, t)
    }
}

/// Emit `FadeTick { generation, step }` for steps `1..=plan.steps`.  The core
/// decides whether each tick is still current; this task only keeps time.
pub fn spawn_fade_ticker(
    plan: FadePlan,
    generation: u64,
    tx: mpsc::Sender<CoreEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for step in 1..=plan.steps {
            tokio::time::sleep(plan.interval).await;
            if tx
                .send(CoreEvent::FadeTick { generation, step })
                .await
                .is_err()
            {
                break;
            }
        }
    })
}
