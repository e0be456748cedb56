//! Radio autofill guard: keeps the queue from running dry by appending one
//! recommended track at a time.
//!
//! At most one recommendation fetch is in flight.  A successful fetch starts a
//! cooldown whether or not a usable candidate came back; a failed fetch does
//! not, so an unreachable service is retried sooner.

use std::collections::HashSet;
use std::time::Duration;

use player_proto::protocol::Track;
use tokio::time::Instant;

pub const RADIO_COOLDOWN: Duration = Duration::from_millis(4000);
pub const RADIO_FETCH_LIMIT: usize = 12;

#[derive(Debug, Default)]
pub struct RadioGuard {
    cooldown_until: Option<Instant>,
    in_flight: bool,
}

impl RadioGuard {
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    /// Check every precondition and, if all hold, mark a fetch in flight.
    pub fn try_begin(
        &mut self,
        now: Instant,
        radio_enabled: bool,
        has_current: bool,
        queue_len: usize,
    ) -> bool {
        if !radio_enabled || !has_current || self.in_flight || queue_len > 0 {
            return false;
        }
        if matches!(self.cooldown_until, Some(until) if now < until) {
            return false;
        }
        self.in_flight = true;
        true
    }

    /// Always clears the in-flight flag; the cooldown only moves when the
    /// fetch call itself succeeded.
    pub fn finish(&mut self, now: Instant, fetch_succeeded: bool) {
        self.in_flight = false;
        if fetch_succeeded {
            self.cooldown_until = Some(now + RADIO_COOLDOWN);
        }
    }
}

/// First candidate whose key is neither the current track nor already queued.
pub fn pick_candidate<'a>(
    candidates: Vec<Track>,
    current: Option<&Track>,
    queued: impl IntoIterator<Item = &'a Track>,
) -> Option<Track> {
    let mut forbidden: HashSet<String> = queued.into_iter().map(Track::key).collect();
    if let Some(cur) = current {
        forbidden.insert(cur.key());
    }
    candidates
        .into_iter()
        .find(|c| !forbidden.contains(&c.key()))
}
