//! Per-peer flood limits.

use std::time::{Duration, Instant};

/// Window length for block-edit counting.
pub const EDIT_WINDOW: Duration = Duration::from_secs(1);

/// Window length for movement-packet counting.
pub const MOVE_WINDOW: Duration = Duration::from_secs(30);

/// Counts events in fixed windows. The window restarts with the first event
/// after the previous window has elapsed.
#[derive(Debug)]
struct RateWindow {
    window: Duration,
    limit: u32,
    count: u32,
    started: Instant,
}

impl RateWindow {
    fn new(limit: u32, window: Duration, now: Instant) -> Self {
        Self {
            window,
            limit,
            count: 0,
            started: now,
        }
    }

    /// Registers one event; `true` means the limit for the current window is
    /// now exceeded.
    fn note(&mut self, now: Instant) -> bool {
        if now.duration_since(self.started) >= self.window {
            self.count = 0;
            self.started = now;
        }
        self.count += 1;
        self.count > self.limit
    }
}

/// Flood counters for one connection.
#[derive(Debug)]
pub struct SessionPolicy {
    edits: RateWindow,
    moves: RateWindow,
}

impl SessionPolicy {
    pub fn new(edit_limit: u32, move_limit: u32) -> Self {
        let now = Instant::now();
        Self {
            edits: RateWindow::new(edit_limit, EDIT_WINDOW, now),
            moves: RateWindow::new(move_limit, MOVE_WINDOW, now),
        }
    }

    /// Registers an accepted block edit; `true` means the peer should be
    /// kicked for griefing.
    pub fn note_edit(&mut self, now: Instant) -> bool {
        self.edits.note(now)
    }

    /// Registers a movement packet; `true` means the peer should be kicked
    /// for packet spam.
    pub fn note_move(&mut self, now: Instant) -> bool {
        self.moves.note(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_trips_only_past_the_threshold() {
        let start = Instant::now();
        let mut window = RateWindow::new(45, EDIT_WINDOW, start);
        for _ in 0..45 {
            assert!(!window.note(start));
        }
        assert!(window.note(start));
    }

    #[test]
    fn window_restarts_after_elapsing() {
        let start = Instant::now();
        let mut window = RateWindow::new(2, EDIT_WINDOW, start);
        assert!(!window.note(start));
        assert!(!window.note(start));
        assert!(window.note(start));

        let later = start + EDIT_WINDOW;
        assert!(!window.note(later));
        assert!(!window.note(later));
        assert!(window.note(later));
    }

    #[test]
    fn session_policy_tracks_edits_and_moves_separately() {
        let now = Instant::now();
        let mut policy = SessionPolicy::new(1, 2);
        assert!(!policy.note_edit(now));
        assert!(policy.note_edit(now));
        assert!(!policy.note_move(now));
        assert!(!policy.note_move(now));
        assert!(policy.note_move(now));
    }
}
