//! A consecutive-failure counter that trips after a threshold.
//!
//! Used by the poller to decide when a device is offline. Isolated
//! failures are tolerated; only an unbroken run of `threshold` failures
//! trips the streak, and a single success clears it.
//!
//! # State Machine
//!
//! ```text
//!           failure                count reaches threshold
//!  Clear ─────────────► Counting ─────────────────────────► Tripped
//!   ▲                      │                                   │
//!   │      success         │           success                 │
//!   └──────────────────────┘                                   │
//!   ▲                                                          │
//!   └────────────────────────── success ───────────────────────┘
//! ```
//!
//! `record()` returns a [`StreakStatus`] describing the transition so
//! callers can act on exactly the edges they care about (typically
//! `Tripped` and `Recovered`).

/// Result of [`FailureStreak::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakStatus {
    /// Success with no preceding trip. Nothing to do.
    Clear,

    /// Failure below the threshold. Carries the current count.
    Counting(u32),

    /// Threshold just reached. Returned exactly once per episode;
    /// further failures return [`Down`](StreakStatus::Down).
    Tripped,

    /// Already tripped, still failing.
    Down,

    /// Was tripped, success just arrived. Returned exactly once.
    Recovered,
}

#[derive(Debug)]
pub struct FailureStreak {
    threshold: u32,
    count: u32,
}

impl FailureStreak {
    /// Create a streak that trips on the `threshold`-th consecutive
    /// failure. A threshold of zero is treated as one.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
        }
    }

    /// Record the outcome of one attempt.
    ///
    /// | Previous | outcome | Result |
    /// |----------|---------|--------|
    /// | clear | ok | `Clear` |
    /// | clear / counting | fail | `Counting(n)` or `Tripped` |
    /// | counting | ok | `Clear` (resets count) |
    /// | tripped | fail | `Down` |
    /// | tripped | ok | `Recovered` (resets count) |
    pub fn record(&mut self, ok: bool) -> StreakStatus {
        let was_tripped = self.is_tripped();

        if ok {
            self.count = 0;
            return if was_tripped {
                StreakStatus::Recovered
            } else {
                StreakStatus::Clear
            };
        }

        if was_tripped {
            return StreakStatus::Down;
        }

        self.count += 1;
        if self.count >= self.threshold {
            StreakStatus::Tripped
        } else {
            StreakStatus::Counting(self.count)
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.count >= self.threshold
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
