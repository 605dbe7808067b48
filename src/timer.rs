use std::time::Duration;

use tokio::time::Instant;

/// A single rearmable inactivity deadline.
///
/// There is only ever one deadline: rearming overwrites it, so a stale expiry
/// can never fire after a newer rearm.
#[derive(Debug, Clone)]
pub struct InactivityTimer {
    period: Option<Duration>,
    deadline: Option<Instant>,
    // Set once the deadline is a last one that rearming may not move.
    last: bool,
}

impl InactivityTimer {
    /// `None` (or a zero period) disables the timer entirely.
    pub fn new(period: Option<Duration>) -> Self {
        Self {
            period: period.filter(|p| !p.is_zero()),
            deadline: None,
            last: false,
        }
    }

    pub fn rearm(&mut self) {
        if self.last {
            return;
        }
        if let Some(period) = self.period {
            self.deadline = Some(Instant::now() + period);
        }
    }

    /// Arm one final deadline `grace` from now, even when the timer is
    /// disabled. Later rearms leave it alone.
    pub fn finish_within(&mut self, grace: Duration) {
        self.deadline = Some(Instant::now() + grace);
        self.last = true;
    }

    /// Whether the current deadline came from [`finish_within`].
    ///
    /// [`finish_within`]: InactivityTimer::finish_within
    pub fn is_final(&self) -> bool {
        self.last
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.last = false;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Resolves when `deadline` passes; never resolves for `None`.
pub async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
