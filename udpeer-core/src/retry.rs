//! Retry policy for request/ack exchanges: attempt budgets and the backoff schedule.
//!
//! Pure and clock-free. The host walks [`RetryPolicy::attempts`], sleeping `delay_before`
//! and then sending; the first attempt never waits and nothing waits after the last one.

use std::time::Duration;

/// Pause inserted between a failed attempt and the next send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    /// After attempt `after`, wait `step * (attempt - after)`, capped at `cap`.
    Linear {
        after: u32,
        step: Duration,
        cap: Duration,
    },
}

impl Backoff {
    /// Used by the FILE handshake and every CHUNK.
    pub const STANDARD: Backoff = Backoff::Linear {
        after: 3,
        step: Duration::from_millis(500),
        cap: Duration::from_millis(1500),
    };

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { after, step, cap } => {
                if attempt <= after {
                    Duration::ZERO
                } else {
                    (step * (attempt - after)).min(cap)
                }
            }
        }
    }
}

/// Base attempt budget for each CHUNK.
pub const CHUNK_BASE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const TALK: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        backoff: Backoff::None,
    };

    pub const FILE_OFFER: RetryPolicy = RetryPolicy {
        max_attempts: 5,
        backoff: Backoff::STANDARD,
    };

    pub const END: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        backoff: Backoff::None,
    };

    /// Budget for a chunk sent after `sent_bytes` of `total_bytes` were acknowledged:
    /// 5 attempts, 7 past 50% progress, 8 past 80%.
    pub fn for_chunk(sent_bytes: u64, total_bytes: u64) -> Self {
        let bonus = if total_bytes == 0 {
            0
        } else {
            let sent = u128::from(sent_bytes) * 100;
            let total = u128::from(total_bytes);
            if sent > total * 80 {
                3
            } else if sent > total * 50 {
                2
            } else {
                0
            }
        };
        RetryPolicy {
            max_attempts: CHUNK_BASE_ATTEMPTS + bonus,
            backoff: Backoff::STANDARD,
        }
    }

    pub fn attempts(&self) -> Attempts {
        Attempts {
            policy: *self,
            next: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub delay_before: Duration,
}

/// Bounded attempt sequence for one exchange.
#[derive(Debug, Clone)]
pub struct Attempts {
    policy: RetryPolicy,
    next: u32,
}

impl Iterator for Attempts {
    type Item = Attempt;

    fn next(&mut self) -> Option<Attempt> {
        if self.next > self.policy.max_attempts {
            return None;
        }
        let number = self.next;
        self.next += 1;
        let delay_before = if number == 1 {
            Duration::ZERO
        } else {
            self.policy.backoff.delay_after(number - 1)
        };
        Some(Attempt {
            number,
            delay_before,
        })
    }
}
