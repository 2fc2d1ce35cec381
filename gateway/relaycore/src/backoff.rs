//! Retry timing.
//!
//! Every retry loop in the relay (send retry, reconnect loops) takes its
//! delays from a `BackoffPolicy`, so timing is configuration rather than a
//! constant buried in a loop.

use std::{fmt, str::FromStr, time::Duration};

use rand::Rng;

#[derive(thiserror::Error, Debug)]
#[error("unknown backoff kind '{0}' (expected fixed, exponential or jittered)")]
pub struct UnknownBackoffKind(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
    Jittered,
}

impl FromStr for BackoffKind {
    type Err = UnknownBackoffKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" | "exp" => Ok(BackoffKind::Exponential),
            "jittered" | "jitter" => Ok(BackoffKind::Jittered),
            other => Err(UnknownBackoffKind(other.to_string())),
        }
    }
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
            BackoffKind::Jittered => "jittered",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Same delay after every failure.
    Fixed { delay: Duration },
    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// Uniform in `[0, exponential delay]`.
    Jittered { base: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::fixed(Duration::from_secs(5))
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed { delay }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        BackoffPolicy::Exponential { base, max }
    }

    pub fn jittered(base: Duration, max: Duration) -> Self {
        BackoffPolicy::Jittered { base, max }
    }

    pub fn from_kind(kind: BackoffKind, base: Duration, max: Duration) -> Self {
        match kind {
            BackoffKind::Fixed => BackoffPolicy::fixed(base),
            BackoffKind::Exponential => BackoffPolicy::exponential(base, max),
            BackoffKind::Jittered => BackoffPolicy::jittered(base, max),
        }
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay } => *delay,
            BackoffPolicy::Exponential { base, max } => exponential(*base, *max, attempt),
            BackoffPolicy::Jittered { base, max } => {
                let ceiling = exponential(*base, *max, attempt);
                if ceiling.is_zero() {
                    return ceiling;
                }
                let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
                Duration::from_millis(millis)
            }
        }
    }
}

fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << shift).unwrap_or(max).min(max)
}

/// Bounded retry: at most `max_attempts` tries, `backoff` between them.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryLimit {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl RetryLimit {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        Self::new(3, BackoffPolicy::fixed(Duration::from_secs(1)))
    }
}
