//! Retry policies for jobs whose task returned an error.
//!
//! A [`RetryPolicy`] answers two questions once a task fails: may the job run
//! again, and when. The first is a plain ceiling on retries
//! (`max_attempts`); the second is delegated to a [`RetryStrategy`], which is
//! either one of the built-in backoff formulas or any [`BackoffPolicy`] you
//! plug in.
//!
//! # Examples
//!
//! ```rust
//! use laterwork::retry::{JitterType, RetryPolicy, RetryStrategy};
//! use std::time::Duration;
//!
//! // Up to 5 retries: 1s, 2s, 4s, 8s, 16s, each adjusted by up to ±10%
//! let policy = RetryPolicy::new(
//!     5,
//!     RetryStrategy::exponential_with_jitter(
//!         Duration::from_secs(1),
//!         2.0,
//!         Some(Duration::from_secs(10 * 60)),
//!         JitterType::Multiplicative(0.1),
//!     ),
//! );
//!
//! // A hand-written formula
//! let custom = RetryPolicy::new(3, RetryStrategy::custom(|attempt| {
//!     Duration::from_secs(u64::from(attempt) * 30)
//! }));
//! assert!(custom.delay(2) >= Duration::from_secs(60));
//! # let _ = policy;
//! ```

use crate::config::duration_secs;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

/// Computes the delay before retry number `attempt` (1-based).
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Randomness added to a delay so failing jobs do not all retry at once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JitterType {
    /// `delay ± rand(0, amount)`
    Additive(#[serde(with = "duration_secs")] Duration),

    /// `delay * (1 ± rand(0, factor))`
    Multiplicative(f64),
}

impl JitterType {
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        match self {
            JitterType::Additive(amount) => {
                let jitter = Duration::from_millis(rng.gen_range(0..=amount.as_millis() as u64));
                if rng.gen_bool(0.5) {
                    delay + jitter
                } else {
                    delay.saturating_sub(jitter)
                }
            }
            JitterType::Multiplicative(factor) => {
                let factor = factor.abs();
                let scale = rng.gen_range((1.0 - factor).max(0.0)..=(1.0 + factor));
                Duration::from_millis((delay.as_millis() as f64 * scale) as u64)
            }
        }
    }
}

/// Backoff formula. `attempt` is the number of the retry about to be
/// scheduled, starting at 1.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay every time.
    Fixed {
        #[serde(with = "duration_secs")]
        delay: Duration,
    },

    /// `base + attempt * increment`
    Linear {
        #[serde(with = "duration_secs")]
        base: Duration,
        #[serde(with = "duration_secs")]
        increment: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_secs::option")]
        max_delay: Option<Duration>,
    },

    /// `base * multiplier ^ (attempt - 1)`, then jitter.
    Exponential {
        #[serde(with = "duration_secs")]
        base: Duration,
        multiplier: f64,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_secs::option")]
        max_delay: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<JitterType>,
    },

    /// `base * fibonacci(attempt)`
    Fibonacci {
        #[serde(with = "duration_secs")]
        base: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_secs::option")]
        max_delay: Option<Duration>,
    },

    /// Any [`BackoffPolicy`]. Cannot be written to a config file.
    #[serde(skip)]
    Custom(Arc<dyn BackoffPolicy>),
}

impl RetryStrategy {
    /// Delay before retry number `attempt`. Never zero.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = match self {
            RetryStrategy::Fixed { delay } => *delay,
            RetryStrategy::Linear {
                base,
                increment,
                max_delay,
            } => cap(*base + increment.mul_f64(attempt as f64), *max_delay),
            RetryStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.powi(exponent);
                let delay = match max_delay {
                    Some(max) if base.as_secs_f64() * factor >= max.as_secs_f64() => *max,
                    _ => Duration::try_from_secs_f64(base.as_secs_f64() * factor)
                        .unwrap_or(Duration::MAX),
                };
                match jitter {
                    Some(jitter) => jitter.apply(delay),
                    None => delay,
                }
            }
            RetryStrategy::Fibonacci { base, max_delay } => {
                cap(base.saturating_mul(fibonacci(attempt).min(u32::MAX as u64) as u32), *max_delay)
            }
            RetryStrategy::Custom(policy) => policy.delay(attempt),
        };

        delay.max(Duration::from_millis(1))
    }

    pub fn fixed(delay: Duration) -> Self {
        RetryStrategy::Fixed { delay }
    }

    pub fn linear(base: Duration, increment: Duration, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Linear {
            base,
            increment,
            max_delay,
        }
    }

    pub fn exponential(base: Duration, multiplier: f64, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: None,
        }
    }

    pub fn exponential_with_jitter(
        base: Duration,
        multiplier: f64,
        max_delay: Option<Duration>,
        jitter: JitterType,
    ) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: Some(jitter),
        }
    }

    pub fn fibonacci(base: Duration, max_delay: Option<Duration>) -> Self {
        RetryStrategy::Fibonacci { base, max_delay }
    }

    pub fn custom<P>(policy: P) -> Self
    where
        P: BackoffPolicy + 'static,
    {
        RetryStrategy::Custom(Arc::new(policy))
    }
}

impl BackoffPolicy for RetryStrategy {
    fn delay(&self, attempt: u32) -> Duration {
        self.calculate_delay(attempt)
    }
}

fn cap(delay: Duration, max_delay: Option<Duration>) -> Duration {
    match max_delay {
        Some(max) => delay.min(max),
        None => delay,
    }
}

/// `n`-th Fibonacci number, 1-based, saturating.
pub fn fibonacci(n: u32) -> u64 {
    if n == 0 {
        return 0;
    }
    let (mut prev, mut curr) = (0u64, 1u64);
    for _ in 1..n {
        let next = prev.saturating_add(curr);
        prev = curr;
        curr = next;
    }
    curr
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::Fixed { delay } => f.debug_struct("Fixed").field("delay", delay).finish(),
            RetryStrategy::Linear {
                base,
                increment,
                max_delay,
            } => f
                .debug_struct("Linear")
                .field("base", base)
                .field("increment", increment)
                .field("max_delay", max_delay)
                .finish(),
            RetryStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                jitter,
            } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("multiplier", multiplier)
                .field("max_delay", max_delay)
                .field("jitter", jitter)
                .finish(),
            RetryStrategy::Fibonacci { base, max_delay } => f
                .debug_struct("Fibonacci")
                .field("base", base)
                .field("max_delay", max_delay)
                .finish(),
            RetryStrategy::Custom(_) => f.write_str("Custom(<policy>)"),
        }
    }
}

impl PartialEq for RetryStrategy {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RetryStrategy::Fixed { delay: a }, RetryStrategy::Fixed { delay: b }) => a == b,
            (
                RetryStrategy::Linear {
                    base: a_base,
                    increment: a_inc,
                    max_delay: a_max,
                },
                RetryStrategy::Linear {
                    base: b_base,
                    increment: b_inc,
                    max_delay: b_max,
                },
            ) => a_base == b_base && a_inc == b_inc && a_max == b_max,
            (
                RetryStrategy::Exponential {
                    base: a_base,
                    multiplier: a_mult,
                    max_delay: a_max,
                    jitter: a_jitter,
                },
                RetryStrategy::Exponential {
                    base: b_base,
                    multiplier: b_mult,
                    max_delay: b_max,
                    jitter: b_jitter,
                },
            ) => a_base == b_base && a_mult == b_mult && a_max == b_max && a_jitter == b_jitter,
            (
                RetryStrategy::Fibonacci {
                    base: a_base,
                    max_delay: a_max,
                },
                RetryStrategy::Fibonacci {
                    base: b_base,
                    max_delay: b_max,
                },
            ) => a_base == b_base && a_max == b_max,
            (RetryStrategy::Custom(a), RetryStrategy::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// How many times a failed job is retried and how long it waits in between.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries allowed after the first run. 0 disables retrying.
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: RetryStrategy) -> Self {
        Self {
            max_attempts,
            strategy,
        }
    }

    /// Failed jobs go straight to `failed`.
    pub fn none() -> Self {
        Self::new(0, RetryStrategy::fixed(Duration::from_secs(1)))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.strategy.calculate_delay(attempt)
    }

    /// When a job that already went through `attempts` retries should run
    /// again, or `None` once the ceiling is reached.
    ///
    /// A delay too large to represent saturates at [`DateTime::<Utc>::MAX_UTC`].
    pub fn retry_at(&self, attempts: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let attempts = u32::try_from(attempts).unwrap_or(0);
        if attempts >= self.max_attempts {
            return None;
        }
        let retry_at = chrono::Duration::from_std(self.delay(attempts + 1))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(retry_at)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
