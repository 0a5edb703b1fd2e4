//! Token pool manager.
//!
//! Owns the health state of every upstream bearer token, hands tokens out in
//! round-robin order over the currently-available set, and schedules
//! recovery of rate-limited tokens once their reset time has passed.
//!
//! Rotation is a cyclic index into a snapshot `Vec` that is rebuilt on every
//! mutation of the available set, never a live iterator over a mutating
//! collection.

use crate::core::error::{GatewayError, Result};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Literal marker the upstream embeds in rate-limit error bodies. This exact
/// phrase is an external contract; do not reword it.
pub const RATE_LIMIT_MARKER: &str = "usage exceeds frequency limit";

/// Interval after which `next_token` always runs a recovery sweep.
const SWEEP_INTERVAL_SECS: i64 = 30;

/// Minimum spacing between opportunistic sweeps triggered by a due token.
const SWEEP_MIN_INTERVAL_SECS: i64 = 5;

/// Backoff applied when a rate-limit message carries no parsable reset time.
const DEFAULT_BACKOFF_SECS: i64 = 3600;

/// Interval of the background recovery task spawned at startup.
pub const BACKGROUND_SWEEP_SECS: u64 = 60;

static RESET_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    // e.g. "2025-09-04 02:57:00 UTC+8"
    Regex::new(r"(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}) UTC\+(\d+)").unwrap()
});

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Health state for a single upstream token.
#[derive(Debug, Clone)]
struct TokenHealth {
    is_available: bool,
    reset_time: Option<DateTime<Utc>>,
    error_count: u32,
    last_error_message: Option<String>,
}

impl TokenHealth {
    fn new() -> Self {
        Self {
            is_available: true,
            reset_time: None,
            error_count: 0,
            last_error_message: None,
        }
    }
}

/// State guarded by the pool mutex.
struct PoolInner {
    statuses: HashMap<String, TokenHealth>,
    /// Snapshot of the currently-available tokens, in load order.
    rotation: Vec<String>,
    cursor: usize,
    last_sweep: Option<DateTime<Utc>>,
}

/// Pool health summary returned by `/v1/token/status` and `/health`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub rate_limited: usize,
}

/// Redacted per-token detail for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TokenDetail {
    pub token: String,
    pub is_available: bool,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_until_reset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Round-robin rotation over the healthy subset of a fixed token list.
pub struct TokenPool {
    inner: Mutex<PoolInner>,
    /// Token list fixed at load time; a reload is a full re-init.
    all_tokens: Vec<String>,
    /// Lock-free mirrors for best-effort reads and the cheap sweep pre-check.
    available_count: AtomicUsize,
    earliest_reset_epoch: AtomicI64,
    clock: Clock,
}

impl TokenPool {
    /// Build a pool over `tokens`, all initially available.
    ///
    /// Fails with `EmptyTokenPool` when the list is empty.
    pub fn new(tokens: Vec<String>) -> Result<Self> {
        Self::with_clock(tokens, Arc::new(Utc::now))
    }

    /// Like [`TokenPool::new`] but with an injected clock, for tests that
    /// need to advance time without sleeping.
    pub fn with_clock(tokens: Vec<String>, clock: Clock) -> Result<Self> {
        if tokens.is_empty() {
            return Err(GatewayError::EmptyTokenPool);
        }

        let statuses = tokens
            .iter()
            .map(|t| (t.clone(), TokenHealth::new()))
            .collect();

        let available_count = AtomicUsize::new(tokens.len());
        let inner = PoolInner {
            statuses,
            rotation: tokens.clone(),
            cursor: 0,
            last_sweep: None,
        };

        tracing::info!(tokens = tokens.len(), "Token pool initialized");

        Ok(Self {
            inner: Mutex::new(inner),
            all_tokens: tokens,
            available_count,
            earliest_reset_epoch: AtomicI64::new(i64::MAX),
            clock,
        })
    }

    /// Next token in round-robin order over the available set.
    ///
    /// Runs a conditional recovery sweep first: immediately when the
    /// available set is empty, on the 30s interval otherwise, or after 5s
    /// when the lock-free pre-check sees a token whose reset time has
    /// already passed.
    pub async fn next_token(&self) -> Result<String> {
        let now = (self.clock)();
        let due_seen = self.has_due_token(now);

        let mut inner = self.inner.lock().await;

        let should_sweep = match inner.last_sweep {
            _ if inner.rotation.is_empty() => true,
            None => true,
            Some(last) => {
                let since = (now - last).num_seconds();
                since >= SWEEP_INTERVAL_SECS || (since >= SWEEP_MIN_INTERVAL_SECS && due_seen)
            }
        };

        if should_sweep {
            self.recover_due_locked(&mut inner, now);
            inner.last_sweep = Some(now);
        }

        if inner.rotation.is_empty() {
            tracing::error!("All upstream tokens are rate-limited");
            return Err(GatewayError::NoAvailableToken);
        }

        let index = inner.cursor % inner.rotation.len();
        let token = inner.rotation[index].clone();
        inner.cursor = (index + 1) % inner.rotation.len();
        Ok(token)
    }

    /// Mark `token` rate-limited and schedule its recovery.
    ///
    /// The reset time is parsed out of `error_message` when present,
    /// otherwise defaults to one hour from now. Unknown tokens are a logged
    /// no-op.
    pub async fn mark_rate_limited(&self, token: &str, error_message: &str) {
        let now = (self.clock)();
        let mut inner = self.inner.lock().await;

        let Some(status) = inner.statuses.get_mut(token) else {
            tracing::warn!("Attempted to rate-limit a token unknown to the pool");
            return;
        };

        status.is_available = false;
        status.error_count += 1;
        status.last_error_message = Some(error_message.to_string());

        let reset_time = match parse_reset_time(error_message) {
            Some(t) => {
                tracing::warn!(reset_time = %t, "Token rate-limited, reset time parsed from error");
                t
            }
            None => {
                let t = now + Duration::seconds(DEFAULT_BACKOFF_SECS);
                tracing::warn!(reset_time = %t, "Token rate-limited, no reset time in error, defaulting to 1h");
                t
            }
        };
        status.reset_time = Some(reset_time);

        self.rebuild_rotation(&mut inner);
        tracing::info!(available = inner.rotation.len(), "Removed token from rotation");
    }

    /// Restore every token whose reset time has elapsed. Returns how many
    /// were restored; calling again with no elapsed time is a no-op.
    pub async fn recover_due_tokens(&self) -> usize {
        let now = (self.clock)();
        let mut inner = self.inner.lock().await;
        self.recover_due_locked(&mut inner, now)
    }

    /// Best-effort pool counts, read without taking the lock.
    pub fn status_summary(&self) -> PoolStatus {
        let total = self.all_tokens.len();
        let available = self.available_count.load(Ordering::Relaxed);
        PoolStatus {
            total,
            available,
            rate_limited: total - available,
        }
    }

    /// Redacted per-token detail, in load order.
    pub async fn token_details(&self) -> Vec<TokenDetail> {
        let now = (self.clock)();
        let inner = self.inner.lock().await;

        self.all_tokens
            .iter()
            .map(|token| {
                let status = &inner.statuses[token];
                TokenDetail {
                    token: redact_token(token),
                    is_available: status.is_available,
                    error_count: status.error_count,
                    reset_time: status.reset_time.map(|t| t.to_rfc3339()),
                    seconds_until_reset: status
                        .reset_time
                        .map(|t| (t - now).num_seconds().max(0)),
                    last_error: status
                        .last_error_message
                        .as_ref()
                        .map(|m| truncate_error(m)),
                }
            })
            .collect()
    }

    /// Lock-free pre-check: is any unavailable token past its reset time?
    fn has_due_token(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.earliest_reset_epoch.load(Ordering::Relaxed)
    }

    fn recover_due_locked(&self, inner: &mut PoolInner, now: DateTime<Utc>) -> usize {
        let mut restored = 0;
        for status in inner.statuses.values_mut() {
            if !status.is_available {
                if let Some(reset_time) = status.reset_time {
                    if now >= reset_time {
                        status.is_available = true;
                        status.reset_time = None;
                        status.error_count = 0;
                        status.last_error_message = None;
                        restored += 1;
                    }
                }
            }
        }

        if restored > 0 {
            // One rebuild after processing all restorations.
            self.rebuild_rotation(inner);
            tracing::info!(
                restored,
                available = inner.rotation.len(),
                "Restored rate-limited tokens"
            );
        }
        restored
    }

    /// Rebuild the rotation snapshot from current health state. Any mutation
    /// of the available set must come through here so the cursor stays
    /// consistent.
    fn rebuild_rotation(&self, inner: &mut PoolInner) {
        inner.rotation = self
            .all_tokens
            .iter()
            .filter(|t| inner.statuses[*t].is_available)
            .cloned()
            .collect();
        inner.cursor = 0;

        self.available_count
            .store(inner.rotation.len(), Ordering::Relaxed);

        let earliest = inner
            .statuses
            .values()
            .filter(|s| !s.is_available)
            .filter_map(|s| s.reset_time)
            .map(|t| t.timestamp())
            .min()
            .unwrap_or(i64::MAX);
        self.earliest_reset_epoch.store(earliest, Ordering::Relaxed);
    }
}

/// Parse a reset-time hint like `2025-09-04 02:57:00 UTC+8` into the
/// corresponding UTC instant.
pub fn parse_reset_time(error_message: &str) -> Option<DateTime<Utc>> {
    let caps = RESET_TIME_RE.captures(error_message)?;
    let naive = NaiveDateTime::parse_from_str(&caps[1], "%Y-%m-%d %H:%M:%S").ok()?;
    let offset_hours: i64 = caps[2].parse().ok()?;

    // The hint is local time at the stated offset; subtract it to reach UTC.
    Some(Utc.from_utc_datetime(&naive) - Duration::hours(offset_hours))
}

/// Show only a prefix and suffix of the token value.
fn redact_token(token: &str) -> String {
    if token.len() > 14 {
        format!("{}...{}", &token[..10], &token[token.len() - 4..])
    } else {
        token.to_string()
    }
}

fn truncate_error(message: &str) -> String {
    if message.len() > 100 {
        let cut = message
            .char_indices()
            .take_while(|(i, _)| *i <= 100)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!("{}...", &message[..cut])
    } else {
        message.to_string()
    }
}
