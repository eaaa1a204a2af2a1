//! Upstream rate budget
//!
//! Every upstream response reports how many calls are left in the current
//! window (`x-rate-limit-remaining`) and when the window resets
//! (`x-rate-limit-reset`, unix seconds). Calls are paced so the remaining
//! budget spreads over the time left; an exhausted class blocks every
//! caller until the reset deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::metrics::RATE_LIMIT_WAITS_TOTAL;

const HEADER_REMAINING: &str = "x-rate-limit-remaining";
const HEADER_RESET: &str = "x-rate-limit-reset";

/// Fallback wait after a 429 without a reset header
const DEFAULT_PENALTY: Duration = Duration::from_secs(60);

/// Upstream endpoints sharing one quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    UserByUsername,
    UserTweets,
    UserLookup,
    TweetsLookup,
    Other,
}

impl EndpointClass {
    /// Classify a request path such as `/2/users/123/tweets`.
    pub fn from_path(path: &str) -> Self {
        if path.starts_with("/2/users/by/username") || path.starts_with("/2/users/by") {
            return EndpointClass::UserByUsername;
        }
        if let Some(rest) = path.strip_prefix("/2/users/") {
            if let Some(id) = rest.strip_suffix("/tweets") {
                if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
                    return EndpointClass::UserTweets;
                }
            }
        }
        if path == "/2/users" || path.starts_with("/2/users/") {
            return EndpointClass::UserLookup;
        }
        if path == "/2/tweets" || path.starts_with("/2/tweets/") {
            return EndpointClass::TweetsLookup;
        }
        EndpointClass::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::UserByUsername => "user_by_username",
            EndpointClass::UserTweets => "user_tweets",
            EndpointClass::UserLookup => "user_lookup",
            EndpointClass::TweetsLookup => "tweets_lookup",
            EndpointClass::Other => "other",
        }
    }
}

/// Budget of one endpoint class
#[derive(Debug, Clone, Default)]
struct RateBudget {
    /// Calls left in the window, decremented locally on every reservation
    remaining: Option<u64>,
    reset_at: Option<Instant>,
    /// Spacing between two calls
    interval: Option<Duration>,
    next_slot: Option<Instant>,
}

impl RateBudget {
    /// Reserve a call; returns the instant to wait for, if any.
    fn reserve(&mut self, now: Instant) -> Option<Instant> {
        if self.reset_at.is_some_and(|reset| reset <= now) {
            *self = RateBudget::default();
        }

        if self.remaining == Some(0) {
            if let Some(reset) = self.reset_at {
                return Some(reset);
            }
        }

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }

        let interval = self.interval?;
        let slot = self.next_slot.map_or(now, |next| next.max(now));
        self.next_slot = Some(slot + interval);
        (slot > now).then_some(slot)
    }

    fn apply(&mut self, remaining: u64, reset_in: Duration, now: Instant) {
        self.remaining = Some(remaining);
        self.reset_at = Some(now + reset_in);
        self.interval = if remaining > 0 {
            let calls = u32::try_from(remaining).unwrap_or(u32::MAX);
            Some(reset_in / calls)
        } else {
            None
        };
        if self.interval.is_none() {
            self.next_slot = None;
        }
    }
}

/// Snapshot of a budget, for logs and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub remaining: Option<u64>,
    pub interval: Option<Duration>,
}

/// Shared per-class rate budgets
#[derive(Clone, Default)]
pub struct RateLimiter {
    budgets: Arc<Mutex<HashMap<EndpointClass, RateBudget>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a call of `class` fits the budget.
    pub async fn acquire(&self, class: EndpointClass) {
        loop {
            let deadline = {
                let mut budgets = self.budgets.lock().await;
                budgets.entry(class).or_default().reserve(Instant::now())
            };

            let Some(deadline) = deadline else {
                return;
            };

            RATE_LIMIT_WAITS_TOTAL
                .with_label_values(&[class.as_str()])
                .inc();
            tracing::debug!(
                endpoint = class.as_str(),
                wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                "waiting for upstream rate budget"
            );
            tokio::time::sleep_until(deadline.into()).await;

            // A paced slot is ours once reached; an exhausted budget is re-checked.
            let exhausted = {
                let budgets = self.budgets.lock().await;
                budgets
                    .get(&class)
                    .is_some_and(|budget| budget.remaining == Some(0) && budget.reset_at == Some(deadline))
            };
            if !exhausted {
                return;
            }
        }
    }

    /// Record the budget reported by an upstream response.
    pub async fn update(&self, class: EndpointClass, status: u16, headers: &http::HeaderMap) {
        let remaining = header_u64(headers, HEADER_REMAINING);
        let reset_in = header_u64(headers, HEADER_RESET).map(|reset| {
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            Duration::from_secs(reset.saturating_sub(now))
        });

        match (remaining, reset_in) {
            (Some(remaining), Some(reset_in)) => {
                let remaining = if status == 429 { 0 } else { remaining };
                self.apply(class, remaining, reset_in).await;
            }
            _ if status == 429 => self.apply(class, 0, reset_in.unwrap_or(DEFAULT_PENALTY)).await,
            _ => {}
        }
    }

    /// Replace the budget of `class`.
    pub async fn apply(&self, class: EndpointClass, remaining: u64, reset_in: Duration) {
        let mut budgets = self.budgets.lock().await;
        budgets
            .entry(class)
            .or_default()
            .apply(remaining, reset_in, Instant::now());
        if remaining == 0 {
            tracing::warn!(
                endpoint = class.as_str(),
                reset_in_secs = reset_in.as_secs(),
                "upstream rate budget exhausted"
            );
        }
    }

    pub async fn snapshot(&self, class: EndpointClass) -> Option<BudgetSnapshot> {
        let budgets = self.budgets.lock().await;
        budgets.get(&class).map(|budget| BudgetSnapshot {
            remaining: budget.remaining,
            interval: budget.interval,
        })
    }
}

fn header_u64(headers: &http::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}
