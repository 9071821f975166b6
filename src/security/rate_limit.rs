use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
#[error("Rate limit exceeded for {action}, retry in {retry_after_ms}ms")]
pub struct RateLimitError {
    pub action: String,
    pub retry_after_ms: u64,
}

/// Sliding 60 s window per `(actor, action)`. Actors never cross-contaminate
/// and an action with no configured limit is unmetered.
pub struct RateLimiter {
    limits: HashMap<String, u32>,
    buckets: Mutex<HashMap<(String, String), Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, u32>) -> Self {
        Self { limits, buckets: Mutex::new(HashMap::new()) }
    }

    /// Record one action now, unless the bucket is already at its limit for
    /// the trailing window. Rejections do not count toward the window.
    pub fn check_and_record(&self, actor_id: &str, action: &str) -> Result<(), RateLimitError> {
        let Some(&limit) = self.limits.get(action) else {
            return Ok(());
        };

        let now = Instant::now();
        let Ok(mut buckets) = self.buckets.lock() else {
            return Ok(());
        };
        let bucket = buckets
            .entry((actor_id.to_string(), action.to_string()))
            .or_default();
        bucket.retain(|t| now.duration_since(*t) < WINDOW);

        if bucket.len() >= limit as usize {
            // Oldest surviving timestamp decides when a slot frees up.
            let retry_after = bucket
                .first()
                .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(WINDOW);
            return Err(RateLimitError {
                action: action.to_string(),
                retry_after_ms: (retry_after.as_millis() as u64).max(1),
            });
        }

        bucket.push(now);
        Ok(())
    }

    #[cfg(test)]
    fn recorded(&self, actor_id: &str, action: &str) -> usize {
        self.buckets
            .lock()
            .unwrap()
            .get(&(actor_id.to_string(), action.to_string()))
            .map(|b| b.len())
            .unwrap_or(0)
    }
}
