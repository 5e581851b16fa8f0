// In-memory per-user request limiter for the quiz endpoints.
//
// This caps request bursts only. Energy and the gap between attempts at the
// same quiz are enforced from the database by the energy gate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::ApiError;

/// Different rate limit types with their constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitType {
    QuizStart,
    QuizAnswer,
    QuizFinish,
}

impl RateLimitType {
    /// Maximum number of events allowed in the window.
    pub fn max_count(&self) -> usize {
        match self {
            RateLimitType::QuizStart => 20,
            RateLimitType::QuizAnswer => 120,
            RateLimitType::QuizFinish => 20,
        }
    }

    /// Time window for the rate limit.
    pub fn window(&self) -> Duration {
        Duration::from_secs(60)
    }
}

impl std::fmt::Display for RateLimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitType::QuizStart => write!(f, "quiz starts per minute"),
            RateLimitType::QuizAnswer => write!(f, "answers per minute"),
            RateLimitType::QuizFinish => write!(f, "quiz finishes per minute"),
        }
    }
}

/// Error returned when a rate limit is exceeded.
#[derive(Debug, Clone)]
pub struct RateLimitError {
    pub limit_type: RateLimitType,
    pub max: usize,
    /// Time until the oldest counted request leaves the window.
    pub retry_after: Duration,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Rate limit exceeded: max {} {}", self.max, self.limit_type)
    }
}

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        ApiError::RateLimited {
            wait_ms: e.retry_after.as_millis() as i64,
        }
    }
}

/// Key for the rate limit map: (user_id, limit_type).
type LimitKey = (i64, RateLimitType);

/// Thread-safe in-memory rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<LimitKey, Vec<Instant>>>>,
    enabled: bool,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            enabled: true,
        }
    }

    /// A limiter that lets everything through (local mode).
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<LimitKey, Vec<Instant>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check if the user is within the rate limit for the given type.
    /// If within limits, records the event and returns Ok(()).
    pub fn check_limit(&self, user_id: i64, limit_type: RateLimitType) -> Result<(), RateLimitError> {
        if !self.enabled {
            return Ok(());
        }
        let mut map = self.map();
        let window = limit_type.window();
        let max = limit_type.max_count();
        let now = Instant::now();

        let entries = map.entry((user_id, limit_type)).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max {
            let retry_after = entries
                .first()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            return Err(RateLimitError {
                limit_type,
                max,
                retry_after,
            });
        }

        entries.push(now);
        Ok(())
    }

    /// Get the current count for a user and limit type (for testing/diagnostics).
    pub fn current_count(&self, user_id: i64, limit_type: RateLimitType) -> usize {
        let mut map = self.map();
        let window = limit_type.window();
        let now = Instant::now();

        match map.get_mut(&(user_id, limit_type)) {
            Some(entries) => {
                entries.retain(|t| now.duration_since(*t) < window);
                entries.len()
            }
            None => 0,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_denies_over_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..20 {
            assert!(limiter.check_limit(1, RateLimitType::QuizStart).is_ok());
        }
        let err = limiter.check_limit(1, RateLimitType::QuizStart).unwrap_err();
        assert_eq!(err.max, 20);
        assert_eq!(err.limit_type, RateLimitType::QuizStart);
        assert!(err.retry_after <= Duration::from_secs(60));
        assert_eq!(err.to_string(), "Rate limit exceeded: max 20 quiz starts per minute");
    }

    #[test]
    fn test_rate_limiter_separate_users_and_types() {
        let limiter = RateLimiter::new();
        for _ in 0..20 {
            limiter.check_limit(1, RateLimitType::QuizFinish).unwrap();
        }
        assert!(limiter.check_limit(1, RateLimitType::QuizFinish).is_err());
        assert!(limiter.check_limit(2, RateLimitType::QuizFinish).is_ok());
        assert!(limiter.check_limit(1, RateLimitType::QuizAnswer).is_ok());
        assert_eq!(limiter.current_count(1, RateLimitType::QuizAnswer), 1);
    }

    #[test]
    fn test_disabled_limiter_records_nothing() {
        let limiter = RateLimiter::disabled();
        for _ in 0..50 {
            assert!(limiter.check_limit(1, RateLimitType::QuizStart).is_ok());
        }
        assert_eq!(limiter.current_count(1, RateLimitType::QuizStart), 0);
    }

    #[test]
    fn test_error_maps_to_rate_limited() {
        let err = RateLimitError {
            limit_type: RateLimitType::QuizStart,
            max: 20,
            retry_after: Duration::from_millis(1500),
        };
        match ApiError::from(err) {
            ApiError::RateLimited { wait_ms } => assert_eq!(wait_ms, 1500),
            other => panic!("unexpected {other:?}"),
        }
    }
}
