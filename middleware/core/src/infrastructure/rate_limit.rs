// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

// Rate Limiting and Circuit Breaking
//
// RateLimits keeps one keyed governor limiter per configured class. Keys are
// the caller identity (`user:<name>` once authenticated, `addr:<peer>`
// before). Classes that are not configured are unlimited.
//
// CircuitBreaker counts INTERNAL failures per method inside a sliding window.
// Once the threshold is hit the method is refused for the cooldown period.

use dashmap::DashMap;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::domain::config::{CircuitBreakerConfig, RateLimitClass};

pub struct RateLimits {
    classes: HashMap<String, DefaultKeyedRateLimiter<String>>,
}

impl RateLimits {
    pub fn new(classes: &HashMap<String, RateLimitClass>) -> Self {
        let mut limiters = HashMap::new();
        for (name, class) in classes {
            let Some(burst) = NonZeroU32::new(class.calls) else {
                warn!("Rate limit class {} allows no calls; ignoring it", name);
                continue;
            };
            let period = Duration::from_secs(class.per_seconds.max(1)) / class.calls;
            let Some(quota) = Quota::with_period(period) else {
                warn!("Rate limit class {} has an empty period; ignoring it", name);
                continue;
            };
            limiters.insert(name.clone(), RateLimiter::keyed(quota.allow_burst(burst)));
        }
        Self { classes: limiters }
    }

    pub fn unlimited() -> Self {
        Self {
            classes: HashMap::new(),
        }
    }

    /// `false` when `key` has exhausted the budget of `class`.
    pub fn check(&self, class: &str, key: &str) -> bool {
        match self.classes.get(class) {
            Some(limiter) => limiter.check_key(&key.to_string()).is_ok(),
            None => {
                debug!("Rate limit class {} is not configured", class);
                true
            }
        }
    }

    /// Drop idle keys.
    pub fn prune(&self) {
        for limiter in self.classes.values() {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }
}

#[derive(Default)]
struct BreakerState {
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold: usize,
    window: Duration,
    cooldown: Duration,
    methods: DashMap<String, BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            threshold: config.failures.max(1) as usize,
            window: Duration::from_secs(config.window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            methods: DashMap::new(),
        }
    }

    /// Whether `method` is currently refused.
    pub fn is_open(&self, method: &str) -> bool {
        let Some(mut state) = self.methods.get_mut(method) else {
            return false;
        };
        match state.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                state.open_until = None;
                state.failures.clear();
                false
            }
            None => false,
        }
    }

    /// Count one INTERNAL failure. Returns true when this failure opened the
    /// breaker.
    pub fn record_failure(&self, method: &str) -> bool {
        let now = Instant::now();
        let mut state = self.methods.entry(method.to_string()).or_default();
        while let Some(first) = state.failures.front() {
            if now.duration_since(*first) > self.window {
                state.failures.pop_front();
            } else {
                break;
            }
        }
        state.failures.push_back(now);
        if state.open_until.is_none() && state.failures.len() >= self.threshold {
            state.open_until = Some(now + self.cooldown);
            warn!(
                "Method {} failed {} times within {:?}; refusing calls for {:?}",
                method,
                state.failures.len(),
                self.window,
                self.cooldown
            );
            return true;
        }
        false
    }

    pub fn record_success(&self, method: &str) {
        if let Some(mut state) = self.methods.get_mut(method) {
            if state.open_until.is_none() {
                state.failures.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_budget_is_per_key() {
        let mut classes = HashMap::new();
        classes.insert(
            "auth".to_string(),
            RateLimitClass {
                calls: 2,
                per_seconds: 60,
            },
        );
        let limits = RateLimits::new(&classes);
        assert!(limits.check("auth", "addr:10.0.0.1"));
        assert!(limits.check("auth", "addr:10.0.0.1"));
        assert!(!limits.check("auth", "addr:10.0.0.1"));
        assert!(limits.check("auth", "addr:10.0.0.2"));
    }

    #[test]
    fn test_unknown_class_is_unlimited() {
        let limits = RateLimits::unlimited();
        for _ in 0..100 {
            assert!(limits.check("anything", "user:root"));
        }
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(&CircuitBreakerConfig {
            failures: 3,
            window_secs: 60,
            cooldown_secs: 60,
        });
        assert!(!breaker.record_failure("pool.query"));
        assert!(!breaker.record_failure("pool.query"));
        assert!(!breaker.is_open("pool.query"));
        assert!(breaker.record_failure("pool.query"));
        assert!(breaker.is_open("pool.query"));
        assert!(!breaker.is_open("user.query"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(&CircuitBreakerConfig {
            failures: 2,
            window_secs: 60,
            cooldown_secs: 60,
        });
        breaker.record_failure("m");
        breaker.record_success("m");
        assert!(!breaker.record_failure("m"));
        assert!(!breaker.is_open("m"));
    }

    #[test]
    fn test_breaker_closes_after_cooldown() {
        let breaker = CircuitBreaker::new(&CircuitBreakerConfig {
            failures: 1,
            window_secs: 60,
            cooldown_secs: 0,
        });
        assert!(breaker.record_failure("m"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!breaker.is_open("m"));
    }
}
