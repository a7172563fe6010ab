// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! Per-call authorization, rate limiting and the circuit breaker.
//!
//! Checks run in this order and stop at the first failure:
//!
//! 1. private method from a transport session → `METHOD_NOT_FOUND`
//! 2. non-public method without a credential → `NOT_AUTHENTICATED`
//! 3. required roles not held → `NOT_AUTHORIZED`
//! 4. method predicates → `NOT_AUTHORIZED`
//!
//! Rate limiting and the breaker are separate so the dispatcher can skip
//! auditing their rejections.

use serde_json::Value;
use tracing::info;

use crate::application::service_registry::MethodEntry;
use crate::domain::config::MiddlewareSpec;
use crate::domain::credential::Credential;
use crate::domain::error::CallError;
use crate::infrastructure::rate_limit::{CircuitBreaker, RateLimits};

/// Where a call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOrigin {
    /// `Middleware::call` from inside the process.
    Internal,
    /// A transport session.
    Session,
}

pub struct Authorizer {
    rate_limits: RateLimits,
    breaker: CircuitBreaker,
}

impl Authorizer {
    pub fn new(spec: &MiddlewareSpec) -> Self {
        Self {
            rate_limits: RateLimits::new(&spec.rate_limits),
            breaker: CircuitBreaker::new(&spec.circuit_breaker),
        }
    }

    pub fn authorize(
        &self,
        method: &MethodEntry,
        origin: CallOrigin,
        credential: Option<&Credential>,
        args: &[Value],
    ) -> Result<(), CallError> {
        if method.private && origin != CallOrigin::Internal {
            return Err(CallError::MethodNotFound(method.name.clone()));
        }

        let descriptor = &method.descriptor;
        let Some(credential) = credential else {
            if descriptor.public {
                return Ok(());
            }
            return Err(CallError::NotAuthenticated);
        };

        if !credential.has_all_roles(&descriptor.roles) {
            info!(
                "{} lacks roles {:?} for {}",
                credential.username, descriptor.roles, method.name
            );
            return Err(CallError::NotAuthorized(format!(
                "{} requires {}",
                method.name,
                descriptor.roles.join(", ")
            )));
        }

        for predicate in &descriptor.predicates {
            if let Err(reason) = predicate.check(credential, args) {
                info!("{} refused for {}: {}", method.name, credential.username, reason);
                return Err(CallError::NotAuthorized(reason));
            }
        }
        Ok(())
    }

    /// Budget check for the method's rate-limit class, keyed by principal or peer.
    pub fn check_rate(&self, method: &MethodEntry, rate_key: &str) -> Result<(), CallError> {
        if self.breaker.is_open(&method.name) {
            return Err(CallError::RateLimited(method.name.clone()));
        }
        let Some(class) = &method.rate_limit else {
            return Ok(());
        };
        if self.rate_limits.check(class, rate_key) {
            Ok(())
        } else {
            Err(CallError::RateLimited(method.name.clone()))
        }
    }

    /// Feed a call outcome to the breaker. Only `INTERNAL` errors count.
    pub fn record_outcome(&self, method: &str, result: &Result<Value, CallError>) {
        match result {
            Err(CallError::Internal { .. }) => {
                self.breaker.record_failure(method);
            }
            _ => self.breaker.record_success(method),
        }
    }

    pub fn prune(&self) {
        self.rate_limits.prune();
    }
}
