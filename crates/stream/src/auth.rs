// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection authentication.
//!
//! Validation is delegated to an injected [`TokenValidator`]; the session
//! state machine only cares about pass/fail.

use std::collections::HashSet;
use std::sync::Arc;

/// Validates opaque bearer tokens or API keys.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Accepts anything (auth disabled or trusted network).
#[derive(Clone, Default)]
pub struct AllowAll;

impl TokenValidator for AllowAll {
    fn validate(&self, _token: &str) -> bool {
        true
    }
}

/// Fixed API key set.
#[derive(Clone)]
pub struct ApiKeyValidator {
    keys: HashSet<String>,
}

impl ApiKeyValidator {
    pub fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }
}

impl TokenValidator for ApiKeyValidator {
    fn validate(&self, token: &str) -> bool {
        self.keys.contains(token)
    }
}

/// Auth gate for one listener.
#[derive(Clone)]
pub struct Authenticator {
    enabled: bool,
    validator: Arc<dyn TokenValidator>,
}

impl Authenticator {
    pub fn new(enabled: bool, validator: Arc<dyn TokenValidator>) -> Self {
        Self { enabled, validator }
    }

    /// Auth disabled: every connection starts authenticated.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            validator: Arc::new(AllowAll),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn check(&self, token: &str) -> bool {
        !self.enabled || self.validator.validate(token)
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
