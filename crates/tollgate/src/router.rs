//! Header-driven route selection with weighted backend choice.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use common::configuration::{Backend, RouteRule};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouterError {
    #[error("no matching rule found")]
    NoMatchingRule,
}

/// Rule matcher shared by every stream holding the owning snapshot.
///
/// The RNG backs weighted backend selection only; it is non-cryptographic,
/// seeded from the wall clock at construction, and guarded by a mutex so
/// concurrent streams can draw from it.
pub struct Router {
    rules: Vec<RouteRule>,
    rng: Mutex<StdRng>,
}

impl Router {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self {
            rules,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Select a backend for the request headers.
    ///
    /// Rules are evaluated in declared order; within a rule the header
    /// predicates are OR-combined with exact value matching. The first
    /// matching rule wins.
    pub fn calculate(&self, headers: &HashMap<String, String>) -> Result<&Backend, RouterError> {
        let rule = self
            .rules
            .iter()
            .find(|rule| {
                rule.headers.iter().any(|predicate| {
                    headers
                        .get(&predicate.name.to_ascii_lowercase())
                        .map(|value| *value == predicate.value)
                        .unwrap_or(false)
                })
            })
            .ok_or(RouterError::NoMatchingRule)?;
        Ok(self.select_backend(rule))
    }

    fn select_backend<'a>(&self, rule: &'a RouteRule) -> &'a Backend {
        let total_weight: u64 = rule.backends.iter().map(|b| u64::from(b.weight)).sum();
        if total_weight == 0 {
            return &rule.backends[0];
        }
        let mut drawn = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(0..total_weight)
        };
        for backend in &rule.backends {
            let weight = u64::from(backend.weight);
            if drawn < weight {
                return backend;
            }
            drawn -= weight;
        }
        &rule.backends[0]
    }
}
