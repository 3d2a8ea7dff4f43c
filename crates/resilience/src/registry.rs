//! Named policy definitions and their lazily created instances.
//!
//! A definition is registered once under a name. The first [`resolve`]
//! builds the instance; every later call, including concurrent first calls,
//! observes that same instance. Breakers and bulkheads carry state, so all
//! call sites resolving a name share one state machine and one set of slots.
//!
//! [`resolve`]: PolicyRegistry::resolve

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chain::{Policy, PolicyChain};
use crate::core::{ConfigError, ConfigResult, PolicyKind, ResilienceConfig};
use crate::patterns::{
    Bulkhead, BulkheadConfig, BulkheadStats, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    FallbackPolicy, RetryConfig, RetryPolicy, TimeoutConfig, TimeoutPolicy,
};

/// Serializable definition of one named policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// Retry with backoff
    Retry(RetryConfig),
    /// Circuit breaker
    CircuitBreaker(CircuitBreakerConfig),
    /// Bulkhead
    Bulkhead(BulkheadConfig),
    /// Per-attempt timeout
    Timeout(TimeoutConfig),
}

impl PolicyConfig {
    /// Kind of policy this defines.
    #[must_use]
    pub const fn kind(&self) -> PolicyKind {
        match self {
            Self::Retry(_) => PolicyKind::Retry,
            Self::CircuitBreaker(_) => PolicyKind::CircuitBreaker,
            Self::Bulkhead(_) => PolicyKind::Bulkhead,
            Self::Timeout(_) => PolicyKind::Timeout,
        }
    }

    /// Validate the wrapped configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        match self {
            Self::Retry(config) => config.validate(),
            Self::CircuitBreaker(config) => config.validate(),
            Self::Bulkhead(config) => config.validate(),
            Self::Timeout(config) => config.validate(),
        }
    }

    /// Construct a fresh instance named `name`.
    pub fn build(&self, name: &str) -> ConfigResult<PolicyInstance> {
        Ok(match self {
            Self::Retry(config) => PolicyInstance::Retry(RetryPolicy::new(config.clone())?),
            Self::CircuitBreaker(config) => {
                PolicyInstance::CircuitBreaker(CircuitBreaker::new(name, config.clone())?)
            }
            Self::Bulkhead(config) => PolicyInstance::Bulkhead(Bulkhead::new(name, *config)?),
            Self::Timeout(config) => PolicyInstance::Timeout(TimeoutPolicy::from_config(*config)),
        })
    }
}

impl From<RetryConfig> for PolicyConfig {
    fn from(config: RetryConfig) -> Self {
        Self::Retry(config)
    }
}

impl From<CircuitBreakerConfig> for PolicyConfig {
    fn from(config: CircuitBreakerConfig) -> Self {
        Self::CircuitBreaker(config)
    }
}

impl From<BulkheadConfig> for PolicyConfig {
    fn from(config: BulkheadConfig) -> Self {
        Self::Bulkhead(config)
    }
}

impl From<TimeoutConfig> for PolicyConfig {
    fn from(config: TimeoutConfig) -> Self {
        Self::Timeout(config)
    }
}

/// A resolved policy. Clones share the underlying state.
#[derive(Debug, Clone)]
pub enum PolicyInstance {
    /// Retry policy
    Retry(RetryPolicy),
    /// Circuit breaker
    CircuitBreaker(CircuitBreaker),
    /// Bulkhead
    Bulkhead(Bulkhead),
    /// Timeout policy
    Timeout(TimeoutPolicy),
}

impl PolicyInstance {
    /// Kind of this instance.
    #[must_use]
    pub const fn kind(&self) -> PolicyKind {
        match self {
            Self::Retry(_) => PolicyKind::Retry,
            Self::CircuitBreaker(_) => PolicyKind::CircuitBreaker,
            Self::Bulkhead(_) => PolicyKind::Bulkhead,
            Self::Timeout(_) => PolicyKind::Timeout,
        }
    }

    /// Turn into a chain layer.
    #[must_use]
    pub fn into_policy<T>(self) -> Policy<T> {
        match self {
            Self::Retry(retry) => Policy::Retry(retry),
            Self::CircuitBreaker(breaker) => Policy::CircuitBreaker(breaker),
            Self::Bulkhead(bulkhead) => Policy::Bulkhead(bulkhead),
            Self::Timeout(timeout) => Policy::Timeout(timeout),
        }
    }
}

impl<T> From<PolicyInstance> for Policy<T> {
    fn from(instance: PolicyInstance) -> Self {
        instance.into_policy()
    }
}

/// Registry of named policies.
///
/// Held explicitly by the call sites that need it (typically behind an
/// `Arc`); there is no process-wide instance.
#[derive(Default)]
pub struct PolicyRegistry {
    definitions: DashMap<String, PolicyConfig>,
    instances: DashMap<String, PolicyInstance>,
    fallbacks: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("definitions", &self.names())
            .field("resolved", &self.instances.len())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

impl PolicyRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validated definition under `name`.
    pub fn define(&self, name: impl Into<String>, config: impl Into<PolicyConfig>) -> ConfigResult<()> {
        let name = name.into();
        let config = config.into();
        config.validate()?;

        match self.definitions.entry(name) {
            Entry::Occupied(entry) => Err(ConfigError::AlreadyDefined {
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                debug!(policy = %entry.key(), kind = %config.kind(), "policy defined");
                entry.insert(config);
                Ok(())
            }
        }
    }

    /// Register every definition in a JSON object of `name -> config`.
    ///
    /// All definitions are decoded and validated before any is registered.
    /// Returns the number of definitions added.
    pub fn load_json(&self, value: &serde_json::Value) -> ConfigResult<usize> {
        let configs: BTreeMap<String, PolicyConfig> = serde_json::from_value(value.clone())?;
        for (name, config) in &configs {
            config
                .validate()
                .map_err(|e| ConfigError::validation(format!("policy '{name}': {e}")))?;
            if self.definitions.contains_key(name) {
                return Err(ConfigError::AlreadyDefined { name: name.clone() });
            }
        }

        let count = configs.len();
        for (name, config) in configs {
            self.define(name, config)?;
        }
        info!(count, "loaded policy definitions");
        Ok(count)
    }

    /// The instance for `name`, building it on first use.
    pub fn resolve(&self, name: &str) -> ConfigResult<PolicyInstance> {
        if let Some(instance) = self.instances.get(name) {
            return Ok(instance.value().clone());
        }

        // Held until the instance is stored, so `remove` cannot interleave.
        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| ConfigError::not_found("policy", name))?;

        // The shard lock makes construction exactly-once under a race.
        let instance = self
            .instances
            .entry(name.to_owned())
            .or_try_insert_with(|| {
                let config = definition.value();
                debug!(policy = name, kind = %config.kind(), "creating policy instance");
                config.build(name)
            })?;
        Ok(instance.value().clone())
    }

    /// Resolve a circuit breaker.
    pub fn circuit_breaker(&self, name: &str) -> ConfigResult<CircuitBreaker> {
        match self.resolve(name)? {
            PolicyInstance::CircuitBreaker(breaker) => Ok(breaker),
            other => Err(kind_mismatch(name, PolicyKind::CircuitBreaker, other.kind())),
        }
    }

    /// Resolve a bulkhead.
    pub fn bulkhead(&self, name: &str) -> ConfigResult<Bulkhead> {
        match self.resolve(name)? {
            PolicyInstance::Bulkhead(bulkhead) => Ok(bulkhead),
            other => Err(kind_mismatch(name, PolicyKind::Bulkhead, other.kind())),
        }
    }

    /// Resolve a retry policy.
    pub fn retry(&self, name: &str) -> ConfigResult<RetryPolicy> {
        match self.resolve(name)? {
            PolicyInstance::Retry(retry) => Ok(retry),
            other => Err(kind_mismatch(name, PolicyKind::Retry, other.kind())),
        }
    }

    /// Resolve a timeout policy.
    pub fn timeout(&self, name: &str) -> ConfigResult<TimeoutPolicy> {
        match self.resolve(name)? {
            PolicyInstance::Timeout(timeout) => Ok(timeout),
            other => Err(kind_mismatch(name, PolicyKind::Timeout, other.kind())),
        }
    }

    /// Register a fallback producing `T` under `name`.
    pub fn register_fallback<T: Send + 'static>(
        &self,
        name: impl Into<String>,
        fallback: FallbackPolicy<T>,
    ) -> ConfigResult<()> {
        match self.fallbacks.entry(name.into()) {
            Entry::Occupied(entry) => Err(ConfigError::AlreadyDefined {
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(fallback));
                Ok(())
            }
        }
    }

    /// The fallback registered under `name`; it must produce `T`.
    pub fn fallback<T: Send + 'static>(&self, name: &str) -> ConfigResult<FallbackPolicy<T>> {
        let entry = self
            .fallbacks
            .get(name)
            .ok_or_else(|| ConfigError::not_found("fallback", name))?;
        entry
            .value()
            .downcast_ref::<FallbackPolicy<T>>()
            .cloned()
            .ok_or_else(|| ConfigError::KindMismatch {
                name: name.to_owned(),
                expected: format!("fallback producing {}", type_name::<T>()),
                actual: "fallback producing another type".to_owned(),
            })
    }

    /// Build a chain from named policies and fallbacks.
    ///
    /// Each name is looked up among policy definitions first, then among
    /// fallbacks.
    pub fn chain<T: Send + 'static>(&self, names: &[&str]) -> ConfigResult<PolicyChain<T>> {
        names.iter().try_fold(PolicyChain::default(), |chain, name| {
            let layer = if self.definitions.contains_key(*name) {
                self.resolve(name)?.into_policy()
            } else {
                Policy::Fallback(self.fallback::<T>(name)?)
            };
            Ok(chain.with(layer))
        })
    }

    /// Drop a definition and its instance. Holders of the instance keep it.
    pub fn remove(&self, name: &str) -> Option<PolicyConfig> {
        // Definition first: it waits out any `resolve` still building.
        let removed = self.definitions.remove(name).map(|(_, config)| config);
        self.instances.remove(name);
        self.fallbacks.remove(name);
        if removed.is_some() {
            debug!(policy = name, "policy removed");
        }
        removed
    }

    /// Defined policy names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Whether a policy is defined under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// State of every resolved circuit breaker.
    #[must_use]
    pub fn breaker_states(&self) -> BTreeMap<String, CircuitState> {
        self.instances
            .iter()
            .filter_map(|entry| match entry.value() {
                PolicyInstance::CircuitBreaker(breaker) => {
                    Some((entry.key().clone(), breaker.state()))
                }
                _ => None,
            })
            .collect()
    }

    /// Occupancy of every resolved bulkhead.
    #[must_use]
    pub fn bulkhead_stats(&self) -> BTreeMap<String, BulkheadStats> {
        self.instances
            .iter()
            .filter_map(|entry| match entry.value() {
                PolicyInstance::Bulkhead(bulkhead) => Some((entry.key().clone(), bulkhead.stats())),
                _ => None,
            })
            .collect()
    }
}

fn kind_mismatch(name: &str, expected: PolicyKind, actual: PolicyKind) -> ConfigError {
    ConfigError::KindMismatch {
        name: name.to_owned(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn resolve_returns_the_same_instance() {
        let registry = PolicyRegistry::new();
        registry
            .define("payments", CircuitBreakerConfig::default())
            .unwrap();

        let first = registry.circuit_breaker("payments").unwrap();
        let second = registry.circuit_breaker("payments").unwrap();
        first.force_open();

        assert!(second.is_open());
        assert_eq!(
            registry.breaker_states().get("payments"),
            Some(&CircuitState::Open)
        );
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = PolicyRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(ConfigError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_definition_is_rejected() {
        let registry = PolicyRegistry::new();
        registry.define("t", TimeoutConfig::default()).unwrap();
        let err = registry.define("t", TimeoutConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::AlreadyDefined { name } if name == "t"));
    }

    #[test]
    fn invalid_definition_is_rejected() {
        let registry = PolicyRegistry::new();
        let err = registry
            .define("b", BulkheadConfig::unqueued(0))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        assert!(!registry.contains("b"));
    }

    #[test]
    fn wrong_kind_is_reported() {
        let registry = PolicyRegistry::new();
        registry.define("db", BulkheadConfig::default()).unwrap();
        let err = registry.circuit_breaker("db").unwrap_err();
        assert_eq!(
            err.to_string(),
            "policy 'db' is a bulkhead, not a circuit_breaker"
        );
    }

    #[test]
    fn loads_definitions_from_json() {
        let registry = PolicyRegistry::new();
        let loaded = registry
            .load_json(&json!({
                "api-retry": { "kind": "retry", "max_retries": 5, "base_delay": "50ms" },
                "api-timeout": { "kind": "timeout", "duration": "2s" },
                "api-breaker": { "kind": "circuit_breaker", "failure_ratio": 0.5 },
                "api-bulkhead": { "kind": "bulkhead", "max_concurrent": 4, "queue_length": 0 },
            }))
            .unwrap();

        assert_eq!(loaded, 4);
        assert_eq!(registry.retry("api-retry").unwrap().config().max_retries, 5);
        assert_eq!(
            registry.timeout("api-timeout").unwrap().duration(),
            Duration::from_secs(2)
        );
        assert_eq!(registry.bulkhead("api-bulkhead").unwrap().stats().max_concurrent, 4);
    }

    #[test]
    fn invalid_json_batch_registers_nothing() {
        let registry = PolicyRegistry::new();
        let result = registry.load_json(&json!({
            "ok": { "kind": "timeout", "duration": "1s" },
            "bad": { "kind": "retry", "multiplier": 0.5 },
        }));

        assert!(result.is_err());
        assert!(registry.names().is_empty());
    }

    #[test]
    fn unknown_kind_fails_to_parse() {
        let registry = PolicyRegistry::new();
        let err = registry
            .load_json(&json!({ "x": { "kind": "hedge" } }))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn fallbacks_are_typed() {
        let registry = PolicyRegistry::new();
        registry
            .register_fallback("default-price", FallbackPolicy::value(0_u64))
            .unwrap();

        assert!(registry.fallback::<u64>("default-price").is_ok());
        assert!(matches!(
            registry.fallback::<String>("default-price"),
            Err(ConfigError::KindMismatch { .. })
        ));
    }

    #[test]
    fn remove_forgets_the_instance() {
        let registry = PolicyRegistry::new();
        registry.define("cb", CircuitBreakerConfig::default()).unwrap();
        let old = registry.circuit_breaker("cb").unwrap();
        old.force_open();

        assert!(registry.remove("cb").is_some());
        assert!(registry.resolve("cb").is_err());

        registry.define("cb", CircuitBreakerConfig::default()).unwrap();
        assert!(registry.circuit_breaker("cb").unwrap().is_closed());
        assert!(old.is_open());
    }

    #[test]
    fn chain_from_names() {
        let registry = PolicyRegistry::new();
        registry.define("t", TimeoutConfig::default()).unwrap();
        registry.define("r", RetryConfig::default()).unwrap();
        registry
            .register_fallback("fb", FallbackPolicy::value(()))
            .unwrap();

        let chain = registry.chain::<()>(&["t", "fb", "r"]).unwrap();
        assert_eq!(
            chain.layers().collect::<Vec<_>>(),
            vec![PolicyKind::Fallback, PolicyKind::Retry, PolicyKind::Timeout]
        );
        assert!(registry.chain::<()>(&["nope"]).is_err());
    }
}
