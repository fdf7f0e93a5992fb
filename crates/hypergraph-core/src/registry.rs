//! Strategy registries
//!
//! Each pluggable capability (completion providers, cache backends, rate
//! limiters, retry backoff) is selected by a discriminator string from the
//! configuration. A [`Registry`] maps those names to constructors. Registries
//! are plain values owned by whoever builds the run and passed down; nothing
//! here is global.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Name → constructor map for one capability
pub struct Registry<F: ?Sized> {
    capability: &'static str,
    entries: BTreeMap<String, Arc<F>>,
}

impl<F: ?Sized> Registry<F> {
    /// Create an empty registry for the named capability
    pub fn new(capability: &'static str) -> Self {
        Self {
            capability,
            entries: BTreeMap::new(),
        }
    }

    /// Register (or replace) a constructor under `name`
    pub fn register(&mut self, name: impl Into<String>, constructor: Arc<F>) -> &mut Self {
        self.entries.insert(name.into(), constructor);
        self
    }

    /// Look up a constructor, failing with `UnknownStrategy` on a miss
    pub fn get(&self, name: &str) -> Result<Arc<F>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStrategy {
                capability: self.capability,
                name: name.to_string(),
                registered: self.names().join(", "),
            })
    }

    /// Whether a strategy is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered strategy names, sorted
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Capability this registry serves
    pub fn capability(&self) -> &'static str {
        self.capability
    }
}

impl<F: ?Sized> Clone for Registry<F> {
    fn clone(&self) -> Self {
        Self {
            capability: self.capability,
            entries: self.entries.clone(),
        }
    }
}

impl<F: ?Sized> std::fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("capability", &self.capability)
            .field("entries", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Ctor = dyn Fn(u32) -> u32 + Send + Sync;

    #[test]
    fn test_register_and_get() {
        let mut registry: Registry<Ctor> = Registry::new("doubler");
        registry.register("double", Arc::new(|x| x * 2));

        let ctor = registry.get("double").unwrap();
        assert_eq!(ctor(21), 42);
        assert!(registry.contains("double"));
        assert_eq!(registry.capability(), "doubler");
    }

    #[test]
    fn test_unknown_strategy_lists_registered_names() {
        let mut registry: Registry<Ctor> = Registry::new("doubler");
        registry.register("b", Arc::new(|x| x));
        registry.register("a", Arc::new(|x| x));

        let err = registry.get("missing").err().unwrap();
        match err {
            Error::UnknownStrategy {
                capability,
                name,
                registered,
            } => {
                assert_eq!(capability, "doubler");
                assert_eq!(name, "missing");
                assert_eq!(registered, "a, b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
