//! Action registry
//!
//! Registration happens once through [`ActionRegistryBuilder`]; the built
//! registry is immutable and shared between jobs without locking.

use super::Action;
use crate::error::{Result, StrataError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Produces the action instance used for a step
pub trait ActionFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Action>;
}

impl<F> ActionFactory for F
where
    F: Fn() -> Arc<dyn Action> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Action> {
        self()
    }
}

/// Factory handing out one shared instance
struct SharedAction(Arc<dyn Action>);

impl ActionFactory for SharedAction {
    fn create(&self) -> Arc<dyn Action> {
        Arc::clone(&self.0)
    }
}

/// Builder that collects action factories before the registry is frozen
#[derive(Default)]
pub struct ActionRegistryBuilder {
    factories: BTreeMap<String, Arc<dyn ActionFactory>>,
}

impl ActionRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `key`
    pub fn register(
        &mut self,
        key: impl Into<String>,
        factory: impl ActionFactory + 'static,
    ) -> Result<&mut Self> {
        let key = key.into();
        if self.factories.contains_key(&key) {
            return Err(StrataError::DuplicateAction { action_type: key });
        }
        debug!("Registered action type '{}'", key);
        self.factories.insert(key, Arc::new(factory));
        Ok(self)
    }

    /// Registers a single shared instance under `key`
    pub fn register_action<A>(&mut self, key: impl Into<String>, action: A) -> Result<&mut Self>
    where
        A: Action + 'static,
    {
        self.register(key, SharedAction(Arc::new(action)))
    }

    /// Registers the generic built-in actions
    pub fn with_builtins(&mut self) -> Result<&mut Self> {
        super::builtin::register_builtins(self)?;
        Ok(self)
    }

    pub fn build(self) -> ActionRegistry {
        ActionRegistry {
            factories: Arc::new(self.factories),
        }
    }
}

/// Immutable map from action type to factory
#[derive(Clone, Default)]
pub struct ActionRegistry {
    factories: Arc<BTreeMap<String, Arc<dyn ActionFactory>>>,
}

impl ActionRegistry {
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder::new()
    }

    /// A registry holding only the built-in actions
    pub fn with_builtins() -> Result<Self> {
        let mut builder = ActionRegistryBuilder::new();
        builder.with_builtins()?;
        Ok(builder.build())
    }

    /// Resolve `key` to a fresh action instance
    pub fn resolve(&self, key: &str) -> Result<Arc<dyn Action>> {
        self.factories
            .get(key)
            .map(|factory| factory.create())
            .ok_or_else(|| StrataError::ActionNotFound {
                action_type: key.to_string(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered action types in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
