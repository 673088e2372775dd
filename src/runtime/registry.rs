//! Name- and version-keyed registries for orchestrations, activities, and entities.
//!
//! All three share one `Registry<H>` shape. Entities are keyed by their lowercase name only.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::activity::{ActivityFailure, FnActivity, TaskActivity, TaskContext, decode_input, encode_output};
use crate::entities::{EntityContext, FnEntity, TaskEntity};
use crate::error::{FailureDetails, OrchestrationError};
use crate::logging::DISPATCHER_TARGET;
use crate::orchestration::OrchestrationContext;
use crate::orchestration::context::decode_output;
use crate::runtime::{FnOrchestration, OrchestrationHandler};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryKey {
    pub name: String,
    pub version: String,
}

impl RegistryKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<RegistryKey, Arc<H>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<RegistryKey, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn TaskActivity>;
pub type EntityRegistry = Registry<dyn TaskEntity>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn TaskActivity>;
pub type EntityRegistryBuilder = RegistryBuilder<dyn TaskEntity>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str, version: &str) -> Option<Arc<H>> {
        let found = self.inner.get(&RegistryKey::new(name, version)).cloned();
        if found.is_none() {
            debug!(
                target: DISPATCHER_TARGET,
                name = %name,
                version = %version,
                registered_count = self.inner.len(),
                "registry lookup miss"
            );
        }
        found
    }

    pub fn contains(&self, name: &str, version: &str) -> bool {
        self.inner.contains_key(&RegistryKey::new(name, version))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<RegistryKey> {
        let mut keys: Vec<RegistryKey> = self.inner.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    /// Adds a handler. Registering the same name and version twice is recorded as an error.
    pub fn add(mut self, name: impl Into<String>, version: impl Into<String>, handler: Arc<H>) -> Self {
        let key = RegistryKey::new(name, version);
        if self.map.contains_key(&key) {
            self.errors
                .push(format!("duplicate registration: {}@{}", key.name, key.version));
        } else {
            self.map.insert(key, handler);
        }
        self
    }

    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Builds the registry, or returns every registration error joined by `; `.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, OrchestrationError>> + Send + 'static,
    {
        self.register_versioned(name, "", f)
    }

    pub fn register_versioned<F, Fut>(self, name: impl Into<String>, version: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, OrchestrationError>> + Send + 'static,
    {
        self.add(name, version, Arc::new(FnOrchestration(f)))
    }

    /// Registers an orchestration with a JSON-decoded input and JSON-encoded output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, OrchestrationError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input: Option<String>| {
            let f = Arc::clone(&f);
            async move {
                let input: In = decode_output(input)?;
                let out = f(ctx, input).await?;
                Ok(Some(serde_json::to_string(&out).map_err(|e| {
                    OrchestrationError::failed("SerializationException", e.to_string())
                })?))
            }
        };
        self.register(name, wrapper)
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, ActivityFailure>> + Send + 'static,
    {
        self.register_versioned(name, "", f)
    }

    pub fn register_versioned<F, Fut>(self, name: impl Into<String>, version: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<String>, ActivityFailure>> + Send + 'static,
    {
        self.add(name, version, Arc::new(FnActivity(f)))
    }

    /// Registers an activity with a JSON-decoded input and JSON-encoded output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(TaskContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, ActivityFailure>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: TaskContext, input: Option<String>| {
            let f = Arc::clone(&f);
            async move {
                let input: In = decode_input(input.as_deref())?;
                let out = f(ctx, input).await?;
                encode_output(&out)
            }
        };
        self.register(name, wrapper)
    }
}

impl EntityRegistryBuilder {
    /// Registers a per-operation entity handler under the lowercase `name`.
    pub fn register<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&mut EntityContext, &str, Option<&str>) -> Result<Option<String>, FailureDetails> + Send + Sync + 'static,
    {
        self.add(name.to_lowercase(), "", Arc::new(FnEntity(f)))
    }

    pub fn register_entity(self, name: &str, entity: Arc<dyn TaskEntity>) -> Self {
        self.add(name.to_lowercase(), "", entity)
    }
}

impl EntityRegistry {
    pub fn get_entity(&self, name: &str) -> Option<Arc<dyn TaskEntity>> {
        self.get(&name.to_lowercase(), "")
    }
}
