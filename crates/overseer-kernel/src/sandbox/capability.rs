//! Capability map
//!
//! The explicit, caller-supplied set of named operations an action may
//! invoke. The interpreter has no other route to the outside world.

use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Failure reported by a capability
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    /// Arguments had the wrong shape
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The operation ran and failed
    #[error("{0}")]
    Failed(String),

    /// The operation targeted the protected resource
    #[error("resource {0} is protected and cannot be modified")]
    ProtectedResource(String),

    /// A dependency of the operation is not available
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// One named operation
#[async_trait::async_trait]
pub trait Capability: Send + Sync {
    /// Invoke with positional JSON arguments
    async fn call(&self, args: Vec<Json>) -> Result<Json, CapabilityError>;
}

/// Closure-backed capability
struct FnCapability<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait::async_trait]
impl<F, Fut> Capability for FnCapability<F, Fut>
where
    F: Fn(Vec<Json>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Json, CapabilityError>> + Send,
{
    async fn call(&self, args: Vec<Json>) -> Result<Json, CapabilityError> {
        (self.f)(args).await
    }
}

/// Ordered map from operation name to capability
#[derive(Clone, Default)]
pub struct CapabilityMap {
    entries: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityMap {
    /// Create an empty map
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability, replacing any previous one with that name
    pub fn insert(&mut self, name: impl Into<String>, capability: Arc<dyn Capability>) {
        self.entries.insert(name.into(), capability);
    }

    /// Register a closure-backed capability
    pub fn insert_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Json>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Json, CapabilityError>> + Send + 'static,
    {
        self.insert(
            name,
            Arc::new(FnCapability {
                f,
                _fut: PhantomData,
            }),
        );
    }

    /// Builder form of [`CapabilityMap::insert_fn`]
    #[must_use]
    pub fn with_fn<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Json>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Json, CapabilityError>> + Send + 'static,
    {
        self.insert_fn(name, f);
        self
    }

    /// Look up a capability
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.entries.get(name)
    }

    /// Check if a capability is present
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of capabilities
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CapabilityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Positional argument helpers for capability implementations
pub mod args {
    use super::{CapabilityError, Json};

    fn get<'a>(args: &'a [Json], idx: usize, name: &str) -> Result<&'a Json, CapabilityError> {
        args.get(idx)
            .ok_or_else(|| CapabilityError::InvalidArguments(format!("missing argument '{name}'")))
    }

    /// Required string argument
    ///
    /// # Errors
    /// Missing or non-string argument.
    pub fn string(args: &[Json], idx: usize, name: &str) -> Result<String, CapabilityError> {
        get(args, idx, name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CapabilityError::InvalidArguments(format!("'{name}' must be a string")))
    }

    /// Required identifier argument; accepts an integer or a numeric string
    ///
    /// # Errors
    /// Missing argument or one that is not an id.
    pub fn id(args: &[Json], idx: usize, name: &str) -> Result<String, CapabilityError> {
        match get(args, idx, name)? {
            Json::Number(n) if n.is_u64() || n.is_i64() => Ok(n.to_string()),
            Json::String(s) if !s.trim().is_empty() => Ok(s.clone()),
            _ => Err(CapabilityError::InvalidArguments(format!("'{name}' must be an id"))),
        }
    }

    /// Optional unsigned integer argument
    ///
    /// # Errors
    /// Present but not a non-negative integer.
    pub fn u64_or(args: &[Json], idx: usize, name: &str, default: u64) -> Result<u64, CapabilityError> {
        match args.get(idx) {
            None | Some(Json::Null) => Ok(default),
            Some(v) => v
                .as_u64()
                .ok_or_else(|| CapabilityError::InvalidArguments(format!("'{name}' must be a non-negative integer"))),
        }
    }

    /// Optional boolean argument
    ///
    /// # Errors
    /// Present but not a boolean.
    pub fn bool_or(args: &[Json], idx: usize, name: &str, default: bool) -> Result<bool, CapabilityError> {
        match args.get(idx) {
            None | Some(Json::Null) => Ok(default),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| CapabilityError::InvalidArguments(format!("'{name}' must be a boolean"))),
        }
    }
}
