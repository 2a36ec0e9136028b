//! Request descriptors.
//!
//! A [`RequestDescriptor`] carries everything the coordinator needs to run
//! one unit of work: where it goes, how urgent it is, which collapsing and
//! caching options apply, and the opaque backend call itself.

use crate::error::CoordResult;
use crate::id::RequestId;
use crate::priority::{Priority, PriorityContext, PriorityTable};
use crate::time::Timestamp;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Future returned by a backend call
pub type WorkFuture<T> = BoxFuture<'static, CoordResult<T>>;

/// Opaque backend call, invocable once per attempt
pub type Work<T> = Arc<dyn Fn() -> WorkFuture<T> + Send + Sync>;

/// Cache read-through / write-through options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Logical domain of the key
    pub namespace: String,
    /// Key within the namespace
    pub key: String,
    /// Entry TTL (config default when `None`)
    pub ttl: Option<Duration>,
    /// Serve a fresh cached value without calling the backend
    pub read_through: bool,
}

impl CachePolicy {
    /// Write-through only
    #[must_use]
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            ttl: None,
            read_through: false,
        }
    }

    /// Set the entry TTL
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Also answer from the cache when a fresh value exists
    #[must_use]
    pub fn read_through(mut self) -> Self {
        self.read_through = true;
        self
    }
}

/// Batch membership
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSpec {
    /// Requests only share a batch when their filters match
    pub filter_signature: String,
    /// This member's parameters, handed to the batch handler
    pub params: serde_json::Value,
}

impl BatchSpec {
    /// Create a batch spec
    #[must_use]
    pub fn new(filter_signature: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            filter_signature: filter_signature.into(),
            params,
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOptions {
    /// Coalesce with concurrent calls under this key
    pub dedup_key: Option<String>,
    /// Cache behavior
    pub cache: Option<CachePolicy>,
    /// Batch membership
    pub batch: Option<BatchSpec>,
    /// Sleep through throttling instead of failing fast
    pub auto_wait: bool,
    /// Accept a stale cached value when the call fails
    pub allow_stale: bool,
    /// Deadline for this caller only
    pub timeout: Option<Duration>,
}

/// One unit of work submitted to the coordinator
///
/// Immutable once handed to `execute`; the coordinator only stamps the
/// issue time.
pub struct RequestDescriptor<T> {
    id: RequestId,
    resource_key: String,
    operation: String,
    resource_class: String,
    context: PriorityContext,
    priority: Option<Priority>,
    issued_at: Option<Timestamp>,
    options: ExecuteOptions,
    work: Work<T>,
}

impl<T: Send + 'static> RequestDescriptor<T> {
    /// Create a descriptor for `operation` on `resource_key`
    ///
    /// The resource class used for priority lookup defaults to the resource
    /// key.
    pub fn new<F, Fut>(resource_key: impl Into<String>, operation: impl Into<String>, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoordResult<T>> + Send + 'static,
    {
        let resource_key = resource_key.into();
        Self {
            id: RequestId::new(),
            resource_class: resource_key.clone(),
            resource_key,
            operation: operation.into(),
            context: PriorityContext::default(),
            priority: None,
            issued_at: None,
            options: ExecuteOptions::default(),
            work: Arc::new(move || -> WorkFuture<T> { Box::pin(work()) }),
        }
    }
}

impl<T> RequestDescriptor<T> {
    /// Use a fixed request id
    #[must_use]
    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    /// Resource class used for the priority table
    #[must_use]
    pub fn with_resource_class(mut self, class: impl Into<String>) -> Self {
        self.resource_class = class.into();
        self
    }

    /// Caller context for priority modifiers
    #[must_use]
    pub fn with_context(mut self, context: PriorityContext) -> Self {
        self.context = context;
        self
    }

    /// Override the computed priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Coalesce with concurrent calls under `key`
    #[must_use]
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.options.dedup_key = Some(key.into());
        self
    }

    /// Attach a cache policy
    #[must_use]
    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.options.cache = Some(policy);
        self
    }

    /// Join a batch
    #[must_use]
    pub fn with_batch(mut self, spec: BatchSpec) -> Self {
        self.options.batch = Some(spec);
        self
    }

    /// Wait out throttling instead of failing fast
    #[must_use]
    pub fn with_auto_wait(mut self) -> Self {
        self.options.auto_wait = true;
        self
    }

    /// Accept a stale cached value on failure
    #[must_use]
    pub fn with_stale_fallback(mut self) -> Self {
        self.options.allow_stale = true;
        self
    }

    /// Fail this caller with `Timeout` after `timeout`
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Replace all options at once
    #[must_use]
    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    /// Record when the descriptor entered the coordinator
    #[must_use]
    pub fn stamped(mut self, at: Timestamp) -> Self {
        self.issued_at.get_or_insert(at);
        self
    }

    /// Request id
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Resource key (breaker and throttle scope)
    #[must_use]
    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    /// Operation kind
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Resource class for priority lookup
    #[must_use]
    pub fn resource_class(&self) -> &str {
        &self.resource_class
    }

    /// Caller context
    #[must_use]
    pub fn context(&self) -> &PriorityContext {
        &self.context
    }

    /// Whether the caller marked the request as authentication-gated
    #[must_use]
    pub fn auth_required(&self) -> bool {
        self.context.auth_required
    }

    /// Explicit priority override, if any
    #[must_use]
    pub fn priority_override(&self) -> Option<Priority> {
        self.priority
    }

    /// Effective priority against `table`
    #[must_use]
    pub fn priority(&self, table: &PriorityTable) -> Priority {
        self.priority
            .unwrap_or_else(|| table.calculate(&self.resource_class, &self.context))
    }

    /// When the coordinator accepted the descriptor
    #[must_use]
    pub fn issued_at(&self) -> Option<Timestamp> {
        self.issued_at
    }

    /// Call options
    #[must_use]
    pub fn options(&self) -> &ExecuteOptions {
        &self.options
    }

    /// Shared handle to the backend call
    #[must_use]
    pub fn work(&self) -> Work<T> {
        Arc::clone(&self.work)
    }

    /// Start one backend attempt
    pub fn invoke(&self) -> WorkFuture<T> {
        (self.work)()
    }
}

impl<T> Clone for RequestDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            resource_key: self.resource_key.clone(),
            operation: self.operation.clone(),
            resource_class: self.resource_class.clone(),
            context: self.context,
            priority: self.priority,
            issued_at: self.issued_at,
            options: self.options.clone(),
            work: Arc::clone(&self.work),
        }
    }
}

impl<T> std::fmt::Debug for RequestDescriptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("id", &self.id)
            .field("resource_key", &self.resource_key)
            .field("operation", &self.operation)
            .field("resource_class", &self.resource_class)
            .field("context", &self.context)
            .field("priority", &self.priority)
            .field("issued_at", &self.issued_at)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
