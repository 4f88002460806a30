//! The object model chains are replayed against.
//!
//! A [`Target`] exposes named members.  [`Instance`] is the usual
//! implementation: it pairs some state `T` with a [`MethodTable<T>`] (the
//! explicit allow-list of what a remote chain may call) and a [`Services`]
//! registry reachable through the reserved `svc` accessor.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use mc_domain::MeshError;
use serde_json::Value;

/// Reserved accessor for trusted infrastructure services.
pub const SERVICE_ACCESSOR: &str = "svc";

pub type MethodFuture = BoxFuture<'static, Result<Value, MeshError>>;

/// Guard run before a callable method's body; an `Err` rejects the call.
pub type Guard<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

type Handler<T> = Arc<dyn Fn(Arc<T>, Vec<Value>) -> MethodFuture + Send + Sync>;
type Property<T> = Arc<dyn Fn(&T) -> Value + Send + Sync>;

/// Anything a chain can be executed against.
pub trait Target: Send + Sync + 'static {
    /// Look up a member by name.  `None` means there is no such member.
    fn member(&self, key: &str) -> Option<Member>;
}

/// Result of reading a member off a [`Target`].
pub enum Member {
    /// Plain data.
    Value(Value),
    /// A nested object (e.g. a service).
    Object(Arc<dyn Target>),
    /// A method bound to its receiver, ready to invoke.
    Method(BoundMethod),
}

/// A method bound to its receiver.
pub struct BoundMethod {
    name: String,
    callable: bool,
    guard: Option<Box<dyn Fn() -> Result<(), MeshError> + Send + Sync>>,
    invoke: Box<dyn FnOnce(Vec<Value>) -> MethodFuture + Send>,
}

impl BoundMethod {
    /// A bound method with no callable marker.
    pub fn new<F>(name: impl Into<String>, invoke: F) -> Self
    where
        F: FnOnce(Vec<Value>) -> MethodFuture + Send + 'static,
    {
        Self {
            name: name.into(),
            callable: false,
            guard: None,
            invoke: Box::new(invoke),
        }
    }

    pub fn callable(mut self, callable: bool) -> Self {
        self.callable = callable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_callable(&self) -> bool {
        self.callable
    }

    /// Run the guard, if any.
    pub fn check_guard(&self) -> Result<(), MeshError> {
        match &self.guard {
            Some(guard) => guard(),
            None => Ok(()),
        }
    }

    pub fn invoke(self, args: Vec<Value>) -> MethodFuture {
        (self.invoke)(args)
    }
}

impl std::fmt::Debug for BoundMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundMethod")
            .field("name", &self.name)
            .field("callable", &self.callable)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MethodTable
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Access<T> {
    Callable(Option<Guard<T>>),
    Internal,
}

struct MethodEntry<T> {
    handler: Handler<T>,
    access: Access<T>,
}

/// Methods and properties of `T`, with an explicit callable allow-list.
///
/// ```rust
/// use mc_chain::MethodTable;
/// use serde_json::{json, Value};
///
/// struct Counter;
///
/// let mut table = MethodTable::<Counter>::new();
/// table
///     .callable("double", |_c, args: Vec<Value>| async move {
///         Ok(json!(args[0].as_i64().unwrap_or(0) * 2))
///     })
///     .internal("reset", |_c, _args| async move { Ok(Value::Null) });
/// assert!(table.is_callable("double"));
/// assert!(!table.is_callable("reset"));
/// ```
pub struct MethodTable<T> {
    methods: HashMap<String, MethodEntry<T>>,
    properties: HashMap<String, Property<T>>,
}

impl<T> Default for MethodTable<T> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
            properties: HashMap::new(),
        }
    }
}

impl<T: Send + Sync + 'static> MethodTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method that externally-originated chains may call.
    pub fn callable<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Arc<T>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MeshError>> + Send + 'static,
    {
        self.insert(name.into(), boxed(f), Access::Callable(None))
    }

    /// Register a callable method protected by `guard`.
    pub fn guarded<G, F, Fut>(&mut self, name: impl Into<String>, guard: G, f: F) -> &mut Self
    where
        G: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
        F: Fn(Arc<T>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MeshError>> + Send + 'static,
    {
        self.insert(name.into(), boxed(f), Access::Callable(Some(Arc::new(guard))))
    }

    /// Register a method reachable only from trusted paths: local handler
    /// continuations, scheduled work, or the `svc` accessor.
    pub fn internal<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Arc<T>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MeshError>> + Send + 'static,
    {
        self.insert(name.into(), boxed(f), Access::Internal)
    }

    /// Expose a read-only field.
    pub fn property<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&T) -> Value + Send + Sync + 'static,
    {
        self.properties.insert(name.into(), Arc::new(f));
        self
    }

    pub fn is_callable(&self, name: &str) -> bool {
        matches!(
            self.methods.get(name).map(|m| &m.access),
            Some(Access::Callable(_))
        )
    }

    /// Registered method names (sorted).
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    fn insert(&mut self, name: String, handler: Handler<T>, access: Access<T>) -> &mut Self {
        self.methods.insert(name, MethodEntry { handler, access });
        self
    }

    fn member(&self, state: &Arc<T>, key: &str) -> Option<Member> {
        if let Some(entry) = self.methods.get(key) {
            let handler = entry.handler.clone();
            let receiver = state.clone();
            let mut method = BoundMethod::new(key, move |args| handler(receiver, args));
            if let Access::Callable(guard) = &entry.access {
                method.callable = true;
                if let Some(guard) = guard.clone() {
                    let receiver = state.clone();
                    let name = key.to_string();
                    method.guard = Some(Box::new(move || {
                        guard(receiver.as_ref()).map_err(|reason| MeshError::GuardRejected {
                            method: name.clone(),
                            reason,
                        })
                    }));
                }
            }
            return Some(Member::Method(method));
        }
        self.properties.get(key).map(|p| Member::Value(p(state.as_ref())))
    }
}

fn boxed<T, F, Fut>(f: F) -> Handler<T>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, MeshError>> + Send + 'static,
{
    Arc::new(move |state, args| f(state, args).boxed())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Named infrastructure services, injected at construction.
#[derive(Clone, Default)]
pub struct Services {
    entries: HashMap<String, Arc<dyn Target>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, service: Arc<dyn Target>) -> &mut Self {
        self.entries.insert(name.into(), service);
        self
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Target for Services {
    fn member(&self, key: &str) -> Option<Member> {
        self.entries.get(key).cloned().map(Member::Object)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Instance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// State plus its method table: the standard [`Target`].
pub struct Instance<T> {
    state: Arc<T>,
    methods: Arc<MethodTable<T>>,
    services: Arc<Services>,
}

impl<T: Send + Sync + 'static> Instance<T> {
    pub fn new(state: Arc<T>, methods: MethodTable<T>) -> Self {
        Self {
            state,
            methods: Arc::new(methods),
            services: Arc::new(Services::new()),
        }
    }

    pub fn with_services(mut self, services: Services) -> Self {
        self.services = Arc::new(services);
        self
    }

    pub fn state(&self) -> &Arc<T> {
        &self.state
    }
}

impl<T: Send + Sync + 'static> Target for Instance<T> {
    fn member(&self, key: &str) -> Option<Member> {
        if key == SERVICE_ACCESSOR {
            return Some(Member::Object(self.services.clone()));
        }
        self.methods.member(&self.state, key)
    }
}
