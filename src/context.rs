//! Execution contexts and the instance registry.
//!
//! A [`Ctx`] carries the registry shared by every instance in one context
//! tree, plus the chain of instances the context was derived from. Starting
//! an instance from another instance's context links them: the new instance
//! joins the same registry and remembers its ancestors, which is what the
//! propagation and broadcast helpers walk.

use crate::event::{Done, Event};
use dashmap::DashMap;
use std::sync::Arc;

/// Type-erased view of a running instance, independent of its context type.
pub trait AnyInstance: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// Qualified name of the active leaf; empty when stopped.
    fn state(&self) -> String;
    fn dispatch_any(&self, event: Event) -> Done;
}

/// A cheap, cloneable handle to a running instance of any context type.
#[derive(Clone)]
pub struct InstanceRef(pub(crate) Arc<dyn AnyInstance>);

impl InstanceRef {
    pub fn id(&self) -> &str {
        self.0.id()
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn state(&self) -> String {
        self.0.state()
    }

    pub fn dispatch(&self, event: Event) -> Done {
        self.0.dispatch_any(event)
    }
}

impl std::fmt::Debug for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRef")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Concurrent id-to-instance map shared across a context tree.
#[derive(Default)]
pub(crate) struct Registry {
    map: DashMap<String, InstanceRef>,
}

impl Registry {
    pub(crate) fn insert(&self, instance: InstanceRef) {
        self.map.insert(instance.id().to_string(), instance);
    }

    pub(crate) fn remove(&self, id: &str) {
        self.map.remove(id);
    }

    pub(crate) fn snapshot(&self) -> Vec<InstanceRef> {
        self.map.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// An execution context: the registry plus the chain of enclosing instances,
/// outermost first.
#[derive(Clone)]
pub struct Ctx {
    pub(crate) registry: Arc<Registry>,
    pub(crate) chain: Vec<InstanceRef>,
}

impl Ctx {
    /// A fresh root context with its own registry.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            chain: Vec::new(),
        }
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("instances", &self.registry.map.len())
            .field("depth", &self.chain.len())
            .finish()
    }
}

/// Returns the instance this context belongs to, if any.
pub fn from_context(ctx: &Ctx) -> Option<InstanceRef> {
    ctx.chain.last().cloned()
}

/// Returns every instance registered in this context tree.
pub fn instances_from_context(ctx: &Ctx) -> Vec<InstanceRef> {
    ctx.registry.snapshot()
}

/// Dispatches an event to the context's own instance. Resolves immediately if
/// the context has no instance.
pub fn dispatch(ctx: &Ctx, event: Event) -> Done {
    match ctx.chain.last() {
        Some(instance) => instance.dispatch(event),
        None => Done::ready(),
    }
}

/// Dispatches an event to every instance in the context tree. The returned
/// signal completes once all of them are idle for the event.
pub fn dispatch_all(ctx: &Ctx, event: Event) -> Done {
    let signals = ctx
        .registry
        .snapshot()
        .into_iter()
        .map(|instance| instance.dispatch(event.clone()))
        .collect();
    Done::all(signals)
}

/// Dispatches an event to every instance whose id matches any of the glob
/// patterns.
pub fn dispatch_to(ctx: &Ctx, event: Event, patterns: &[&str]) -> Done {
    let signals = ctx
        .registry
        .snapshot()
        .into_iter()
        .filter(|instance| crate::path::matches_any(instance.id(), patterns))
        .map(|instance| instance.dispatch(event.clone()))
        .collect();
    Done::all(signals)
}

/// Forwards an event to the immediate parent instance of this context.
pub fn propagate(ctx: &Ctx, event: Event) -> Done {
    if ctx.chain.len() < 2 {
        return Done::ready();
    }
    match ctx.chain.get(ctx.chain.len() - 2) {
        Some(parent) => parent.dispatch(event),
        None => Done::ready(),
    }
}

/// Forwards an event to every ancestor instance of this context, outermost
/// first.
pub fn propagate_all(ctx: &Ctx, event: Event) -> Done {
    if ctx.chain.len() < 2 {
        return Done::ready();
    }
    let signals = ctx.chain[..ctx.chain.len() - 1]
        .iter()
        .map(|ancestor| ancestor.dispatch(event.clone()))
        .collect();
    Done::all(signals)
}
