//! Compiled state machine models.
//!
//! A [`Model`] is the immutable output of [`crate::builder::define`]: a flat
//! table of elements keyed by qualified name, with per-transition exit/enter
//! paths precomputed for every vertex that can be active when the transition
//! fires. Elements reference each other by qualified name rather than by
//! pointer, so the graph has no back-references and dispatch never chases
//! more than one table lookup per step.

use crate::error::Loc;
use crate::event::Event;
use crate::instance::{ActivityContext, Instance};
use crate::kind::Kind;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Entry, exit, and effect behaviors run synchronously inside the RTC step.
pub type Action<T> = Arc<dyn Fn(&Instance<T>, &mut T, &Event) + Send + Sync>;

/// Guard expressions; a transition fires only if its guard returns true.
pub type GuardFn<T> = Arc<dyn Fn(&Instance<T>, &mut T, &Event) -> bool + Send + Sync>;

/// Long-running concurrent behaviors started on state entry and cancelled on
/// exit through the [`ActivityContext`].
pub type ActivityFn<T> =
    Arc<dyn Fn(ActivityContext<T>, Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Computes the delay of a timed trigger; `None` disables the timer.
pub type DurationFn<T> = Arc<dyn Fn(&mut T, &Event) -> Option<Duration> + Send + Sync>;

/// A trigger pattern attached to a transition.
#[derive(Debug, Clone)]
pub struct EventSpec {
    pub kind: Kind,
    pub name: String,
    pub id: u64,
}

impl EventSpec {
    /// Materializes the event that this trigger dispatches when synthesized
    /// by a timer or signal activity.
    pub(crate) fn to_event(&self) -> Event {
        Event {
            kind: self.kind,
            name: self.name.clone(),
            id: self.id,
            data: serde_json::Value::Null,
        }
    }

    pub(crate) fn has_wildcard(&self) -> bool {
        self.name.contains('*')
    }
}

impl From<&str> for EventSpec {
    fn from(name: &str) -> Self {
        Self {
            kind: Kind::EVENT,
            name: name.to_string(),
            id: 0,
        }
    }
}

impl From<String> for EventSpec {
    fn from(name: String) -> Self {
        Self {
            kind: Kind::EVENT,
            name,
            id: 0,
        }
    }
}

impl From<Event> for EventSpec {
    fn from(event: Event) -> Self {
        Self {
            kind: if event.kind == Kind::NONE {
                Kind::EVENT
            } else {
                event.kind
            },
            name: event.name,
            id: event.id,
        }
    }
}

/// Precomputed exit/enter lists for one (transition, active vertex) pair.
#[derive(Debug, Clone, Default)]
pub struct Paths {
    /// Vertices to exit, ordered bottom-up, ending just below the LCA.
    pub exit: Vec<String>,
    /// Vertices to enter, ordered top-down, starting just below the LCA and
    /// ending at the target.
    pub enter: Vec<String>,
}

/// A state: the only element kind that can host nested declarations.
#[derive(Debug, Clone)]
pub struct StateDef {
    pub kind: Kind,
    pub qualified_name: String,
    /// Qualified name of the initial vertex, if this is a composite state.
    pub initial: Option<String>,
    pub entry: Vec<String>,
    pub exit: Vec<String>,
    pub activities: Vec<String>,
    /// Outgoing transitions in declaration order, wildcard triggers sorted last.
    pub transitions: Vec<String>,
    /// Event-name patterns this state defers.
    pub deferred: Vec<String>,
}

impl StateDef {
    pub(crate) fn new(kind: Kind, qualified_name: impl Into<String>) -> Self {
        Self {
            kind,
            qualified_name: qualified_name.into(),
            initial: None,
            entry: Vec::new(),
            exit: Vec::new(),
            activities: Vec::new(),
            transitions: Vec::new(),
            deferred: Vec::new(),
        }
    }
}

/// A non-state vertex: initial, choice, or final.
#[derive(Debug, Clone)]
pub struct VertexDef {
    pub kind: Kind,
    pub qualified_name: String,
    pub transitions: Vec<String>,
}

/// A transition, with its path table precomputed at build time.
#[derive(Debug, Clone)]
pub struct TransitionDef {
    pub kind: Kind,
    pub qualified_name: String,
    pub source: String,
    /// Empty for internal transitions.
    pub target: String,
    pub guard: Option<String>,
    pub effects: Vec<String>,
    pub events: Vec<EventSpec>,
    /// Exit/enter lists keyed by the qualified name of the active vertex.
    pub paths: HashMap<String, Paths>,
    pub(crate) location: Loc,
}

/// A behavior: either a synchronous action or a concurrent activity.
pub struct BehaviorDef<T> {
    pub kind: Kind,
    pub qualified_name: String,
    pub action: BehaviorFn<T>,
}

pub enum BehaviorFn<T> {
    Sync(Action<T>),
    Activity(ActivityFn<T>),
}

impl<T> std::fmt::Debug for BehaviorDef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorDef")
            .field("kind", &self.kind)
            .field("qualified_name", &self.qualified_name)
            .finish_non_exhaustive()
    }
}

/// A guard constraint.
pub struct ConstraintDef<T> {
    pub kind: Kind,
    pub qualified_name: String,
    pub expression: GuardFn<T>,
}

impl<T> std::fmt::Debug for ConstraintDef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintDef")
            .field("kind", &self.kind)
            .field("qualified_name", &self.qualified_name)
            .finish_non_exhaustive()
    }
}

/// One element of a compiled model.
#[derive(Debug)]
pub enum Element<T> {
    State(StateDef),
    Vertex(VertexDef),
    Transition(TransitionDef),
    Behavior(BehaviorDef<T>),
    Constraint(ConstraintDef<T>),
}

impl<T> Element<T> {
    pub fn kind(&self) -> Kind {
        match self {
            Element::State(s) => s.kind,
            Element::Vertex(v) => v.kind,
            Element::Transition(t) => t.kind,
            Element::Behavior(b) => b.kind,
            Element::Constraint(c) => c.kind,
        }
    }

    pub fn qualified_name(&self) -> &str {
        match self {
            Element::State(s) => &s.qualified_name,
            Element::Vertex(v) => &v.qualified_name,
            Element::Transition(t) => &t.qualified_name,
            Element::Behavior(b) => &b.qualified_name,
            Element::Constraint(c) => &c.qualified_name,
        }
    }

    /// Outgoing transitions if this element is a vertex of any kind.
    pub fn transitions(&self) -> Option<&[String]> {
        match self {
            Element::State(s) => Some(&s.transitions),
            Element::Vertex(v) => Some(&v.transitions),
            _ => None,
        }
    }
}

/// An immutable, compiled state machine model.
///
/// Shared read-only (via `Arc`) by every instance started against it.
#[derive(Debug)]
pub struct Model<T> {
    name: String,
    members: HashMap<String, Element<T>>,
}

impl<T> Model<T> {
    pub(crate) fn new(name: String, members: HashMap<String, Element<T>>) -> Self {
        Self { name, members }
    }

    /// The machine name given to [`crate::builder::define`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All declared elements, including synthetic initial vertices, keyed by
    /// qualified name. External walkers (diagram emitters and the like) use
    /// this table.
    pub fn members(&self) -> &HashMap<String, Element<T>> {
        &self.members
    }

    pub fn element(&self, qualified_name: &str) -> Option<&Element<T>> {
        self.members.get(qualified_name)
    }

    pub fn state(&self, qualified_name: &str) -> Option<&StateDef> {
        match self.members.get(qualified_name) {
            Some(Element::State(s)) => Some(s),
            _ => None,
        }
    }

    pub fn vertex(&self, qualified_name: &str) -> Option<&VertexDef> {
        match self.members.get(qualified_name) {
            Some(Element::Vertex(v)) => Some(v),
            _ => None,
        }
    }

    pub fn transition(&self, qualified_name: &str) -> Option<&TransitionDef> {
        match self.members.get(qualified_name) {
            Some(Element::Transition(t)) => Some(t),
            _ => None,
        }
    }

    pub fn behavior(&self, qualified_name: &str) -> Option<&BehaviorDef<T>> {
        match self.members.get(qualified_name) {
            Some(Element::Behavior(b)) => Some(b),
            _ => None,
        }
    }

    pub fn constraint(&self, qualified_name: &str) -> Option<&ConstraintDef<T>> {
        match self.members.get(qualified_name) {
            Some(Element::Constraint(c)) => Some(c),
            _ => None,
        }
    }
}
