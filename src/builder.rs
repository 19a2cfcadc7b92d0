//! Declarative model composition.
//!
//! Models are described with free functions that return opaque [`Part`]
//! values and compose by nesting:
//!
//! ```
//! use statechart::*;
//!
//! let model: Model<()> = define(
//!     "traffic_light",
//!     [
//!         state("red", []),
//!         state("green", []),
//!         transition([on("go"), source("red"), target("green")]),
//!         initial([target("red")]),
//!     ],
//! )
//! .unwrap();
//! ```
//!
//! Parts apply eagerly against a stack of enclosing elements and may push
//! deferred validation steps; [`define`] repeats passes until the deferred
//! list drains, then runs a finishing pass that sorts triggers, derives
//! transition kinds, and precomputes the exit/enter path tables.

use crate::error::{BuildError, Loc};
use crate::event::Event;
use crate::instance::{ActivityContext, Instance};
use crate::kind::Kind;
use crate::model::{
    ActivityFn, BehaviorDef, BehaviorFn, ConstraintDef, DurationFn, Element, EventSpec, Model,
    Paths, StateDef, TransitionDef, VertexDef,
};
use crate::path;
use std::collections::HashMap;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

/// One composable piece of a model description.
pub struct Part<T> {
    apply: Apply<T>,
}

type Apply<T> = Box<dyn FnOnce(&mut Builder<T>) -> Result<Option<String>, BuildError>>;

impl<T> Part<T> {
    fn new(
        apply: impl FnOnce(&mut Builder<T>) -> Result<Option<String>, BuildError> + 'static,
    ) -> Self {
        Self {
            apply: Box::new(apply),
        }
    }
}

/// Argument accepted wherever a qualified name or a nested part fits, such as
/// [`target`] and [`source`].
pub enum NameOrPart<T> {
    Name(String),
    Part(Part<T>),
}

impl<T> From<&str> for NameOrPart<T> {
    fn from(name: &str) -> Self {
        NameOrPart::Name(name.to_string())
    }
}

impl<T> From<String> for NameOrPart<T> {
    fn from(name: String) -> Self {
        NameOrPart::Name(name)
    }
}

impl<T> From<Part<T>> for NameOrPart<T> {
    fn from(part: Part<T>) -> Self {
        NameOrPart::Part(part)
    }
}

type Deferred<T> = Box<dyn FnOnce(&mut Builder<T>) -> Result<(), BuildError>>;

struct Builder<T> {
    machine: String,
    members: HashMap<String, Element<T>>,
    stack: Vec<String>,
    deferred: Vec<Deferred<T>>,
}

impl<T> Builder<T> {
    fn kind_of(&self, qualified_name: &str) -> Option<Kind> {
        self.members.get(qualified_name).map(|el| el.kind())
    }

    /// Walks the enclosing-element stack from the top looking for a kind.
    fn find(&self, kinds: &[Kind]) -> Option<String> {
        self.stack
            .iter()
            .rev()
            .find(|q| self.kind_of(q).is_some_and(|k| k.is_any(kinds)))
            .cloned()
    }

    /// Resolves a possibly-relative name against the nearest enclosing state.
    fn resolve(&self, name: &str) -> String {
        if name.starts_with('/') {
            path::join("/", name)
        } else {
            let base = self.find(&[Kind::STATE]).unwrap_or_else(|| "/".to_string());
            path::join(&base, name)
        }
    }

    fn state_ref(&self, q: &str) -> Option<&StateDef> {
        match self.members.get(q) {
            Some(Element::State(s)) => Some(s),
            _ => None,
        }
    }

    fn state_mut(&mut self, q: &str) -> Option<&mut StateDef> {
        match self.members.get_mut(q) {
            Some(Element::State(s)) => Some(s),
            _ => None,
        }
    }

    fn vertex_ref(&self, q: &str) -> Option<&VertexDef> {
        match self.members.get(q) {
            Some(Element::Vertex(v)) => Some(v),
            _ => None,
        }
    }

    fn transition_ref(&self, q: &str) -> Option<&TransitionDef> {
        match self.members.get(q) {
            Some(Element::Transition(t)) => Some(t),
            _ => None,
        }
    }

    fn transition_mut(&mut self, q: &str) -> Option<&mut TransitionDef> {
        match self.members.get_mut(q) {
            Some(Element::Transition(t)) => Some(t),
            _ => None,
        }
    }

    fn defer(&mut self, step: impl FnOnce(&mut Builder<T>) -> Result<(), BuildError> + 'static) {
        self.deferred.push(Box::new(step));
    }
}

/// Builds and validates a model from its declarative description.
///
/// Fails fast: the first structural violation aborts the build with a
/// source-location-tagged [`BuildError`].
#[track_caller]
pub fn define<T, I>(name: &str, parts: I) -> Result<Model<T>, BuildError>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = Part<T>>,
{
    let name = name.to_string();
    let mut builder = Builder {
        machine: name.clone(),
        members: HashMap::new(),
        stack: vec!["/".to_string()],
        deferred: Vec::new(),
    };
    builder.members.insert(
        "/".to_string(),
        Element::State(StateDef::new(Kind::STATE_MACHINE, "/")),
    );
    for part in parts {
        (part.apply)(&mut builder)?;
    }
    while !builder.deferred.is_empty() {
        let steps = std::mem::take(&mut builder.deferred);
        for step in steps {
            step(&mut builder)?;
        }
    }
    finish(&mut builder)?;
    Ok(Model::new(name, builder.members))
}

/// Declares a state. States nest and can carry entry/exit behaviors,
/// activities, deferral patterns, and transitions.
#[track_caller]
pub fn state<T, I>(name: impl Into<String>, parts: I) -> Part<T>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = Part<T>>,
{
    let location = Location::caller();
    let name = name.into();
    let parts: Vec<Part<T>> = parts.into_iter().collect();
    Part::new(move |b| {
        let Some(owner) = b.find(&[Kind::STATE]) else {
            return Err(BuildError::Misplaced {
                element: format!("state {name:?}"),
                container: "define() or state()",
                location,
            });
        };
        let qualified = path::join(&owner, &name);
        b.members.insert(
            qualified.clone(),
            Element::State(StateDef::new(Kind::STATE, &qualified)),
        );
        b.stack.push(qualified.clone());
        for part in parts {
            (part.apply)(b)?;
        }
        b.stack.pop();
        Ok(Some(qualified))
    })
}

/// Declares a final state. Entering a top-level final state terminates the
/// instance.
#[track_caller]
pub fn final_state<T>(name: impl Into<String>) -> Part<T>
where
    T: Send + Sync + 'static,
{
    let location = Location::caller();
    let name = name.into();
    Part::new(move |b| {
        let Some(owner) = b.find(&[Kind::STATE]) else {
            return Err(BuildError::Misplaced {
                element: format!("final state {name:?}"),
                container: "define() or state()",
                location,
            });
        };
        let qualified = path::join(&owner, &name);
        b.members.insert(
            qualified.clone(),
            Element::Vertex(VertexDef {
                kind: Kind::FINAL_STATE,
                qualified_name: qualified.clone(),
                transitions: Vec::new(),
            }),
        );
        Ok(Some(qualified))
    })
}

/// Declares a transition with an auto-generated name.
#[track_caller]
pub fn transition<T, I>(parts: I) -> Part<T>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = Part<T>>,
{
    transition_part(None, parts.into_iter().collect(), Location::caller())
}

/// Declares a named transition.
#[track_caller]
pub fn transition_named<T, I>(name: impl Into<String>, parts: I) -> Part<T>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = Part<T>>,
{
    transition_part(
        Some(name.into()),
        parts.into_iter().collect(),
        Location::caller(),
    )
}

fn transition_part<T>(name: Option<String>, parts: Vec<Part<T>>, location: Loc) -> Part<T>
where
    T: Send + Sync + 'static,
{
    Part::new(move |b| {
        let Some(owner) = b.find(&[Kind::VERTEX]) else {
            return Err(BuildError::Misplaced {
                element: "transition".to_string(),
                container: "define() or state()",
                location,
            });
        };
        let name = name.unwrap_or_else(|| format!("transition_{}", b.members.len()));
        let qualified = path::join(&owner, &name);
        b.members.insert(
            qualified.clone(),
            Element::Transition(TransitionDef {
                kind: Kind::TRANSITION,
                qualified_name: qualified.clone(),
                source: String::new(),
                target: String::new(),
                guard: None,
                effects: Vec::new(),
                events: Vec::new(),
                paths: HashMap::new(),
                location,
            }),
        );
        b.stack.push(qualified.clone());
        for part in parts {
            (part.apply)(b)?;
        }
        b.stack.pop();

        // Default the source to the owning vertex.
        let source = match b.transition_ref(&qualified) {
            Some(t) if t.source.is_empty() => owner.clone(),
            Some(t) => t.source.clone(),
            None => owner.clone(),
        };
        if let Some(t) = b.transition_mut(&qualified) {
            t.source = source.clone();
        }

        // The source must already be declared; register the transition on it.
        let source_kind = match b.kind_of(&source) {
            Some(kind) if kind.is(Kind::VERTEX) => kind,
            _ => {
                return Err(BuildError::MissingSource {
                    transition: qualified,
                    src: source,
                    location,
                })
            }
        };
        match b.members.get_mut(&source) {
            Some(Element::State(s)) => s.transitions.push(qualified.clone()),
            Some(Element::Vertex(v)) => v.transitions.push(qualified.clone()),
            _ => {}
        }

        // Transitions out of real states need a trigger; pseudostate
        // transitions (initial, choice) fire structurally.
        let has_trigger = b
            .transition_ref(&qualified)
            .map(|t| !t.events.is_empty())
            .unwrap_or(false);
        if !has_trigger && !source_kind.is(Kind::PSEUDOSTATE) {
            return Err(BuildError::MissingTrigger {
                transition: qualified,
                location,
            });
        }
        Ok(Some(qualified))
    })
}

/// Sets the source of the enclosing transition. Relative names resolve
/// against the nearest enclosing state.
#[track_caller]
pub fn source<T>(from: impl Into<NameOrPart<T>>) -> Part<T>
where
    T: Send + Sync + 'static,
{
    let location = Location::caller();
    let from = from.into();
    Part::new(move |b| {
        let Some(tq) = b.find(&[Kind::TRANSITION]) else {
            return Err(BuildError::Misplaced {
                element: "source()".to_string(),
                container: "transition()",
                location,
            });
        };
        let resolved = match from {
            NameOrPart::Name(name) => b.resolve(&name),
            NameOrPart::Part(part) => (part.apply)(b)?.unwrap_or_default(),
        };
        let Some(t) = b.transition_mut(&tq) else {
            return Ok(None);
        };
        if !t.source.is_empty() {
            return Err(BuildError::DuplicateSource {
                transition: tq.clone(),
                src: t.source.clone(),
                location,
            });
        }
        t.source = resolved;
        Ok(None)
    })
}

/// Sets the target of the enclosing transition: either a (possibly relative)
/// qualified name or a nested part such as [`choice`].
#[track_caller]
pub fn target<T>(to: impl Into<NameOrPart<T>>) -> Part<T>
where
    T: Send + Sync + 'static,
{
    let location = Location::caller();
    let to = to.into();
    Part::new(move |b| {
        let Some(tq) = b.find(&[Kind::TRANSITION]) else {
            return Err(BuildError::Misplaced {
                element: "target()".to_string(),
                container: "transition()",
                location,
            });
        };
        let resolved = match to {
            NameOrPart::Name(name) => {
                let resolved = b.resolve(&name);
                // Existence is validated once the whole model is declared.
                let check = resolved.clone();
                let transition = tq.clone();
                b.defer(move |b| {
                    if b.members.contains_key(&check) {
                        Ok(())
                    } else {
                        Err(BuildError::MissingTarget {
                            transition,
                            target: check,
                            location,
                        })
                    }
                });
                resolved
            }
            NameOrPart::Part(part) => (part.apply)(b)?.unwrap_or_default(),
        };
        let Some(t) = b.transition_mut(&tq) else {
            return Ok(None);
        };
        if !t.target.is_empty() {
            return Err(BuildError::DuplicateTarget {
                transition: tq.clone(),
                target: t.target.clone(),
                location,
            });
        }
        t.target = resolved;
        Ok(None)
    })
}

/// Adds a trigger to the enclosing transition. Patterns may contain glob `*`.
/// Repeatable.
#[track_caller]
pub fn on<T, E>(trigger: E) -> Part<T>
where
    T: Send + Sync + 'static,
    E: Into<EventSpec>,
{
    let location = Location::caller();
    let spec = trigger.into();
    Part::new(move |b| {
        let Some(tq) = b.find(&[Kind::TRANSITION]) else {
            return Err(BuildError::Misplaced {
                element: "on()".to_string(),
                container: "transition()",
                location,
            });
        };
        if let Some(t) = b.transition_mut(&tq) {
            t.events.push(spec);
        }
        Ok(None)
    })
}

/// Attaches a guard to the enclosing transition.
#[track_caller]
pub fn guard<T, F>(expression: F) -> Part<T>
where
    T: Send + Sync + 'static,
    F: Fn(&Instance<T>, &mut T, &Event) -> bool + Send + Sync + 'static,
{
    let location = Location::caller();
    Part::new(move |b| {
        let Some(tq) = b.find(&[Kind::TRANSITION]) else {
            return Err(BuildError::Misplaced {
                element: "guard()".to_string(),
                container: "transition()",
                location,
            });
        };
        let qualified = path::join(&tq, ".guard");
        b.members.insert(
            qualified.clone(),
            Element::Constraint(ConstraintDef {
                kind: Kind::CONSTRAINT,
                qualified_name: qualified.clone(),
                expression: Arc::new(expression),
            }),
        );
        if let Some(t) = b.transition_mut(&tq) {
            t.guard = Some(qualified);
        }
        Ok(None)
    })
}

/// Appends an effect to the enclosing transition. Effects run after the exit
/// cascade and before entry, in declaration order.
#[track_caller]
pub fn effect<T, F>(action: F) -> Part<T>
where
    T: Send + Sync + 'static,
    F: Fn(&Instance<T>, &mut T, &Event) + Send + Sync + 'static,
{
    let location = Location::caller();
    Part::new(move |b| {
        let Some(tq) = b.find(&[Kind::TRANSITION]) else {
            return Err(BuildError::Misplaced {
                element: "effect()".to_string(),
                container: "transition()",
                location,
            });
        };
        let index = b.transition_ref(&tq).map(|t| t.effects.len()).unwrap_or(0);
        let qualified = path::join(&tq, &format!(".effect_{index}"));
        b.members.insert(
            qualified.clone(),
            Element::Behavior(BehaviorDef {
                kind: Kind::BEHAVIOR,
                qualified_name: qualified.clone(),
                action: BehaviorFn::Sync(Arc::new(action)),
            }),
        );
        if let Some(t) = b.transition_mut(&tq) {
            t.effects.push(qualified);
        }
        Ok(None)
    })
}

enum BehaviorSlot {
    Entry,
    Exit,
}

fn state_behavior<T, F>(slot: BehaviorSlot, action: F, location: Loc) -> Part<T>
where
    T: Send + Sync + 'static,
    F: Fn(&Instance<T>, &mut T, &Event) + Send + Sync + 'static,
{
    let name = match slot {
        BehaviorSlot::Entry => "entry",
        BehaviorSlot::Exit => "exit",
    };
    Part::new(move |b| {
        let Some(owner) = b.find(&[Kind::STATE]) else {
            return Err(BuildError::Misplaced {
                element: format!("{name}()"),
                container: "state()",
                location,
            });
        };
        let index = b
            .state_ref(&owner)
            .map(|s| s.entry.len() + s.exit.len())
            .unwrap_or(0);
        let qualified = path::join(&owner, &format!(".{name}_{index}"));
        b.members.insert(
            qualified.clone(),
            Element::Behavior(BehaviorDef {
                kind: Kind::BEHAVIOR,
                qualified_name: qualified.clone(),
                action: BehaviorFn::Sync(Arc::new(action)),
            }),
        );
        if let Some(s) = b.state_mut(&owner) {
            match slot {
                BehaviorSlot::Entry => s.entry.push(qualified),
                BehaviorSlot::Exit => s.exit.push(qualified),
            }
        }
        Ok(None)
    })
}

/// Appends an entry behavior to the enclosing state.
#[track_caller]
pub fn entry<T, F>(action: F) -> Part<T>
where
    T: Send + Sync + 'static,
    F: Fn(&Instance<T>, &mut T, &Event) + Send + Sync + 'static,
{
    state_behavior(BehaviorSlot::Entry, action, Location::caller())
}

/// Appends an exit behavior to the enclosing state.
#[track_caller]
pub fn exit<T, F>(action: F) -> Part<T>
where
    T: Send + Sync + 'static,
    F: Fn(&Instance<T>, &mut T, &Event) + Send + Sync + 'static,
{
    state_behavior(BehaviorSlot::Exit, action, Location::caller())
}

/// Attaches a long-running activity to the enclosing state. The activity is
/// spawned after the entry behaviors and cancelled before the exit behaviors;
/// it must honor its cancellation scope for state exit to proceed promptly.
#[track_caller]
pub fn activity<T, F, Fut>(behavior: F) -> Part<T>
where
    T: Send + Sync + 'static,
    F: Fn(ActivityContext<T>, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let location = Location::caller();
    Part::new(move |b| {
        let Some(owner) = b.find(&[Kind::STATE]) else {
            return Err(BuildError::Misplaced {
                element: "activity()".to_string(),
                container: "state()",
                location,
            });
        };
        let index = b.state_ref(&owner).map(|s| s.activities.len()).unwrap_or(0);
        let qualified = path::join(&owner, &format!(".activity_{index}"));
        let action: ActivityFn<T> = Arc::new(move |ctx, event| Box::pin(behavior(ctx, event)));
        b.members.insert(
            qualified.clone(),
            Element::Behavior(BehaviorDef {
                kind: Kind::CONCURRENT,
                qualified_name: qualified.clone(),
                action: BehaviorFn::Activity(action),
            }),
        );
        if let Some(s) = b.state_mut(&owner) {
            s.activities.push(qualified);
        }
        Ok(None)
    })
}

/// Declares the event-name patterns the enclosing state defers. A deferred
/// event is re-queued after the next transition out of the state.
#[track_caller]
pub fn defer<T, I, S>(patterns: I) -> Part<T>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let location = Location::caller();
    let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
    Part::new(move |b| {
        let Some(owner) = b.find(&[Kind::STATE]) else {
            return Err(BuildError::Misplaced {
                element: "defer()".to_string(),
                container: "state()",
                location,
            });
        };
        if let Some(s) = b.state_mut(&owner) {
            s.deferred.extend(patterns);
        }
        Ok(None)
    })
}

/// Declares the initial vertex of the enclosing state. Exactly one per
/// composite state; its transition must target a nested state and may carry
/// effects but neither triggers nor a guard.
#[track_caller]
pub fn initial<T, I>(parts: I) -> Part<T>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = Part<T>>,
{
    let location = Location::caller();
    let parts: Vec<Part<T>> = parts.into_iter().collect();
    Part::new(move |b| {
        let Some(owner) = b.find(&[Kind::STATE]) else {
            return Err(BuildError::Misplaced {
                element: "initial()".to_string(),
                container: "define() or state()",
                location,
            });
        };
        let qualified = path::join(&owner, ".initial");
        if b.members.contains_key(&qualified) {
            return Err(BuildError::DuplicateInitial {
                initial: qualified,
                owner,
                location,
            });
        }
        b.members.insert(
            qualified.clone(),
            Element::Vertex(VertexDef {
                kind: Kind::INITIAL,
                qualified_name: qualified.clone(),
                transitions: Vec::new(),
            }),
        );
        if let Some(s) = b.state_mut(&owner) {
            s.initial = Some(qualified.clone());
        }

        b.stack.push(qualified.clone());
        let mut tparts: Vec<Part<T>> = vec![source(qualified.as_str())];
        tparts.extend(parts);
        let applied = (transition_part(None, tparts, location).apply)(b);
        b.stack.pop();
        let tq = applied?.unwrap_or_default();

        if let Some(t) = b.transition_ref(&tq) {
            if t.guard.is_some() {
                return Err(BuildError::InitialGuard {
                    initial: qualified,
                    location,
                });
            }
            if t.events.iter().any(|e| !e.name.is_empty()) {
                return Err(BuildError::InitialTrigger {
                    initial: qualified,
                    location,
                });
            }
            if t.target.is_empty() || !path::is_ancestor(&owner, &t.target) {
                return Err(BuildError::InitialTarget {
                    initial: qualified,
                    owner,
                    target: t.target.clone(),
                    location,
                });
            }
        }
        if b.vertex_ref(&qualified)
            .is_some_and(|v| v.transitions.len() > 1)
        {
            return Err(BuildError::MultipleInitialTransitions {
                initial: qualified,
                location,
            });
        }
        Ok(Some(qualified))
    })
}

/// Declares a choice pseudo-state with an auto-generated name. Outgoing
/// transitions are evaluated in declaration order; the last must be
/// unguarded.
#[track_caller]
pub fn choice<T, I>(parts: I) -> Part<T>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = Part<T>>,
{
    choice_part(None, parts.into_iter().collect(), Location::caller())
}

/// Declares a named choice pseudo-state.
#[track_caller]
pub fn choice_named<T, I>(name: impl Into<String>, parts: I) -> Part<T>
where
    T: Send + Sync + 'static,
    I: IntoIterator<Item = Part<T>>,
{
    choice_part(
        Some(name.into()),
        parts.into_iter().collect(),
        Location::caller(),
    )
}

fn choice_part<T>(name: Option<String>, parts: Vec<Part<T>>, location: Loc) -> Part<T>
where
    T: Send + Sync + 'static,
{
    Part::new(move |b| {
        let Some(found) = b.find(&[Kind::STATE, Kind::TRANSITION]) else {
            return Err(BuildError::Misplaced {
                element: "choice()".to_string(),
                container: "state() or transition()",
                location,
            });
        };
        // A choice nested in a transition lives in the namespace of the
        // transition's source state.
        let owner = if b.kind_of(&found).is_some_and(|k| k.is(Kind::TRANSITION)) {
            let src = b
                .transition_ref(&found)
                .map(|t| t.source.clone())
                .unwrap_or_default();
            match b.kind_of(&src) {
                Some(kind) if kind.is(Kind::PSEUDOSTATE) => {
                    b.find(&[Kind::STATE]).unwrap_or_else(|| "/".to_string())
                }
                Some(kind) if kind.is(Kind::STATE) => src,
                _ => {
                    return Err(BuildError::Misplaced {
                        element: "choice()".to_string(),
                        container: "a transition with a declared source",
                        location,
                    })
                }
            }
        } else {
            found
        };
        let name = name.unwrap_or_else(|| format!("choice_{}", b.members.len()));
        let qualified = path::join(&owner, &name);
        b.members.insert(
            qualified.clone(),
            Element::Vertex(VertexDef {
                kind: Kind::CHOICE,
                qualified_name: qualified.clone(),
                transitions: Vec::new(),
            }),
        );
        b.stack.push(qualified.clone());
        for part in parts {
            (part.apply)(b)?;
        }
        b.stack.pop();

        let branches = b
            .vertex_ref(&qualified)
            .map(|v| v.transitions.clone())
            .unwrap_or_default();
        if branches.is_empty() {
            return Err(BuildError::EmptyChoice {
                choice: qualified,
                location,
            });
        }
        if let Some(last) = branches.last() {
            if b.transition_ref(last).is_some_and(|t| t.guard.is_some()) {
                return Err(BuildError::GuardedChoiceDefault {
                    choice: qualified,
                    location,
                });
            }
        }
        Ok(Some(qualified))
    })
}

enum TimerRepeat {
    Once,
    Recurring,
}

/// Adds a one-shot timed trigger: the transition fires once the computed
/// delay elapses while the source state stays active. `None` disables the
/// timer for that entry.
#[track_caller]
pub fn after<T, F>(duration: F) -> Part<T>
where
    T: Send + Sync + 'static,
    F: Fn(&mut T, &Event) -> Option<Duration> + Send + Sync + 'static,
{
    timer_part(
        TimerRepeat::Once,
        ".after",
        Arc::new(duration),
        Location::caller(),
    )
}

/// Adds a recurring timed trigger: re-evaluates the delay and re-arms after
/// each fire, until the source state is exited.
#[track_caller]
pub fn every<T, F>(duration: F) -> Part<T>
where
    T: Send + Sync + 'static,
    F: Fn(&mut T, &Event) -> Option<Duration> + Send + Sync + 'static,
{
    timer_part(
        TimerRepeat::Recurring,
        ".every",
        Arc::new(duration),
        Location::caller(),
    )
}

fn timer_part<T>(
    repeat: TimerRepeat,
    suffix: &'static str,
    duration: DurationFn<T>,
    location: Loc,
) -> Part<T>
where
    T: Send + Sync + 'static,
{
    Part::new(move |b| {
        let Some(tq) = b.find(&[Kind::TRANSITION]) else {
            return Err(BuildError::Misplaced {
                element: format!("{}()", &suffix[1..]),
                container: "transition()",
                location,
            });
        };
        let index = b.transition_ref(&tq).map(|t| t.events.len()).unwrap_or(0);
        let trigger_name = format!("{tq}/{index}{suffix}");
        let id = crc32c::crc32c(trigger_name.as_bytes()) as u64;
        let spec = EventSpec {
            kind: Kind::TIME_EVENT,
            name: trigger_name,
            id,
        };
        if let Some(t) = b.transition_mut(&tq) {
            t.events.push(spec.clone());
        }

        // The timer activity attaches to the source state, which is resolved
        // only after all of the transition's parts have applied.
        let recurring = matches!(repeat, TimerRepeat::Recurring);
        b.defer(move |b| {
            let Some(source) = b.transition_ref(&tq).map(|t| t.source.clone()) else {
                return Ok(());
            };
            if b.state_ref(&source).is_none() {
                return Err(BuildError::TimerSource { src: source, location });
            }
            let qualified = format!("{source}/.timer_{}", b.members.len());
            let event = spec.to_event();
            let action: ActivityFn<T> = Arc::new(move |ctx, cause| {
                let duration = duration.clone();
                let event = event.clone();
                Box::pin(async move {
                    loop {
                        let delay = ctx.with_context(|c| duration(c, &cause));
                        let Some(delay) = delay else { return };
                        tokio::select! {
                            _ = ctx.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {
                                ctx.dispatch(event.clone());
                            }
                        }
                        if !recurring {
                            return;
                        }
                    }
                })
            });
            b.members.insert(
                qualified.clone(),
                Element::Behavior(BehaviorDef {
                    kind: Kind::CONCURRENT,
                    qualified_name: qualified.clone(),
                    action: BehaviorFn::Activity(action),
                }),
            );
            if let Some(s) = b.state_mut(&source) {
                s.activities.push(qualified);
            }
            Ok(())
        });
        Ok(None)
    })
}

/// Adds a signal trigger: an activity awaits the supplied future while the
/// source state is active; resolving `true` fires the transition's trigger
/// and re-arms, resolving `false` disarms until the state is re-entered.
#[track_caller]
pub fn when<T, F, Fut>(signal: F) -> Part<T>
where
    T: Send + Sync + 'static,
    F: Fn(ActivityContext<T>, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    let location = Location::caller();
    let signal = Arc::new(signal);
    Part::new(move |b| {
        let Some(tq) = b.find(&[Kind::TRANSITION]) else {
            return Err(BuildError::Misplaced {
                element: "when()".to_string(),
                container: "transition()",
                location,
            });
        };
        let index = b.transition_ref(&tq).map(|t| t.events.len()).unwrap_or(0);
        let trigger_name = format!("{tq}/{index}/.when");
        let id = crc32c::crc32c(trigger_name.as_bytes()) as u64;
        let spec = EventSpec {
            kind: Kind::EVENT,
            name: trigger_name,
            id,
        };
        if let Some(t) = b.transition_mut(&tq) {
            t.events.push(spec.clone());
        }

        b.defer(move |b| {
            let Some(source) = b.transition_ref(&tq).map(|t| t.source.clone()) else {
                return Ok(());
            };
            if b.state_ref(&source).is_none() {
                return Err(BuildError::TimerSource { src: source, location });
            }
            let qualified = format!("{source}/.signal_{}", b.members.len());
            let event = spec.to_event();
            let action: ActivityFn<T> = Arc::new(move |ctx, cause| {
                let signal = signal.clone();
                let event = event.clone();
                Box::pin(async move {
                    loop {
                        tokio::select! {
                            _ = ctx.cancelled() => return,
                            fired = signal(ctx.clone(), cause.clone()) => {
                                if fired {
                                    ctx.dispatch(event.clone());
                                } else {
                                    return;
                                }
                            }
                        }
                    }
                })
            });
            b.members.insert(
                qualified.clone(),
                Element::Behavior(BehaviorDef {
                    kind: Kind::CONCURRENT,
                    qualified_name: qualified.clone(),
                    action: BehaviorFn::Activity(action),
                }),
            );
            if let Some(s) = b.state_mut(&source) {
                s.activities.push(qualified);
            }
            Ok(())
        });
        Ok(None)
    })
}

/// Final build pass: root invariants, trigger ordering, transition kinds, and
/// path precomputation.
fn finish<T>(b: &mut Builder<T>) -> Result<(), BuildError>
where
    T: Send + Sync + 'static,
{
    // Root structural rules.
    {
        let Some(root) = b.state_ref("/") else {
            return Err(BuildError::MissingInitial {
                machine: b.machine.clone(),
            });
        };
        if root.initial.is_none() {
            return Err(BuildError::MissingInitial {
                machine: b.machine.clone(),
            });
        }
        if !root.entry.is_empty() || !root.exit.is_empty() {
            return Err(BuildError::RootBehavior {
                machine: b.machine.clone(),
            });
        }
    }

    // Sort each vertex's outgoing transitions so wildcard triggers come
    // last, preserving the relative order of equally-classified transitions;
    // specific matches win ties.
    let vertex_names: Vec<String> = b
        .members
        .iter()
        .filter(|(_, el)| el.kind().is(Kind::VERTEX))
        .map(|(q, _)| q.clone())
        .collect();
    for vq in &vertex_names {
        let Some(list) = b.members.get(vq).and_then(|el| el.transitions()) else {
            continue;
        };
        let mut ordered: Vec<(String, bool)> = list
            .iter()
            .map(|tq| {
                let wild = b
                    .transition_ref(tq)
                    .map(|t| t.events.iter().any(|e| e.has_wildcard()))
                    .unwrap_or(false);
                (tq.clone(), wild)
            })
            .collect();
        ordered.sort_by_key(|(_, wild)| *wild);
        let sorted: Vec<String> = ordered.into_iter().map(|(q, _)| q).collect();
        match b.members.get_mut(vq) {
            Some(Element::State(s)) => s.transitions = sorted,
            Some(Element::Vertex(v)) => v.transitions = sorted,
            _ => {}
        }
    }

    // Derive each transition's kind and precompute its path table.
    let transition_names: Vec<String> = b
        .members
        .iter()
        .filter(|(_, el)| matches!(el, Element::Transition(_)))
        .map(|(q, _)| q.clone())
        .collect();
    for tq in transition_names {
        let (source, target, effects, location) = match b.transition_ref(&tq) {
            Some(t) => (
                t.source.clone(),
                t.target.clone(),
                t.effects.len(),
                t.location,
            ),
            None => continue,
        };
        let source_kind = b.kind_of(&source).unwrap_or(Kind::NONE);
        if source_kind.is(Kind::FINAL_STATE) {
            return Err(BuildError::FinalStateTransitions {
                state: source,
                location,
            });
        }
        if !target.is_empty() && !b.members.contains_key(&target) {
            return Err(BuildError::MissingTarget {
                transition: tq.clone(),
                target,
                location,
            });
        }
        if source == "/" && !target.is_empty() {
            return Err(BuildError::PartialTopLevelTransition {
                transition: tq.clone(),
                location,
            });
        }

        let kind = if target.is_empty() {
            Kind::INTERNAL
        } else if target == source {
            Kind::SELF_TRANSITION
        } else if path::is_ancestor(&source, &target) {
            Kind::LOCAL
        } else {
            Kind::EXTERNAL
        };
        if kind == Kind::INTERNAL && effects == 0 {
            return Err(BuildError::InternalWithoutEffect {
                transition: tq.clone(),
                location,
            });
        }

        let lca = path::lca(&source, &target);
        let mut enter: Vec<String> = Vec::new();
        if kind != Kind::INTERNAL {
            let mut entering = target.clone();
            while entering != lca && entering != "/" && !entering.is_empty() {
                enter.insert(0, entering.clone());
                entering = path::owner(&entering).to_string();
            }
        }

        let mut paths: HashMap<String, Paths> = HashMap::new();
        if source_kind.is(Kind::INITIAL) {
            // Initial transitions are looked up from their owning state when
            // it is entered with default entry.
            paths.insert(
                path::owner(&source).to_string(),
                Paths {
                    exit: vec![source.clone()],
                    enter,
                },
            );
        } else {
            for vq in &vertex_names {
                if *vq != source && !path::is_ancestor(&source, vq) {
                    continue;
                }
                let exit = if kind == Kind::INTERNAL {
                    Vec::new()
                } else {
                    let mut exiting = vq.clone();
                    let mut list = Vec::new();
                    while exiting != lca && !exiting.is_empty() {
                        list.push(exiting.clone());
                        if exiting == "/" {
                            break;
                        }
                        exiting = path::owner(&exiting).to_string();
                    }
                    list
                };
                paths.insert(
                    vq.clone(),
                    Paths {
                        exit,
                        enter: enter.clone(),
                    },
                );
            }
        }

        if let Some(t) = b.transition_mut(&tq) {
            t.kind = kind;
            t.paths = paths;
        }
    }
    Ok(())
}
