//! # statechart
//!
//! Hierarchical state machine (UML statechart) runtime.
//!
//! This crate provides:
//! - A declarative builder that compiles a nested state hierarchy into an
//!   immutable, validated model with precomputed transition paths
//! - A run-to-completion dispatch loop with a two-priority event queue,
//!   completion-event preemption, and event deferral
//! - A transition engine covering guarded, self, internal, local, and
//!   external transitions plus choice pseudo-states
//! - Concurrent in-state activities with cancellation scopes, and time- and
//!   signal-triggered transitions (`after`, `every`, `when`)
//!
//! ```
//! use statechart::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let model = Arc::new(
//!     define::<(), _>(
//!         "toggle",
//!         [
//!             state("off", []),
//!             state("on", []),
//!             transition([on("flip"), source("off"), target("on")]),
//!             transition([on("flip"), source("on"), target("off")]),
//!             initial([target("off")]),
//!         ],
//!     )
//!     .unwrap(),
//! );
//!
//! let ctx = Ctx::new();
//! let sm = start(&ctx, (), model, Config::new()).await;
//! assert_eq!(sm.state(), "/off");
//! sm.dispatch(Event::new("flip")).await;
//! assert_eq!(sm.state(), "/on");
//! # }
//! ```

pub mod builder;
pub mod context;
pub mod error;
pub mod event;
pub mod instance;
pub mod kind;
pub mod model;
pub mod muid;
pub mod path;
pub mod queue;

pub use builder::{
    activity, after, choice, choice_named, defer, define, effect, entry, every, exit, final_state,
    guard, initial, on, source, state, target, transition, transition_named, when, NameOrPart,
    Part,
};
pub use context::{
    dispatch, dispatch_all, dispatch_to, from_context, instances_from_context, propagate,
    propagate_all, AnyInstance, Ctx, InstanceRef,
};
pub use error::BuildError;
pub use event::{Done, Event, ERROR_EVENT_NAME};
pub use instance::{start, ActivityContext, Config, Instance, Trace};
pub use kind::Kind;
pub use model::{Element, EventSpec, Model};
