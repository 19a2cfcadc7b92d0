//! Build-time error types.
//!
//! Model construction is fail-fast: the first structural violation aborts the
//! build, and a model never exists in an invalid state. Every error carries
//! the source location of the builder call that caused it, captured through
//! `#[track_caller]`.

use std::panic::Location;
use thiserror::Error;

/// Source location of the offending builder call.
pub type Loc = &'static Location<'static>;

/// Errors surfaced while building a model.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{location}: {element} must be declared within {container}")]
    Misplaced {
        element: String,
        container: &'static str,
        location: Loc,
    },

    #[error("{location}: missing source {src:?} for transition {transition:?}")]
    MissingSource {
        transition: String,
        src: String,
        location: Loc,
    },

    #[error("{location}: missing target {target:?} for transition {transition:?}")]
    MissingTarget {
        transition: String,
        target: String,
        location: Loc,
    },

    #[error("{location}: transition {transition:?} already has source {src:?}")]
    DuplicateSource {
        transition: String,
        src: String,
        location: Loc,
    },

    #[error("{location}: transition {transition:?} already has target {target:?}")]
    DuplicateTarget {
        transition: String,
        target: String,
        location: Loc,
    },

    #[error("{location}: transition {transition:?} requires at least one trigger")]
    MissingTrigger { transition: String, location: Loc },

    #[error("an initial vertex is required for machine {machine:?}")]
    MissingInitial { machine: String },

    #[error("entry and exit behaviors are not allowed on the top-level state of machine {machine:?}")]
    RootBehavior { machine: String },

    #[error("{location}: initial {initial:?} is already defined for {owner:?}")]
    DuplicateInitial {
        initial: String,
        owner: String,
        location: Loc,
    },

    #[error("{location}: initial {initial:?} cannot have a guard")]
    InitialGuard { initial: String, location: Loc },

    #[error("{location}: initial {initial:?} cannot have triggers")]
    InitialTrigger { initial: String, location: Loc },

    #[error("{location}: initial {initial:?} cannot have multiple transitions")]
    MultipleInitialTransitions { initial: String, location: Loc },

    #[error("{location}: initial {initial:?} must target a state nested under {owner:?}, not {target:?}")]
    InitialTarget {
        initial: String,
        owner: String,
        target: String,
        location: Loc,
    },

    #[error("{location}: choice {choice:?} requires at least one outgoing transition")]
    EmptyChoice { choice: String, location: Loc },

    #[error("{location}: the last transition of choice {choice:?} cannot have a guard")]
    GuardedChoiceDefault { choice: String, location: Loc },

    #[error("{location}: internal transition {transition:?} requires at least one effect")]
    InternalWithoutEffect { transition: String, location: Loc },

    #[error("{location}: top-level transitions must declare both source and target, or neither")]
    PartialTopLevelTransition { transition: String, location: Loc },

    #[error("{location}: final state {state:?} cannot have outgoing transitions")]
    FinalStateTransitions { state: String, location: Loc },

    #[error("{location}: timed triggers require a state source, got {src:?}")]
    TimerSource { src: String, location: Loc },
}
