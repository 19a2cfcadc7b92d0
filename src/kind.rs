//! Element and event taxonomy.
//!
//! Every element in a model carries a [`Kind`]: a bit set in which broader
//! categories are encoded as shared bits, so membership tests like "is this a
//! vertex" are a single mask comparison. `Kind::STATE.is(Kind::VERTEX)` holds
//! because every state is a vertex; the reverse does not.

use serde::{Deserialize, Serialize};

/// A bit set identifying what an element (or event) is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub u64);

impl Kind {
    /// The zero kind; events dispatched with it are normalized to [`Kind::EVENT`].
    pub const NONE: Kind = Kind(0);

    pub const ELEMENT: Kind = Kind(1);

    // Vertices.
    pub const VERTEX: Kind = Kind(1 << 1 | Self::ELEMENT.0);
    pub const STATE: Kind = Kind(1 << 2 | Self::VERTEX.0);
    pub const STATE_MACHINE: Kind = Kind(1 << 3 | Self::STATE.0);
    pub const FINAL_STATE: Kind = Kind(1 << 4 | Self::VERTEX.0);
    pub const PSEUDOSTATE: Kind = Kind(1 << 5 | Self::VERTEX.0);
    pub const INITIAL: Kind = Kind(1 << 6 | Self::PSEUDOSTATE.0);
    pub const CHOICE: Kind = Kind(1 << 7 | Self::PSEUDOSTATE.0);

    // Non-vertex elements.
    pub const TRANSITION: Kind = Kind(1 << 8 | Self::ELEMENT.0);
    pub const BEHAVIOR: Kind = Kind(1 << 9 | Self::ELEMENT.0);
    pub const CONCURRENT: Kind = Kind(1 << 10 | Self::BEHAVIOR.0);
    pub const CONSTRAINT: Kind = Kind(1 << 11 | Self::ELEMENT.0);

    // Events.
    pub const EVENT: Kind = Kind(1 << 12 | Self::ELEMENT.0);
    pub const COMPLETION_EVENT: Kind = Kind(1 << 13 | Self::EVENT.0);
    pub const TIME_EVENT: Kind = Kind(1 << 14 | Self::EVENT.0);
    pub const ERROR_EVENT: Kind = Kind(1 << 15 | Self::EVENT.0);

    // Transition kinds, derived once at build time.
    pub const INTERNAL: Kind = Kind(1 << 16 | Self::TRANSITION.0);
    pub const EXTERNAL: Kind = Kind(1 << 17 | Self::TRANSITION.0);
    pub const LOCAL: Kind = Kind(1 << 18 | Self::TRANSITION.0);
    pub const SELF_TRANSITION: Kind = Kind(1 << 19 | Self::TRANSITION.0);

    /// Returns true if `self` is (a refinement of) `kind`.
    pub fn is(self, kind: Kind) -> bool {
        self.0 & kind.0 == kind.0
    }

    /// Returns true if `self` is (a refinement of) any of `kinds`.
    pub fn is_any(self, kinds: &[Kind]) -> bool {
        kinds.iter().any(|k| self.is(*k))
    }
}
