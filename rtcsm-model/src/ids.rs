//! Arena identifiers.
//!
//! Every vertex, region and transition lives in a flat arena inside
//! [`StateMachine`](crate::StateMachine); these ids are indices into it.
//! They are only meaningful for the model that produced them. Portable
//! identity (snapshots, definitions) uses the string keys instead.

use std::fmt;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub(crate) fn new(index: usize) -> Self {
                Self(index as u32)
            }

            /// Returns the arena index.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(
    /// Identifies a state, pseudostate or final state.
    VertexId,
    "v"
);
arena_id!(
    /// Identifies a region.
    RegionId,
    "r"
);
arena_id!(
    /// Identifies a transition.
    TransitionId,
    "t"
);
