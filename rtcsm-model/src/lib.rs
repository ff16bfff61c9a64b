//! # rtcsm-model
//!
//! Static model for rtcsm.
//!
//! This crate provides:
//! - The immutable vertex/region/transition arena shared by every execution
//! - Ancestor and least-common-ancestor queries over that arena
//! - Behaviour types (guards, effects, activities, timer delays) and events
//! - Guard expression evaluation for JSON contexts
//! - JSON machine definitions, including submachine templates

pub mod behavior;
pub mod builder;
pub mod definition;
pub mod error;
pub mod guard;
pub mod ids;
pub mod machine;
pub mod transition;
pub mod vertex;

pub use behavior::{
    ActionFn, ActivityFn, BehaviorError, Delay, DelayFn, Event, EventKind, Guard, GuardFn,
};
pub use builder::{ModelBuilder, TransitionSpec};
pub use definition::{MachineDefinition, MachineDefinitionRaw};
pub use error::ModelError;
pub use guard::{GuardEvaluator, GuardExpr};
pub use ids::{RegionId, TransitionId, VertexId};
pub use machine::StateMachine;
pub use transition::{Transition, TransitionKind};
pub use vertex::{
    Owner, PseudoKind, Region, RegionOwner, StateBehavior, StateShape, Vertex, VertexKind,
};
