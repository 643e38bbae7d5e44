//! Demand-driven memory-SSA construction and reaching definitions over a
//! read/write graph.
//!
//! The entry point is [`MemorySsa`]: hand it an [`RwGraph`], call
//! [`MemorySsa::run`] once, then ask for the definitions reaching a use with
//! [`MemorySsa::definitions_of`] or probe an arbitrary program point with
//! [`MemorySsa::definitions_at`]. Queries are byte-interval precise,
//! flow-sensitive, and cross call boundaries in both directions; answers
//! contain only real writers, never the phi nodes the search materializes
//! along the way.
//!
//! [`RwGraph`]: memdep_ir::RwGraph

mod definitions;
mod intervals;
mod memory_ssa;

pub use definitions::{Definitions, DefinitionsMap, join_definitions};
pub use intervals::{Interval, IntervalMap, NodeSet};
pub use memory_ssa::{MemorySsa, SubgraphSummary};
