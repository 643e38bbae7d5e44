//! The read/write (RW) graph: the program representation consumed by the
//! memory-SSA analysis in `memdep-analysis`.
//!
//! A program is a set of [`Subgraph`]s (procedures), each a CFG of
//! [`Block`]s holding [`RwNode`]s in program order. Every node describes its
//! memory behavior through three disjoint [`DefSite`] lists: may-writes
//! (`defs`), must-writes (`overwrites`), and reads (`uses`). Calls either
//! branch into defined callee subgraphs or stand for an external function
//! summarized by a single node.
//!
//! All entities live in append-only arenas addressed by `u32` index
//! newtypes, so references between them are stable as the analysis grows the
//! graph with phi and mu nodes.

pub mod idx;

mod block;
mod defsite;
mod errors;
mod graph;
mod node;
mod offset;

pub use block::{Block, BlockId, BlockKind};
pub use defsite::{DefSite, MemId, Target};
pub use errors::{GraphError, GraphResult};
pub use graph::{RwGraph, Subgraph, SubgraphId};
pub use node::{CallTarget, CallTargets, DefUse, NodeId, NodeKind, RwNode};
pub use offset::Offset;
