//! Static binary analysis core for performance tuning.
//!
//! From a decoded machine-instruction stream, this crate rebuilds the
//! higher-level structure of the program: basic blocks, control-flow and
//! call graphs, dominance trees, connected components, loop nests, acyclic
//! paths, live registers, SSA form and instruction-level data-dependency
//! graphs, plus the scheduling metrics (RecMII, critical paths) derived
//! from them. Binary parsing and instruction decoding are the caller's job:
//! instructions enter through [`program::builder::ProgramBuilder`].

pub mod analysis;
pub mod error;
pub mod graph;
pub mod program;

pub use error::CoreError;
pub use program::Program;
