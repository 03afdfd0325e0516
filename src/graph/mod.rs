//! Knowledge graph: ontology, record mapping and the in-memory accumulator.
//!
//! - [`vocab`]: the fixed paper ontology (classes and properties)
//! - [`mapper`]: deterministic identifier minting and record → triple mapping
//! - [`accumulator`]: concurrent set-of-triples graph shared by the pipeline stages

pub mod accumulator;
pub mod mapper;
pub mod vocab;

pub use accumulator::{EntityCounts, GraphAccumulator, ntriples_line};
pub use mapper::GraphMapper;
pub use vocab::{EntityKind, Vocab};
