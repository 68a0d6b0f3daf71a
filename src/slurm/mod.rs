// src/slurm/mod.rs

//! Cluster backend: translates the active subgraph into Slurm submissions
//! with equivalent dependency semantics.

pub mod script;
pub mod submit;

pub use script::{dependency_spec, format_indices, render_script};
pub use submit::SlurmBackend;
