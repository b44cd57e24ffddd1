//! Domain types shared by the Territorium result-ingestion crates.
//!
//! Everything in here is free of database and broker dependencies: the
//! completion envelope codec, the job state machine, the retention window
//! and the artifact store contract with its filesystem and in-memory
//! implementations.

pub mod artifact;
pub mod envelope;
pub mod error;
pub mod job_state;
pub mod retention;
pub mod types;
