//! The ProofScan core library: the MCP/A2A transport and session layer, the
//! aggregating proxy, the HTTP gateway, and the SQLite-backed event store
//! that every surface above the core reads from.
//!
//! This crate is intentionally "heavy middle, thin edges": the command-line
//! dispatcher in `proofscan-app` wires these pieces together and owns
//! process lifecycle; this crate owns the protocol, concurrency, and
//! persistence semantics described in `SPEC_FULL.md`.

pub mod adapter;
pub mod agentcard;
pub mod config;
pub mod error;
pub mod gateway;
pub mod proxy;
pub mod queue;
pub mod recorder;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
