//! Shared utilities used by both the `proofscan` library and the `proofscan-app` binary.

pub mod bow;
pub mod ids;
pub mod prelude;
pub mod telemetry;

pub use bow::OwnedOrBorrowed;
