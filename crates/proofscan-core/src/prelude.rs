//! Common imports pulled in across the workspace: std types and the handful
//! of external crates that show up in nearly every module.

pub use std::sync::Arc;
pub use std::time::Duration;

pub use anyhow::{Context as _, Result as AnyResult};
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, error, info, trace, warn};
