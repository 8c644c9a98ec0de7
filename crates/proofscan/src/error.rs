//! Error taxonomy. Each subsystem owns its own error enum; this module only
//! defines the umbrella type process-entry code uses when it needs one
//! return type across subsystems.

use thiserror::Error;

use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::store::PersistenceError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Persistence(#[from] PersistenceError),
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error(transparent)]
	Queue(#[from] QueueError),
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
