//! Error kinds for the broker-adapter subsystem. Each maps to a fate
//! described in the design: logged-and-continue, retried-by-a-supervisor,
//! or surfaced to the caller.

use thiserror::Error;

pub use crate::wrapper::{DecodeError, WrapError};

#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to dial broker: {0}")]
    Connect(#[source] lapin::Error),
    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),
}

#[derive(Debug, Error)]
pub enum DeclareError {
    #[error("failed to declare exchange {name}: {source}")]
    Exchange { name: String, #[source] source: lapin::Error },
    #[error("failed to declare queue {name}: {source}")]
    Queue { name: String, #[source] source: lapin::Error },
    #[error("failed to bind queue {queue} to exchange {exchange}: {source}")]
    Bind { queue: String, exchange: String, #[source] source: lapin::Error },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to publish message: {0}")]
    Broker(#[source] lapin::Error),
    #[error(transparent)]
    Wrap(#[from] WrapError),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Declare(#[from] DeclareError),
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Declare(#[from] DeclareError),
    #[error("failed to register consumer: {0}")]
    Register(#[source] lapin::Error),
}
