//! The broker-adapter subsystem: topology declaration, connection and
//! channel supervision, the at-least-once delivery loop, and the
//! endpoint registrar that dispatches deliveries to local services.

pub mod broker;
pub mod config;
pub mod error;
pub mod registrar;
pub mod waitfor;
pub mod wrapper;

pub use broker::{Broker, ConsumerCallback, ConsumerDescriptor, DestinationMode};
pub use registrar::{GrpcDispatcher, Registrar};
pub use wrapper::{JsonWrapper, Wrapper};
