//! Shared runtime for the KEDA HTTP connectors.
//!
//! Each broker driver crate supplies a source (and a sink) for its broker
//! family and plugs them into one of the dispatch engines in [`engine`].
//! Everything else, from metadata parsing and HTTP invocation to the error
//! envelope, sink routing policy, and lifecycle, lives here and is
//! identical across brokers.

pub mod config;
pub mod engine;
pub mod envelope;
pub mod invoker;
pub mod lifecycle;
pub mod message;
pub mod router;

pub use config::ConnectorMetadata;
pub use envelope::ErrorEnvelope;
pub use invoker::{HttpInvoker, InvokeResponse};
pub use lifecycle::{ConnectorState, Lifecycle};
pub use message::SourceMessage;
pub use router::{OutboundResponse, Sink, SinkRouter};
