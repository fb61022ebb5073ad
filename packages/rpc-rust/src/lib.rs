//! `mqrpc` -- request/response RPC over a message broker.
//!
//! A client publishes a request tagged with a correlation id and its private
//! reply queue; a server consumes the shared request queue, runs the handler
//! registered for the request's operation and publishes the result back. The
//! client resolves the waiting caller when the matching reply arrives.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;
pub mod service;
pub mod telemetry;
pub mod transport;

pub use client::{ReplyHandle, RpcClient};
pub use config::{BackoffConfig, RpcConfig};
pub use connection::ConnectionState;
pub use error::{ConnectionError, RpcError, TransportError};
pub use server::RpcServer;
pub use service::{HandlerRegistry, OperationHandler};
pub use transport::{AmqpBroker, Broker, InMemoryBroker};

pub use mqrpc_core::{CorrelationId, ResponseBody};
