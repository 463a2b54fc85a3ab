//! Protocol drivers used by workloads to talk to the system under test.
//!
//! Drivers record their own request metrics through the VU's recorder, so a
//! workload only decides what to send and how to check the answer. Failures are
//! returned as [`IterationError`](crate::IterationError)s and recorded, never
//! raised past the iteration.
pub mod grpc;
pub mod http;
pub mod ws;

pub use grpc::{ConnectOptions, GrpcClient, GrpcResponse, StringFields};
pub use http::{HttpDriver, HttpOptions, HttpResponse};
pub use ws::{Socket, SocketHandler, SocketState, WsParams, WsResponse};
