//! Unary gRPC calls over a per-VU persistent channel.
//!
//! Requests and responses are plain `prost` messages, so generated types can be
//! used directly. [`StringFields`] covers the common case of a message made of
//! string fields without generating code at all.

use std::{collections::BTreeMap, time::Duration};

use prost::{
    DecodeError, Message,
    bytes::{Buf, BufMut},
    encoding::{self, DecodeContext, WireType},
};
use tokio::time::Instant;
use tonic::{
    Code,
    client::Grpc,
    codec::ProstCodec,
    codegen::http::uri::PathAndQuery,
    transport::{Channel, ClientTlsConfig, Endpoint},
};
use typed_builder::TypedBuilder;

use crate::{
    aggregator::Recorder,
    error::IterationError,
    metric::{Protocol, RequestOutcome, Tags},
};

#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct ConnectOptions {
    /// Connect without TLS.
    #[builder(default)]
    pub plaintext: bool,
    /// Applies to establishing the connection and to every call on it.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GrpcResponse<R> {
    pub status: Code,
    /// Present when `status` is OK.
    pub message: Option<R>,
    pub latency: Duration,
}

impl<R> GrpcResponse<R> {
    pub fn is_ok(&self) -> bool {
        self.status == Code::Ok
    }
}

/// A gRPC client owned by one VU. Connect once, then invoke on every iteration.
pub struct GrpcClient {
    recorder: Recorder,
    inner: Option<Grpc<Channel>>,
    connects: u64,
    timeout: Option<Duration>,
}

impl GrpcClient {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            inner: None,
            connects: 0,
            timeout: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    /// How many times [`GrpcClient::connect`] succeeded.
    pub fn connect_count(&self) -> u64 {
        self.connects
    }

    /// Open the channel to `address` (`host:port` or a full URI).
    ///
    /// The channel reconnects on its own if the connection later drops.
    pub async fn connect(
        &mut self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<(), IterationError> {
        let uri = if address.contains("://") {
            address.to_string()
        } else if options.plaintext {
            format!("http://{address}")
        } else {
            format!("https://{address}")
        };
        let mut endpoint =
            Endpoint::from_shared(uri).map_err(|e| IterationError::Usage(e.to_string()))?;
        if let Some(timeout) = options.timeout {
            endpoint = endpoint.connect_timeout(timeout).timeout(timeout);
        }
        if !options.plaintext {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| IterationError::Usage(e.to_string()))?;
        }

        let start = Instant::now();
        match endpoint.connect().await {
            Ok(channel) => {
                self.inner = Some(Grpc::new(channel));
                self.connects += 1;
                self.timeout = options.timeout;
                tracing::debug!(address, "gRPC channel connected");
                Ok(())
            }
            Err(e) => {
                let err = IterationError::Connection(e.to_string());
                tracing::warn!(address, error = %err, "gRPC connect failed");
                self.recorder
                    .outcome(RequestOutcome::failed(Protocol::Grpc, start.elapsed(), &err));
                Err(err)
            }
        }
    }

    /// Issue a unary call to `method` (`/package.Service/Method`).
    ///
    /// A non-OK status is a response, recorded as failed. Misuse (no connection,
    /// malformed method path) and calls cut off by the connection timeout are
    /// errors.
    pub async fn invoke<M, R>(
        &mut self,
        method: &str,
        message: M,
    ) -> Result<GrpcResponse<R>, IterationError>
    where
        M: Message + Send + Sync + 'static,
        R: Message + Default + Send + Sync + 'static,
    {
        let Some(grpc) = self.inner.as_mut() else {
            return Err(IterationError::Usage(
                "invoke called before connect".to_string(),
            ));
        };
        let path = if method.starts_with('/') {
            method.to_string()
        } else {
            format!("/{method}")
        };
        let path = PathAndQuery::try_from(path)
            .map_err(|e| IterationError::Usage(format!("invalid method {method:?}: {e}")))?;

        let mut tags = Tags::new();
        tags.insert("method".into(), path.path().to_string());

        let start = Instant::now();
        if let Err(e) = grpc.ready().await {
            let err = IterationError::Connection(e.to_string());
            self.recorder.outcome(
                RequestOutcome::failed(Protocol::Grpc, start.elapsed(), &err).with_tags(tags),
            );
            return Ok(GrpcResponse {
                status: Code::Unavailable,
                message: None,
                latency: start.elapsed(),
            });
        }
        let result = grpc
            .unary(
                tonic::Request::new(message),
                path,
                ProstCodec::<M, R>::default(),
            )
            .await;
        let latency = start.elapsed();

        let (status, message) = match result {
            Ok(response) => (Code::Ok, Some(response.into_inner())),
            Err(status) => {
                tracing::debug!(method, code = ?status.code(), message = status.message(), "gRPC call failed");
                let timed_out = self
                    .timeout
                    .filter(|after| is_timeout(&status, latency, *after));
                if let Some(after) = timed_out {
                    let err = IterationError::Timeout { after };
                    self.recorder.outcome(
                        RequestOutcome::failed(Protocol::Grpc, after, &err).with_tags(tags),
                    );
                    return Err(err);
                }
                (status.code(), None)
            }
        };
        self.recorder.outcome(
            RequestOutcome::succeeded(Protocol::Grpc, status as i32 as u16, latency, status == Code::Ok)
                .with_tags(tags),
        );
        Ok(GrpcResponse {
            status,
            message,
            latency,
        })
    }
}

/// The client-side timeout surfaces as `Cancelled`, a deadline enforced by the
/// server as `DeadlineExceeded`.
fn is_timeout(status: &tonic::Status, latency: Duration, after: Duration) -> bool {
    matches!(status.code(), Code::Cancelled | Code::DeadlineExceeded) && latency >= after
}

/// A message whose fields are all strings, keyed by field number.
///
/// Encodes `{1: "Bert"}` the same way as `message HelloRequest { string name = 1; }`.
/// Non-string fields of a decoded message are skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringFields(pub BTreeMap<u32, String>);

impl StringFields {
    pub fn get(&self, field: u32) -> Option<&str> {
        self.0.get(&field).map(String::as_str)
    }
}

impl<const N: usize> From<[(u32, &str); N]> for StringFields {
    fn from(fields: [(u32, &str); N]) -> Self {
        Self(fields.into_iter().map(|(k, v)| (k, v.to_string())).collect())
    }
}

impl Message for StringFields {
    fn encode_raw(&self, buf: &mut impl BufMut)
    where
        Self: Sized,
    {
        for (tag, value) in &self.0 {
            encoding::string::encode(*tag, value, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        if wire_type != WireType::LengthDelimited {
            return encoding::skip_field(wire_type, tag, buf, ctx);
        }
        let mut raw = Vec::new();
        encoding::bytes::merge(wire_type, &mut raw, buf, ctx)?;
        self.0
            .insert(tag, String::from_utf8_lossy(&raw).into_owned());
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        self.0
            .iter()
            .map(|(tag, value)| encoding::string::encoded_len(*tag, value))
            .sum()
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}
