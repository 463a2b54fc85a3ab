//! Workloads described entirely in the options file, for use from the CLI.
//!
//! ```yaml
//! workload:
//!   grpc:
//!     address: 127.0.0.1:50051
//!     plaintext: true
//!     method: /helloworld.Greeter/SayHello
//!     message: { 1: Bert }
//! ```

use std::{collections::BTreeMap, time::Duration};

use reqwest::Method;
use serde::Deserialize;

use crate::{
    config::duration,
    driver::{
        ConnectOptions, GrpcClient, HttpDriver, HttpOptions, Socket, SocketHandler,
        StringFields, WsParams, http, ws,
    },
    error::{ConfigError, IterationError, Result},
    metric::Tags,
    vu::VuContext,
    workload::Workload,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkloadConfig {
    Http(HttpRequestConfig),
    Grpc(GrpcCallConfig),
    Websocket(WsSessionConfig),
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            WorkloadConfig::Http(c) => c.validate(),
            WorkloadConfig::Grpc(c) => c.validate(),
            WorkloadConfig::Websocket(c) => c.validate(),
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// One HTTP request per iteration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(with = "duration::option", default)]
    pub timeout: Option<Duration>,
    /// `name` tag, grouping URLs that differ only in query strings.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

impl HttpRequestConfig {
    fn method(&self) -> Result<Method, ConfigError> {
        Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ConfigError::InvalidWorkload(format!("invalid HTTP method {:?}", self.method)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.method()?;
        reqwest::Url::parse(&self.url)
            .map_err(|e| ConfigError::InvalidWorkload(format!("url {:?}: {e}", self.url)))?;
        Ok(())
    }
}

/// One unary call per iteration on a per-VU connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcCallConfig {
    pub address: String,
    #[serde(default)]
    pub plaintext: bool,
    pub method: String,
    /// String fields of the request, by field number.
    #[serde(default)]
    pub message: BTreeMap<u32, String>,
    #[serde(with = "duration::option", default)]
    pub timeout: Option<Duration>,
}

impl GrpcCallConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::InvalidWorkload("grpc address is empty".into()));
        }
        if self.method.trim_start_matches('/').split('/').count() != 2 {
            return Err(ConfigError::InvalidWorkload(format!(
                "grpc method {:?} is not of the form package.Service/Method",
                self.method
            )));
        }
        Ok(())
    }
}

/// One WebSocket session per iteration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsSessionConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Tags,
    /// Sent once the socket opens, then on every `interval`.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(with = "duration::option", default)]
    pub interval: Option<Duration>,
    /// Close the socket after this long; without it the session lasts until the
    /// peer closes or the iteration is interrupted.
    #[serde(with = "duration::option", default)]
    pub session_duration: Option<Duration>,
    #[serde(with = "duration::option", default)]
    pub connect_timeout: Option<Duration>,
}

impl WsSessionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidWorkload(format!(
                "websocket url {:?} must start with ws:// or wss://",
                self.url
            )));
        }
        if self.interval.is_some_and(|i| i.is_zero()) {
            return Err(ConfigError::InvalidWorkload(
                "websocket interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

pub struct HttpWorkload {
    config: HttpRequestConfig,
    method: Method,
    options: HttpOptions,
    client: reqwest::Client,
}

impl HttpWorkload {
    pub fn new(config: HttpRequestConfig, insecure_skip_tls_verify: bool) -> Result<Self> {
        let method = config.method()?;
        let options = HttpOptions {
            headers: config.headers.clone().into_iter().collect(),
            timeout: config.timeout,
            tags: config.tags.clone(),
            name: config.name.clone(),
        };
        Ok(Self {
            client: http::client(insecure_skip_tls_verify)?,
            config,
            method,
            options,
        })
    }
}

impl Workload for HttpWorkload {
    type Vu = HttpDriver;

    async fn init_vu(&self, ctx: &VuContext) -> HttpDriver {
        HttpDriver::new(self.client.clone(), ctx.recorder().clone())
    }

    async fn iteration(&self, driver: &mut HttpDriver, _ctx: &VuContext) -> Result<(), IterationError> {
        let body = self.config.body.clone().map(String::into_bytes);
        driver
            .request(self.method.clone(), &self.config.url, body, &self.options)
            .await?;
        Ok(())
    }
}

pub struct GrpcWorkload {
    config: GrpcCallConfig,
    connect: ConnectOptions,
    message: StringFields,
}

impl GrpcWorkload {
    pub fn new(config: GrpcCallConfig, insecure_skip_tls_verify: bool) -> Self {
        if insecure_skip_tls_verify && !config.plaintext {
            tracing::warn!("insecureSkipTLSVerify is not applied to gRPC connections");
        }
        Self {
            connect: ConnectOptions {
                plaintext: config.plaintext,
                timeout: config.timeout,
            },
            message: StringFields(config.message.clone()),
            config,
        }
    }
}

impl Workload for GrpcWorkload {
    type Vu = GrpcClient;

    async fn init_vu(&self, ctx: &VuContext) -> GrpcClient {
        GrpcClient::new(ctx.recorder().clone())
    }

    /// Connects on the first iteration, and again on later ones only if that failed.
    async fn iteration(&self, client: &mut GrpcClient, ctx: &VuContext) -> Result<(), IterationError> {
        if !client.is_connected() {
            client.connect(&self.config.address, &self.connect).await?;
        }
        let response = client
            .invoke::<_, StringFields>(&self.config.method, self.message.clone())
            .await?;
        ctx.check("status is OK", response.is_ok());
        Ok(())
    }
}

pub struct WsWorkload {
    config: WsSessionConfig,
}

impl WsWorkload {
    pub fn new(config: WsSessionConfig) -> Self {
        Self { config }
    }
}

impl Workload for WsWorkload {
    type Vu = ();

    async fn init_vu(&self, _ctx: &VuContext) {}

    async fn iteration(&self, _: &mut (), ctx: &VuContext) -> Result<(), IterationError> {
        let params = WsParams {
            headers: self.config.headers.clone().into_iter().collect(),
            tags: self.config.tags.clone(),
            insecure_skip_tls_verify: ctx.insecure_skip_tls_verify(),
            connect_timeout: self.config.connect_timeout,
        };
        let mut handler = Repeater {
            message: self.config.message.clone(),
            interval: self.config.interval,
            session_duration: self.config.session_duration,
            close_timer: None,
        };
        let response = ws::connect(ctx.recorder(), &self.config.url, &params, &mut handler).await?;
        ctx.check("status is 101", response.status == 101);
        Ok(())
    }
}

/// Sends `message` on open and on every tick of `interval`.
struct Repeater {
    message: Option<String>,
    interval: Option<Duration>,
    session_duration: Option<Duration>,
    close_timer: Option<ws::TimerId>,
}

impl SocketHandler for Repeater {
    fn on_open(&mut self, socket: &mut Socket) {
        if let Some(message) = &self.message {
            socket.send_text(message.clone());
        }
        if let Some(interval) = self.interval {
            socket.set_interval(interval);
        }
        if let Some(after) = self.session_duration {
            self.close_timer = Some(socket.set_timeout(after));
        }
    }

    fn on_timer(&mut self, socket: &mut Socket, timer: ws::TimerId) {
        if Some(timer) == self.close_timer {
            socket.close();
        } else if let Some(message) = &self.message {
            socket.send_text(message.clone());
        }
    }

    fn on_close(&mut self, code: Option<u16>) {
        tracing::debug!(?code, "Socket closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_protocol() {
        let http: WorkloadConfig = serde_yaml::from_str(
            r#"
http:
  method: post
  url: http://localhost:8001/spot/orders?a=b
  body: '{"market":"BTC_USDT"}'
  headers: { Content-Type: application/json, X-User-ID: "1" }
  timeout: 1s
"#,
        )
        .unwrap();
        let WorkloadConfig::Http(req) = &http else {
            panic!("expected http");
        };
        assert_eq!(req.timeout, Some(Duration::from_secs(1)));
        assert_eq!(req.method().unwrap(), Method::POST);
        assert!(http.validate().is_ok());

        let grpc: WorkloadConfig = serde_yaml::from_str(
            "grpc:\n  address: 127.0.0.1:50051\n  plaintext: true\n  method: /helloworld.Greeter/SayHello\n  message: { 1: Bert }\n",
        )
        .unwrap();
        assert!(grpc.validate().is_ok());

        let ws: WorkloadConfig = serde_yaml::from_str(
            "websocket:\n  url: ws://127.0.0.1:8001/websocket\n  message: hi\n  interval: 100ms\n",
        )
        .unwrap();
        assert!(ws.validate().is_ok());
    }

    #[test]
    fn rejects_bad_targets() {
        let bad = [
            "http:\n  url: not a url\n",
            "http:\n  method: \"GE T\"\n  url: http://x\n",
            "grpc:\n  address: x:1\n  method: SayHello\n",
            "websocket:\n  url: http://x\n",
            "websocket:\n  url: ws://x\n  interval: 0s\n",
        ];
        for raw in bad {
            let cfg: WorkloadConfig = serde_yaml::from_str(raw).unwrap();
            assert!(
                matches!(cfg.validate(), Err(ConfigError::InvalidWorkload(_))),
                "{raw}"
            );
        }
    }
}
