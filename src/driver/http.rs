use std::time::Duration;

use reqwest::{Client, Method};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::{
    aggregator::Recorder,
    error::{Error, IterationError, Result},
    metric::{Protocol, RequestOutcome, Tags},
};

/// Per-call timeout applied when a request does not set its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the pooled keep-alive client shared by every VU of a workload.
pub fn client(insecure_skip_tls_verify: bool) -> Result<Client> {
    Client::builder()
        .danger_accept_invalid_certs(insecure_skip_tls_verify)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .build()
        .map_err(|e| Error::Client {
            protocol: "http",
            reason: e.to_string(),
        })
}

#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct HttpOptions {
    #[builder(default)]
    pub headers: Vec<(String, String)>,
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
    /// Extra tags for the samples of this request.
    #[builder(default)]
    pub tags: Tags,
    /// Value of the `name` tag; defaults to the URL.
    #[builder(default, setter(strip_option, into))]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub latency: Duration,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// 2xx and 3xx.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }
}

/// Issues requests on behalf of one VU and records `http_reqs`,
/// `http_req_duration` and `http_req_failed` for each.
///
/// Clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpDriver {
    client: Client,
    recorder: Recorder,
}

impl HttpDriver {
    pub fn new(client: Client, recorder: Recorder) -> Self {
        Self { client, recorder }
    }

    pub async fn get(
        &self,
        url: &str,
        options: &HttpOptions,
    ) -> Result<HttpResponse, IterationError> {
        self.request(Method::GET, url, None, options).await
    }

    pub async fn post(
        &self,
        url: &str,
        body: impl Into<Vec<u8>>,
        options: &HttpOptions,
    ) -> Result<HttpResponse, IterationError> {
        self.request(Method::POST, url, Some(body.into()), options)
            .await
    }

    /// A non-2xx/3xx status is returned as a response and recorded as failed.
    /// Timeouts and connection errors come back as [`IterationError`]s and are
    /// recorded too.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        options: &HttpOptions,
    ) -> Result<HttpResponse, IterationError> {
        let timeout = options.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let mut tags = options.tags.clone();
        tags.insert("method".into(), method.to_string());
        tags.insert(
            "name".into(),
            options.name.clone().unwrap_or_else(|| url.to_string()),
        );

        let mut req = self.client.request(method, url).timeout(timeout);
        for (k, v) in &options.headers {
            req = req.header(k, v);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        let start = Instant::now();
        let result = async {
            let resp = req.send().await?;
            let status = resp.status().as_u16();
            // reading the body to the end returns the connection to the pool
            let body = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, body.to_vec()))
        }
        .await;
        let latency = start.elapsed();

        match result {
            Ok((status, body)) => {
                let response = HttpResponse {
                    status,
                    latency,
                    body,
                };
                self.recorder.outcome(
                    RequestOutcome::succeeded(
                        Protocol::Http,
                        status,
                        latency,
                        response.is_success(),
                    )
                    .with_tags(tags),
                );
                Ok(response)
            }
            Err(e) => {
                let (err, latency) = classify(e, timeout, latency);
                tracing::debug!(url, error = %err, "HTTP request failed");
                self.recorder
                    .outcome(RequestOutcome::failed(Protocol::Http, latency, &err).with_tags(tags));
                Err(err)
            }
        }
    }
}

fn classify(e: reqwest::Error, timeout: Duration, latency: Duration) -> (IterationError, Duration) {
    if e.is_timeout() {
        (IterationError::Timeout { after: timeout }, timeout)
    } else if e.is_connect() {
        (IterationError::Connection(e.to_string()), latency)
    } else if e.is_builder() {
        (IterationError::Usage(e.to_string()), latency)
    } else {
        (IterationError::Protocol(e.to_string()), latency)
    }
}
