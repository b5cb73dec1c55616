//! `reqwest`-backed transport for `tcp://` (plain HTTP) and `ssl://` (HTTPS) endpoints.

use std::time::Duration;

use async_trait::async_trait;
use clustercomm_core::{endpoint_to_url, Answer, ErrorCode, Headers};
use tracing::debug;

use super::{SendProgress, Transport, TransportError, TransportRequest};

/// HTTP transport; one instance (and connection pool) per worker.
///
/// The connect timeout is fixed per client. The overall timeout comes with
/// each request and is enforced by reqwest, so a request that was written but
/// never answered reports `send_was_complete`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a transport whose client uses `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: TransportRequest,
        progress: &SendProgress,
    ) -> Result<Answer, TransportError> {
        let Some(base) = endpoint_to_url(&request.endpoint) else {
            return Err(TransportError::Unreachable {
                endpoint: request.endpoint,
                message: "unsupported endpoint scheme".to_string(),
            });
        };
        let url = format!("{base}{}", request.path);
        debug!(method = %request.method, %url, "sending cluster request");

        let mut builder = self.client.request(request.method, &url);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            // Connect-phase failures leave nothing on the wire.
            Err(err) if err.is_connect() => {
                return Err(TransportError::Unreachable {
                    endpoint: request.endpoint,
                    message: err.to_string(),
                });
            }
            Err(err) => {
                progress.mark_sent();
                return Err(classify(&err));
            }
        };
        progress.mark_sent();

        let status_code = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let body = response.bytes().await.map_err(|err| classify(&err))?;

        Ok(Answer {
            status_code,
            headers,
            body,
        })
    }

    fn enforces_timeout(&self) -> bool {
        true
    }
}

/// Maps a failure that happened after the connection was established.
fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Failed {
            code: ErrorCode::CLUSTER_CONNECTION_LOST,
            message: err.to_string(),
        }
    }
}
