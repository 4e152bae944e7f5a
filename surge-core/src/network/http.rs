//! Production transport using reqwest against a speed test backend.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_ENCODING;
use reqwest::{Body, Client, Response};
use url::Url;

use super::{
    ClientLookupQuery, PingTiming, ProgressSink, Transport, TransportCapabilities, TransportError,
};
use crate::config::ServerConfig;
use crate::measurement::TelemetryReport;

/// Size of the pieces an upload body is streamed in.
const UPLOAD_PIECE_BYTES: usize = 64 * 1024;

/// HTTP transport talking to a LibreSpeed-compatible backend.
///
/// Transfers have no request timeout; only the connect timeout applies, so
/// throughput phases stay bounded by their own stop condition. Ping, client
/// lookup and telemetry requests use the configured request timeout.
pub struct HttpTransport {
    client: Client,
    base: Url,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Creates a transport for the server described by `config`.
    ///
    /// # Errors
    ///
    /// - `TransportError::InvalidUrl` - Base URL cannot be parsed
    /// - `TransportError::ConnectionFailed` - HTTP client could not be built
    pub fn new(config: &ServerConfig) -> Result<Self, TransportError> {
        let mut raw = config.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).map_err(|e| TransportError::InvalidUrl {
            endpoint: config.base_url.clone(),
            reason: e.to_string(),
        })?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| TransportError::ConnectionFailed {
                url: base.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base,
            request_timeout: config.request_timeout,
        })
    }

    /// Base URL endpoints are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Resolves `endpoint` with extra query pairs and a cache-busting `r`.
    fn endpoint_url(
        &self,
        endpoint: &str,
        extra: &[(&str, String)],
    ) -> Result<Url, TransportError> {
        let mut url = self
            .base
            .join(endpoint)
            .map_err(|e| TransportError::InvalidUrl {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in extra {
                query.append_pair(key, value);
            }
            query.append_pair("r", &rand::random::<f64>().to_string());
        }
        Ok(url)
    }
}

fn request_error(url: &Url, error: reqwest::Error) -> TransportError {
    let reason = if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        "connection refused or unreachable".to_string()
    } else {
        error.to_string()
    };
    TransportError::ConnectionFailed {
        url: url.to_string(),
        reason,
    }
}

fn check_status(url: &Url, response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransportError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

fn body_error(error: reqwest::Error) -> TransportError {
    TransportError::Stream {
        reason: error.to_string(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            upload_progress: true,
            precise_timing: true,
            ..TransportCapabilities::default()
        }
    }

    async fn download(
        &self,
        endpoint: &str,
        chunk_mib: u32,
        progress: &ProgressSink,
    ) -> Result<(), TransportError> {
        let url = self.endpoint_url(endpoint, &[("ckSize", chunk_mib.to_string())])?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        let response = check_status(&url, response)?;

        let mut loaded = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(body_error)?;
            loaded += chunk.len() as u64;
            progress.report(loaded);
        }
        tracing::trace!("Download transfer from {} finished after {} bytes", url, loaded);
        Ok(())
    }

    /// Streams `payload` to the upload endpoint.
    ///
    /// Progress counts bytes as the HTTP client pulls each piece into the
    /// request body, not bytes acknowledged by the server. Early readings
    /// can therefore run ahead of the wire by up to the socket buffer plus
    /// one piece.
    async fn upload(
        &self,
        endpoint: &str,
        payload: Bytes,
        progress: &ProgressSink,
    ) -> Result<(), TransportError> {
        let url = self.endpoint_url(endpoint, &[])?;
        let pieces = upload_pieces(&payload);

        let sink = progress.clone();
        let mut sent = 0u64;
        let stream = futures::stream::iter(pieces).map(move |piece| {
            sent += piece.len() as u64;
            sink.report(sent);
            Ok::<Bytes, std::io::Error>(piece)
        });

        let response = self
            .client
            .post(url.clone())
            .header(CONTENT_ENCODING, "identity")
            .body(Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        check_status(&url, response)?;
        Ok(())
    }

    async fn ping(&self, endpoint: &str) -> Result<PingTiming, TransportError> {
        let url = self.endpoint_url(endpoint, &[])?;
        let started = Instant::now();
        let response = self
            .client
            .get(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        let headers_after = started.elapsed();
        let response = check_status(&url, response)?;
        response.bytes().await.map_err(body_error)?;

        Ok(PingTiming {
            precise: Some(headers_after),
        })
    }

    async fn lookup_client(
        &self,
        endpoint: &str,
        query: &ClientLookupQuery,
    ) -> Result<String, TransportError> {
        let url = self.endpoint_url(endpoint, &query.query_pairs())?;
        let response = self
            .client
            .get(url.clone())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        check_status(&url, response)?
            .text()
            .await
            .map_err(body_error)
    }

    async fn submit_telemetry(
        &self,
        endpoint: &str,
        report: &TelemetryReport,
    ) -> Result<String, TransportError> {
        let url = self.endpoint_url(endpoint, &[])?;
        let response = self
            .client
            .post(url.clone())
            .timeout(self.request_timeout)
            .form(&report.form_fields())
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        check_status(&url, response)?
            .text()
            .await
            .map_err(body_error)
    }
}

/// Splits an upload payload into zero-copy pieces of at most
/// `UPLOAD_PIECE_BYTES`, bounding how far one progress step can jump.
fn upload_pieces(payload: &Bytes) -> Vec<Bytes> {
    let total = payload.len();
    (0..total)
        .step_by(UPLOAD_PIECE_BYTES)
        .map(|start| payload.slice(start..(start + UPLOAD_PIECE_BYTES).min(total)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(base_url: &str) -> HttpTransport {
        let config = ServerConfig {
            base_url: base_url.to_string(),
            ..ServerConfig::default()
        };
        HttpTransport::new(&config).unwrap()
    }

    #[test]
    fn test_endpoint_resolution_adds_cache_buster() {
        let transport = transport("http://speed.example.com/backend");
        let url = transport
            .endpoint_url("garbage", &[("ckSize", "20".to_string())])
            .unwrap();

        assert_eq!(url.path(), "/backend/garbage");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("ckSize".to_string(), "20".to_string()));
        assert_eq!(pairs[1].0, "r");
    }

    #[test]
    fn test_absolute_endpoint_overrides_base() {
        let transport = transport("http://speed.example.com/");
        let url = transport
            .endpoint_url("http://other.example.com/empty.php", &[])
            .unwrap();
        assert_eq!(url.host_str(), Some("other.example.com"));
        assert_eq!(url.path(), "/empty.php");
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = ServerConfig {
            base_url: "not a url".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            HttpTransport::new(&config),
            Err(TransportError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_connection_failure() {
        let transport = transport("http://127.0.0.1:9/");
        let result = transport.ping("empty").await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed { .. })
        ));
    }

    #[test]
    fn test_upload_pieces_bound_progress_steps() {
        let payload = Bytes::from(vec![7u8; 3 * UPLOAD_PIECE_BYTES + 10]);

        let pieces = upload_pieces(&payload);

        assert_eq!(pieces.len(), 4);
        assert!(pieces.iter().all(|piece| piece.len() <= UPLOAD_PIECE_BYTES));
        assert_eq!(pieces[3].len(), 10);
        assert_eq!(pieces.iter().map(Bytes::len).sum::<usize>(), payload.len());
        assert!(upload_pieces(&Bytes::new()).is_empty());
    }
}
