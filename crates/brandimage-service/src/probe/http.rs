//! Support to probe images on an HTTP origin.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode, header};
use url::Url;

use crate::config::Config;
use crate::error::{ProbeError, ProbeResult};

use super::ProbeExists;

/// The `User-Agent` sent with every probe.
pub const USER_AGENT: &str = concat!("brandimage/", env!("CARGO_PKG_VERSION"));

/// Timeouts applied by the [`HttpProber`].
#[derive(Copy, Clone, Debug)]
pub struct ProbeTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the response headers.
    pub head: Duration,
}

impl ProbeTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
        }
    }
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            head: Duration::from_secs(5),
        }
    }
}

/// Creates a [`reqwest::Client`] suitable for probing.
pub fn create_client(timeouts: &ProbeTimeouts) -> reqwest::Result<Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .hickory_dns(true)
        .connect_timeout(timeouts.connect)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(USER_AGENT)
        .build()
}

/// Probes images by requesting them from an HTTP origin.
///
/// Only the response head is awaited; the image body is never downloaded.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: Client,
    timeouts: ProbeTimeouts,
}

impl HttpProber {
    pub fn new(client: Client, timeouts: ProbeTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Creates a prober with its own client, using the timeouts from `config`.
    pub fn from_config(config: &Config) -> reqwest::Result<Self> {
        let timeouts = ProbeTimeouts::from_config(config);
        Ok(Self::new(create_client(&timeouts)?, timeouts))
    }

    async fn probe(&self, url: &Url) -> ProbeResult {
        tracing::debug!("Probing image at `{}`", url);

        let request = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, "image/webp,image/*;q=0.8")
            .send();
        let response = tokio::time::timeout(self.timeouts.head, request)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeouts.head))??;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_status(url, status));
        }

        // A browser refuses to render anything that is not an image, login pages included.
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        match content_type {
            Some(content_type) if !content_type.starts_with("image/") => {
                tracing::debug!("Origin served `{content_type}` instead of an image for `{url}`");
                Err(ProbeError::NotFound)
            }
            _ => Ok(()),
        }
    }
}

impl ProbeExists for HttpProber {
    fn probe_exists<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, ProbeResult> {
        self.probe(url).boxed()
    }
}

/// Uses the HTTP status code to infer the [`ProbeError`].
fn error_from_status(url: &Url, status: StatusCode) -> ProbeError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to probe `{url}`: {status}");
        ProbeError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("No image at `{url}`: {status}");
        ProbeError::NotFound
    } else if status == StatusCode::FOUND {
        tracing::debug!("Potential login page detected when probing `{url}`: {status}");
        ProbeError::PermissionDenied("Potential login page detected".to_owned())
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");
        ProbeError::DownloadError(status.to_string())
    }
}
