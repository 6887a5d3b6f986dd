//! HTTP implementation of [`Transport`]

use crate::collaborators::{RemoteFile, Transport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::time::Duration;

/// Streams resources over HTTP(S) with `reqwest`
///
/// Only connection setup is time-limited here; the job's wall-clock limit bounds the body.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with the given connect timeout and user agent
    pub fn new(connect_timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn stream(&self, resource_ref: &str) -> Result<RemoteFile> {
        let url = url::Url::parse(resource_ref).map_err(|e| {
            Error::Validation(format!("invalid resource reference '{}': {}", resource_ref, e))
        })?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, resource_ref));
        }

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();

        Ok(RemoteFile {
            content_length,
            stream,
        })
    }
}

fn classify_status(status: StatusCode, resource_ref: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            Error::ResourceNotFound(format!("{} returned {}", resource_ref, status))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Error::Transient(format!("{} returned {}", resource_ref, status))
        }
        s if s.is_server_error() => Error::Transient(format!("{} returned {}", resource_ref, s)),
        s => Error::Other(format!("{} returned {}", resource_ref, s)),
    }
}
