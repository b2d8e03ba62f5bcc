use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use reqwest::Client;

use crate::{config::HttpConfig, error::NetworkError, key::Locator};

pub type ByteStream = BoxStream<'static, Result<Bytes, NetworkError>>;

/// A response body delivered in chunks, for progress reporting.
pub struct StreamedBody {
    /// `None` when the server sent no usable `Content-Length`.
    pub content_length: Option<u64>,
    pub chunks: ByteStream,
}

impl std::fmt::Debug for StreamedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamedBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Where image bytes come from. Non-2xx responses are errors.
#[async_trait]
pub trait ImageTransport: Send + Sync + 'static {
    async fn fetch(&self, locator: &Locator) -> Result<Bytes, NetworkError>;

    async fn stream(
        &self,
        locator: &Locator,
    ) -> Result<StreamedBody, NetworkError>;
}

/// `reqwest`-backed transport with a pooled client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> reqwest::Result<Self> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout);
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        locator: &Locator,
    ) -> Result<reqwest::Response, NetworkError> {
        let mut request = self
            .client
            .request(locator.method().clone(), locator.url().clone());
        for (name, value) in locator.headers() {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NetworkError::transport(locator.address(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status {
                status: status.as_u16(),
                url: locator.address().to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ImageTransport for HttpTransport {
    async fn fetch(&self, locator: &Locator) -> Result<Bytes, NetworkError> {
        let response = self.send(locator).await?;
        response
            .bytes()
            .await
            .map_err(|e| NetworkError::transport(locator.address(), e))
    }

    async fn stream(
        &self,
        locator: &Locator,
    ) -> Result<StreamedBody, NetworkError> {
        let response = self.send(locator).await?;
        let content_length = response.content_length().filter(|len| *len > 0);
        let url = locator.address().to_string();
        let chunks = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| NetworkError::transport(&url, e))
            })
            .boxed();
        Ok(StreamedBody {
            content_length,
            chunks,
        })
    }
}
