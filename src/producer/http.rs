//! Fetches source audio over HTTP and forwards the body unchanged.

use super::{ProduceError, ProduceOptions, Producer};
use crate::http_retry::{RetryConfig, fetch_with_retry};
use crate::sink::ChunkSink;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tracing::{debug, info};

/// Placeholder replaced by the resource id in a source URL template.
pub const ID_PLACEHOLDER: &str = "{id}";

/// Streams `GET <source url for id>` into the sink.
#[derive(Clone, Debug)]
pub struct HttpSourceProducer {
    client: Client,
    url_template: String,
    retry: RetryConfig,
}

impl HttpSourceProducer {
    /// `url_template` either contains `{id}` or is a base URL the id is
    /// appended to as a path segment.
    pub fn new(client: Client, url_template: impl Into<String>) -> Self {
        Self {
            client,
            url_template: url_template.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn source_url(&self, id: &str) -> String {
        if self.url_template.contains(ID_PLACEHOLDER) {
            self.url_template.replace(ID_PLACEHOLDER, id)
        } else {
            format!("{}/{}", self.url_template.trim_end_matches('/'), id)
        }
    }
}

#[async_trait]
impl Producer for HttpSourceProducer {
    async fn produce(
        &self,
        id: &str,
        sink: ChunkSink,
        _options: &ProduceOptions,
    ) -> Result<(), ProduceError> {
        let url = self.source_url(id);
        info!("Fetching source for {} from {}", id, url);

        let response = fetch_with_retry(&self.client, &url, &self.retry).await?;
        let mut body = response.bytes_stream();
        let mut total = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            total += chunk.len();
            sink.write(chunk).await?;
        }
        debug!("Source for {} finished after {} bytes", id, total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_retry::RetryConfig;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn producer(template: String) -> HttpSourceProducer {
        HttpSourceProducer::new(Client::new(), template).with_retry(RetryConfig {
            max_attempts: 1,
            backoff: Duration::from_millis(1),
        })
    }

    async fn collect(mut rx: tokio::sync::mpsc::Receiver<bytes::Bytes>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn template_placeholder_is_replaced() {
        let p = producer("https://media.example.com/audio/{id}.webm".to_string());
        assert_eq!(
            p.source_url("abc123"),
            "https://media.example.com/audio/abc123.webm"
        );
    }

    #[test]
    fn base_url_gets_id_appended() {
        let p = producer("https://media.example.com/audio/".to_string());
        assert_eq!(p.source_url("abc123"), "https://media.example.com/audio/abc123");
    }

    #[tokio::test]
    async fn streams_source_body_into_sink() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/src/abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"audio-bytes".to_vec()))
            .mount(&server)
            .await;

        let p = producer(format!("{}/src", server.uri()));
        let (sink, rx) = ChunkSink::channel(8);
        let reader = tokio::spawn(collect(rx));

        p.produce("abc123", sink, &ProduceOptions::default())
            .await
            .unwrap();
        assert_eq!(reader.await.unwrap(), b"audio-bytes");
    }

    #[tokio::test]
    async fn missing_source_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let p = producer(format!("{}/{{id}}", server.uri()));
        let (sink, _rx) = ChunkSink::channel(8);
        let err = p
            .produce("nope", sink, &ProduceOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProduceError::Fetch(_)));
    }

    #[tokio::test]
    async fn closed_sink_stops_production() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 1024]))
            .mount(&server)
            .await;

        let p = producer(server.uri());
        let (sink, rx) = ChunkSink::channel(1);
        drop(rx);
        let err = p
            .produce("abc", sink, &ProduceOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProduceError::SinkClosed(_)));
    }
}
