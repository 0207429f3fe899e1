//! Audio producers: the expensive step the cache runs at most once per id.

pub mod ffmpeg;
pub mod http;

use crate::sink::{ChunkSink, SinkClosed};
use async_trait::async_trait;
use thiserror::Error;

pub use ffmpeg::FfmpegProducer;
pub use http::HttpSourceProducer;

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("Source fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Transcoder failed: {0}")]
    Transcoder(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output sink closed before production finished")]
    SinkClosed(#[from] SinkClosed),

    #[error("{0}")]
    Other(String),
}

/// Output encoding requested from a producer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProduceOptions {
    /// Container/codec name as understood by ffmpeg's `-f` (e.g. `mp3`).
    pub format: String,
    /// Target audio bitrate (e.g. `192k`).
    pub bitrate: String,
}

impl Default for ProduceOptions {
    fn default() -> Self {
        Self {
            format: "mp3".to_string(),
            bitrate: "192k".to_string(),
        }
    }
}

impl ProduceOptions {
    /// MIME type for the produced bytes.
    pub fn content_type(&self) -> &'static str {
        match self.format.as_str() {
            "mp3" => "audio/mpeg",
            "ogg" | "opus" => "audio/ogg",
            "adts" | "aac" => "audio/aac",
            "flac" => "audio/flac",
            "wav" => "audio/wav",
            "webm" => "audio/webm",
            _ => "application/octet-stream",
        }
    }
}

/// Produces the bytes of one resource.
///
/// Implementations write chunks to `sink` in final order and return `Ok(())`
/// once everything is written, or an error. The sink is consumed, so nothing
/// can be written after returning.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce(
        &self,
        id: &str,
        sink: ChunkSink,
        options: &ProduceOptions,
    ) -> Result<(), ProduceError>;
}
