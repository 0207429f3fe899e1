//! Transcodes another producer's output through an `ffmpeg` child process.
//!
//! The inner producer's bytes are pumped into ffmpeg's stdin while stdout is
//! streamed into the sink, so the first encoded bytes reach the cache long
//! before the source has been fully fetched.

use super::{ProduceError, ProduceOptions, Producer};
use crate::sink::ChunkSink;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Source chunks buffered between the inner producer and ffmpeg's stdin.
const SOURCE_BUFFER: usize = 16;

/// Longest ffmpeg stderr excerpt carried in an error.
const MAX_STDERR: usize = 2048;

#[derive(Clone)]
pub struct FfmpegProducer {
    source: Arc<dyn Producer>,
    ffmpeg: PathBuf,
}

impl FfmpegProducer {
    pub fn new(source: Arc<dyn Producer>, ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            source,
            ffmpeg: ffmpeg.into(),
        }
    }

    fn command(&self, options: &ProduceOptions) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-vn"])
            .args(["-b:a", options.bitrate.as_str()])
            .args(["-f", options.format.as_str(), "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Producer for FfmpegProducer {
    async fn produce(
        &self,
        id: &str,
        sink: ChunkSink,
        options: &ProduceOptions,
    ) -> Result<(), ProduceError> {
        let mut child = self.command(options).spawn().map_err(|e| {
            ProduceError::Transcoder(format!("failed to start {}: {e}", self.ffmpeg.display()))
        })?;
        let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ProduceError::Transcoder("ffmpeg pipes unavailable".to_string()));
        };
        info!(
            "Transcoding {} to {} at {}",
            id, options.format, options.bitrate
        );

        let (source_sink, mut source_rx) = ChunkSink::channel(SOURCE_BUFFER);
        let fetch = self.source.produce(id, source_sink, options);
        let pump = async move {
            while let Some(chunk) = source_rx.recv().await {
                stdin.write_all(&chunk).await?;
            }
            // Closing stdin tells ffmpeg the input is complete.
            stdin.shutdown().await
        };
        let drain = async {
            let mut encoded = ReaderStream::new(stdout);
            while let Some(chunk) = encoded.next().await {
                sink.write(chunk?).await?;
            }
            Ok::<_, ProduceError>(())
        };
        let collect_stderr = async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        };

        let (fetched, pumped, drained, stderr) = tokio::join!(fetch, pump, drain, collect_stderr);
        let status = child.wait().await?;
        let diagnostics = String::from_utf8_lossy(&stderr[..stderr.len().min(MAX_STDERR)])
            .trim()
            .to_string();

        // The source error explains a broken pipe better than the pipe error does.
        fetched?;
        drained?;
        if !status.success() {
            warn!("ffmpeg exited with {} for {}: {}", status, id, diagnostics);
            return Err(ProduceError::Transcoder(format!(
                "ffmpeg exited with {status}: {diagnostics}"
            )));
        }
        pumped?;
        debug!("Transcode of {} complete", id);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::OnceLock;

    /// Emits fixed chunks, standing in for the source fetch.
    struct FixedSource(Vec<&'static [u8]>);

    #[async_trait]
    impl Producer for FixedSource {
        async fn produce(
            &self,
            _id: &str,
            sink: ChunkSink,
            _options: &ProduceOptions,
        ) -> Result<(), ProduceError> {
            for chunk in &self.0 {
                sink.write(Bytes::from_static(*chunk)).await?;
            }
            Ok(())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl Producer for FailingSource {
        async fn produce(
            &self,
            _id: &str,
            _sink: ChunkSink,
            _options: &ProduceOptions,
        ) -> Result<(), ProduceError> {
            Err(ProduceError::Other("source went away".to_string()))
        }
    }

    async fn run(producer: &FfmpegProducer) -> (Result<(), ProduceError>, Vec<u8>) {
        let (sink, mut rx) = ChunkSink::channel(8);
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk);
            }
            out
        });
        let result = producer
            .produce("abc", sink, &ProduceOptions::default())
            .await;
        (result, reader.await.unwrap())
    }

    struct FakeTranscoders {
        passthrough: PathBuf,
        failing: PathBuf,
    }

    /// Shell scripts standing in for ffmpeg. Written once, before any test
    /// spawns a child, so no child inherits an open write handle.
    fn fakes() -> &'static FakeTranscoders {
        static FAKES: OnceLock<FakeTranscoders> = OnceLock::new();
        FAKES.get_or_init(|| {
            let dir = std::env::temp_dir().join(format!("tailcast-ffmpeg-{}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            let write = |name: &str, body: &str| {
                let path = dir.join(name);
                std::fs::write(&path, body).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
                path
            };
            FakeTranscoders {
                passthrough: write("passthrough", "#!/bin/sh\nexec cat\n"),
                failing: write(
                    "failing",
                    "#!/bin/sh\ncat >/dev/null\necho 'bad input' >&2\nexit 1\n",
                ),
            }
        })
    }

    #[tokio::test]
    async fn pipes_source_through_transcoder() {
        let producer = FfmpegProducer::new(
            Arc::new(FixedSource(vec![&b"hello "[..], &b"world"[..]])),
            &fakes().passthrough,
        );
        let (result, out) = run(&producer).await;
        result.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn missing_binary_is_a_transcoder_error() {
        let producer = FfmpegProducer::new(
            Arc::new(FixedSource(vec![&b"x"[..]])),
            "/nonexistent/ffmpeg-binary",
        );
        let (result, out) = run(&producer).await;
        assert!(matches!(result, Err(ProduceError::Transcoder(_))));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn source_failure_fails_production() {
        let producer = FfmpegProducer::new(Arc::new(FailingSource), &fakes().passthrough);
        let (result, _) = run(&producer).await;
        assert!(matches!(result, Err(ProduceError::Other(_))));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_transcoder_error() {
        let producer = FfmpegProducer::new(Arc::new(FixedSource(vec![&b"x"[..]])), &fakes().failing);
        let (result, _) = run(&producer).await;
        match result {
            Err(ProduceError::Transcoder(msg)) => assert!(msg.contains("bad input"), "{msg}"),
            other => panic!("expected transcoder error, got {other:?}"),
        }
    }
}
