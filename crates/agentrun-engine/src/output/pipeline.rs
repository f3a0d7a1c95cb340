use std::path::Path;
use std::sync::Arc;

use agentrun_core::{EngineEvent, OutputStream, TaskId};
use agentrun_protocol::{normalize_output, split_incomplete_escape};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::DedupCache;
use crate::extractor::{SubtaskExtractor, SubtaskRecorder};
use crate::ports::BroadcastSink;

/// Per-run output path: log file, normalizer, dedup, broadcast, extractor.
pub(crate) struct OutputPipeline {
    task_id: TaskId,
    log_file: Option<File>,
    dedup: Arc<DedupCache>,
    extractor: SubtaskExtractor,
    recorder: SubtaskRecorder,
    broadcast: Arc<dyn BroadcastSink>,
    /// Unfinished escape sequences carried into the next chunk, per stream.
    pending_stdout: String,
    pending_stderr: String,
}

impl OutputPipeline {
    pub(crate) async fn open(
        task_id: TaskId,
        log_path: Option<&Path>,
        dedup: Arc<DedupCache>,
        extractor: SubtaskExtractor,
        recorder: SubtaskRecorder,
        broadcast: Arc<dyn BroadcastSink>,
    ) -> Self {
        let log_file = match log_path {
            Some(path) => open_log(path)
                .await
                .map_err(|e| {
                    warn!(task_id = %task_id, path = %path.display(), error = %e, "Cannot open run log, continuing without it");
                })
                .ok(),
            None => None,
        };

        Self {
            task_id,
            log_file,
            dedup,
            extractor,
            recorder,
            broadcast,
            pending_stdout: String::new(),
            pending_stderr: String::new(),
        }
    }

    /// Process one chunk as read from the transport.
    pub(crate) async fn handle(&mut self, stream: OutputStream, raw: &str) {
        self.append_log(raw).await;

        let mut text = std::mem::take(self.pending(stream));
        text.push_str(raw);
        let (complete, rest) = split_incomplete_escape(&text);
        *self.pending(stream) = rest.to_string();

        let normalized = normalize_output(complete);
        self.forward(stream, normalized).await;
    }

    /// Flush held-back text, extractor state and the log file once the transport has closed.
    pub(crate) async fn finish(&mut self) {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let rest = std::mem::take(self.pending(stream));
            if !rest.is_empty() {
                self.forward(stream, normalize_output(&rest)).await;
            }
        }

        let signals = self.extractor.finish();
        self.record(signals).await;
        if let Some(file) = self.log_file.as_mut() {
            let _ = file.flush().await;
        }
    }

    fn pending(&mut self, stream: OutputStream) -> &mut String {
        match stream {
            OutputStream::Stdout => &mut self.pending_stdout,
            OutputStream::Stderr => &mut self.pending_stderr,
        }
    }

    async fn forward(&mut self, stream: OutputStream, normalized: String) {
        if normalized.is_empty() {
            return;
        }

        let forwarded = self.dedup.filter(&self.task_id, &normalized).await;
        if !forwarded.is_empty() {
            self.publish(EngineEvent::CliOutput {
                task_id: self.task_id.clone(),
                stream,
                data: forwarded,
            });
        } else {
            debug!(task_id = %self.task_id, "Suppressed repeated output");
        }

        if stream == OutputStream::Stdout {
            let signals = self.extractor.scan(&normalized);
            self.record(signals).await;
        }
    }

    /// Append a line written by the engine itself (not by the agent).
    pub(crate) async fn append_line(&mut self, line: &str) {
        self.append_log(&format!("{line}\n")).await;
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        self.broadcast.publish(event.event_type(), event.payload());
    }

    async fn record(&self, signals: Vec<agentrun_core::SubtaskSignal>) {
        for signal in signals {
            let external_id = signal.external_id.clone();
            if let Err(e) = self.recorder.apply(signal).await {
                warn!(task_id = %self.task_id, external_id = %external_id, error = %e, "Failed to record subtask signal");
            }
        }
    }

    async fn append_log(&mut self, text: &str) {
        let Some(file) = self.log_file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(text.as_bytes()).await {
            warn!(task_id = %self.task_id, error = %e, "Run log write failed, disabling log file");
            self.log_file = None;
        }
    }
}

async fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}
