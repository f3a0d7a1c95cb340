//! Child-process transport.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use agentrun_core::OutputStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{TransportEvent, TransportExit, TransportSink};
use crate::error::EngineError;

/// How long pipe readers may keep draining after the process has exited.
/// Grandchildren that inherited the pipes would otherwise hold them open.
const READER_GRACE: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// What to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Written to stdin, which is then closed.
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Spawn the process and its pipe readers. Returns the pid.
///
/// Output is sent as it is read; [`TransportExit::Process`] follows once the
/// process has exited and both readers are detached.
pub(crate) fn spawn_process(spec: ProcessSpec, sink: TransportSink) -> Result<u32, EngineError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();
    info!(program = %spec.program, pid, "Process spawned");

    if let (Some(mut stdin), Some(input)) = (child.stdin.take(), spec.stdin) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                warn!(pid, error = %e, "Failed to write prompt to stdin");
            }
            let _ = stdin.shutdown().await;
        });
    }

    let stdout = child
        .stdout
        .take()
        .map(|pipe| spawn_reader(pipe, OutputStream::Stdout, sink.clone()));
    let stderr = child
        .stderr
        .take()
        .map(|pipe| spawn_reader(pipe, OutputStream::Stderr, sink.clone()));

    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(pid, error = %e, "Failed to wait for process");
                None
            }
        };
        debug!(pid, code = ?code, "Process exited");

        for reader in [stdout, stderr].into_iter().flatten() {
            detach_reader(reader).await;
        }
        sink.send(TransportEvent::Finished(TransportExit::Process { code }))
            .await;
    });

    Ok(pid)
}

async fn detach_reader(mut reader: JoinHandle<()>) {
    if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
        debug!("Pipe still open after exit, detaching reader");
        reader.abort();
    }
}

fn spawn_reader<R>(mut pipe: R, stream: OutputStream, sink: TransportSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut carry = Vec::new();
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decode_utf8(&mut carry, &buf[..n]);
                    if !text.is_empty() && !sink.output(stream, text).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = stream.as_str(), error = %e, "Error reading pipe");
                    break;
                }
            }
        }
        if !carry.is_empty() {
            let tail = String::from_utf8_lossy(&carry).into_owned();
            sink.output(stream, tail).await;
        }
    })
}

/// Decode as much of `carry + bytes` as forms complete UTF-8.
///
/// An incomplete sequence at the end stays in `carry`; invalid bytes become
/// U+FFFD.
fn decode_utf8(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    let mut out = String::new();
    loop {
        match std::str::from_utf8(carry.as_slice()) {
            Ok(valid) => {
                out.push_str(valid);
                carry.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&carry[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        carry.drain(..valid + bad);
                    }
                    None => {
                        carry.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}
