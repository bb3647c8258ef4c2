//! Child-process transport.
//!
//! Spawns an executable with an explicit argument list (no shell), writes one
//! JSON document per line to its stdin and reads newline-delimited frames from
//! its stdout. Stderr is drained line by line into the log and never parsed.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DEFAULT_MAX_FRAME_BYTES, FrameStream, Transport};
use crate::error::TransportError;
use crate::relock;

/// Default wait before checking that a freshly spawned process is still alive.
pub const DEFAULT_SPAWN_GRACE: Duration = Duration::from_millis(50);

/// Inbound frames buffered between the stdout reader and the protocol client.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// How to start the provider process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Label used in logs (normally the connector id).
    pub label: String,
    pub command: String,
    pub args: Vec<String>,
    /// Merged over the ambient environment.
    pub env: HashMap<String, String>,
    pub max_frame_bytes: usize,
    pub spawn_grace: Duration,
}

impl ProcessConfig {
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            spawn_grace: DEFAULT_SPAWN_GRACE,
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    #[must_use]
    pub fn spawn_grace(mut self, grace: Duration) -> Self {
        self.spawn_grace = grace;
        self
    }
}

#[derive(Debug)]
struct Running {
    child: Child,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug)]
enum FrameSlot {
    Idle,
    Ready(mpsc::Receiver<Result<String, TransportError>>),
    Taken,
}

/// Transport over a child process's standard streams.
#[derive(Debug)]
pub struct ProcessTransport {
    config: ProcessConfig,
    running: Mutex<Option<Running>>,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    frames: Mutex<FrameSlot>,
}

impl ProcessTransport {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
            writer: Mutex::new(None),
            frames: Mutex::new(FrameSlot::Idle),
        }
    }

    /// Check whether the child is still running.
    pub fn is_alive(&self) -> bool {
        let mut guard = relock(self.running.lock());
        match guard.as_mut() {
            Some(running) => matches!(running.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn spawn_child(&self) -> Result<Child, TransportError> {
        let cfg = &self.config;
        let mut cmd = Command::new(&cfg.command);
        cmd.args(&cfg.args)
            .envs(&cfg.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| TransportError::Spawn {
            command: cfg.command.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if relock(self.running.lock()).is_some() {
            return Ok(());
        }

        info!(
            name: "transport.process.spawn",
            connector = %self.config.label,
            command = %self.config.command,
            args = ?self.config.args,
            "Spawning provider process"
        );

        let mut child = self.spawn_child()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("missing stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("missing stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Io("missing stderr pipe".into()))?;

        let shutdown = CancellationToken::new();
        let label = self.config.label.clone();
        let limit = self.config.max_frame_bytes;

        // Writer: each frame is a single line, newline-terminated.
        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(FRAME_CHANNEL_CAPACITY);
        let writer = {
            let shutdown = shutdown.clone();
            let label = label.clone();
            let mut stdin = stdin;
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        () = shutdown.cancelled() => break,
                        next = writer_rx.recv() => match next {
                            Some(frame) => frame,
                            None => break,
                        },
                    };
                    let line = frame.replace('\n', "");
                    let res = async {
                        stdin.write_all(line.as_bytes()).await?;
                        stdin.write_all(b"\n").await?;
                        stdin.flush().await
                    }
                    .await;
                    if let Err(e) = res {
                        error!(connector = %label, error = %e, "stdin write failed");
                        break;
                    }
                }
                debug!(connector = %label, "stdin writer exiting");
            })
        };

        // Reader: buffer stdout until a newline, one frame per line.
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let reader = {
            let shutdown = shutdown.clone();
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(limit));
                let mut frame_tx = Some(frame_tx);
                loop {
                    let next = tokio::select! {
                        () = shutdown.cancelled() => break,
                        next = lines.next() => next,
                    };
                    let Some(next) = next else {
                        info!(connector = %label, "stdout closed (provider exited)");
                        break;
                    };
                    // Once the stream has ended, stdout is still drained so the
                    // provider never writes into a closed pipe.
                    let Some(tx) = frame_tx.as_ref() else {
                        continue;
                    };
                    let item = match next {
                        Ok(line) if line.trim().is_empty() => continue,
                        Ok(line) => Ok(line),
                        Err(LinesCodecError::MaxLineLengthExceeded) => {
                            warn!(connector = %label, limit, "stdout frame over limit");
                            Err(TransportError::FrameTooLarge { limit })
                        }
                        Err(LinesCodecError::Io(e)) => Err(TransportError::Io(e.to_string())),
                    };
                    let terminal = item.is_err();
                    if tx.send(item).await.is_err() || terminal {
                        frame_tx = None;
                    }
                }
            })
        };

        // Stderr: log only, never protocol data.
        let stderr_task = {
            let shutdown = shutdown.clone();
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(limit));
                loop {
                    let next = tokio::select! {
                        () = shutdown.cancelled() => break,
                        next = lines.next() => next,
                    };
                    match next {
                        Some(Ok(line)) => {
                            let line = line.trim();
                            if !line.is_empty() {
                                debug!(target: "toolbridge::provider_stderr", connector = %label, "{line}");
                            }
                        }
                        Some(Err(e)) => {
                            warn!(connector = %label, error = %e, "stderr read error");
                            break;
                        }
                        None => break,
                    }
                }
            })
        };

        let tasks = vec![writer, reader, stderr_task];

        // A process that dies right away (bad flags, missing runtime) should
        // fail the connect instead of the first request.
        tokio::time::sleep(self.config.spawn_grace).await;
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                shutdown.cancel();
                for task in &tasks {
                    task.abort();
                }
                return Err(TransportError::ExitedEarly {
                    command: self.config.command.clone(),
                    status: status.to_string(),
                });
            }
            Err(e) => {
                shutdown.cancel();
                return Err(TransportError::Io(e.to_string()));
            }
        }

        *relock(self.writer.lock()) = Some(writer_tx);
        *relock(self.frames.lock()) = FrameSlot::Ready(frame_rx);
        *relock(self.running.lock()) = Some(Running {
            child,
            shutdown,
            tasks,
        });
        Ok(())
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let tx = relock(self.writer.lock())
            .clone()
            .ok_or(TransportError::Closed)?;
        tx.send(frame).await.map_err(|_closed| TransportError::Closed)
    }

    fn receive(&self) -> Result<FrameStream, TransportError> {
        let mut slot = relock(self.frames.lock());
        match std::mem::replace(&mut *slot, FrameSlot::Taken) {
            FrameSlot::Ready(rx) => Ok(ReceiverStream::new(rx).boxed()),
            FrameSlot::Taken => Err(TransportError::StreamTaken),
            FrameSlot::Idle => {
                *slot = FrameSlot::Idle;
                Err(TransportError::Closed)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        relock(self.writer.lock()).take();
        let Some(mut running) = relock(self.running.lock()).take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        for task in &running.tasks {
            task.abort();
        }

        if matches!(running.child.try_wait(), Ok(None)) {
            info!(connector = %self.config.label, "Killing provider process");
            if let Err(e) = running.child.kill().await {
                warn!(connector = %self.config.label, error = %e, "kill failed");
            }
        }
        Ok(())
    }
}
