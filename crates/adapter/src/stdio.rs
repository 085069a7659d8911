//! Child-process transport: spawn a backend and exchange newline-delimited
//! JSON-RPC over its standard streams.
//!
//! Stdout is pumped line by line into the adapter's event channel. Stderr
//! never carries protocol data; it is drained into a rolling tail kept for
//! diagnostics. Stopping closes stdin first (the polite signal), waits five
//! seconds for the child to exit, then kills it.

use std::{
    collections::{HashMap, VecDeque},
    process::Stdio,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, Command},
        sync::{Mutex, mpsc},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    config::BackendConfig,
    error::{Error, Result},
    transport::{Transport, TransportEvent},
};

const STOP_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_LINES: usize = 100;

/// Rolling buffer of the most recent stderr lines from the child.
#[derive(Default)]
pub struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: String) {
        if self.lines.len() >= STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Stdio transport for one backend child process.
pub struct StdioTransport {
    id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    cancel: StdMutex<CancellationToken>,
    stderr_tail: Arc<StdMutex<StderrTail>>,
}

impl StdioTransport {
    pub fn new(config: &BackendConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            id: config.id.clone(),
            command: config.command.clone().unwrap_or_default(),
            args: config.args.clone(),
            env: config.env.clone(),
            events,
            connected: Arc::new(AtomicBool::new(false)),
            stdin: Mutex::new(None),
            child: Mutex::new(None),
            cancel: StdMutex::new(CancellationToken::new()),
            stderr_tail: Arc::new(StdMutex::new(StderrTail::default())),
        }
    }

    /// Most recent stderr lines, for the admin status surface.
    pub fn stderr_tail(&self) -> Arc<StdMutex<StderrTail>> {
        Arc::clone(&self.stderr_tail)
    }

    fn fresh_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        slot.cancel();
        *slot = token.clone();
        token
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<()> {
        // A previous child may still be lingering after a crash.
        if let Some(mut old) = self.child.lock().await.take() {
            let _ = old.start_kill();
        }

        info!(backend = %self.id, command = %self.command, args = ?self.args, "spawning backend process");

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| Error::SpawnFailed {
            command: self.command.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Protocol("failed to open stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("failed to open stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Protocol("failed to open stderr pipe".into()))?;

        let cancel = self.fresh_cancel();
        self.connected.store(true, Ordering::SeqCst);
        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        // Stdout pump: one line is one inbound message.
        {
            let id = self.id.clone();
            let events = self.events.clone();
            let connected = Arc::clone(&self.connected);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                let trimmed = line.trim();
                                if trimmed.is_empty() {
                                    continue;
                                }
                                if events.send(TransportEvent::Frame(trimmed.to_string())).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {
                                debug!(backend = %id, "backend stdout closed");
                                connected.store(false, Ordering::SeqCst);
                                if !cancel.is_cancelled() {
                                    let _ = events.send(TransportEvent::Closed {
                                        reason: "process exited".into(),
                                    });
                                }
                                break;
                            }
                            Err(e) => {
                                warn!(backend = %id, error = %e, "error reading backend stdout");
                                connected.store(false, Ordering::SeqCst);
                                if !cancel.is_cancelled() {
                                    let _ = events.send(TransportEvent::Closed {
                                        reason: format!("stdout read error: {e}"),
                                    });
                                }
                                break;
                            }
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }

        // Stderr drain: diagnostics only.
        {
            let id = self.id.clone();
            let tail = Arc::clone(&self.stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                let trimmed = line.trim();
                                if trimmed.is_empty() {
                                    continue;
                                }
                                debug!(backend = %id, line = %trimmed, "backend stderr");
                                tail.lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .push(trimmed.to_string());
                            }
                            Ok(None) | Err(_) => break,
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }

        Ok(())
    }

    async fn stop(&self) {
        self.current_cancel().cancel();
        self.connected.store(false, Ordering::SeqCst);

        // Closing stdin is the polite termination signal.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(backend = %self.id, %status, "backend process exited");
                }
                Ok(Err(e)) => {
                    warn!(backend = %self.id, error = %e, "error awaiting backend process");
                }
                Err(_) => {
                    warn!(backend = %self.id, "backend did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_raw(&self, frame: &str) -> Result<()> {
        // Single lock scope per message so writes never interleave.
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::TransportLost("stdin is closed".into()))?;
        stdin.write_all(frame.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}
