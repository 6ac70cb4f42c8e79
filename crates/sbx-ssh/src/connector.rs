//! Drives exactly one remote process and exposes it as a stream of frames.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{WORKDIR, launch_command};
use crate::session::SshSession;
use crate::{Error, Result, SshClient};

/// Slots in the outbound frame channel.
pub const OUTBOUND_CAPACITY: usize = 100;

/// How long stdout EOF waits for buffered stderr before shutting down.
const STDERR_DRAIN: Duration = Duration::from_secs(1);
const TERM: &str = "xterm-256color";

/// What the connector needs from the transport under it.
#[async_trait]
pub trait ProcessTransport: Send + Sync + 'static {
    async fn request_pty(&self, term: &str, cols: u32, rows: u32) -> Result<()>;
    async fn exec(&self, command: &str) -> Result<()>;
    async fn write(&self, data: &[u8]) -> Result<()>;
    async fn resize(&self, cols: u32, rows: u32) -> Result<()>;
    fn take_stdout(&self) -> Option<mpsc::Receiver<Vec<u8>>>;
    fn take_stderr(&self) -> Option<mpsc::Receiver<Vec<u8>>>;
    async fn wait(&self) -> Result<Option<u32>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl ProcessTransport for SshSession {
    async fn request_pty(&self, term: &str, cols: u32, rows: u32) -> Result<()> {
        SshSession::request_pty(self, term, cols, rows).await
    }

    async fn exec(&self, command: &str) -> Result<()> {
        SshSession::exec(self, command).await
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        SshSession::write(self, data).await
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        SshSession::resize(self, cols, rows).await
    }

    fn take_stdout(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        SshSession::take_stdout(self)
    }

    fn take_stderr(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        SshSession::take_stderr(self)
    }

    async fn wait(&self) -> Result<Option<u32>> {
        SshSession::wait(self).await
    }

    async fn close(&self) -> Result<()> {
        SshSession::close(self).await
    }
}

/// How remote stdout is cut into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Newline-delimited records (agent JSON). Sends get a trailing newline.
    Lines,
    /// Unframed terminal bytes, passed through as they arrive.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

/// Everything needed to launch one remote process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub program: String,
    pub env: BTreeMap<String, String>,
    pub workdir: String,
    pub framing: Framing,
    pub pty: Option<PtySize>,
}

impl ProcessConfig {
    /// A line-framed process without a pty.
    pub fn agent(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            env: BTreeMap::new(),
            workdir: WORKDIR.into(),
            framing: Framing::Lines,
            pty: None,
        }
    }

    /// A raw, pty-backed shell.
    pub fn terminal(program: impl Into<String>, cols: u32, rows: u32) -> Self {
        Self {
            framing: Framing::Raw,
            pty: Some(PtySize { cols, rows }),
            ..Self::agent(program)
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

struct Shared {
    transport: Arc<dyn ProcessTransport>,
    done: CancellationToken,
    close_once: Once,
    state: watch::Sender<ConnectorState>,
}

impl Shared {
    /// The single shutdown path. Only the first caller closes the transport.
    async fn shutdown(&self, reason: &'static str) -> Result<()> {
        let mut first = false;
        self.close_once.call_once(|| {
            first = true;
            self.state.send_replace(ConnectorState::Closing);
            self.done.cancel();
        });
        if !first {
            return Ok(());
        }

        debug!(reason, "connector: shutting down");
        let result = self.transport.close().await;
        self.state.send_replace(ConnectorState::Closed);
        result
    }
}

/// One remote process presented as a send/receive pair.
///
/// All background tasks stop when [`done`](Self::done) fires, which happens
/// exactly once on explicit close, stdout EOF or a failed write. The frame
/// channel closes once the last of those tasks has exited.
pub struct ProcessConnector {
    shared: Arc<Shared>,
    config: ProcessConfig,
    write_lock: tokio::sync::Mutex<()>,
    frames: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    frames_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl ProcessConnector {
    pub fn new(transport: Arc<dyn ProcessTransport>, config: ProcessConfig) -> Self {
        let (frames_tx, frames) = mpsc::channel(OUTBOUND_CAPACITY);
        let (state, _) = watch::channel(ConnectorState::Idle);
        Self {
            shared: Arc::new(Shared {
                transport,
                done: CancellationToken::new(),
                close_once: Once::new(),
                state,
            }),
            config,
            write_lock: tokio::sync::Mutex::new(()),
            frames: Mutex::new(Some(frames)),
            frames_tx: Mutex::new(Some(frames_tx)),
        }
    }

    /// Launch the process on an already open transport.
    pub async fn connect(transport: Arc<dyn ProcessTransport>, config: ProcessConfig) -> Result<Self> {
        let connector = Self::new(transport, config);
        connector.start().await?;
        Ok(connector)
    }

    /// Open an SSH session to `host:port` (retrying while sshd comes up) and
    /// launch the process on it.
    pub async fn open(client: &SshClient, host: &str, port: u16, config: ProcessConfig) -> Result<Self> {
        let session = client.connect_with_default_retry(host, port).await?;
        Self::connect(Arc::new(session), config).await
    }

    pub fn state(&self) -> ConnectorState {
        *self.shared.state.borrow()
    }

    pub fn framing(&self) -> Framing {
        self.config.framing
    }

    /// Fires once the connector is shutting down.
    pub fn done(&self) -> CancellationToken {
        self.shared.done.clone()
    }

    /// Start the remote process and the background readers.
    pub async fn start(&self) -> Result<()> {
        if self.state() != ConnectorState::Idle {
            return Err(Error::Closed);
        }
        self.shared.state.send_replace(ConnectorState::Connecting);

        if let Err(e) = self.launch().await {
            warn!(error = %e, program = %self.config.program, "connector: launch failed");
            self.drop_unused_sender();
            if let Err(close_err) = self.shared.shutdown("launch failed").await {
                debug!(error = %close_err, "connector: close after failed launch");
            }
            return Err(e);
        }

        let frames_tx = self
            .frames_tx
            .lock()
            .ok()
            .and_then(|mut tx| tx.take())
            .ok_or(Error::Closed)?;
        let transport = &self.shared.transport;
        let stdout = transport.take_stdout().ok_or(Error::Closed)?;
        let stderr = transport.take_stderr();

        let stderr_task = stderr.map(|stderr| {
            tokio::spawn(read_stderr(
                self.shared.done.clone(),
                stderr,
                frames_tx.clone(),
                self.config.framing,
            ))
        });
        tokio::spawn(read_stdout(
            Arc::clone(&self.shared),
            stdout,
            frames_tx,
            self.config.framing,
            stderr_task,
        ));

        self.shared.state.send_replace(ConnectorState::Active);
        info!(program = %self.config.program, framing = ?self.config.framing, "connector: process started");
        Ok(())
    }

    async fn launch(&self) -> Result<()> {
        let command = launch_command(&self.config.env, &self.config.workdir, &self.config.program)?;
        let transport = &self.shared.transport;
        if let Some(pty) = self.config.pty {
            transport.request_pty(TERM, pty.cols, pty.rows).await?;
        }
        transport.exec(&command).await
    }

    /// Write one record to the process stdin. Line framing appends the
    /// newline. Writes never interleave; a failed write closes the connector.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.shared.done.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut payload = data.to_vec();
        if self.config.framing == Framing::Lines {
            while payload.last() == Some(&b'\n') {
                payload.pop();
            }
            payload.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.shared.transport.write(&payload).await {
            warn!(error = %e, "connector: write failed");
            if let Err(close_err) = self.shared.shutdown("write failed").await {
                debug!(error = %close_err, "connector: close after failed write");
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        if self.shared.done.is_cancelled() {
            return Err(Error::Closed);
        }
        self.shared.transport.resize(cols, rows).await
    }

    /// Complete frames from the process, in arrival order. Can be taken once.
    pub fn receive(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.frames.lock().ok()?.take()
    }

    /// Exit status of the remote process, once it has exited.
    pub async fn wait(&self) -> Result<Option<u32>> {
        self.shared.transport.wait().await
    }

    /// Shut down. Safe to call repeatedly and concurrently with a transport
    /// failure; the transport is closed exactly once.
    pub async fn close(&self) -> Result<()> {
        self.drop_unused_sender();
        self.shared.shutdown("closed by caller").await
    }

    /// Before `start` hands the sender to the readers, the connector holds it
    /// itself; dropping it lets a receiver taken early observe the close.
    fn drop_unused_sender(&self) {
        if let Ok(mut tx) = self.frames_tx.lock() {
            tx.take();
        }
    }
}

/// Accumulates stdout chunks and yields complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    fn pending(&self) -> usize {
        self.buf.len()
    }
}

async fn deliver(tx: &mpsc::Sender<Vec<u8>>, frame: Vec<u8>, done: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = done.cancelled() => false,
        sent = tx.send(frame) => sent.is_ok(),
    }
}

async fn read_stdout(
    shared: Arc<Shared>,
    mut stdout: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    framing: Framing,
    stderr_task: Option<JoinHandle<()>>,
) {
    let mut lines = LineBuffer::default();
    loop {
        let chunk = tokio::select! {
            _ = shared.done.cancelled() => return,
            chunk = stdout.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };

        let frames = match framing {
            Framing::Lines => lines.push(&chunk),
            Framing::Raw => vec![chunk],
        };
        for frame in frames {
            if !deliver(&tx, frame, &shared.done).await {
                return;
            }
        }
    }

    if lines.pending() > 0 {
        debug!(bytes = lines.pending(), "connector: dropping unterminated line at eof");
    }
    drop(tx);
    // Crash output is written just before exit, so stderr gets to drain
    // before `done` stops its reader.
    if let Some(stderr_task) = stderr_task {
        if tokio::time::timeout(STDERR_DRAIN, stderr_task).await.is_err() {
            debug!("connector: stderr still open at stdout eof");
        }
    }
    if let Err(e) = shared.shutdown("stdout eof").await {
        debug!(error = %e, "connector: close after eof");
    }
}

/// Stderr never ends the session. In line mode every non-empty read becomes
/// an `{"type":"error"}` frame; raw mode passes it through. Runs until the
/// stream ends or the connector is closed.
async fn read_stderr(
    done: CancellationToken,
    mut stderr: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    framing: Framing,
) {
    loop {
        let chunk = tokio::select! {
            _ = done.cancelled() => return,
            chunk = stderr.recv() => chunk,
        };
        let Some(chunk) = chunk else { return };

        let frame = match framing {
            Framing::Raw => chunk,
            Framing::Lines => {
                let text = String::from_utf8_lossy(&chunk);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                serde_json::json!({ "type": "error", "error": text })
                    .to_string()
                    .into_bytes()
            }
        };
        if !deliver(&tx, frame, &done).await {
            return;
        }
    }
}
