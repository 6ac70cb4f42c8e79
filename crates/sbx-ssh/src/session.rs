use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::ClientHandler;
use crate::{Error, Result};

const STREAM_CAPACITY: usize = 64;
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

enum Request {
    Pty {
        term: String,
        cols: u32,
        rows: u32,
    },
    Exec(String),
    Shell,
    Data(Vec<u8>),
    WindowChange {
        cols: u32,
        rows: u32,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct ExitState {
    finished: bool,
    code: Option<u32>,
}

/// One SSH connection carrying one session channel.
///
/// The channel is owned by a background pump task; calls on this type are
/// forwarded to it. Remote stdout and stderr arrive on their own receivers,
/// which end when the channel closes. A peer that stops answering the
/// client's keepalives drops the connection, which closes the channel too.
pub struct SshSession {
    addr: String,
    handle: Handle<ClientHandler>,
    requests: mpsc::Sender<(Request, oneshot::Sender<Result<()>>)>,
    stdout: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    stderr: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    exit: watch::Receiver<ExitState>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<Result<()>>>>,
    closed: AtomicBool,
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("addr", &self.addr)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SshSession {
    pub(crate) fn spawn(handle: Handle<ClientHandler>, channel: Channel<Msg>, addr: String) -> Self {
        let (requests, request_rx) = mpsc::channel(STREAM_CAPACITY);
        let (stdout_tx, stdout_rx) = mpsc::channel(STREAM_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(STREAM_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(ExitState::default());
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(pump(
            channel,
            request_rx,
            stdout_tx,
            stderr_tx,
            exit_tx,
            cancel.clone(),
        ));

        Self {
            addr,
            handle,
            requests,
            stdout: Mutex::new(Some(stdout_rx)),
            stderr: Mutex::new(Some(stderr_rx)),
            exit: exit_rx,
            cancel,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn request(&self, request: Request) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send((request, reply))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn request_pty(&self, term: &str, cols: u32, rows: u32) -> Result<()> {
        self.request(Request::Pty {
            term: term.to_string(),
            cols,
            rows,
        })
        .await
    }

    pub async fn start_shell(&self) -> Result<()> {
        self.request(Request::Shell).await
    }

    pub async fn exec(&self, command: &str) -> Result<()> {
        self.request(Request::Exec(command.to_string())).await
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.request(Request::Data(data.to_vec())).await
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        self.request(Request::WindowChange { cols, rows }).await
    }

    /// Remote stdout. Can be taken once.
    pub fn take_stdout(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.stdout.lock().ok()?.take()
    }

    /// Remote stderr. Can be taken once.
    pub fn take_stderr(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.stderr.lock().ok()?.take()
    }

    /// Wait for the channel to close. Returns the exit status if the remote
    /// reported one.
    pub async fn wait(&self) -> Result<Option<u32>> {
        let mut exit = self.exit.clone();
        let state = exit
            .wait_for(|s| s.finished)
            .await
            .map(|s| *s)
            .unwrap_or(ExitState {
                finished: true,
                code: None,
            });
        Ok(state.code)
    }

    /// Close the channel and the connection. Safe to call more than once;
    /// later calls return `Ok(())`. Every step runs even if an earlier one
    /// failed, and all failures are reported together.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut errors = Vec::new();
        self.cancel.cancel();

        let pump = self.pump.lock().ok().and_then(|mut p| p.take());
        if let Some(pump) = pump {
            match pump.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(Error::Io(std::io::Error::other(e))),
            }
        }

        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            errors.push(e.into());
        }

        debug!(addr = %self.addr, errors = errors.len(), "ssh: session closed");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(errors))
        }
    }
}

async fn pump(
    mut channel: Channel<Msg>,
    mut requests: mpsc::Receiver<(Request, oneshot::Sender<Result<()>>)>,
    stdout: mpsc::Sender<Vec<u8>>,
    stderr: mpsc::Sender<Vec<u8>>,
    exit: watch::Sender<ExitState>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut code = None;
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            request = requests.recv() => {
                let Some((request, reply)) = request else {
                    cancelled = true;
                    break;
                };
                let result = apply(&mut channel, request).await;
                let _ = reply.send(result);
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if !forward(&stdout, data.to_vec(), &cancel).await {
                        cancelled = true;
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == SSH_EXTENDED_DATA_STDERR => {
                    if !forward(&stderr, data.to_vec(), &cancel).await {
                        cancelled = true;
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => code = Some(exit_status),
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    debug!(signal = ?signal_name, "ssh: remote process killed by signal");
                }
                Some(ChannelMsg::Failure) => warn!("ssh: channel request rejected by server"),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    }

    exit.send_replace(ExitState {
        finished: true,
        code,
    });

    if cancelled {
        channel.close().await?;
    }
    Ok(())
}

async fn apply(channel: &mut Channel<Msg>, request: Request) -> Result<()> {
    match request {
        Request::Pty { term, cols, rows } => {
            channel
                .request_pty(false, &term, cols, rows, 0, 0, &[])
                .await?
        }
        Request::Exec(command) => channel.exec(true, command).await?,
        Request::Shell => channel.request_shell(true).await?,
        Request::Data(data) => channel.data(&data[..]).await?,
        Request::WindowChange { cols, rows } => channel.window_change(cols, rows, 0, 0).await?,
    }
    Ok(())
}

/// Deliver a chunk unless the session is being torn down. A dropped receiver
/// only means nobody wants this stream any more.
async fn forward(tx: &mpsc::Sender<Vec<u8>>, chunk: Vec<u8>, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tx.send(chunk) => true,
    }
}
