//! SSH transport to project machines and the process connector built on it.

pub mod client;
pub mod command;
pub mod connector;
pub mod session;

pub use client::SshClient;
pub use connector::{
    ConnectorState, Framing, OUTBOUND_CAPACITY, ProcessConfig, ProcessConnector, ProcessTransport,
    PtySize,
};
pub use session::SshSession;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ssh protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("invalid ssh key: {0}")]
    Key(#[from] russh_keys::Error),

    #[error("ssh authentication rejected for user {user}")]
    AuthRejected { user: String },

    #[error("connecting to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("could not connect to {addr} after {attempts} attempts: {last}")]
    RetriesExhausted {
        addr: String,
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("invalid environment variable name: {0:?}")]
    InvalidEnvName(String),

    #[error("session is closed")]
    Closed,

    #[error("errors while closing session: {}", join(.0))]
    Close(Vec<Error>),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn join(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
