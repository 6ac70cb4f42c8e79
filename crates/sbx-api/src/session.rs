//! Bridges between a client WebSocket and a process on a project machine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use sbx_db::CredentialStore;
use sbx_infra::types::Endpoint;
use sbx_ssh::{ProcessConfig, ProcessConnector, SshClient};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::lifecycle::LifecycleManager;
use crate::protocol::{ClientMessage, ServerEvent, ServerMessage};
use crate::vault::CredentialVault;

const OUTBOUND_CAPACITY: usize = 64;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a process connector on a machine endpoint.
#[async_trait]
pub trait SessionOpener: Send + Sync + 'static {
    async fn open(
        &self,
        endpoint: &Endpoint,
        config: ProcessConfig,
    ) -> sbx_ssh::Result<ProcessConnector>;
}

#[async_trait]
impl SessionOpener for SshClient {
    async fn open(
        &self,
        endpoint: &Endpoint,
        config: ProcessConfig,
    ) -> sbx_ssh::Result<ProcessConnector> {
        ProcessConnector::open(self, &endpoint.host, endpoint.port, config).await
    }
}

/// Environment variable a provider's API key is exposed as.
pub fn credential_env_var(provider: &str) -> String {
    if provider.eq_ignore_ascii_case("anthropic") {
        return "ANTHROPIC_API_KEY".into();
    }
    let name: String = provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{name}_API_KEY")
}

/// Environment for an agent process: the project id plus every stored
/// credential the vault can decrypt.
pub async fn agent_env(
    credentials: &dyn CredentialStore,
    vault: Option<&CredentialVault>,
    user_id: Uuid,
    project_id: Uuid,
) -> sqlx::Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::from([("PROJECT_ID".to_string(), project_id.to_string())]);
    let Some(vault) = vault else {
        return Ok(env);
    };

    for credential in credentials.list_credentials(user_id).await? {
        match vault.decrypt(&credential.ciphertext, user_id) {
            Ok(secret) => {
                env.insert(credential_env_var(&credential.provider), secret);
            }
            Err(e) => tracing::warn!(
                user_id = %user_id,
                provider = %credential.provider,
                error = %e,
                "skipping credential that does not decrypt"
            ),
        }
    }
    Ok(env)
}

// ── Agent bridge ────────────────────────────────────────────────────

/// Parse a client text frame and re-serialize it as the line the agent reads.
fn client_line(text: &str) -> Result<(Vec<u8>, bool), serde_json::Error> {
    let msg: ClientMessage = serde_json::from_str(text)?;
    Ok((serde_json::to_vec(&msg)?, msg.is_prompt()))
}

/// Wrap one agent output line for the client. Unparseable lines are dropped.
fn agent_frame(frame: &[u8], agent: &str) -> Option<String> {
    match serde_json::from_slice::<ServerEvent>(frame) {
        Ok(event) => serde_json::to_string(&ServerMessage::new(event, agent)).ok(),
        Err(e) => {
            tracing::warn!(error = %e, len = frame.len(), "dropping unparseable agent frame");
            None
        }
    }
}

fn event_message(event: ServerEvent, agent: &str) -> Option<Message> {
    serde_json::to_string(&ServerMessage::new(event, agent))
        .ok()
        .map(|text| Message::Text(text.into()))
}

/// Open the agent on `endpoint` and relay until either side goes away.
pub async fn agent_bridge(
    socket: WebSocket,
    opener: Arc<dyn SessionOpener>,
    endpoint: Endpoint,
    config: ProcessConfig,
    agent: String,
    lifecycle: Arc<LifecycleManager>,
    project_id: Uuid,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let connector = match opener.open(&endpoint, config).await {
        Ok(connector) => Arc::new(connector),
        Err(e) => {
            tracing::error!(project_id = %project_id, endpoint = %endpoint, error = %e, "agent session failed to open");
            let event = ServerEvent::Error {
                error: format!("failed to start agent: {e}"),
            };
            if let Some(msg) = event_message(event, &agent) {
                let _ = ws_tx.send(msg).await;
            }
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let Some(mut frames) = connector.receive() else {
        let _ = connector.close().await;
        return;
    };
    tracing::info!(project_id = %project_id, endpoint = %endpoint, "agent session opened");

    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let writer = spawn_writer(ws_tx, out_rx);

    let agent_tx = out_tx.clone();
    let agent_connector = Arc::clone(&connector);
    let agent_name = agent.clone();
    let mut agent_reader = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Some(text) = agent_frame(&frame, &agent_name)
                && agent_tx.send(Message::Text(text.into())).await.is_err()
            {
                break;
            }
        }
        let exit_code = agent_connector.wait().await.ok().flatten();
        if let Some(msg) = event_message(ServerEvent::Done { exit_code }, &agent_name) {
            let _ = agent_tx.send(msg).await;
        }
        let _ = agent_tx.send(Message::Close(None)).await;
        exit_code
    });

    let client_tx = out_tx.clone();
    let client_connector = Arc::clone(&connector);
    let mut client_reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            match client_line(text.as_str()) {
                Ok((line, is_prompt)) => {
                    if is_prompt && let Err(e) = lifecycle.touch(project_id).await {
                        tracing::warn!(project_id = %project_id, error = %e, "failed to record activity");
                    }
                    if let Err(e) = client_connector.send(&line).await {
                        tracing::warn!(project_id = %project_id, error = %e, "agent stdin closed");
                        break;
                    }
                }
                Err(e) => {
                    let event = ServerEvent::Error {
                        error: format!("invalid message: {e}"),
                    };
                    if let Some(msg) = event_message(event, &agent) {
                        let _ = client_tx.send(msg).await;
                    }
                }
            }
        }
    });

    let agent_finished = tokio::select! {
        _ = &mut agent_reader => true,
        _ = &mut client_reader => false,
    };
    client_reader.abort();

    if let Err(e) = connector.close().await {
        tracing::debug!(project_id = %project_id, error = %e, "agent connector close");
    }
    if !agent_finished && tokio::time::timeout(DRAIN_TIMEOUT, &mut agent_reader).await.is_err() {
        agent_reader.abort();
    }

    drop(out_tx);
    finish_writer(writer).await;
    tracing::info!(project_id = %project_id, "agent session closed");
}

// ── Terminal bridge ─────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum TerminalInput {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TerminalControl {
    Resize { cols: u32, rows: u32 },
}

fn terminal_input(text: &str) -> TerminalInput {
    match serde_json::from_str::<TerminalControl>(text) {
        Ok(TerminalControl::Resize { cols, rows }) => TerminalInput::Resize { cols, rows },
        Err(_) => TerminalInput::Data(text.as_bytes().to_vec()),
    }
}

/// Open a pty shell on `endpoint` and relay raw bytes both ways.
pub async fn terminal_bridge(
    socket: WebSocket,
    opener: Arc<dyn SessionOpener>,
    endpoint: Endpoint,
    config: ProcessConfig,
    project_id: Uuid,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let connector = match opener.open(&endpoint, config).await {
        Ok(connector) => Arc::new(connector),
        Err(e) => {
            tracing::error!(project_id = %project_id, endpoint = %endpoint, error = %e, "terminal failed to open");
            let _ = ws_tx
                .send(Message::Text(format!("failed to open terminal: {e}\r\n").into()))
                .await;
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let Some(mut frames) = connector.receive() else {
        let _ = connector.close().await;
        return;
    };
    tracing::info!(project_id = %project_id, endpoint = %endpoint, "terminal opened");

    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let writer = spawn_writer(ws_tx, out_rx);

    let shell_tx = out_tx.clone();
    let mut shell_reader = tokio::spawn(async move {
        while let Some(chunk) = frames.recv().await {
            if shell_tx.send(Message::Binary(chunk.into())).await.is_err() {
                break;
            }
        }
        let _ = shell_tx.send(Message::Close(None)).await;
    });

    let client_connector = Arc::clone(&connector);
    let mut client_reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let input = match msg {
                Message::Binary(data) => TerminalInput::Data(data.to_vec()),
                Message::Text(text) => terminal_input(text.as_str()),
                Message::Close(_) => break,
                _ => continue,
            };
            let result = match input {
                TerminalInput::Data(data) => client_connector.send(&data).await,
                TerminalInput::Resize { cols, rows } => client_connector.resize(cols, rows).await,
            };
            if let Err(e) = result {
                tracing::debug!(project_id = %project_id, error = %e, "terminal input rejected");
                break;
            }
        }
    });

    let shell_finished = tokio::select! {
        _ = &mut shell_reader => true,
        _ = &mut client_reader => false,
    };
    client_reader.abort();

    if let Err(e) = connector.close().await {
        tracing::debug!(project_id = %project_id, error = %e, "terminal connector close");
    }
    if !shell_finished && tokio::time::timeout(DRAIN_TIMEOUT, &mut shell_reader).await.is_err() {
        shell_reader.abort();
    }

    drop(out_tx);
    finish_writer(writer).await;
    tracing::info!(project_id = %project_id, "terminal closed");
}

// ── Shared ──────────────────────────────────────────────────────────

fn spawn_writer(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let close = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || close {
                break;
            }
        }
    })
}

async fn finish_writer(mut writer: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    const MASTER: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn provider_env_names() {
        assert_eq!(credential_env_var("anthropic"), "ANTHROPIC_API_KEY");
        assert_eq!(credential_env_var("openai"), "OPENAI_API_KEY");
        assert_eq!(credential_env_var("google-ai"), "GOOGLE_AI_API_KEY");
    }

    #[tokio::test]
    async fn agent_env_decrypts_owned_credentials() {
        let store = MemoryStore::default();
        let vault = CredentialVault::new(MASTER).unwrap();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        let project = Uuid::new_v4();

        store
            .put_credential(user, "anthropic", &vault.encrypt("sk-ant", user).unwrap())
            .await
            .unwrap();
        store
            .put_credential(user, "openai", &vault.encrypt("sk-oai", other).unwrap())
            .await
            .unwrap();

        let env = agent_env(&store, Some(&vault), user, project).await.unwrap();
        assert_eq!(env["PROJECT_ID"], project.to_string());
        assert_eq!(env["ANTHROPIC_API_KEY"], "sk-ant");
        assert!(!env.contains_key("OPENAI_API_KEY"));
    }

    #[tokio::test]
    async fn agent_env_without_vault_has_no_credentials() {
        let store = MemoryStore::default();
        let user = Uuid::new_v4();
        store.put_credential(user, "anthropic", "opaque").await.unwrap();

        let env = agent_env(&store, None, user, Uuid::new_v4()).await.unwrap();
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn client_frames_become_single_lines() {
        let (line, is_prompt) =
            client_line(r#"{ "type": "prompt", "content": "line one\nline two" }"#).unwrap();
        assert!(is_prompt);
        assert!(!line.contains(&b'\n'));
        let back: ClientMessage = serde_json::from_slice(&line).unwrap();
        assert_eq!(
            back,
            ClientMessage::Prompt {
                content: "line one\nline two".into()
            }
        );

        assert!(client_line("not json").is_err());
    }

    #[test]
    fn agent_frames_are_attributed_or_dropped() {
        let text = agent_frame(br#"{"type":"thinking","text":"hmm"}"#, "sandbox-agent").unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "thinking");
        assert_eq!(value["agent"], "sandbox-agent");

        assert!(agent_frame(b"Loading model...", "sandbox-agent").is_none());
        assert!(agent_frame(br#"{"type":"mystery"}"#, "sandbox-agent").is_none());
    }

    #[test]
    fn terminal_text_is_data_unless_resize() {
        assert_eq!(
            terminal_input(r#"{"type":"resize","cols":120,"rows":40}"#),
            TerminalInput::Resize { cols: 120, rows: 40 }
        );
        assert_eq!(terminal_input("ls -la\r"), TerminalInput::Data(b"ls -la\r".to_vec()));
        assert_eq!(
            terminal_input(r#"{"type":"other"}"#),
            TerminalInput::Data(br#"{"type":"other"}"#.to_vec())
        );
    }
}
