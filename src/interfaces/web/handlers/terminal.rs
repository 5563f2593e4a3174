use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::super::AppState;
use super::ApiError;
use crate::core::docker::validate_container_ref;
use crate::core::remote::{RemoteExecutor, RemoteTarget};

const FRAME_BUFFER: usize = 64;

/// Wire frame in both directions: `{"type": "...", "data": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Frame {
    Connected(String),
    Output(String),
    Error(String),
    Command(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Streaming,
    Closed,
}

/// Prefers bash inside the container, falls back to sh.
fn container_shell_command(container_id: &str) -> String {
    format!(
        "docker exec -it {} sh -c 'command -v bash >/dev/null 2>&1 && exec bash || exec sh'",
        container_id
    )
}

/// Decodes the longest valid UTF-8 prefix of `pending` and keeps a split
/// trailing sequence for the next read.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            return text;
        }
    };
    let rest = pending.split_off(valid);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

/// One interactive shell bridged to one client. Shell output becomes
/// `output` frames, `command` data goes to the shell's stdin, and the remote
/// shell is torn down when either side goes away.
pub(crate) struct TerminalSession {
    label: String,
    command: Option<String>,
    state: SessionState,
}

impl TerminalSession {
    pub(crate) fn new(label: String, command: Option<String>) -> Self {
        Self {
            label,
            command,
            state: SessionState::Open,
        }
    }

    pub(crate) async fn run(
        mut self,
        exec: Arc<dyn RemoteExecutor>,
        target: RemoteTarget,
        mut commands: mpsc::Receiver<String>,
        frames: mpsc::Sender<Frame>,
    ) {
        let mut shell = match exec.open_shell(&target, self.command.as_deref()).await {
            Ok(shell) => shell,
            Err(e) => {
                warn!("Terminal for {} failed to open: {}", self.label, e);
                let _ = frames.send(Frame::Error(e.to_string())).await;
                self.state = SessionState::Closed;
                return;
            }
        };
        self.state = SessionState::Streaming;
        info!("Terminal session opened for {}", self.label);
        let _ = frames
            .send(Frame::Connected(format!("Connected to {}", self.label)))
            .await;

        let mut buf = vec![0u8; 4096];
        let mut pending = Vec::new();
        while self.state == SessionState::Streaming {
            tokio::select! {
                read = shell.output.read(&mut buf) => match read {
                    Ok(0) => {
                        let _ = frames.send(Frame::Output("\r\n[session closed]\r\n".to_string())).await;
                        self.state = SessionState::Closed;
                    }
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        let text = drain_utf8(&mut pending);
                        if !text.is_empty() && frames.send(Frame::Output(text)).await.is_err() {
                            self.state = SessionState::Closed;
                        }
                    }
                    Err(e) => {
                        let _ = frames.send(Frame::Error(format!("shell read failed: {}", e))).await;
                        self.state = SessionState::Closed;
                    }
                },
                command = commands.recv() => match command {
                    Some(data) => {
                        let written = match shell.input.write_all(data.as_bytes()).await {
                            Ok(()) => shell.input.flush().await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = written {
                            let _ = frames.send(Frame::Error(format!("shell write failed: {}", e))).await;
                            self.state = SessionState::Closed;
                        }
                    }
                    None => self.state = SessionState::Closed,
                },
            }
        }

        shell.close().await;
        info!("Terminal session closed for {}", self.label);
    }
}

pub async fn host_terminal_endpoint(
    Path(host_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let (host, target) = state.targets.resolve(&host_id).await?;
    let label = format!("{} ({})", host.name, host.address);
    Ok(ws.on_upgrade(move |socket| serve_socket(socket, state.exec, target, label, None)))
}

pub async fn container_terminal_endpoint(
    Path((host_id, container_id)): Path<(String, String)>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    validate_container_ref(&container_id)?;
    let (host, target) = state.targets.resolve(&host_id).await?;
    let label = format!("container {} on {}", container_id, host.name);
    let command = container_shell_command(&container_id);
    Ok(ws.on_upgrade(move |socket| {
        serve_socket(socket, state.exec, target, label, Some(command))
    }))
}

/// Adapts the websocket to the session's channels.
async fn serve_socket(
    socket: WebSocket,
    exec: Arc<dyn RemoteExecutor>,
    target: RemoteTarget,
    label: String,
    command: Option<String>,
) {
    let (mut sink, mut stream) = socket.split();
    let (command_tx, command_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_BUFFER);

    let session = tokio::spawn(TerminalSession::new(label, command).run(
        exec, target, command_rx, frame_tx,
    ));
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<Frame>(text.as_str()) {
                Ok(Frame::Command(data)) => {
                    if command_tx.send(data).await.is_err() {
                        break;
                    }
                }
                Ok(other) => debug!("Ignoring client frame {:?}", other),
                Err(e) => debug!("Malformed terminal frame: {}", e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop(command_tx);
    let _ = session.await;
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::RemoteError;
    use crate::core::remote::fake::FakeExecutor;
    use std::time::Duration;

    async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame should arrive")
            .expect("channel open")
    }

    #[test]
    fn frames_use_type_and_data_fields() {
        let frame: Frame = serde_json::from_str(r#"{"type":"command","data":"ls\n"}"#).unwrap();
        assert_eq!(frame, Frame::Command("ls\n".to_string()));
        assert_eq!(
            serde_json::to_string(&Frame::Output("hi".to_string())).unwrap(),
            r#"{"type":"output","data":"hi"}"#
        );
    }

    #[test]
    fn split_multibyte_sequences_wait_for_the_next_read() {
        let bytes = "héllo".as_bytes();
        let mut pending = bytes[..2].to_vec();
        assert_eq!(drain_utf8(&mut pending), "h");
        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(drain_utf8(&mut pending), "éllo");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn commands_reach_the_shell_and_output_streams_back() {
        let fake = Arc::new(FakeExecutor::new());
        let target = fake.target();
        let (command_tx, command_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        let session = tokio::spawn(
            TerminalSession::new("edge".to_string(), None).run(fake.clone(), target, command_rx, frame_tx),
        );

        assert_eq!(
            next_frame(&mut frame_rx).await,
            Frame::Connected("Connected to edge".to_string())
        );
        command_tx.send("uptime\n".to_string()).await.unwrap();
        assert_eq!(next_frame(&mut frame_rx).await, Frame::Output("$ uptime\n".to_string()));

        drop(command_tx);
        session.await.unwrap();
        assert_eq!(fake.count("shell login"), 1);
    }

    #[tokio::test]
    async fn open_failure_sends_error_frame() {
        let fake = Arc::new(FakeExecutor::new());
        let target = fake.target();
        fake.fail(
            "shell docker exec",
            RemoteError::Unreachable {
                host: target.address.clone(),
                message: "connection refused".to_string(),
            },
        );
        let (_command_tx, command_rx) = mpsc::channel(8);
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        TerminalSession::new("web".to_string(), Some(container_shell_command("web")))
            .run(fake, target, command_rx, frame_tx)
            .await;

        match next_frame(&mut frame_rx).await {
            Frame::Error(message) => assert!(message.contains("unreachable")),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(frame_rx.recv().await.is_none());
    }
}
