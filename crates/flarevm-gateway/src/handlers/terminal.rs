//! Terminal WebSocket proxy.
//!
//! Relays a browser terminal to the serial console of a running VM. Binary
//! frames and ordinary text frames are raw terminal bytes; a text frame
//! holding `{"type":"resize","cols":N,"rows":M}` resizes the guest terminal.
//!
//! Close codes:
//!
//! | code | meaning                                 |
//! |------|-----------------------------------------|
//! | 1000 | the console closed                      |
//! | 1011 | the console could not be reached        |
//! | 4004 | the VM is not running                   |
//! | 4010 | the VM left `running` during the session |
//! | 4011 | the VM was deleted during the session   |

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;

use flarevm_auth::JwtValidator;
use flarevm_control::{
    Actor, ConsoleChannel, ConsoleConnector, ConsoleInput, ControlPlane, Vm, VmEvent, VmStatus,
};
use flarevm_core::VmId;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::handlers::vms::{next_status, parse_vm_id};
use crate::state::GatewayState;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// The console failed.
pub const CLOSE_CONSOLE_ERROR: u16 = 1011;
/// The VM is not running.
pub const CLOSE_NOT_RUNNING: u16 = 4004;
/// The VM stopped, paused or failed during the session.
pub const CLOSE_LEFT_RUNNING: u16 = 4010;
/// The VM was deleted during the session.
pub const CLOSE_DELETED: u16 = 4011;

/// A control frame sent by the terminal as text.
#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    cols: u16,
    rows: u16,
}

/// Interpret a text frame from the terminal.
fn text_input(text: String) -> ConsoleInput {
    match serde_json::from_str::<ControlFrame>(&text) {
        Ok(frame) if frame.kind == "resize" => ConsoleInput::Resize {
            cols: frame.cols,
            rows: frame.rows,
        },
        _ => ConsoleInput::Data(text.into_bytes()),
    }
}

/// Terminal WebSocket handler.
///
/// Verifies access to the VM and upgrades the connection. Status checks
/// happen after the upgrade so that refusals reach the browser as close
/// codes.
///
/// # Errors
///
/// Returns an error if the VM ID is malformed, the VM is not found, or the
/// user doesn't own it.
pub async fn terminal_handler<C, V>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState<C, V>>>,
    Path(vm_id): Path<String>,
    user: AuthUser,
) -> Result<Response, ApiError>
where
    C: ControlPlane + 'static,
    V: JwtValidator + 'static,
{
    let vm_id = parse_vm_id(&vm_id)?;

    // Subscribe first so a change right after the read is not missed
    let events = state.control.subscribe();
    let vm = state.control.get_vm(&user.actor(), &vm_id).await?;

    tracing::info!(
        vm_id = %vm_id,
        user_id = %user.user_id,
        status = vm.status.as_str(),
        "Terminal connection initiated"
    );

    let console = Arc::clone(&state.console);
    let control = Arc::clone(&state.control);
    let actor = user.actor();
    Ok(ws.on_upgrade(move |socket| {
        handle_terminal(socket, vm, console, control, actor, events)
    }))
}

type ClientSink = SplitSink<WebSocket, Message>;

async fn close(sink: &mut ClientSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Failed to send close frame");
    }
}

/// Handle the terminal connection after upgrade.
async fn handle_terminal<C: ControlPlane>(
    socket: WebSocket,
    vm: Vm,
    console: Arc<dyn ConsoleConnector>,
    control: Arc<C>,
    actor: Actor,
    events: broadcast::Receiver<VmEvent>,
) {
    let vm_id = vm.vm_id;
    let (mut sink, stream) = socket.split();

    if vm.status != VmStatus::Running {
        tracing::debug!(vm_id = %vm_id, status = vm.status.as_str(), "Terminal refused");
        close(&mut sink, CLOSE_NOT_RUNNING, "VM is not running").await;
        return;
    }

    let channel = match console.connect(&vm).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(vm_id = %vm_id, error = %e, "Failed to open VM console");
            close(&mut sink, CLOSE_CONSOLE_ERROR, "console unavailable").await;
            return;
        }
    };

    tracing::info!(vm_id = %vm_id, "Connected to VM console, starting relay");

    let watch = StatusWatch {
        control: &*control,
        actor,
        vm_id,
        events,
    };
    let (code, reason) = relay(vm_id, &mut sink, stream, channel, watch).await;
    if let Some(code) = code {
        close(&mut sink, code, reason).await;
    }

    tracing::info!(vm_id = %vm_id, code = ?code, reason, "Terminal relay ended");
}

/// Follows one VM's status for the life of a terminal session.
struct StatusWatch<'a, C> {
    control: &'a C,
    actor: Actor,
    vm_id: VmId,
    events: broadcast::Receiver<VmEvent>,
}

impl<C: ControlPlane> StatusWatch<'_, C> {
    /// Wait until the VM leaves `running`. Returns the close code and reason.
    async fn left_running(&mut self) -> (u16, &'static str) {
        loop {
            let event = next_status(&mut self.events, self.control, &self.actor, self.vm_id).await;
            match event.map(|event| event.status) {
                None => return (CLOSE_CONSOLE_ERROR, "VM status unavailable"),
                Some(None) => return (CLOSE_DELETED, "VM was deleted"),
                Some(Some(VmStatus::Running)) => {}
                Some(Some(_)) => return (CLOSE_LEFT_RUNNING, "VM is no longer running"),
            }
        }
    }
}

/// Relay until one side ends. Returns the close code to send, if any.
async fn relay<C: ControlPlane>(
    vm_id: VmId,
    sink: &mut ClientSink,
    mut stream: futures::stream::SplitStream<WebSocket>,
    channel: ConsoleChannel,
    mut watch: StatusWatch<'_, C>,
) -> (Option<u16>, &'static str) {
    let ConsoleChannel { input, mut output } = channel;

    loop {
        tokio::select! {
            message = stream.next() => {
                let input_frame = match message {
                    Some(Ok(Message::Binary(bytes))) => ConsoleInput::Data(bytes),
                    Some(Ok(Message::Text(text))) => text_input(text),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => {
                        return (None, "client closed");
                    }
                    Some(Err(e)) => {
                        tracing::debug!(vm_id = %vm_id, error = %e, "Error reading from client");
                        return (None, "client error");
                    }
                };
                if input.send(input_frame).await.is_err() {
                    return (Some(CLOSE_CONSOLE_ERROR), "console closed");
                }
            }
            bytes = output.recv() => {
                let Some(bytes) = bytes else {
                    return (Some(CLOSE_NORMAL), "console closed");
                };
                if sink.send(Message::Binary(bytes)).await.is_err() {
                    return (None, "client gone");
                }
            }
            (code, reason) = watch.left_running() => {
                return (Some(code), reason);
            }
        }
    }
}
