//! Serial console access to running VMs.
//!
//! The guest runs a small console agent that exposes the serial console as a
//! WebSocket on its private address. The gateway relays a user's terminal to
//! it through a [`ConsoleChannel`].

use std::time::Duration;

use async_trait::async_trait;
use flarevm_store::Vm;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Buffer depth of each direction of a console channel.
const CHANNEL_DEPTH: usize = 64;

/// Errors opening a console.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The console agent refused or dropped the connection.
    #[error("console connection failed: {0}")]
    Connect(String),

    /// The console agent did not answer in time.
    #[error("console connection timed out")]
    Timeout,
}

/// Input from the user's terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    /// Keystrokes.
    Data(Vec<u8>),
    /// The terminal was resized.
    Resize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
}

/// A live console session.
///
/// Dropping `input` closes the session; `output` ends when the guest side
/// closes.
#[derive(Debug)]
pub struct ConsoleChannel {
    /// Send terminal input to the guest.
    pub input: mpsc::Sender<ConsoleInput>,
    /// Receive console output from the guest.
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// Opens console sessions.
#[async_trait]
pub trait ConsoleConnector: Send + Sync {
    /// Open a console session to `vm`.
    ///
    /// # Errors
    ///
    /// Returns an error if the guest console cannot be reached.
    async fn connect(&self, vm: &Vm) -> Result<ConsoleChannel, ConsoleError>;
}

/// Connects to the in-guest console agent over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConsoleConnector {
    port: u16,
    connect_timeout: Duration,
}

impl WsConsoleConnector {
    /// Create a connector for agents listening on `port`.
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            port,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Override the connect deadline.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The console URL of `vm`.
    #[must_use]
    pub fn url_for(&self, vm: &Vm) -> String {
        format!("ws://{}:{}/console", vm.network.ip_address, self.port)
    }
}

#[derive(Serialize)]
struct ResizeMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    cols: u16,
    rows: u16,
}

#[async_trait]
impl ConsoleConnector for WsConsoleConnector {
    async fn connect(&self, vm: &Vm) -> Result<ConsoleChannel, ConsoleError> {
        let url = self.url_for(vm);

        let (ws, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| ConsoleError::Timeout)?
        .map_err(|e| ConsoleError::Connect(e.to_string()))?;

        tracing::debug!(vm_id = %vm.vm_id, %url, "Connected to VM console");

        let (mut sink, mut stream) = ws.split();
        let (input_tx, mut input_rx) = mpsc::channel::<ConsoleInput>(CHANNEL_DEPTH);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);

        let vm_id = vm.vm_id;
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let message = match input {
                    ConsoleInput::Data(bytes) => Message::Binary(bytes),
                    ConsoleInput::Resize { cols, rows } => {
                        match serde_json::to_string(&ResizeMessage {
                            kind: "resize",
                            cols,
                            rows,
                        }) {
                            Ok(json) => Message::Text(json),
                            Err(_) => continue,
                        }
                    }
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
            tracing::debug!(vm_id = %vm_id, "Console input closed");
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let bytes = match message {
                    Ok(Message::Binary(bytes)) => bytes,
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if output_tx.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        Ok(ConsoleChannel {
            input: input_tx,
            output: output_rx,
        })
    }
}

/// In-process console for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::{
        async_trait, mpsc, ConsoleChannel, ConsoleConnector, ConsoleError, ConsoleInput, Vm,
        CHANNEL_DEPTH,
    };

    /// Echoes input back as output and reports resizes as `resize:<cols>x<rows>`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct EchoConsole {
        /// Fail every connection attempt.
        pub refuse: bool,
    }

    #[async_trait]
    impl ConsoleConnector for EchoConsole {
        async fn connect(&self, _vm: &Vm) -> Result<ConsoleChannel, ConsoleError> {
            if self.refuse {
                return Err(ConsoleError::Connect("connection refused".to_string()));
            }

            let (input_tx, mut input_rx) = mpsc::channel::<ConsoleInput>(CHANNEL_DEPTH);
            let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);

            tokio::spawn(async move {
                while let Some(input) = input_rx.recv().await {
                    let echoed = match input {
                        ConsoleInput::Data(bytes) => bytes,
                        ConsoleInput::Resize { cols, rows } => {
                            format!("resize:{cols}x{rows}").into_bytes()
                        }
                    };
                    if output_tx.send(echoed).await.is_err() {
                        break;
                    }
                }
            });

            Ok(ConsoleChannel {
                input: input_tx,
                output: output_rx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flarevm_core::{ImageId, OfferId, UserId, VmId};
    use flarevm_store::{NetworkIdentity, VmResources, VmStatus};
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn vm_at(ip: Ipv4Addr) -> Vm {
        Vm {
            vm_id: VmId::generate(),
            user_id: UserId::new(1),
            name: "web-1".to_string(),
            status: VmStatus::Running,
            resources: VmResources {
                vcpu_count: 1,
                memory_size_mib: 512,
                disk_size_gb: 5,
            },
            system_image_id: ImageId::generate(),
            vm_offer_id: OfferId::generate(),
            network: NetworkIdentity {
                slot: 0,
                ip_address: ip,
                mac_address: "06:00:7f:00:00:01".to_string(),
                tap_device_name: "fctap0".to_string(),
                tap_ip: Ipv4Addr::new(127, 0, 0, 2),
                network_namespace: "flarevm".to_string(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            error_message: None,
        }
    }

    #[test]
    fn console_url() {
        let connector = WsConsoleConnector::new(7681);
        let vm = vm_at(Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(connector.url_for(&vm), "ws://172.16.0.2:7681/console");
    }

    #[tokio::test]
    async fn relays_to_console_agent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Console agent stand-in: echo binary frames, answer resizes in text
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Binary(bytes) => ws.send(Message::Binary(bytes)).await.unwrap(),
                    Message::Text(text) => {
                        ws.send(Message::Text(format!("ack {text}"))).await.unwrap();
                    }
                    _ => break,
                }
            }
        });

        let connector = WsConsoleConnector::new(port);
        let mut channel = connector
            .connect(&vm_at(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();

        channel
            .input
            .send(ConsoleInput::Data(b"ls\n".to_vec()))
            .await
            .unwrap();
        assert_eq!(channel.output.recv().await.unwrap(), b"ls\n".to_vec());

        channel
            .input
            .send(ConsoleInput::Resize { cols: 120, rows: 40 })
            .await
            .unwrap();
        let ack = String::from_utf8(channel.output.recv().await.unwrap()).unwrap();
        assert!(ack.starts_with("ack "));
        assert!(ack.contains("\"type\":\"resize\""));
        assert!(ack.contains("\"cols\":120"));
    }

    #[tokio::test]
    async fn unreachable_console_fails() {
        let connector =
            WsConsoleConnector::new(9).with_connect_timeout(Duration::from_secs(2));
        let result = connector.connect(&vm_at(Ipv4Addr::LOCALHOST)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn echo_console_reports_resize() {
        let mut channel = mock::EchoConsole::default()
            .connect(&vm_at(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        channel
            .input
            .send(ConsoleInput::Resize { cols: 80, rows: 24 })
            .await
            .unwrap();
        assert_eq!(channel.output.recv().await.unwrap(), b"resize:80x24".to_vec());
    }
}
