//! Transport kinds and concrete links.
//!
//! Three mechanisms carry the same logical stream: datagram (UDP), socket
//! (websocket), and one-way push (SSE-style streaming HTTP). A link is a
//! thin framed pipe; the subscribe handshake and all protocol logic live
//! in [`crate::attempt`].

use crate::codec;
use crate::error::FeedError;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

const DATAGRAM_RECV_BUFFER: usize = 64 * 1024;

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Datagram,
    Socket,
    Push,
}

impl TransportKind {
    /// Cascade preference: datagram first, then socket, then push-only.
    pub const PREFERENCE_ORDER: [TransportKind; 3] =
        [TransportKind::Datagram, TransportKind::Socket, TransportKind::Push];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Datagram => "datagram",
            Self::Socket => "socket",
            Self::Push => "push",
        }
    }
}

/// Per-kind addresses; any subset may be configured.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEndpoints {
    pub datagram: Option<String>,
    pub socket: Option<String>,
    pub push: Option<String>,
}

impl TransportEndpoints {
    pub fn get(&self, kind: TransportKind) -> Option<&str> {
        match kind {
            TransportKind::Datagram => self.datagram.as_deref(),
            TransportKind::Socket => self.socket.as_deref(),
            TransportKind::Push => self.push.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.datagram.is_none() && self.socket.is_none() && self.push.is_none()
    }
}

/// Reports which transport kinds the current runtime can use. Injected so
/// cascade planning is testable without a live runtime.
pub trait CapabilityProbe: Send + Sync {
    fn supports(&self, kind: TransportKind) -> bool;
}

/// Native runtime: every kind is available.
#[derive(Debug, Default)]
pub struct RuntimeProbe;

impl CapabilityProbe for RuntimeProbe {
    fn supports(&self, _kind: TransportKind) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

pub struct DatagramLink {
    socket: UdpSocket,
    recv_buf: Box<[u8]>,
}

pub struct PushLink {
    stream: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    line_buf: Vec<u8>,
    pending: VecDeque<String>,
}

#[cfg(test)]
pub struct ScriptedLink {
    rx: tokio::sync::mpsc::Receiver<Result<Frame, FeedError>>,
    sent: tokio::sync::mpsc::UnboundedSender<String>,
    duplex: bool,
}

/// One open connection of one transport kind. Reads yield whole frames;
/// `None` means the remote closed the link.
pub enum TransportLink {
    Socket(FeedWsStream),
    Datagram(DatagramLink),
    Push(PushLink),
    #[cfg(test)]
    Scripted(ScriptedLink),
}

impl TransportLink {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Socket(_) => TransportKind::Socket,
            Self::Datagram(_) => TransportKind::Datagram,
            Self::Push(_) => TransportKind::Push,
            #[cfg(test)]
            Self::Scripted(link) => {
                if link.duplex {
                    TransportKind::Socket
                } else {
                    TransportKind::Push
                }
            }
        }
    }

    /// Push links are one-way; the handshake rides on the request instead.
    pub fn is_duplex(&self) -> bool {
        match self {
            Self::Push(_) => false,
            #[cfg(test)]
            Self::Scripted(link) => link.duplex,
            _ => true,
        }
    }

    pub async fn send(&mut self, text: &str) -> Result<(), FeedError> {
        match self {
            Self::Socket(stream) => {
                stream.send(Message::Text(text.to_string())).await?;
                Ok(())
            }
            Self::Datagram(link) => {
                link.socket.send(text.as_bytes()).await?;
                Ok(())
            }
            Self::Push(_) => {
                tracing::debug!("send ignored on one-way push link");
                Ok(())
            }
            #[cfg(test)]
            Self::Scripted(link) => {
                let _ = link.sent.send(text.to_string());
                Ok(())
            }
        }
    }

    pub async fn recv(&mut self) -> Option<Result<Frame, FeedError>> {
        match self {
            Self::Socket(stream) => loop {
                match stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                    Ok(Message::Binary(bytes)) => return Some(Ok(Frame::Binary(bytes))),
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => continue,
                    Err(error) => return Some(Err(error.into())),
                }
            },
            Self::Datagram(link) => match link.socket.recv(&mut link.recv_buf).await {
                Ok(len) => Some(Ok(Frame::Binary(link.recv_buf[..len].to_vec()))),
                Err(error) => Some(Err(error.into())),
            },
            Self::Push(link) => loop {
                if let Some(event) = link.pending.pop_front() {
                    return Some(Ok(Frame::Text(event)));
                }
                match link.stream.next().await? {
                    Ok(chunk) => {
                        link.line_buf.extend_from_slice(&chunk);
                        drain_push_events(&mut link.line_buf, &mut link.pending);
                    }
                    Err(error) => return Some(Err(error.into())),
                }
            },
            #[cfg(test)]
            Self::Scripted(link) => link.rx.recv().await,
        }
    }

    pub async fn shutdown(&mut self) {
        if let Self::Socket(stream) = self {
            let _ = stream.close(None).await;
        }
    }

    #[cfg(test)]
    pub fn scripted(
        rx: tokio::sync::mpsc::Receiver<Result<Frame, FeedError>>,
        duplex: bool,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (sent_tx, sent_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self::Scripted(ScriptedLink {
                rx,
                sent: sent_tx,
                duplex,
            }),
            sent_rx,
        )
    }
}

/// Splits buffered SSE bytes into complete `data:` payloads. Comment and
/// blank lines are dropped; partial trailing lines stay in the buffer.
fn drain_push_events(line_buf: &mut Vec<u8>, pending: &mut VecDeque<String>) {
    while let Some(newline_at) = line_buf.iter().position(|&byte| byte == b'\n') {
        let mut line: Vec<u8> = line_buf.drain(..=newline_at).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        let Ok(line) = String::from_utf8(line) else {
            continue;
        };
        if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.trim_start();
            if !payload.is_empty() {
                pending.push_back(payload.to_string());
            }
        }
    }
}

/// Opens one link of the given kind. The channel is only used by the push
/// transport, which carries the subscribe handshake in the request because
/// it cannot write to the stream.
pub async fn open(
    kind: TransportKind,
    endpoint: &str,
    channel: &str,
) -> Result<TransportLink, FeedError> {
    match kind {
        TransportKind::Datagram => {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(endpoint).await?;
            Ok(TransportLink::Datagram(DatagramLink {
                socket,
                recv_buf: vec![0; DATAGRAM_RECV_BUFFER].into_boxed_slice(),
            }))
        }
        TransportKind::Socket => {
            let ws_config = WebSocketConfig {
                max_message_size: Some(16 << 20),
                max_frame_size: Some(4 << 20),
                ..Default::default()
            };
            let (stream, _) = connect_async_with_config(endpoint, Some(ws_config), true).await?;
            Ok(TransportLink::Socket(stream))
        }
        TransportKind::Push => {
            let handshake = codec::encode_subscribe(channel)?;
            let response = reqwest::Client::new()
                .get(endpoint)
                .query(&[("subscribe", handshake.as_str())])
                .send()
                .await?
                .error_for_status()?;
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed();
            Ok(TransportLink::Push(PushLink {
                stream,
                line_buf: Vec::new(),
                pending: VecDeque::new(),
            }))
        }
    }
}
