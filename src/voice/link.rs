//! Duplex links to the transcription service
//!
//! A [`Link`] is a pair of channels bridging one live socket: commands go
//! out through `outbound`, everything the socket produces (frames, errors,
//! the final close) comes back through `inbound` in arrival order. The
//! [`Connector`] seam lets the transport be driven without a network.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::{Error, Result};

/// Close code for a caller-initiated stop
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close frame received without a status code
pub const NO_STATUS: u16 = 1005;

/// Socket dropped without any close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Message sent towards the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw audio chunk, forwarded as a binary frame
    Audio(Vec<u8>),
    /// Close the socket with the given code
    Close(u16),
}

/// Something the socket produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    Binary(Vec<u8>),
    /// Socket-level error; the close that follows drives state changes
    Error(String),
    /// Socket closed with this code; always the last event
    Closed(u16),
}

/// Channel pair for one live connection
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links to a transcription endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be established
    async fn connect(&self, url: &str) -> Result<Link>;
}

/// WebSocket connector backed by `tokio-tungstenite`
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link> {
        let (stream, _) = connect_async(url).await.map_err(|e| {
            tracing::debug!(url, error = %e, "websocket handshake failed");
            Error::Transport(e.to_string())
        })?;
        let (mut writer, mut reader) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        let write_errors = in_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match msg {
                    Outbound::Audio(data) => {
                        if let Err(e) = writer.send(Message::Binary(data.into())).await {
                            let _ = write_errors.send(LinkEvent::Error(e.to_string()));
                            break;
                        }
                    }
                    Outbound::Close(code) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "client closing".into(),
                        };
                        if let Err(e) = writer.send(Message::Close(Some(frame))).await {
                            tracing::debug!(error = %e, "close frame not delivered");
                        }
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut close_code = None;

            while let Some(msg) = reader.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => LinkEvent::Text(text.as_str().to_owned()),
                    Ok(Message::Binary(data)) => LinkEvent::Binary(data.to_vec()),
                    Ok(Message::Close(frame)) => {
                        close_code = Some(frame.map_or(NO_STATUS, |f| u16::from(f.code)));
                        continue;
                    }
                    Ok(_) => continue,
                    Err(e) => LinkEvent::Error(e.to_string()),
                };

                let is_error = matches!(event, LinkEvent::Error(_));
                if in_tx.send(event).is_err() || is_error {
                    break;
                }
            }

            let _ = in_tx.send(LinkEvent::Closed(close_code.unwrap_or(ABNORMAL_CLOSURE)));
        });

        tracing::debug!(url, "websocket connected");
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
