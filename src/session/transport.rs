use std::borrow::Cow;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::error::TransportError;
use crate::session::state::{CLOSE_ABNORMAL, CLOSE_AUTH_FAILED};
use crate::session::LoopEvent;

/// What a transport reports back to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Closed { code: u16, reason: String },
    Error(String),
}

/// Posts transport events into the session queue, stamped with the
/// generation of the transport that produced them.
#[derive(Clone)]
pub struct TransportSink {
    generation: u64,
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl TransportSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the session loop is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(LoopEvent::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Write half of one live connection.
pub trait Link: Send {
    fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    fn close(&mut self, code: u16, reason: &str);
}

/// Opens transports. The returned link is usable immediately; frames written
/// before the transport reports `Opened` are the caller's responsibility.
pub trait Connector: Send {
    fn open(&mut self, url: Url, sink: TransportSink) -> Box<dyn Link>;
}

enum LinkCommand {
    Text(String),
    Close { code: u16, reason: String },
}

pub struct WsLink {
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl Link for WsLink {
    fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(LinkCommand::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self, code: u16, reason: &str) {
        let _ = self.tx.send(LinkCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// WebSocket transport over `tokio-tungstenite`. Each `open` spawns one task
/// that owns the socket for its whole life.
#[derive(Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&mut self, url: Url, sink: TransportSink) -> Box<dyn Link> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(url, sink, rx));
        Box::new(WsLink { tx })
    }
}

// The url carries the auth token; only log where we are going.
fn redacted(url: &Url) -> String {
    format!("{}://{}{}", url.scheme(), url.host_str().unwrap_or("?"), url.path())
}

async fn drive(url: Url, sink: TransportSink, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
    let target = redacted(&url);
    debug!("Opening WebSocket #{} to {}", sink.generation(), target);

    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(WsError::Http(resp)) if matches!(resp.status().as_u16(), 401 | 403) => {
            warn!("WebSocket handshake to {} rejected with {}", target, resp.status());
            sink.emit(TransportEvent::Closed {
                code: CLOSE_AUTH_FAILED,
                reason: format!("auth rejected ({})", resp.status().as_u16()),
            });
            return;
        }
        Err(e) => {
            sink.emit(TransportEvent::Error(e.to_string()));
            return;
        }
    };
    info!("WebSocket #{} connected to {}", sink.generation(), target);
    if !sink.emit(TransportEvent::Opened) {
        return;
    }

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(LinkCommand::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        sink.emit(TransportEvent::Error(e.to_string()));
                        return;
                    }
                }
                Some(LinkCommand::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(reason),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    debug!("WebSocket #{} closed locally", sink.generation());
                    return;
                }
                None => {
                    let _ = write.close().await;
                    return;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !sink.emit(TransportEvent::Frame(text)) {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((CLOSE_ABNORMAL, String::new()));
                    sink.emit(TransportEvent::Closed { code, reason });
                    return;
                }
                Some(Ok(Message::Binary(_))) => warn!("Ignoring binary frame on #{}", sink.generation()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    sink.emit(TransportEvent::Error(e.to_string()));
                    return;
                }
                None => {
                    sink.emit(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: String::new(),
                    });
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_drops_query() {
        let url = Url::parse("wss://chat.example.com/ws?token=secret&lang=en").unwrap();
        assert_eq!(redacted(&url), "wss://chat.example.com/ws");
    }

    #[tokio::test]
    async fn sink_stamps_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = TransportSink::new(7, tx);
        assert!(sink.emit(TransportEvent::Opened));
        match rx.recv().await {
            Some(LoopEvent::Transport { generation, event }) => {
                assert_eq!(generation, 7);
                assert_eq!(event, TransportEvent::Opened);
            }
            _ => panic!("expected transport event"),
        }
        drop(rx);
        assert!(!sink.emit(TransportEvent::Opened));
    }
}
