//! Broker pub/sub client over WebSocket.
//!
//! Connects to the broker, performs the ClientHello handshake, and provides
//! publish (with at-least-once ack wait) and delivery receive.
//!
//! # Protocol
//! 1. Connect to `broker.url` (ws:// or wss://)
//! 2. Send `ClientHello` with the client id and topic subscriptions
//! 3. Receive `Heartbeat` — extract `session_id`
//! 4. Receive `Publish` deliveries; ack the ones marked `acked`
//! 5. Publish status updates with `acked = true` and wait for the `PubAck`
//!
//! `run_broker_loop` owns reconnection: 1 s doubling backoff capped at 30 s,
//! reset on a successful connect.  Deliveries are handed to the ingestion
//! queue without parsing; connection loss is logged and surfaced to the UI
//! log feed.

use crate::config::BrokerConfig;
use crate::ingest::IngestQueue;
use crate::ui_log::{UiLogLevel, UiLogger};
use chrono::Local;
use cw_protocol::{BrokerMessage, ClientHello, PubAck, Publish, StatusNotice};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// BrokerClient
// ---------------------------------------------------------------------------

/// An active broker session.
///
/// Created by [`BrokerClient::connect`]; holds a granted session after the
/// hello/heartbeat handshake completes.
pub struct BrokerClient {
    ws: WsStream,
    session_id: String,
    /// Deliveries that arrived while waiting for a publish ack.
    pending: VecDeque<Publish>,
}

impl BrokerClient {
    /// Connect to the broker, perform the ClientHello handshake, and return
    /// a ready-to-use session.
    pub async fn connect(
        url: &str,
        client_id: &str,
        subscriptions: Vec<String>,
    ) -> Result<Self, BrokerError> {
        use tokio_tungstenite::connect_async;

        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let mut client = BrokerClient {
            ws,
            session_id: String::new(),
            pending: VecDeque::new(),
        };

        let hello = BrokerMessage::ClientHello(ClientHello {
            client_id: client_id.to_owned(),
            subscriptions,
        });
        client.send_frame(&hello).await?;

        match client.recv_frame().await? {
            BrokerMessage::Heartbeat(hb) => {
                client.session_id = hb.session_id;
                info!(session_id = %client.session_id, "broker session established");
            }
            BrokerMessage::Error(e) => {
                return Err(BrokerError::Protocol(format!(
                    "broker error: {} - {}",
                    e.code, e.message
                )));
            }
            other => {
                return Err(BrokerError::Protocol(format!(
                    "expected Heartbeat, got: {:?}",
                    other
                )));
            }
        }

        Ok(client)
    }

    /// The session ID granted by the broker after the handshake.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Publish a payload to a topic.
    ///
    /// With `acked = true` this waits for the broker's `PubAck`
    /// (at-least-once); deliveries that interleave with the ack are
    /// buffered and returned by later `recv_delivery` calls.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        acked: bool,
    ) -> Result<(), BrokerError> {
        let message_id = Uuid::new_v4().to_string();
        let frame = BrokerMessage::Publish(Publish {
            message_id: message_id.clone(),
            topic: topic.to_owned(),
            payload: payload.to_owned(),
            acked,
        });
        self.send_frame(&frame).await?;
        if !acked {
            return Ok(());
        }

        loop {
            match self.recv_frame().await? {
                BrokerMessage::PubAck(ack) if ack.message_id == message_id => return Ok(()),
                BrokerMessage::PubAck(ack) => {
                    debug!(message_id = %ack.message_id, "ack for an earlier publish");
                }
                BrokerMessage::Publish(delivery) => {
                    // Delivery interleaved with the ack; hand it out later.
                    self.pending.push_back(delivery);
                }
                BrokerMessage::Heartbeat(_) => {}
                BrokerMessage::Error(e) => {
                    return Err(BrokerError::Protocol(format!(
                        "broker error while waiting for ack: {} - {}",
                        e.code, e.message
                    )));
                }
                other => {
                    warn!("unexpected frame while waiting for ack: {:?}", other);
                }
            }
        }
    }

    /// Receive the next delivery, draining the interleave buffer first.
    pub async fn recv_delivery(&mut self) -> Result<Publish, BrokerError> {
        if let Some(delivery) = self.pending.pop_front() {
            return Ok(delivery);
        }
        loop {
            match self.recv_frame().await? {
                BrokerMessage::Publish(delivery) => return Ok(delivery),
                BrokerMessage::Heartbeat(_) => {}
                BrokerMessage::PubAck(ack) => {
                    debug!(message_id = %ack.message_id, "stray ack ignored");
                }
                BrokerMessage::Error(e) => {
                    return Err(BrokerError::Protocol(format!(
                        "broker error: {} - {}",
                        e.code, e.message
                    )));
                }
                other => {
                    debug!("ignoring frame: {:?}", other);
                }
            }
        }
    }

    /// Acknowledge an inbound acked delivery.
    pub async fn send_pub_ack(&mut self, message_id: &str) -> Result<(), BrokerError> {
        let frame = BrokerMessage::PubAck(PubAck {
            message_id: message_id.to_owned(),
        });
        self.send_frame(&frame).await
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn send_frame(&mut self, msg: &BrokerMessage) -> Result<(), BrokerError> {
        let json =
            serde_json::to_string(msg).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| BrokerError::Ws(e.to_string()))?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<BrokerMessage, BrokerError> {
        loop {
            match self.ws.next().await {
                None => return Err(BrokerError::Disconnected),
                Some(Err(e)) => return Err(BrokerError::Ws(e.to_string())),
                Some(Ok(msg)) => match msg {
                    Message::Text(t) => {
                        let frame: BrokerMessage = serde_json::from_str(&t)
                            .map_err(|e| BrokerError::Protocol(format!("JSON parse: {}", e)))?;
                        return Ok(frame);
                    }
                    Message::Close(_) => return Err(BrokerError::Disconnected),
                    Message::Ping(data) => {
                        let _ = self.ws.send(Message::Pong(data)).await;
                    }
                    _ => {}
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum BrokerError {
    Connect(String),
    Ws(String),
    Protocol(String),
    Serialization(String),
    Disconnected,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Connect(s) => write!(f, "Connection error: {}", s),
            BrokerError::Ws(s) => write!(f, "WebSocket error: {}", s),
            BrokerError::Protocol(s) => write!(f, "Protocol error: {}", s),
            BrokerError::Serialization(s) => write!(f, "Serialization error: {}", s),
            BrokerError::Disconnected => write!(f, "Broker disconnected"),
        }
    }
}

impl std::error::Error for BrokerError {}

// ---------------------------------------------------------------------------
// Broker loop: connect → announce → deliver → reconnect with backoff
// ---------------------------------------------------------------------------

fn status_payload(text: &str) -> String {
    let notice = StatusNotice {
        notice_type: "client_status".to_owned(),
        status: text.to_owned(),
        timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    };
    serde_json::to_string(&notice).unwrap_or_else(|_| format!("{{\"status\":\"{}\"}}", text))
}

/// Broker task: keeps one session alive, feeding deliveries to the
/// ingestion queue and republishing status texts from `status_rx`.
pub async fn run_broker_loop(
    cfg: BrokerConfig,
    subscriptions: Vec<String>,
    ingest: IngestQueue,
    mut status_rx: mpsc::UnboundedReceiver<String>,
    logger: UiLogger,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let client_id = if cfg.client_id.is_empty() {
        format!("console-{}", Uuid::new_v4())
    } else {
        cfg.client_id.clone()
    };
    let mut status_open = true;
    let mut backoff_secs: u64 = 1;

    loop {
        if *shutdown_rx.borrow() {
            info!("broker loop stopping (shutdown)");
            return;
        }

        logger.log(format!("broker connecting to {}", cfg.url));

        let mut client =
            match BrokerClient::connect(&cfg.url, &client_id, subscriptions.clone()).await {
                Ok(c) => {
                    logger.log(format!("broker connected (session {})", c.session_id()));
                    backoff_secs = 1;
                    c
                }
                Err(e) => {
                    logger.log_at(
                        UiLogLevel::Warn,
                        format!("broker connect failed: {}; retrying in {}s", e, backoff_secs),
                    );
                    let delay = Duration::from_secs(backoff_secs);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                    }
                    backoff_secs = (backoff_secs * 2).min(30);
                    continue;
                }
            };

        // Announce presence (at-least-once).
        let mut session_ok = true;
        if let Err(e) = client
            .publish(&cfg.status_topic, &status_payload("online"), true)
            .await
        {
            logger.log_at(
                UiLogLevel::Warn,
                format!("startup status publish failed: {}", e),
            );
            session_ok = false;
        }

        if session_ok {
            'session: loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            // Best-effort goodbye; never wait for an ack here.
                            let _ = client
                                .publish(&cfg.status_topic, &status_payload("stopping"), false)
                                .await;
                            info!("broker loop stopping (shutdown)");
                            return;
                        }
                    }
                    maybe_status = status_rx.recv(), if status_open => {
                        match maybe_status {
                            None => status_open = false,
                            Some(text) => {
                                if let Err(e) = client
                                    .publish(&cfg.status_topic, &status_payload(&text), true)
                                    .await
                                {
                                    logger.log_at(
                                        UiLogLevel::Warn,
                                        format!("status publish failed: {}; reconnecting", e),
                                    );
                                    break 'session;
                                }
                            }
                        }
                    }
                    result = client.recv_delivery() => {
                        match result {
                            Ok(delivery) => {
                                debug!(topic = %delivery.topic, "delivery received");
                                ingest.enqueue(delivery.topic, delivery.payload);
                                if delivery.acked {
                                    if let Err(e) = client.send_pub_ack(&delivery.message_id).await {
                                        logger.log_at(
                                            UiLogLevel::Warn,
                                            format!("delivery ack failed: {}; reconnecting", e),
                                        );
                                        break 'session;
                                    }
                                }
                            }
                            Err(e) => {
                                logger.log_at(
                                    UiLogLevel::Warn,
                                    format!("broker connection lost: {}", e),
                                );
                                break 'session;
                            }
                        }
                    }
                }
            }
        }

        // Reconnect with backoff
        let delay = Duration::from_secs(backoff_secs);
        logger.log_at(
            UiLogLevel::Warn,
            format!("broker disconnected; reconnecting in {}s", backoff_secs),
        );
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
        backoff_secs = (backoff_secs * 2).min(30);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    fn parse_frame(msg: Message) -> BrokerMessage {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).expect("parse broker json"),
            other => panic!("expected text ws frame, got {:?}", other),
        }
    }

    fn heartbeat(session: &str, client: &str) -> Message {
        let frame = BrokerMessage::Heartbeat(cw_protocol::Heartbeat {
            session_id: session.to_owned(),
            client_id: client.to_owned(),
        });
        Message::Text(serde_json::to_string(&frame).unwrap().into())
    }

    fn text_frame(frame: &BrokerMessage) -> Message {
        Message::Text(serde_json::to_string(frame).unwrap().into())
    }

    #[tokio::test]
    async fn connect_performs_hello_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = accept_async(stream).await.expect("ws accept");
            let (mut write, mut read) = ws.split();
            let hello = parse_frame(read.next().await.expect("hello").expect("hello frame"));
            let client_id = match hello {
                BrokerMessage::ClientHello(h) => {
                    assert_eq!(h.subscriptions, vec!["camera/+/events".to_owned()]);
                    h.client_id
                }
                other => panic!("expected ClientHello, got {:?}", other),
            };
            write
                .send(heartbeat("session-1", &client_id))
                .await
                .expect("send heartbeat");
        });

        let client = BrokerClient::connect(
            &format!("ws://{}", addr),
            "console-test",
            vec!["camera/+/events".to_owned()],
        )
        .await
        .expect("connect");
        assert_eq!(client.session_id(), "session-1");
        server.await.expect("server join");
    }

    #[tokio::test]
    async fn publish_waits_for_ack_and_buffers_interleaved_deliveries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = accept_async(stream).await.expect("ws accept");
            let (mut write, mut read) = ws.split();
            let _hello = read.next().await.expect("hello").expect("hello frame");
            write
                .send(heartbeat("session-1", "console-test"))
                .await
                .expect("send heartbeat");

            let frame = parse_frame(read.next().await.expect("publish").expect("publish frame"));
            let BrokerMessage::Publish(published) = frame else {
                panic!("expected Publish, got {:?}", frame);
            };
            assert!(published.acked);

            // Interleave a delivery before the ack.
            write
                .send(text_frame(&BrokerMessage::Publish(Publish {
                    message_id: "d-1".to_owned(),
                    topic: "camera/shed/events".to_owned(),
                    payload: "{}".to_owned(),
                    acked: false,
                })))
                .await
                .expect("send delivery");
            write
                .send(text_frame(&BrokerMessage::PubAck(PubAck {
                    message_id: published.message_id,
                })))
                .await
                .expect("send ack");
        });

        let mut client = BrokerClient::connect(&format!("ws://{}", addr), "console-test", vec![])
            .await
            .expect("connect");
        timeout(
            Duration::from_secs(2),
            client.publish("console/status", "{\"status\":\"online\"}", true),
        )
        .await
        .expect("publish timeout")
        .expect("publish");

        let delivery = timeout(Duration::from_secs(1), client.recv_delivery())
            .await
            .expect("delivery timeout")
            .expect("delivery");
        assert_eq!(delivery.message_id, "d-1");
        assert_eq!(delivery.topic, "camera/shed/events");
        server.await.expect("server join");
    }

    #[tokio::test]
    async fn broker_loop_enqueues_deliveries_and_acks_them() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let ws = accept_async(stream).await.expect("ws accept");
            let (mut write, mut read) = ws.split();
            let _hello = read.next().await.expect("hello").expect("hello frame");
            write
                .send(heartbeat("session-1", "console-test"))
                .await
                .expect("send heartbeat");

            // Ack the startup "online" announcement.
            let frame = parse_frame(read.next().await.expect("status").expect("status frame"));
            let BrokerMessage::Publish(announce) = frame else {
                panic!("expected status publish, got {:?}", frame);
            };
            assert!(announce.payload.contains("online"));
            write
                .send(text_frame(&BrokerMessage::PubAck(PubAck {
                    message_id: announce.message_id,
                })))
                .await
                .expect("ack announce");

            // Deliver one acked event.
            write
                .send(text_frame(&BrokerMessage::Publish(Publish {
                    message_id: "d-42".to_owned(),
                    topic: "camera/shed/events".to_owned(),
                    payload: "{\"type\":\"motion_detected\",\"video_path\":\"/v/x.mp4\"}"
                        .to_owned(),
                    acked: true,
                })))
                .await
                .expect("send delivery");

            // Expect the client's PubAck back.
            let frame = parse_frame(read.next().await.expect("ack").expect("ack frame"));
            match frame {
                BrokerMessage::PubAck(ack) => assert_eq!(ack.message_id, "d-42"),
                other => panic!("expected PubAck, got {:?}", other),
            }
        });

        let (queue, mut ingest_rx) = IngestQueue::new();
        let (_status_tx, status_rx) = mpsc::unbounded_channel();
        let (ui_tx, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cfg = BrokerConfig {
            url: format!("ws://{}", addr),
            client_id: "console-test".to_owned(),
            status_topic: "console/status".to_owned(),
            control_topic: "console/control".to_owned(),
        };
        let broker = tokio::spawn(run_broker_loop(
            cfg,
            vec!["camera/+/events".to_owned()],
            queue,
            status_rx,
            UiLogger::new(ui_tx),
            shutdown_rx,
        ));

        let delivery = timeout(Duration::from_secs(2), ingest_rx.recv())
            .await
            .expect("ingest timeout")
            .expect("ingest delivery");
        assert_eq!(delivery.topic, "camera/shed/events");
        assert!(delivery.payload.contains("motion_detected"));

        server.await.expect("server join");
        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), broker)
            .await
            .expect("broker shutdown timeout")
            .expect("broker join");
    }
}
