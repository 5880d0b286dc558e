use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy_rpc_types_eth::{Header, Log};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

use crate::fetcher::LogSubscription;
use crate::types::BlockHeader;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub reconnect_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(3),
            keep_alive_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("loss connection")]
    Loss,
    #[error("request timed out")]
    Timeout,
    #[error("subscriber stopped")]
    Stopped,
    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Push events surfaced to the ingestor. `Log` carries the chain's `removed`
/// flag untouched; de-queueing a removed log from the confirmation stage is
/// the ingestor's job.
#[derive(Debug)]
pub enum SubscriberEvent {
    /// Session (re)established, all subscriptions re-registered.
    Connected,
    /// Keep-alive failed or the stream closed; a reconnect will follow.
    Loss,
    Log(Log),
    NewHead(BlockHeader),
}

enum Command {
    Subscribe(LogSubscription),
    Request {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value, SubscriberError>>,
    },
}

/// Cheap clonable handle onto the subscriber worker.
#[derive(Clone)]
pub struct SubscriberHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl SubscriberHandle {
    /// Registers a logs subscription; takes effect immediately when
    /// connected, and on every reconnect thereafter.
    pub async fn subscribe_logs(&self, address: Address, topics: Vec<B256>) {
        if self
            .cmd_tx
            .send(Command::Subscribe(LogSubscription { address, topics }))
            .await
            .is_err()
        {
            warn!(%address, "subscriber worker gone, subscription dropped");
        }
    }

    /// Sends a JSON-RPC request over the session. Buffered while
    /// disconnected; rejected on session loss or timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, SubscriberError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| SubscriberError::Stopped)?;
        rx.await.map_err(|_| SubscriberError::Stopped)?
    }
}

pub fn spawn_subscriber(
    url: Url,
    settings: SubscriberSettings,
    events: mpsc::Sender<SubscriberEvent>,
    cancel: CancellationToken,
) -> SubscriberHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let worker = Worker {
        url,
        settings,
        events,
        cmd_rx,
        subscriptions: Vec::new(),
        next_id: 1,
        pending: HashMap::new(),
        sub_requests: HashMap::new(),
        sub_ids: HashMap::new(),
        outbound: VecDeque::new(),
    };
    tokio::spawn(
        worker
            .run(cancel)
            .instrument(info_span!("log_subscriber")),
    );
    SubscriberHandle { cmd_tx }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubKind {
    Logs(usize),
    NewHeads,
}

struct PendingRequest {
    reply: oneshot::Sender<Result<Value, SubscriberError>>,
    deadline: Instant,
}

struct Worker {
    url: Url,
    settings: SubscriberSettings,
    events: mpsc::Sender<SubscriberEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    subscriptions: Vec<LogSubscription>,
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    /// Request ids of in-flight `eth_subscribe` calls we issued ourselves.
    sub_requests: HashMap<u64, SubKind>,
    /// Active subscription id (as reported by the node) to its kind.
    sub_ids: HashMap<String, SubKind>,
    /// Frames queued while disconnected, flushed in order on reconnect.
    outbound: VecDeque<String>,
}

enum SessionEnd {
    Loss,
    Cancelled,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => {
                    info!("subscriber session established");
                    let (sink, source) = stream.split();
                    match self.session(sink, source, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Loss => {
                            warn!("subscriber session lost");
                            self.reject_in_flight();
                            if self.events.send(SubscriberEvent::Loss).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(?err, "subscriber connect failed");
                }
            }
            if !self.idle_wait(&cancel).await {
                break;
            }
        }
        debug!("subscriber worker stopped");
    }

    /// Waits out the reconnect delay while still accepting commands, so
    /// registrations and requests issued during an outage are not lost.
    async fn idle_wait(&mut self, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + self.settings.reconnect_delay;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command_disconnected(cmd),
                    None => return false,
                },
                _ = tokio::time::sleep(SWEEP_INTERVAL) => self.sweep_timeouts(),
            }
        }
    }

    fn handle_command_disconnected(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe(sub) => self.register(sub),
            Command::Request {
                method,
                params,
                reply,
            } => {
                let id = self.take_id();
                let frame = request_frame(id, &method, &params);
                self.pending.insert(
                    id,
                    PendingRequest {
                        reply,
                        deadline: Instant::now() + self.settings.request_timeout,
                    },
                );
                self.outbound.push_back(frame);
            }
        }
    }

    fn register(&mut self, sub: LogSubscription) {
        if self
            .subscriptions
            .iter()
            .any(|existing| existing.address == sub.address)
        {
            return;
        }
        self.subscriptions.push(sub);
    }

    async fn session(
        &mut self,
        mut sink: WsSink,
        mut source: WsSource,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        // Old subscription ids are void after a reconnect; the node assigns
        // fresh ones in the eth_subscribe responses.
        self.sub_ids.clear();
        self.sub_requests.clear();

        if self.resubscribe(&mut sink).await.is_err() {
            return SessionEnd::Loss;
        }
        while let Some(frame) = self.outbound.pop_front() {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                return SessionEnd::Loss;
            }
        }
        if self.events.send(SubscriberEvent::Connected).await.is_err() {
            return SessionEnd::Cancelled;
        }

        let mut ping_tick = tokio::time::interval(self.settings.keep_alive_interval);
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let pong_wait = pong_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                _ = ping_tick.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return SessionEnd::Loss;
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.settings.keep_alive_timeout);
                    }
                }
                _ = tokio::time::sleep_until(pong_wait), if pong_deadline.is_some() => {
                    warn!("keep-alive pong missed");
                    return SessionEnd::Loss;
                }
                _ = sweep_tick.tick() => self.sweep_timeouts(),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command_connected(cmd, &mut sink).await.is_err() {
                            return SessionEnd::Loss;
                        }
                    }
                    None => return SessionEnd::Cancelled,
                },
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if self.handle_text(text.as_str()).await.is_err() {
                            return SessionEnd::Cancelled;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return SessionEnd::Loss;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => pong_deadline = None,
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Loss,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(?err, "subscriber read error");
                        return SessionEnd::Loss;
                    }
                },
            }
        }
    }

    async fn resubscribe(&mut self, sink: &mut WsSink) -> Result<(), ()> {
        let subs: Vec<(usize, LogSubscription)> = self
            .subscriptions
            .iter()
            .cloned()
            .enumerate()
            .collect();
        for (index, sub) in subs {
            self.send_subscribe(sink, SubKind::Logs(index), logs_params(&sub))
                .await?;
        }
        self.send_subscribe(sink, SubKind::NewHeads, json!(["newHeads"]))
            .await
    }

    async fn send_subscribe(
        &mut self,
        sink: &mut WsSink,
        kind: SubKind,
        params: Value,
    ) -> Result<(), ()> {
        let id = self.take_id();
        self.sub_requests.insert(id, kind);
        let frame = request_frame(id, "eth_subscribe", &params);
        sink.send(Message::Text(frame.into()))
            .await
            .map_err(|_| ())
    }

    async fn handle_command_connected(
        &mut self,
        cmd: Command,
        sink: &mut WsSink,
    ) -> Result<(), ()> {
        match cmd {
            Command::Subscribe(sub) => {
                let known = self
                    .subscriptions
                    .iter()
                    .any(|existing| existing.address == sub.address);
                if known {
                    return Ok(());
                }
                let index = self.subscriptions.len();
                let params = logs_params(&sub);
                self.subscriptions.push(sub);
                self.send_subscribe(sink, SubKind::Logs(index), params).await
            }
            Command::Request {
                method,
                params,
                reply,
            } => {
                let id = self.take_id();
                let frame = request_frame(id, &method, &params);
                self.pending.insert(
                    id,
                    PendingRequest {
                        reply,
                        deadline: Instant::now() + self.settings.request_timeout,
                    },
                );
                sink.send(Message::Text(frame.into()))
                    .await
                    .map_err(|_| ())
            }
        }
    }

    /// Err means the event channel is gone and the worker should stop.
    async fn handle_text(&mut self, text: &str) -> Result<(), ()> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(?err, "unparseable subscriber frame");
                return Ok(());
            }
        };

        if value.get("method").and_then(Value::as_str) == Some("eth_subscription") {
            return self.handle_notification(&value).await;
        }

        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            return Ok(());
        };
        if let Some(kind) = self.sub_requests.remove(&id) {
            match value.get("result").and_then(Value::as_str) {
                Some(sub_id) => {
                    debug!(sub_id, ?kind, "subscription confirmed");
                    self.sub_ids.insert(sub_id.to_string(), kind);
                }
                None => warn!(id, ?kind, "subscription request rejected"),
            }
            return Ok(());
        }
        if let Some(pending) = self.pending.remove(&id) {
            let outcome = match value.get("error") {
                Some(err) => Err(SubscriberError::Rpc(err.to_string())),
                None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
            };
            if pending.reply.send(outcome).is_err() {
                debug!(id, "request reply receiver dropped");
            }
        }
        Ok(())
    }

    async fn handle_notification(&mut self, value: &Value) -> Result<(), ()> {
        let Some(sub_id) = value.pointer("/params/subscription").and_then(Value::as_str) else {
            return Ok(());
        };
        // Notifications for ids we no longer hold are dropped silently.
        let Some(kind) = self.sub_ids.get(sub_id).copied() else {
            return Ok(());
        };
        let Some(result) = value.pointer("/params/result") else {
            return Ok(());
        };
        match kind {
            SubKind::Logs(_) => match serde_json::from_value::<Log>(result.clone()) {
                Ok(log) => self
                    .events
                    .send(SubscriberEvent::Log(log))
                    .await
                    .map_err(|_| ()),
                Err(err) => {
                    warn!(?err, "undecodable log notification");
                    Ok(())
                }
            },
            SubKind::NewHeads => match serde_json::from_value::<Header>(result.clone()) {
                Ok(header) => self
                    .events
                    .send(SubscriberEvent::NewHead(BlockHeader {
                        number: header.number,
                        hash: header.hash,
                        parent_hash: header.parent_hash,
                        timestamp: header.timestamp,
                    }))
                    .await
                    .map_err(|_| ()),
                Err(err) => {
                    warn!(?err, "undecodable head notification");
                    Ok(())
                }
            },
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(SubscriberError::Timeout));
            }
        }
    }

    fn reject_in_flight(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(SubscriberError::Loss));
        }
        self.sub_requests.clear();
        self.sub_ids.clear();
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        // Monotonic with wrap; id 0 is reserved so a wrapped counter never
        // collides with "absent id" framings.
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }
}

fn logs_params(sub: &LogSubscription) -> Value {
    let topics: Vec<String> = sub
        .topics
        .iter()
        .map(|topic| format!("{topic:#x}"))
        .collect();
    if topics.is_empty() {
        json!(["logs", { "address": sub.address }])
    } else {
        json!(["logs", { "address": sub.address, "topics": [topics] }])
    }
}

fn request_frame(id: u64, method: &str, params: &Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string()
}
