use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response as HttpResponse;
use axum::routing::any;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use indexer_core::abi::ParsedEvent;
use sync_service::{ParsedLogEvent, StorageHandle};

mod handler;
mod jsonrpc;

pub use handler::{RequestHandler, format_snapshot_id, parse_snapshot_id};
pub use jsonrpc::{Request, Response, RpcError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: IpAddr,
    pub port: u16,
    pub request_timeout: Duration,
}

impl ApiConfig {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self {
            host,
            port,
            request_timeout: Duration::from_secs(3),
        }
    }
}

struct AppState {
    handler: Arc<RequestHandler>,
    /// Absent in readonly mode; sessions then serve queries only.
    storage: Option<StorageHandle>,
    timeout: Duration,
}

/// Serves JSON-RPC 2.0 over WebSocket until cancelled. `reorged_rx` carries
/// reorg points from the detector into the request handler's lifecycle.
pub async fn serve(
    cfg: ApiConfig,
    handler: Arc<RequestHandler>,
    storage: Option<StorageHandle>,
    reorged_rx: Option<broadcast::Receiver<u64>>,
    cancel: CancellationToken,
) -> Result<(), ApiError> {
    if let Some(mut reorged_rx) = reorged_rx {
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = reorged_rx.recv() => match received {
                        Ok(reorg_block) => handler.on_reorged(reorg_block).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "reorg notifications lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    let state = Arc::new(AppState {
        handler,
        storage,
        timeout: cfg.request_timeout,
    });
    let app = Router::new().route("/", any(ws_upgrade)).with_state(state);
    let addr = SocketAddr::new(cfg.host, cfg.port);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "api server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> HttpResponse {
    ws.on_upgrade(move |socket| session(socket, state))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubscribeParams {
    address: Address,
}

async fn session(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let mut parsed_rx = state.storage.as_ref().map(StorageHandle::subscribe_parsed);
    // Per-session orderFilled subscriptions; the address filter is
    // authoritative.
    let mut order_filled: HashSet<Address> = HashSet::new();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_frame(&state, &mut order_filled, text.as_str()).await;
                    let Ok(reply) = serde_json::to_string(&reply) else {
                        continue;
                    };
                    if sink.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(?err, "session read error");
                    break;
                }
            },
            event = recv_parsed(&mut parsed_rx) => {
                let Some(event) = event else { continue };
                if let Some(frame) = order_filled_notification(&event, &order_filled)
                    && sink.send(Message::Text(frame.into())).await.is_err()
                {
                    break;
                }
            }
        }
    }
    debug!("session closed");
}

async fn recv_parsed(
    rx: &mut Option<broadcast::Receiver<ParsedLogEvent>>,
) -> Option<ParsedLogEvent> {
    match rx {
        Some(receiver) => match receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "parsed-event feed lagged");
                None
            }
            Err(broadcast::error::RecvError::Closed) => {
                *rx = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}

fn order_filled_notification(
    event: &ParsedLogEvent,
    subscriptions: &HashSet<Address>,
) -> Option<String> {
    let ParsedEvent::Fill { trader, .. } = &event.event else {
        return None;
    };
    if !subscriptions.contains(trader) {
        return None;
    }
    let args = serde_json::to_value(&event.event)
        .ok()?
        .get("args")
        .cloned()
        .unwrap_or(Value::Null);
    let params = json!({
        "instrument": event.address,
        "blockNumber": event.position.block_number,
        "args": args,
    });
    serde_json::to_string(&jsonrpc::notification("orderFilled", params)).ok()
}

async fn handle_frame(
    state: &Arc<AppState>,
    order_filled: &mut HashSet<Address>,
    text: &str,
) -> Response {
    let request: Request = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(_) => {
            return Response::err(
                Value::Null,
                RpcError::new(jsonrpc::PARSE_ERROR, "parse error"),
            );
        }
    };
    if request.jsonrpc != "2.0" {
        return Response::err(request.id, RpcError::invalid("unsupported jsonrpc version"));
    }

    let outcome = tokio::time::timeout(
        state.timeout,
        dispatch(state, order_filled, &request.method, request.params),
    )
    .await
    .unwrap_or_else(|_| {
        Err(RpcError::new(
            jsonrpc::SERVER_ERROR,
            "request timed out",
        ))
    });

    match outcome {
        Ok(result) => Response::ok(request.id, result),
        Err(err) => Response::err(request.id, err),
    }
}

async fn dispatch(
    state: &Arc<AppState>,
    order_filled: &mut HashSet<Address>,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match method {
        "generateSnapshot" => Arc::clone(&state.handler).generate_snapshot(params).await,
        "clearSnapshot" => state.handler.clear_snapshot(params).await,
        "listSnapshots" => state.handler.list_snapshots().await,
        "queryAccount" => state.handler.query_account(params).await,
        "queryAMM" => state.handler.query_amm(params).await,
        "subscribeOrderFilled" => {
            let params: SubscribeParams = serde_json::from_value(params)
                .map_err(|err| RpcError::invalid(format!("invalid params: {err}")))?;
            order_filled.insert(params.address);
            Ok(json!(true))
        }
        "unsubscribeOrderFilled" => {
            let params: SubscribeParams = serde_json::from_value(params)
                .map_err(|err| RpcError::invalid(format!("invalid params: {err}")))?;
            order_filled.remove(&params.address);
            Ok(json!(true))
        }
        _ => Err(RpcError::not_found("method not found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::I256;
    use indexer_core::types::Position;

    #[test]
    fn order_filled_filter_is_authoritative() {
        let trader = Address::with_last_byte(9);
        let event = ParsedLogEvent {
            id: Default::default(),
            position: Position::new(100, 1, 2),
            address: Address::with_last_byte(7),
            event: ParsedEvent::Fill {
                expiry: u32::MAX,
                trader,
                tick: 15_000,
                nonce: 1,
                fee: 3,
                pnl: I256::unchecked_from(5),
                operator: Address::ZERO,
            },
            processed: false,
        };

        let empty = HashSet::new();
        assert!(order_filled_notification(&event, &empty).is_none());

        let mut subs = HashSet::new();
        subs.insert(Address::with_last_byte(1));
        assert!(order_filled_notification(&event, &subs).is_none());

        subs.insert(trader);
        let frame = order_filled_notification(&event, &subs).expect("notification");
        let value: Value = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(value["method"], "orderFilled");
        assert_eq!(value["params"]["blockNumber"], 100);
        assert_eq!(value["params"]["args"]["nonce"], 1);
    }

    #[test]
    fn non_fill_events_never_notify(){
        let mut subs = HashSet::new();
        subs.insert(Address::with_last_byte(9));
        let event = ParsedLogEvent {
            id: Default::default(),
            position: Position::new(100, 1, 2),
            address: Address::with_last_byte(7),
            event: ParsedEvent::DeleteContext { expiry: 1 },
            processed: false,
        };
        assert!(order_filled_notification(&event, &subs).is_none());
    }
}
