// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! WebSocket server - the request/response command API for the polling
//! daemon and back office, plus real-time event streaming to dashboards

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::core::{Engine, Event};
use crate::ledger::{AssignRequest, ClassifyRequest, LedgerError};
use crate::metrics::MetricsQuery;

/// WebSocket server
pub struct WebSocketServer {
    port: u16,
    max_clients: usize,
    engine: Arc<Engine>,
    clients: Arc<RwLock<HashMap<String, ClientHandle>>>,
    broadcast_tx: broadcast::Sender<(String, String)>, // (event kind, JSON)
}

struct ClientHandle {
    addr: SocketAddr,
    subscriptions: Vec<String>,
}

impl WebSocketServer {
    pub fn new(port: u16, max_clients: usize, engine: Arc<Engine>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1000);

        Self {
            port,
            max_clients,
            engine,
            clients: Arc::new(RwLock::new(HashMap::new())),
            broadcast_tx,
        }
    }

    pub async fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;

        info!("WebSocket server listening on ws://{}", addr);

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, addr)) => {
                                let client_count = server.clients.read().await.len();
                                if client_count >= server.max_clients {
                                    warn!("Max clients reached, rejecting connection from {}", addr);
                                    continue;
                                }

                                let server = server.clone();
                                tokio::spawn(async move {
                                    server.handle_connection(stream, addr).await;
                                });
                            }
                            Err(e) => {
                                error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("WebSocket server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Queue a ledger event for every connected, subscribed client
    pub async fn broadcast_event(&self, event: &Event) {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = self
                    .broadcast_tx
                    .send((event.payload.kind().to_string(), json));
            }
            Err(e) => warn!("Failed to serialize event: {}", e),
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let client_id = uuid::Uuid::new_v4().to_string();

        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed for {}: {}", addr, e);
                return;
            }
        };

        info!("New WebSocket connection from {} (id: {})", addr, client_id);

        // Register client
        {
            let mut clients = self.clients.write().await;
            clients.insert(
                client_id.clone(),
                ClientHandle {
                    addr,
                    subscriptions: vec!["*".to_string()],
                },
            );
        }

        let mut broadcast_rx = self.broadcast_tx.subscribe();
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Send welcome message
        let welcome = json!({
            "type": "welcome",
            "client_id": client_id,
            "server": "moldwatch",
            "version": env!("CARGO_PKG_VERSION"),
        });

        if let Err(e) = ws_sender.send(Message::Text(welcome.to_string().into())).await {
            warn!("Failed to send welcome: {}", e);
        }

        // Handle messages
        loop {
            tokio::select! {
                // Incoming commands from client
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received from {}: {}", addr, text);
                            let response = self.dispatch(&client_id, &text).await;
                            if let Err(e) = ws_sender.send(Message::Text(response.to_string().into())).await {
                                warn!("Failed to send to {}: {}", addr, e);
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by client {}", addr);
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_sender.send(Message::Pong(data)).await;
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket error from {}: {}", addr, e);
                            break;
                        }
                        None => break,
                        _ => {}
                    }
                }

                // Outgoing event broadcasts
                msg = broadcast_rx.recv() => {
                    if let Ok((kind, json)) = msg {
                        let subscribed = {
                            let clients = self.clients.read().await;
                            clients.get(&client_id).is_some_and(|c| {
                                c.subscriptions.iter().any(|s| s == "*" || *s == kind)
                            })
                        };
                        if subscribed {
                            let wrapper = json!({
                                "type": "event",
                                "event": serde_json::from_str::<Value>(&json).unwrap_or_default(),
                            });
                            if let Err(e) = ws_sender.send(Message::Text(wrapper.to_string().into())).await {
                                warn!("Failed to send to {}: {}", addr, e);
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Remove client
        {
            let mut clients = self.clients.write().await;
            clients.remove(&client_id);
        }

        info!("WebSocket client {} disconnected", addr);
    }

    /// Route one JSON command to the engine and build the reply
    async fn dispatch(&self, client_id: &str, text: &str) -> Value {
        let cmd: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return error_response("bad_request", "malformed JSON payload"),
        };
        let Some(cmd_type) = cmd.get("type").and_then(|v| v.as_str()).map(str::to_string) else {
            return error_response("bad_request", "missing command type");
        };

        match cmd_type.as_str() {
            "ping" => json!({"type": "pong"}),

            "subscribe" | "unsubscribe" => {
                if let Some(topic) = cmd.get("topic").and_then(|v| v.as_str()) {
                    let mut clients = self.clients.write().await;
                    if let Some(client) = clients.get_mut(client_id) {
                        if cmd_type == "subscribe" {
                            client.subscriptions.push(topic.to_string());
                        } else {
                            client.subscriptions.retain(|s| s != topic);
                        }
                    }
                }
                json!({"type": "ok"})
            }

            "ingest" => {
                let Some(byte) = cmd.get("byte").and_then(|v| v.as_str()) else {
                    return error_response("bad_request", "ingest requires a hex 'byte' field");
                };
                let at = match parse_timestamp(&cmd) {
                    Ok(at) => at,
                    Err(resp) => return resp,
                };
                match self.engine.ingest_hex(byte, at).await {
                    Ok(ack) => json!({
                        "type": "ack",
                        "machines": ack.machines,
                        "pins_decoded": ack.pins_decoded,
                        "at": ack.at,
                    }),
                    Err(e) => error_response("bad_request", &e.to_string()),
                }
            }

            "classify" => {
                let req: ClassifyRequest = match serde_json::from_value(cmd) {
                    Ok(req) => req,
                    Err(e) => return error_response("bad_request", &e.to_string()),
                };
                match self.engine.classify(&req).await {
                    Ok(row) => json!({"type": "ok", "stoppage_id": row.id, "reason": row.reason}),
                    Err(e) => ledger_error_response(e),
                }
            }

            "assign" => {
                let req: AssignRequest = match serde_json::from_value(cmd) {
                    Ok(req) => req,
                    Err(e) => return error_response("bad_request", &e.to_string()),
                };
                match self.engine.assign(&req) {
                    Ok(hours) => json!({"type": "ok", "hours": hours}),
                    Err(e) => ledger_error_response(e),
                }
            }

            "metrics" => {
                let query: MetricsQuery = match serde_json::from_value(cmd) {
                    Ok(q) => q,
                    Err(e) => return error_response("bad_request", &e.to_string()),
                };
                match self.engine.metrics(&query) {
                    Ok(report) => json!({
                        "type": "metrics",
                        "report": serde_json::to_value(report).unwrap_or_default(),
                    }),
                    Err(e) => error_response("bad_request", &e.to_string()),
                }
            }

            "status" => {
                let state = self.engine.state().await;
                json!({
                    "type": "status",
                    "state": serde_json::to_value(state).unwrap_or_default(),
                })
            }

            _ => error_response("bad_request", &format!("unknown command '{}'", cmd_type)),
        }
    }
}

fn parse_timestamp(cmd: &Value) -> Result<Option<DateTime<Utc>>, Value> {
    match cmd.get("timestamp") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| error_response("bad_request", "timestamp must be RFC 3339")),
        Some(_) => Err(error_response("bad_request", "timestamp must be RFC 3339")),
    }
}

fn error_response(code: &str, message: &str) -> Value {
    json!({"type": "error", "code": code, "message": message})
}

fn ledger_error_response(e: LedgerError) -> Value {
    match e {
        LedgerError::NoPendingStoppage => error_response("not_found", &e.to_string()),
        LedgerError::InvalidSapId
        | LedgerError::UnknownReason(_)
        | LedgerError::UnknownShift(_)
        | LedgerError::MissingHours => error_response("bad_request", &e.to_string()),
        LedgerError::Storage(_) => {
            error!("Ledger storage failure: {}", e);
            error_response("internal", "storage failure")
        }
    }
}
