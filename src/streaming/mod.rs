//! Streaming module - WebSocket command API and MQTT event fan-out

mod mqtt;
mod websocket;

pub use mqtt::MqttClient;
pub use websocket::WebSocketServer;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::core::{Engine, Event, EventBus};

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Enable the WebSocket server (ingest/classify/assign/metrics API)
    pub websocket_enabled: bool,
    pub websocket_port: u16,
    pub websocket_max_clients: usize,

    /// Enable MQTT event publishing
    pub mqtt_enabled: bool,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,

    /// Topic prefix for MQTT events
    pub topic_prefix: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            websocket_enabled: true,
            websocket_port: 8765,
            websocket_max_clients: 32,

            mqtt_enabled: false,
            mqtt_broker: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_client_id: "moldwatch".to_string(),
            mqtt_username: None,
            mqtt_password: None,

            topic_prefix: "moldwatch".to_string(),
        }
    }
}

/// Fans ledger events out to WebSocket clients and MQTT, best-effort
pub struct StreamingManager {
    config: StreamingConfig,
    mqtt_client: Option<MqttClient>,
    websocket_server: Option<Arc<WebSocketServer>>,
}

impl StreamingManager {
    pub async fn new(config: StreamingConfig, engine: Arc<Engine>) -> Result<Self> {
        let mqtt_client = if config.mqtt_enabled {
            Some(MqttClient::new(&config).await?)
        } else {
            None
        };

        let websocket_server = if config.websocket_enabled {
            Some(Arc::new(WebSocketServer::new(
                config.websocket_port,
                config.websocket_max_clients,
                engine,
            )))
        } else {
            None
        };

        Ok(Self {
            config,
            mqtt_client,
            websocket_server,
        })
    }

    /// Start the server and the event pump
    pub async fn start(self, bus: Arc<EventBus>, shutdown: broadcast::Sender<()>) -> Result<()> {
        if let Some(ws) = &self.websocket_server {
            ws.clone().start(shutdown.subscribe()).await?;
        }

        let mut events = bus.subscribe();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            info!("Event fan-out running");
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Ok(event) => self.publish_event(&event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                debug!("Event fan-out lagged, skipped {} events", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = stop.recv() => break,
                }
            }
        });

        Ok(())
    }

    async fn publish_event(&self, event: &Event) {
        // Broadcast failure never propagates to the write that produced it
        if let Some(ws) = &self.websocket_server {
            ws.broadcast_event(event).await;
        }
        if let Some(mqtt) = &self.mqtt_client {
            let topic = format!("{}/events/{}", self.config.topic_prefix, event.payload.kind());
            if let Err(e) = mqtt.publish(&topic, event).await {
                debug!("MQTT publish failed: {}", e);
            }
        }
    }
}
