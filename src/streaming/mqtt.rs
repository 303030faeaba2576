// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! MQTT client for streaming ledger events

use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::StreamingConfig;

/// MQTT client wrapper
pub struct MqttClient {
    client: AsyncClient,
}

impl MqttClient {
    pub async fn new(config: &StreamingConfig) -> Result<Self> {
        let mut options = MqttOptions::new(
            &config.mqtt_client_id,
            &config.mqtt_broker,
            config.mqtt_port,
        );

        options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        // Spawn eventloop handler
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        info!(
            "MQTT client initialized for {}:{}",
            config.mqtt_broker, config.mqtt_port
        );
        Ok(Self { client })
    }

    pub async fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> Result<()> {
        let json = serde_json::to_vec(payload)?;

        self.client
            .publish(topic, QoS::AtLeastOnce, false, json)
            .await
            .map_err(|e| anyhow!("MQTT publish failed: {}", e))?;

        debug!("Published event to {}", topic);
        Ok(())
    }
}
