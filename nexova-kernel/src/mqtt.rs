/**
 * MQTT BRIDGE - Relais des enveloppes du hub vers un broker
 *
 * Le bridge est un abonné du hub comme un autre : chaque enveloppe est publiée
 * sur `{prefix}/{type}@v1` en QoS 1, sans bloquer (file interne du client).
 * Le trafic entrant du broker (ConnAck, PubAck, PingResp...) vaut acquittement
 * de vivacité. Éjecté par le heartbeat, il se ré-inscrit au prochain événement broker.
 */

use crate::config::MqttConf;
use crate::hub::{BroadcastHub, HubError, SubscriberId, SubscriberSink};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 64;

pub fn topic_for(prefix: &str, kind: &str) -> String {
    format!("{}/{kind}@v1", prefix.trim_end_matches('/'))
}

pub struct MqttBridge {
    client: AsyncClient,
    topic_prefix: String,
    connected: AtomicBool,
    dropped: AtomicBool,
}

impl MqttBridge {
    pub fn new(client: AsyncClient, topic_prefix: String) -> Self {
        Self {
            client,
            topic_prefix,
            connected: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    fn reopen(&self) {
        self.dropped.store(false, Ordering::Relaxed);
    }
}

impl SubscriberSink for MqttBridge {
    fn is_open(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, kind: &str, frame: &str) -> Result<(), HubError> {
        self.client
            .try_publish(topic_for(&self.topic_prefix, kind), QoS::AtLeastOnce, false, frame.as_bytes().to_vec())
            .map_err(|e| HubError::Send(e.to_string()))
    }

    // le keep-alive MQTT fait office de ping ; la réponse arrive par l'eventloop
    fn ping(&self) -> Result<(), HubError> {
        if self.connected.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(HubError::Closed)
        }
    }

    fn close(&self) {
        self.dropped.store(true, Ordering::Relaxed);
    }

    fn label(&self) -> String {
        format!("mqtt:{}", self.topic_prefix)
    }
}

pub fn spawn_mqtt_bridge(conf: &MqttConf, hub: Arc<BroadcastHub>) -> JoinHandle<()> {
    let mut opts = MqttOptions::new(conf.client_id.clone(), conf.host.clone(), conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
    let bridge = Arc::new(MqttBridge::new(client, conf.topic_prefix.clone()));
    let broker = format!("{}:{}", conf.host, conf.port);

    tokio::spawn(async move {
        let mut membership: Option<SubscriberId> = None;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(incoming)) => {
                    if matches!(incoming, Incoming::ConnAck(_)) {
                        bridge.set_connected(true);
                        info!(broker = %broker, "mqtt bridge connected");
                    }
                    match membership {
                        Some(id) if hub.contains(id) => hub.acknowledge(id),
                        _ => {
                            bridge.reopen();
                            membership = Some(hub.join(bridge.clone()));
                        }
                    }
                }
                Ok(Event::Outgoing(outgoing)) => debug!(?outgoing, "mqtt outgoing"),
                Err(e) => {
                    bridge.set_connected(false);
                    warn!(broker = %broker, error = %e, "mqtt connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> MqttBridge {
        let opts = MqttOptions::new("nexova-test", "localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(opts, 4);
        MqttBridge::new(client, "nexova/telemetry".into())
    }

    #[test]
    fn test_topic_naming() {
        assert_eq!(topic_for("nexova/telemetry", "telemetry_batch"), "nexova/telemetry/telemetry_batch@v1");
        assert_eq!(topic_for("plant/", "alert"), "plant/alert@v1");
    }

    #[test]
    fn test_open_only_while_connected_and_tracked() {
        let bridge = bridge();
        assert!(!bridge.is_open());
        assert!(matches!(bridge.ping(), Err(HubError::Closed)));

        bridge.set_connected(true);
        assert!(bridge.is_open());
        assert!(bridge.ping().is_ok());

        bridge.close();
        assert!(!bridge.is_open());
        bridge.reopen();
        assert!(bridge.is_open());
        assert_eq!(bridge.label(), "mqtt:nexova/telemetry");
    }
}
