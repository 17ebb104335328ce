/**
 * BROADCAST HUB - Diffusion temps réel vers les abonnés
 *
 * RÔLE :
 * Maintient l'ensemble des abonnés (WebSocket, bridge MQTT...) et diffuse
 * chaque batch de télémétrie sous forme d'enveloppe JSON {type, payload, timestamp}.
 *
 * FONCTIONNEMENT :
 * - join : enregistre l'abonné "alive" et lui envoie immédiatement `connected`
 * - broadcast : snapshot de l'ensemble sous verrou court, puis envoi hors verrou ;
 *   un abonné en échec n'empêche jamais la livraison aux autres
 * - heartbeat : tout abonné encore "suspect" est éjecté, les autres sont pingés
 *   puis marqués suspects jusqu'au prochain acquittement
 * - leave : idempotent
 */

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SubscriberId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("subscriber transport closed")]
    Closed,
    #[error("subscriber outbound queue full")]
    Full,
    #[error("send failed: {0}")]
    Send(String),
}

/// Transport d'un abonné. Les envois ne doivent jamais bloquer ni paniquer :
/// la diffusion tourne dans la tâche du scheduler.
pub trait SubscriberSink: Send + Sync {
    fn is_open(&self) -> bool;
    fn send(&self, kind: &str, frame: &str) -> Result<(), HubError>;
    fn ping(&self) -> Result<(), HubError>;
    fn close(&self);
    fn label(&self) -> String {
        "subscriber".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Alive,
    Suspect,
}

struct Tracked {
    sink: Arc<dyn SubscriberSink>,
    liveness: Liveness,
}

#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub payload: T,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

pub const ENVELOPE_CONNECTED: &str = "connected";
pub const ENVELOPE_TELEMETRY_BATCH: &str = "telemetry_batch";
pub const ENVELOPE_ALERT: &str = "alert";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub dropped: usize,
}

pub struct BroadcastHub {
    subscribers: RwLock<HashMap<SubscriberId, Tracked>>,
    heartbeat_interval: Duration,
}

impl BroadcastHub {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            heartbeat_interval,
        }
    }

    pub fn join(&self, sink: Arc<dyn SubscriberSink>) -> SubscriberId {
        let id = Uuid::new_v4();
        let welcome = serde_json::json!({
            "subscriberId": id,
            "heartbeatSeconds": self.heartbeat_interval.as_secs(),
        });

        self.subscribers.write().insert(id, Tracked { sink: sink.clone(), liveness: Liveness::Alive });

        match encode(ENVELOPE_CONNECTED, &welcome) {
            Some(frame) => {
                if let Err(e) = sink.send(ENVELOPE_CONNECTED, &frame) {
                    warn!(subscriber = %id, error = %e, "welcome message failed");
                }
            }
            None => warn!(subscriber = %id, "welcome message could not be encoded"),
        }
        info!(subscriber = %id, label = %sink.label(), total = self.len(), "subscriber joined");
        id
    }

    /// Retire un abonné ; un second appel est un no-op
    pub fn leave(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            info!(subscriber = %id, total = self.len(), "subscriber left");
        }
        removed
    }

    /// Acquittement de vivacité (pong, trafic broker...)
    pub fn acknowledge(&self, id: SubscriberId) {
        if let Some(tracked) = self.subscribers.write().get_mut(&id) {
            tracked.liveness = Liveness::Alive;
        }
    }

    #[cfg(test)]
    pub fn is_alive(&self, id: SubscriberId) -> bool {
        self.subscribers.read().get(&id).is_some_and(|tracked| tracked.liveness == Liveness::Alive)
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn broadcast<T: Serialize>(&self, kind: &str, payload: &T) -> BroadcastReport {
        let Some(frame) = encode(kind, payload) else {
            warn!(kind, "broadcast payload could not be encoded");
            return BroadcastReport::default();
        };

        // snapshot : le verrou est relâché avant tout envoi
        let snapshot: Vec<(SubscriberId, Arc<dyn SubscriberSink>)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, tracked)| (*id, tracked.sink.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, sink) in snapshot {
            if !sink.is_open() {
                report.skipped += 1;
                continue;
            }
            match sink.send(kind, &frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    debug!(subscriber = %id, error = %e, kind, "send to subscriber failed");
                }
            }
        }
        report
    }

    /// Un tour de vivacité : éjecte les suspects, pinge et marque suspects les autres
    pub fn heartbeat_round(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let mut dropped = Vec::new();

        {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|id, tracked| {
                if tracked.liveness == Liveness::Suspect {
                    dropped.push((*id, tracked.sink.clone()));
                    return false;
                }
                tracked.liveness = Liveness::Suspect;
                true
            });
        }

        let snapshot: Vec<(SubscriberId, Arc<dyn SubscriberSink>)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, tracked)| (*id, tracked.sink.clone()))
            .collect();

        for (id, sink) in snapshot {
            match sink.ping() {
                Ok(()) => report.pinged += 1,
                Err(e) => {
                    debug!(subscriber = %id, error = %e, "ping failed");
                    if self.subscribers.write().remove(&id).is_some() {
                        dropped.push((id, sink));
                    }
                }
            }
        }

        report.dropped = dropped.len();
        for (id, sink) in dropped {
            info!(subscriber = %id, label = %sink.label(), "dropping unresponsive subscriber");
            sink.close();
        }
        report
    }

    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // premier tick immédiat : on ne pinge pas des abonnés qui viennent d'arriver
            interval.tick().await;
            loop {
                interval.tick().await;
                let report = hub.heartbeat_round();
                if report.dropped > 0 {
                    info!(pinged = report.pinged, dropped = report.dropped, "heartbeat round");
                } else {
                    debug!(pinged = report.pinged, "heartbeat round");
                }
            }
        })
    }
}

fn encode<T: Serialize>(kind: &str, payload: &T) -> Option<String> {
    let envelope = Envelope { kind, payload, timestamp: OffsetDateTime::now_utc() };
    serde_json::to_string(&envelope).ok()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Abonné de test : enregistre les frames reçues
    #[derive(Default)]
    pub struct RecordingSubscriber {
        pub frames: Mutex<Vec<(String, String)>>,
        pub pings: AtomicUsize,
        pub fail_sends: AtomicBool,
        pub closed: AtomicBool,
    }

    impl RecordingSubscriber {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            let sub = Self::default();
            sub.fail_sends.store(true, Ordering::SeqCst);
            Arc::new(sub)
        }

        pub fn kinds(&self) -> Vec<String> {
            self.frames.lock().iter().map(|(kind, _)| kind.clone()).collect()
        }

        pub fn count_of(&self, kind: &str) -> usize {
            self.frames.lock().iter().filter(|(k, _)| k == kind).count()
        }
    }

    impl SubscriberSink for RecordingSubscriber {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn send(&self, kind: &str, frame: &str) -> Result<(), HubError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(HubError::Send("boom".into()));
            }
            self.frames.lock().push((kind.to_string(), frame.to_string()));
            Ok(())
        }

        fn ping(&self) -> Result<(), HubError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSubscriber;
    use super::*;
    use std::sync::atomic::Ordering;

    fn hub() -> Arc<BroadcastHub> {
        Arc::new(BroadcastHub::new(Duration::from_secs(30)))
    }

    #[test]
    fn test_join_sends_welcome() {
        let hub = hub();
        let sub = RecordingSubscriber::new();
        let id = hub.join(sub.clone());

        assert!(hub.contains(id));
        assert_eq!(sub.kinds(), vec![ENVELOPE_CONNECTED.to_string()]);
        let frame: serde_json::Value = serde_json::from_str(&sub.frames.lock()[0].1).unwrap();
        assert_eq!(frame["type"], "connected");
        assert_eq!(frame["payload"]["subscriberId"], id.to_string());
        assert!(frame["timestamp"].is_string());
    }

    #[test]
    fn test_one_failing_subscriber_does_not_block_others() {
        let hub = hub();
        let healthy: Vec<_> = (0..4).map(|_| RecordingSubscriber::new()).collect();
        for sub in &healthy {
            hub.join(sub.clone());
        }
        hub.join(RecordingSubscriber::failing());

        let report = hub.broadcast(ENVELOPE_TELEMETRY_BATCH, &vec![1, 2, 3]);
        assert_eq!(report, BroadcastReport { delivered: 4, failed: 1, skipped: 0 });
        for sub in &healthy {
            assert_eq!(sub.count_of(ENVELOPE_TELEMETRY_BATCH), 1);
        }
    }

    #[test]
    fn test_closed_transport_is_skipped() {
        let hub = hub();
        let open = RecordingSubscriber::new();
        let closed = RecordingSubscriber::new();
        hub.join(open.clone());
        hub.join(closed.clone());
        closed.close();

        let report = hub.broadcast(ENVELOPE_TELEMETRY_BATCH, &"x");
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0, skipped: 1 });
        assert_eq!(closed.count_of(ENVELOPE_TELEMETRY_BATCH), 0);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let hub = hub();
        let id = hub.join(RecordingSubscriber::new());
        assert!(hub.leave(id));
        assert!(!hub.leave(id));
        assert_eq!(hub.len(), 0);
    }

    #[test]
    fn test_heartbeat_drops_only_unacknowledged() {
        let hub = hub();
        let responsive = RecordingSubscriber::new();
        let silent = RecordingSubscriber::new();
        let responsive_id = hub.join(responsive.clone());
        let silent_id = hub.join(silent.clone());

        // premier tour : tout le monde était alive, tout le monde devient suspect
        assert_eq!(hub.heartbeat_round(), HeartbeatReport { pinged: 2, dropped: 0 });
        hub.acknowledge(responsive_id);

        assert_eq!(hub.heartbeat_round(), HeartbeatReport { pinged: 1, dropped: 1 });
        assert!(hub.contains(responsive_id));
        assert!(!hub.contains(silent_id));
        assert!(silent.closed.load(Ordering::SeqCst));
        assert_eq!(responsive.pings.load(Ordering::SeqCst), 2);
    }

    /// Abonné qui se désinscrit pendant la diffusion
    struct LeavingSubscriber {
        hub: Arc<BroadcastHub>,
        id: parking_lot::Mutex<Option<SubscriberId>>,
    }

    impl SubscriberSink for LeavingSubscriber {
        fn is_open(&self) -> bool {
            true
        }
        fn send(&self, kind: &str, _frame: &str) -> Result<(), HubError> {
            if kind == ENVELOPE_TELEMETRY_BATCH {
                if let Some(id) = *self.id.lock() {
                    self.hub.leave(id);
                }
            }
            Ok(())
        }
        fn ping(&self) -> Result<(), HubError> {
            Ok(())
        }
        fn close(&self) {}
    }

    #[test]
    fn test_disconnect_during_broadcast_keeps_fan_out_intact() {
        let hub = hub();
        let leaving = Arc::new(LeavingSubscriber { hub: hub.clone(), id: parking_lot::Mutex::new(None) });
        let leaving_id = hub.join(leaving.clone());
        *leaving.id.lock() = Some(leaving_id);

        let others: Vec<_> = (0..3).map(|_| RecordingSubscriber::new()).collect();
        for sub in &others {
            hub.join(sub.clone());
        }

        let report = hub.broadcast(ENVELOPE_TELEMETRY_BATCH, &"batch");
        assert_eq!(report.delivered, 4);
        assert!(!hub.contains(leaving_id));
        for sub in &others {
            assert_eq!(sub.count_of(ENVELOPE_TELEMETRY_BATCH), 1);
        }
    }
}
