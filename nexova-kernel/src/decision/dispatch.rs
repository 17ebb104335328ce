/**
 * DISPATCH - File des décisions autonomes, hors du chemin critique du tick
 *
 * Le scheduler pousse (sans attente) une requête par anomalie ; un superviseur
 * unique lance chaque invocation dans un JoinSet et journalise son issue.
 * Succès, échec, panique et abandon sont tous observés et comptés.
 *
 * Arrêt : à la fermeture du canal, les invocations en cours disposent d'un délai
 * de grâce, puis sont annulées.
 */

use super::{DecisionError, DecisionInvoker, DecisionOutcome, DecisionRequest};
use crate::health::HealthTracker;
use crate::models::{AnomalyEvent, Machine};
use crate::profiles::MachineProfile;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

type Settled = (String, u64, Result<DecisionOutcome, DecisionError>);

pub struct DecisionDispatcher {
    tx: mpsc::UnboundedSender<DecisionRequest>,
    sequence: AtomicU64,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
    health: HealthTracker,
}

impl DecisionDispatcher {
    pub fn channel(max_in_flight: usize, health: HealthTracker) -> (Self, mpsc::UnboundedReceiver<DecisionRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            tx,
            sequence: AtomicU64::new(0),
            in_flight: health.decisions_in_flight(),
            max_in_flight: max_in_flight.max(1),
            health,
        };
        (dispatcher, rx)
    }

    /// Fire-and-forget. `false` si la requête est refusée (capacité atteinte, superviseur arrêté).
    pub fn dispatch(&self, machine: Machine, profile: MachineProfile, event: AnomalyEvent) -> bool {
        let reserved = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < self.max_in_flight).then_some(n + 1))
            .is_ok();
        if !reserved {
            warn!(machine_id = %event.machine_id, kind = %event.kind, max = self.max_in_flight, "decision capacity reached, anomaly not dispatched");
            self.health.record_decision_rejected();
            return false;
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let machine_id = machine.id.clone();
        if self.tx.send(DecisionRequest { machine, profile, event, sequence }).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.health.record_decision_rejected();
            warn!(machine_id = %machine_id, "decision supervisor stopped, anomaly not dispatched");
            return false;
        }
        debug!(machine_id = %machine_id, sequence, "decision dispatched");
        true
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub fn spawn_decision_supervisor(
    invoker: Arc<DecisionInvoker>,
    mut rx: mpsc::UnboundedReceiver<DecisionRequest>,
    health: HealthTracker,
    grace: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(collaborator = invoker.collaborator_name(), "decision supervisor started");
        let mut tasks: JoinSet<Settled> = JoinSet::new();

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => {
                        let invoker = invoker.clone();
                        tasks.spawn(async move {
                            let machine_id = request.machine.id.clone();
                            let sequence = request.sequence;
                            (machine_id, sequence, invoker.invoke(request).await)
                        });
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => settle(joined, &health),
            }
        }

        if !tasks.is_empty() {
            info!(pending = tasks.len(), grace_ms = grace.as_millis() as u64, "draining decisions");
        }
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                settle(joined, &health);
            }
        })
        .await;

        if drained.is_err() {
            warn!(abandoned = tasks.len(), "grace period elapsed, cancelling decisions");
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                settle(joined, &health);
            }
        }
        info!("decision supervisor stopped");
    })
}

fn settle(joined: Result<Settled, JoinError>, health: &HealthTracker) {
    match joined {
        Ok((machine_id, sequence, Ok(outcome))) => {
            health.record_decision_applied();
            debug!(
                machine_id = %machine_id,
                sequence,
                audit_id = %outcome.record.id,
                alert_id = %outcome.alert.id,
                status_applied = outcome.status_applied,
                "decision settled"
            );
        }
        Ok((machine_id, sequence, Err(e))) => {
            health.record_decision_failed();
            warn!(machine_id = %machine_id, sequence, kind = e.kind(), error = %e, "decision abandoned");
        }
        Err(e) if e.is_cancelled() => {
            health.record_decision_failed();
            warn!("decision cancelled at shutdown");
        }
        Err(e) => {
            health.record_decision_failed();
            error!(error = %e, "decision task panicked");
        }
    }
    health.decisions_in_flight().fetch_sub(1, Ordering::SeqCst);
}
