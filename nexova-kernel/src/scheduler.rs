/**
 * TICK SCHEDULER - Boucle de simulation à intervalle fixe
 *
 * ÉTATS : IDLE <-> RUNNING, puis STOPPED (terminal)
 *
 * PAR TICK :
 * 1. machines actives depuis le registre (vide = no-op)
 * 2. une lecture par machine (générateur + état de dégradation)
 * 3. persistance du batch ET diffusion hub en parallèle (domaines de panne séparés)
 * 4. classification de chaque lecture, dispatch des anomalies sans attente
 *
 * Une tâche unique possède le générateur et l'état : deux ticks ne se
 * chevauchent jamais. Un tick trop long fait sauter les déclenchements manqués
 * (comptés dans la santé). L'arrêt laisse finir le tick en cours.
 */

use crate::anomaly_state::AnomalyStateStore;
use crate::classifier::classify;
use crate::decision::dispatch::DecisionDispatcher;
use crate::generator::TelemetryGenerator;
use crate::health::{HealthTracker, SchedulerPhase};
use crate::hub::{BroadcastHub, ENVELOPE_TELEMETRY_BATCH};
use crate::models::{AnomalyEvent, AnomalyKind, TelemetryReading};
use crate::profiles::ProfileTable;
use crate::store::{MachineRegistry, TelemetrySink};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub machines: usize,
    pub persisted: bool,
    pub delivered: usize,
    pub anomalies: usize,
    pub dispatched: usize,
}

pub struct TickScheduler {
    registry: Arc<dyn MachineRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    hub: Arc<BroadcastHub>,
    profiles: Arc<ProfileTable>,
    generator: TelemetryGenerator,
    states: AnomalyStateStore,
    dispatcher: DecisionDispatcher,
    health: HealthTracker,
    interval: Duration,
}

impl TickScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn MachineRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
        hub: Arc<BroadcastHub>,
        profiles: Arc<ProfileTable>,
        generator: TelemetryGenerator,
        dispatcher: DecisionDispatcher,
        health: HealthTracker,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            telemetry,
            hub,
            profiles,
            generator,
            states: AnomalyStateStore::new(),
            dispatcher,
            health,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    pub async fn run_tick(&mut self) -> TickReport {
        let machines = match self.registry.list_active_machines().await {
            Ok(machines) => machines,
            Err(e) => {
                warn!(error = %e, "registry unavailable, tick skipped");
                return TickReport::default();
            }
        };
        if machines.is_empty() {
            debug!("no active machines");
            self.health.record_tick(0, 0);
            return TickReport::default();
        }

        let at = OffsetDateTime::now_utc();
        let tick_hours = self.interval.as_secs_f64() / 3600.0;
        let batch: Vec<TelemetryReading> = machines
            .iter()
            .map(|machine| {
                let profile = self.profiles.profile_for(&machine.machine_type);
                self.generator.generate(machine, profile, &mut self.states, tick_hours, at)
            })
            .collect();

        // chaque côté reçoit sa propre copie du batch
        let hub = self.hub.clone();
        let fan_out_batch = batch.clone();
        let (persisted, delivery) = tokio::join!(
            self.telemetry.append_batch(batch.clone()),
            async move { hub.broadcast(ENVELOPE_TELEMETRY_BATCH, &fan_out_batch) },
        );

        let persisted = match persisted {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, readings = batch.len(), "telemetry batch not persisted");
                self.health.record_persistence_failure();
                false
            }
        };

        let mut report = TickReport {
            machines: machines.len(),
            persisted,
            delivered: delivery.delivered,
            ..TickReport::default()
        };

        for (machine, reading) in machines.into_iter().zip(batch) {
            let profile = *self.profiles.profile_for(&machine.machine_type);
            let kind = classify(&reading, &profile);
            if kind == AnomalyKind::None {
                continue;
            }
            report.anomalies += 1;
            info!(machine_id = %machine.id, kind = %kind, power = reading.power, temperature = reading.temperature, vibration = reading.vibration, "anomaly detected");

            // sans persistance, l'historique du contexte ne contiendrait pas cette lecture
            if !persisted {
                continue;
            }
            let event = AnomalyEvent { machine_id: machine.id.clone(), kind, reading };
            if self.dispatcher.dispatch(machine, profile, event) {
                report.dispatched += 1;
            }
        }

        if !persisted && report.anomalies > 0 {
            warn!(anomalies = report.anomalies, "decisions skipped for unpersisted batch");
        }
        self.health.record_tick(report.machines, report.anomalies);
        debug!(
            machines = report.machines,
            delivered = report.delivered,
            anomalies = report.anomalies,
            dispatched = report.dispatched,
            tracked = self.states.len(),
            in_flight = self.dispatcher.in_flight(),
            "tick completed"
        );
        report
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        SchedulerHandle { stop: stop_tx, task }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) -> TickScheduler {
        let period = self.interval;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = period.as_millis() as u64, "tick scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = interval.tick() => {}
            }

            // le tick tourne hors du select : un stop ne l'interrompt pas
            self.health.set_phase(SchedulerPhase::Running);
            let started = Instant::now();
            self.run_tick().await;
            let missed = started.elapsed().as_nanos() / period.as_nanos().max(1);
            if missed > 0 {
                self.health.record_skipped(missed as u64);
                warn!(missed = missed as u64, elapsed_ms = started.elapsed().as_millis() as u64, "tick overran its interval");
            }
            self.health.set_phase(SchedulerPhase::Idle);

            if *stop.borrow() {
                break;
            }
        }

        self.health.set_phase(SchedulerPhase::Stopped);
        info!(ticks = self.health.ticks_completed(), skipped = self.health.ticks_skipped(), "tick scheduler stopped");
        self
    }
}

pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<TickScheduler>,
}

impl SchedulerHandle {
    /// Demande l'arrêt et attend la fin du tick en cours
    pub async fn stop(self) -> Result<TickScheduler, JoinError> {
        let _ = self.stop.send(true);
        self.task.await
    }

    /// Se résout si la tâche se termine sans arrêt demandé (panique d'un abonné...)
    pub async fn exited(&mut self) -> Result<TickScheduler, JoinError> {
        (&mut self.task).await
    }
}
