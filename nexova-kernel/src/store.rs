/**
 * STORE - Registre machines, sink de télémétrie, alertes et trace d'audit
 *
 * RÔLE :
 * Définit les interfaces des collaborateurs externes du pipeline (registre,
 * persistance, alertes, statut machine, audit) et fournit JsonStore,
 * l'implémentation fichier utilisée par le kernel.
 *
 * FONCTIONNEMENT (JsonStore) :
 * - caches mémoire (historique borné par machine, alertes, décisions récentes)
 * - fichiers JSON-lines en append-only : telemetry.jsonl, alerts.jsonl, decisions.jsonl
 * - machines.json réécrit à chaque changement de statut
 * - mode mémoire seule si aucun data_dir (tests, fallback au démarrage)
 *
 * L'écriture disque précède la mise à jour du cache : une ligne visible en
 * mémoire est une ligne enregistrée.
 */

use crate::models::{Alert, DecisionAuditRecord, Machine, MachineStatus, TelemetryReading};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

const TELEMETRY_FILE: &str = "telemetry.jsonl";
const ALERTS_FILE: &str = "alerts.jsonl";
const DECISIONS_FILE: &str = "decisions.jsonl";
const MACHINES_FILE: &str = "machines.json";
const RECENT_CAPACITY: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unknown machine: {0}")]
    UnknownMachine(String),
}

#[async_trait]
pub trait MachineRegistry: Send + Sync {
    /// Machines actives (tout sauf OFFLINE)
    async fn list_active_machines(&self) -> Result<Vec<Machine>, StoreError>;
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn append_batch(&self, batch: Vec<TelemetryReading>) -> Result<(), StoreError>;
    /// Les `limit` dernières lectures, ordre chronologique
    async fn query_recent(&self, machine_id: &str, limit: usize) -> Result<Vec<TelemetryReading>, StoreError>;
}

#[async_trait]
pub trait MachineStatusSink: Send + Sync {
    async fn update_status(&self, machine_id: &str, status: MachineStatus) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn create_alert(&self, alert: Alert) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append_audit(&self, record: DecisionAuditRecord) -> Result<(), StoreError>;
}

pub struct JsonStore {
    data_dir: Option<PathBuf>,
    history_capacity: usize,
    machines: Mutex<BTreeMap<String, Machine>>,
    readings: Mutex<HashMap<String, VecDeque<TelemetryReading>>>,
    alerts: Mutex<VecDeque<Alert>>,
    decisions: Mutex<VecDeque<DecisionAuditRecord>>,
}

impl JsonStore {
    pub fn in_memory(history_capacity: usize, machines: &[Machine]) -> Self {
        Self {
            data_dir: None,
            history_capacity: history_capacity.max(1),
            machines: Mutex::new(machines.iter().map(|m| (m.id.clone(), m.clone())).collect()),
            readings: Mutex::new(HashMap::new()),
            alerts: Mutex::new(VecDeque::new()),
            decisions: Mutex::new(VecDeque::new()),
        }
    }

    /// Ouvre le store sur disque. machines.json existant prime sur la flotte seed.
    pub async fn open<P: AsRef<Path>>(data_dir: P, history_capacity: usize, seed: &[Machine]) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let machines_path = dir.join(MACHINES_FILE);
        let mut store = Self::in_memory(history_capacity, seed);
        store.data_dir = Some(dir);

        if tokio::fs::try_exists(&machines_path).await? {
            let content = tokio::fs::read_to_string(&machines_path).await?;
            let saved: BTreeMap<String, Machine> = serde_json::from_str(&content)?;
            info!(count = saved.len(), path = %machines_path.display(), "loaded machine registry");
            *store.machines.lock() = saved;
        } else {
            store.save_machines().await?;
            info!(count = seed.len(), "seeded machine registry");
        }
        Ok(store)
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.machines.lock().values().cloned().collect()
    }

    pub fn machine(&self, machine_id: &str) -> Option<Machine> {
        self.machines.lock().get(machine_id).cloned()
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        newest_first(&self.alerts.lock(), limit)
    }

    pub fn recent_decisions(&self, limit: usize) -> Vec<DecisionAuditRecord> {
        newest_first(&self.decisions.lock(), limit)
    }

    async fn save_machines(&self) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else { return Ok(()) };
        let content = {
            let machines = self.machines.lock();
            serde_json::to_string_pretty(&*machines)?
        };
        tokio::fs::write(dir.join(MACHINES_FILE), content).await?;
        Ok(())
    }

    async fn append_lines<T: Serialize>(&self, file: &str, rows: &[T]) -> Result<(), StoreError> {
        let Some(dir) = &self.data_dir else { return Ok(()) };
        let mut buffer = String::new();
        for row in rows {
            buffer.push_str(&serde_json::to_string(row)?);
            buffer.push('\n');
        }
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(file))
            .await?;
        handle.write_all(buffer.as_bytes()).await?;
        handle.flush().await?;
        Ok(())
    }
}

fn newest_first<T: Clone>(rows: &VecDeque<T>, limit: usize) -> Vec<T> {
    rows.iter().rev().take(limit).cloned().collect()
}

fn push_bounded<T>(rows: &mut VecDeque<T>, row: T, capacity: usize) {
    rows.push_back(row);
    while rows.len() > capacity {
        rows.pop_front();
    }
}

#[async_trait]
impl MachineRegistry for JsonStore {
    async fn list_active_machines(&self) -> Result<Vec<Machine>, StoreError> {
        Ok(self
            .machines
            .lock()
            .values()
            .filter(|m| m.status != MachineStatus::Offline)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TelemetrySink for JsonStore {
    async fn append_batch(&self, batch: Vec<TelemetryReading>) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.append_lines(TELEMETRY_FILE, &batch).await?;

        let mut readings = self.readings.lock();
        for reading in batch {
            let history = readings.entry(reading.machine_id.clone()).or_default();
            push_bounded(history, reading, self.history_capacity);
        }
        Ok(())
    }

    async fn query_recent(&self, machine_id: &str, limit: usize) -> Result<Vec<TelemetryReading>, StoreError> {
        let readings = self.readings.lock();
        let Some(history) = readings.get(machine_id) else { return Ok(Vec::new()) };
        let skip = history.len().saturating_sub(limit);
        Ok(history.iter().skip(skip).cloned().collect())
    }
}

#[async_trait]
impl MachineStatusSink for JsonStore {
    async fn update_status(&self, machine_id: &str, status: MachineStatus) -> Result<(), StoreError> {
        {
            let mut machines = self.machines.lock();
            let machine = machines
                .get_mut(machine_id)
                .ok_or_else(|| StoreError::UnknownMachine(machine_id.to_string()))?;
            machine.status = status;
        }
        self.save_machines().await
    }
}

#[async_trait]
impl AlertSink for JsonStore {
    async fn create_alert(&self, alert: Alert) -> Result<(), StoreError> {
        self.append_lines(ALERTS_FILE, std::slice::from_ref(&alert)).await?;
        push_bounded(&mut self.alerts.lock(), alert, RECENT_CAPACITY);
        Ok(())
    }
}

#[async_trait]
impl AuditLog for JsonStore {
    async fn append_audit(&self, record: DecisionAuditRecord) -> Result<(), StoreError> {
        self.append_lines(DECISIONS_FILE, std::slice::from_ref(&record)).await?;
        push_bounded(&mut self.decisions.lock(), record, RECENT_CAPACITY);
        Ok(())
    }
}
