use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Statut d'une machine tel que vu par le registre
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Online,
    Idle,
    Maintenance,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: String,
    pub status: MachineStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    pub machine_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub temperature: f64,
    pub vibration: f64,
    pub production: f64,
    pub runtime_hours: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    Overheat,
    LoadSpike,
    PredictiveVibration,
    None,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Overheat => "OVERHEAT",
            AnomalyKind::LoadSpike => "LOAD_SPIKE",
            AnomalyKind::PredictiveVibration => "PREDICTIVE_VIBRATION",
            AnomalyKind::None => "NONE",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomalie détectée sur une lecture, consommée immédiatement par le decision invoker
#[derive(Debug, Clone)]
pub struct AnomalyEvent {
    pub machine_id: String,
    pub kind: AnomalyKind,
    pub reading: TelemetryReading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Info,
    Warning,
    Critical,
}

impl RiskLevel {
    pub fn severity(&self) -> AlertSeverity {
        match self {
            RiskLevel::Info => AlertSeverity::Low,
            RiskLevel::Warning => AlertSeverity::High,
            RiskLevel::Critical => AlertSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionTaken {
    Maintenance,
    Offline,
    None,
}

impl ActionTaken {
    /// Statut machine correspondant, `None` quand aucune action n'est demandée
    pub fn target_status(&self) -> Option<MachineStatus> {
        match self {
            ActionTaken::Maintenance => Some(MachineStatus::Maintenance),
            ActionTaken::Offline => Some(MachineStatus::Offline),
            ActionTaken::None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTaken::Maintenance => "MAINTENANCE",
            ActionTaken::Offline => "OFFLINE",
            ActionTaken::None => "NONE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Low,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub machine_id: String,
    pub severity: AlertSeverity,
    pub kind: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Trace d'audit d'une décision autonome (append-only, jamais modifiée)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionAuditRecord {
    pub id: Uuid,
    pub machine_id: String,
    pub sequence: u64,
    pub context_snapshot: serde_json::Value,
    pub anomaly_kind: AnomalyKind,
    pub root_cause: String,
    pub risk_level: RiskLevel,
    pub reasoning_summary: String,
    pub action_taken: ActionTaken,
    /// false si une décision plus récente a déjà fixé le statut
    #[serde(default)]
    pub status_applied: bool,
    pub estimated_savings: f64,
    pub prevented_loss: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
