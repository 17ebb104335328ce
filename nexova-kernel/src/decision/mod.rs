/**
 * AUTONOMOUS DECISION - Réponse autonome aux anomalies détectées
 *
 * RÔLE :
 * Pour chaque anomalie : construit le contexte (machine, lecture, historique),
 * interroge le collaborateur de décision avec un timeout borné, valide la
 * réponse contre un schéma strict puis applique les effets :
 * statut machine (si action), trace d'audit, alerte humaine.
 *
 * ÉCHECS :
 * Réponse invalide, timeout ou erreur transport -> invocation abandonnée,
 * aucune écriture, pas de retry (le prochain tick est le seul chemin de retry).
 *
 * ORDRE DES STATUTS :
 * Chaque dispatch reçoit un numéro de séquence global. Une écriture de statut
 * plus ancienne que la dernière appliquée pour la machine est ignorée ; l'audit
 * (`statusApplied`) et l'alerte le disent.
 *
 * ORDRE DES ÉCRITURES : statut, audit, alerte. L'audit décrit ce qui a
 * réellement été appliqué ; un audit en échec après un statut appliqué est
 * journalisé en erreur avec l'action et la séquence.
 */

pub mod dispatch;
pub mod http;
pub mod rules;

use crate::hub::{BroadcastHub, ENVELOPE_ALERT};
use crate::models::{
    ActionTaken, Alert, AnomalyEvent, AnomalyKind, DecisionAuditRecord, Machine, MachineStatus,
    RiskLevel, TelemetryReading,
};
use crate::profiles::MachineProfile;
use crate::store::{AlertSink, AuditLog, MachineStatusSink, StoreError, TelemetrySink};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const ALERT_KIND_AUTONOMOUS_ACTION: &str = "AUTONOMOUS_ACTION";
const REASONING_SUMMARY_CHARS: usize = 280;

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("malformed decision payload: {0}")]
    Malformed(String),
    #[error("decision collaborator timed out after {0:?}")]
    Timeout(Duration),
    #[error("decision transport error: {0}")]
    Transport(String),
    #[error("decision side effect failed: {0}")]
    Store(#[from] StoreError),
}

impl DecisionError {
    pub fn kind(&self) -> &'static str {
        match self {
            DecisionError::Malformed(_) => "malformed",
            DecisionError::Timeout(_) => "timeout",
            DecisionError::Transport(_) => "transport",
            DecisionError::Store(_) => "store",
        }
    }
}

/// Contexte envoyé au collaborateur
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBundle {
    pub machine: Machine,
    pub anomaly_kind: AnomalyKind,
    pub reading: TelemetryReading,
    pub profile: MachineProfile,
    pub history: Vec<TelemetryReading>,
}

/// Décision validée
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub root_cause: String,
    pub risk_level: RiskLevel,
    pub action_taken: ActionTaken,
    pub reasoning: String,
    pub estimated_savings: f64,
    pub prevented_loss: f64,
    pub human_recommendation: String,
}

impl Decision {
    /// Valide une réponse non typée. Toute forme inattendue est `Malformed`.
    pub fn from_payload(payload: Value) -> Result<Self, DecisionError> {
        if !payload.is_object() {
            return Err(DecisionError::Malformed("expected a JSON object".into()));
        }
        let decision: Decision =
            serde_json::from_value(payload).map_err(|e| DecisionError::Malformed(e.to_string()))?;

        if decision.root_cause.trim().is_empty() {
            return Err(DecisionError::Malformed("rootCause is empty".into()));
        }
        if decision.reasoning.trim().is_empty() {
            return Err(DecisionError::Malformed("reasoning is empty".into()));
        }
        for (field, value) in [
            ("estimatedSavings", decision.estimated_savings),
            ("preventedLoss", decision.prevented_loss),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(DecisionError::Malformed(format!("{field} must be a non-negative number")));
            }
        }
        Ok(decision)
    }
}

#[async_trait]
pub trait DecisionCollaborator: Send + Sync {
    /// Réponse brute, validée ensuite par `Decision::from_payload`
    async fn decide(&self, context: &ContextBundle) -> Result<Value, DecisionError>;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub machine: Machine,
    pub profile: MachineProfile,
    pub event: AnomalyEvent,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub record: DecisionAuditRecord,
    pub alert: Alert,
    pub status_applied: bool,
}

#[derive(Clone)]
pub struct DecisionSinks {
    pub telemetry: Arc<dyn TelemetrySink>,
    pub statuses: Arc<dyn MachineStatusSink>,
    pub alerts: Arc<dyn AlertSink>,
    pub audit: Arc<dyn AuditLog>,
}

pub struct DecisionInvoker {
    collaborator: Arc<dyn DecisionCollaborator>,
    sinks: DecisionSinks,
    hub: Option<Arc<BroadcastHub>>,
    timeout: Duration,
    history_limit: usize,
    // machine_id -> dernière séquence appliquée ; verrou tenu uniquement pendant l'écriture du statut
    applied_sequences: tokio::sync::Mutex<HashMap<String, u64>>,
}

impl DecisionInvoker {
    pub fn new(
        collaborator: Arc<dyn DecisionCollaborator>,
        sinks: DecisionSinks,
        timeout: Duration,
        history_limit: usize,
    ) -> Self {
        Self {
            collaborator,
            sinks,
            hub: None,
            timeout,
            history_limit,
            applied_sequences: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hub(mut self, hub: Arc<BroadcastHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn collaborator_name(&self) -> &'static str {
        self.collaborator.name()
    }

    pub async fn invoke(&self, request: DecisionRequest) -> Result<DecisionOutcome, DecisionError> {
        let DecisionRequest { machine, profile, event, sequence } = request;

        let history = match self.sinks.telemetry.query_recent(&machine.id, self.history_limit).await {
            Ok(history) => history,
            Err(e) => {
                warn!(machine_id = %machine.id, error = %e, "history unavailable, deciding without it");
                Vec::new()
            }
        };

        let context = ContextBundle {
            machine,
            anomaly_kind: event.kind,
            reading: event.reading,
            profile,
            history,
        };
        let context_snapshot = serde_json::to_value(&context).map_err(StoreError::from)?;

        let payload = tokio::time::timeout(self.timeout, self.collaborator.decide(&context))
            .await
            .map_err(|_| DecisionError::Timeout(self.timeout))??;
        let decision = Decision::from_payload(payload)?;

        // à partir d'ici la réponse est valide : effets de bord
        let machine = context.machine;
        let status_applied = match decision.action_taken.target_status() {
            Some(status) => self.apply_status(&machine.id, status, sequence).await?,
            None => false,
        };

        let now = OffsetDateTime::now_utc();
        let record = DecisionAuditRecord {
            id: Uuid::new_v4(),
            machine_id: machine.id.clone(),
            sequence,
            context_snapshot,
            anomaly_kind: context.anomaly_kind,
            root_cause: decision.root_cause.clone(),
            risk_level: decision.risk_level,
            reasoning_summary: summarize(&decision.reasoning, REASONING_SUMMARY_CHARS),
            action_taken: decision.action_taken,
            status_applied,
            estimated_savings: decision.estimated_savings,
            prevented_loss: decision.prevented_loss,
            timestamp: now,
        };
        if let Err(e) = self.sinks.audit.append_audit(record.clone()).await {
            if status_applied {
                error!(
                    machine_id = %machine.id,
                    sequence,
                    action = decision.action_taken.as_str(),
                    error = %e,
                    "status applied but audit record not written"
                );
            }
            return Err(e.into());
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            machine_id: machine.id.clone(),
            severity: decision.risk_level.severity(),
            kind: ALERT_KIND_AUTONOMOUS_ACTION.to_string(),
            message: alert_message(&machine, &decision, status_applied),
            created_at: now,
        };
        self.sinks.alerts.create_alert(alert.clone()).await?;

        if let Some(hub) = &self.hub {
            hub.broadcast(ENVELOPE_ALERT, &alert);
        }

        info!(
            machine_id = %machine.id,
            kind = %context.anomaly_kind,
            sequence,
            action = decision.action_taken.as_str(),
            status_applied,
            "autonomous decision recorded"
        );
        Ok(DecisionOutcome { record, alert, status_applied })
    }

    async fn apply_status(&self, machine_id: &str, status: MachineStatus, sequence: u64) -> Result<bool, DecisionError> {
        let mut applied = self.applied_sequences.lock().await;
        if let Some(last) = applied.get(machine_id) {
            if *last >= sequence {
                warn!(machine_id, sequence, last_applied = *last, "stale decision, status left unchanged");
                return Ok(false);
            }
        }
        self.sinks.statuses.update_status(machine_id, status).await?;
        applied.insert(machine_id.to_string(), sequence);
        Ok(true)
    }
}

fn alert_message(machine: &Machine, decision: &Decision, status_applied: bool) -> String {
    let head = match decision.action_taken {
        ActionTaken::None => format!("No automatic action on {}", machine.name),
        action if status_applied => format!("{} applied to {}", action.as_str(), machine.name),
        action => format!(
            "{} recommended for {} (superseded by a newer decision, status unchanged)",
            action.as_str(),
            machine.name
        ),
    };
    format!(
        "{head}: {}. {} Recommendation: {}",
        decision.root_cause.trim(),
        decision.reasoning.trim(),
        decision.human_recommendation.trim()
    )
}

fn summarize(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut summary: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    summary.push_str("...");
    summary
}


#[cfg(test)]
mod tests {
    use super::testing::{offline_critical, ScriptedCollaborator};
    use super::*;
    use crate::classifier::classify;
    use crate::hub::testing::RecordingSubscriber;
    use crate::models::AlertSeverity;
    use crate::store::testing::RecordingStore;

    fn machine() -> Machine {
        Machine {
            id: "cnc-01".into(),
            name: "CNC 01".into(),
            machine_type: "CNC".into(),
            status: MachineStatus::Online,
        }
    }

    fn reading(power: f64) -> TelemetryReading {
        TelemetryReading {
            machine_id: "cnc-01".into(),
            timestamp: OffsetDateTime::now_utc(),
            voltage: 400.0,
            current: 30.0,
            power,
            temperature: 50.0,
            vibration: 2.0,
            production: 30.0,
            runtime_hours: 3.5,
        }
    }

    fn profile() -> MachineProfile {
        MachineProfile { base_power: 10.0, ..MachineProfile::default() }
    }

    fn request(kind: AnomalyKind, sequence: u64) -> DecisionRequest {
        DecisionRequest {
            machine: machine(),
            profile: profile(),
            event: AnomalyEvent { machine_id: "cnc-01".into(), kind, reading: reading(16.0) },
            sequence,
        }
    }

    fn invoker(collaborator: Arc<dyn DecisionCollaborator>, store: &Arc<RecordingStore>) -> DecisionInvoker {
        DecisionInvoker::new(collaborator, store.sinks(), Duration::from_secs(5), 10)
    }

    #[tokio::test]
    async fn test_load_spike_end_to_end() {
        let store = RecordingStore::new(vec![machine()]);
        let hub_sub = RecordingSubscriber::new();
        let hub = Arc::new(BroadcastHub::new(Duration::from_secs(30)));
        hub.join(hub_sub.clone());

        let r = reading(16.0);
        let kind = classify(&r, &profile());
        assert_eq!(kind, AnomalyKind::LoadSpike);

        let invoker = invoker(ScriptedCollaborator::returning(offline_critical()), &store).with_hub(hub);
        let outcome = invoker.invoke(request(kind, 1)).await.unwrap();

        assert!(outcome.status_applied);
        assert_eq!(store.status_updates(), vec![("cnc-01".to_string(), MachineStatus::Offline)]);

        let audits = store.audits();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].action_taken, ActionTaken::Offline);
        assert_eq!(audits[0].anomaly_kind, AnomalyKind::LoadSpike);
        assert_eq!(audits[0].context_snapshot["machine"]["id"], "cnc-01");

        let alerts = store.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert!(alerts[0].message.contains("OFFLINE"));
        assert!(alerts[0].message.contains("Inspect spindle bearings"));

        assert_eq!(hub_sub.count_of(ENVELOPE_ALERT), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_writes_nothing() {
        let store = RecordingStore::new(vec![machine()]);
        let bad_payloads = vec![
            serde_json::json!("OFFLINE"),
            serde_json::json!({"actionTaken": "OFFLINE"}),
            serde_json::json!({
                "rootCause": "x", "riskLevel": "SEVERE", "actionTaken": "OFFLINE",
                "reasoning": "y", "estimatedSavings": 1.0, "preventedLoss": 1.0,
                "humanRecommendation": "z"
            }),
            serde_json::json!({
                "rootCause": "x", "riskLevel": "CRITICAL", "actionTaken": "SHUTDOWN",
                "reasoning": "y", "estimatedSavings": 1.0, "preventedLoss": 1.0,
                "humanRecommendation": "z"
            }),
            serde_json::json!({
                "rootCause": "x", "riskLevel": "CRITICAL", "actionTaken": "OFFLINE",
                "reasoning": "y", "estimatedSavings": -5.0, "preventedLoss": 1.0,
                "humanRecommendation": "z"
            }),
        ];

        for payload in bad_payloads {
            let invoker = invoker(ScriptedCollaborator::returning(payload), &store);
            let err = invoker.invoke(request(AnomalyKind::LoadSpike, 1)).await.unwrap_err();
            assert!(matches!(err, DecisionError::Malformed(_)), "got {err:?}");
        }
        assert!(store.status_updates().is_empty());
        assert!(store.audits().is_empty());
        assert!(store.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_writes_nothing() {
        let store = RecordingStore::new(vec![machine()]);
        let collaborator = ScriptedCollaborator::slow(offline_critical(), Duration::from_secs(60));
        let invoker = invoker(collaborator, &store);

        let err = invoker.invoke(request(AnomalyKind::LoadSpike, 1)).await.unwrap_err();
        assert!(matches!(err, DecisionError::Timeout(_)));
        assert_eq!(err.kind(), "timeout");
        assert!(store.status_updates().is_empty());
        assert!(store.audits().is_empty());
        assert!(store.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_writes_nothing() {
        let store = RecordingStore::new(vec![machine()]);
        let invoker = invoker(ScriptedCollaborator::failing("connection refused"), &store);

        let err = invoker.invoke(request(AnomalyKind::Overheat, 1)).await.unwrap_err();
        assert!(matches!(err, DecisionError::Transport(_)));
        assert!(store.audits().is_empty());
    }

    #[tokio::test]
    async fn test_no_action_still_audits_and_alerts() {
        let store = RecordingStore::new(vec![machine()]);
        let mut payload = offline_critical();
        payload["actionTaken"] = "NONE".into();
        payload["riskLevel"] = "INFO".into();

        let outcome = invoker(ScriptedCollaborator::returning(payload), &store)
            .invoke(request(AnomalyKind::PredictiveVibration, 1))
            .await
            .unwrap();

        assert!(!outcome.status_applied);
        assert!(store.status_updates().is_empty());
        assert_eq!(store.audits().len(), 1);
        assert_eq!(store.alerts()[0].severity, AlertSeverity::Low);
        assert!(store.alerts()[0].message.starts_with("No automatic action"));
    }

    #[tokio::test]
    async fn test_stale_sequence_does_not_clobber_status() {
        let store = RecordingStore::new(vec![machine()]);
        let invoker = invoker(ScriptedCollaborator::returning(offline_critical()), &store);

        let newer = invoker.invoke(request(AnomalyKind::LoadSpike, 7)).await.unwrap();
        let older = invoker.invoke(request(AnomalyKind::LoadSpike, 3)).await.unwrap();

        assert!(newer.status_applied);
        assert!(!older.status_applied);
        assert_eq!(store.status_updates().len(), 1);
        // la trace d'audit reste complète
        let audits = store.audits();
        assert_eq!(audits.len(), 2);
        assert!(audits[0].status_applied);
        assert!(!audits[1].status_applied);
        assert_eq!(audits[1].action_taken, ActionTaken::Offline);

        let alerts = store.alerts();
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].message.starts_with("OFFLINE applied to CNC 01"));
        assert!(alerts[1].message.starts_with("OFFLINE recommended for CNC 01 (superseded by a newer decision, status unchanged)"));
        assert!(!alerts[1].message.contains("applied to"));
        assert_eq!(serde_json::to_value(&audits[1]).unwrap()["statusApplied"], false);
    }

    #[tokio::test]
    async fn test_audit_failure_after_status_is_a_store_error() {
        let store = RecordingStore::new(vec![machine()]);
        store.fail_audits.store(true, std::sync::atomic::Ordering::SeqCst);
        let invoker = invoker(ScriptedCollaborator::returning(offline_critical()), &store);

        let err = invoker.invoke(request(AnomalyKind::LoadSpike, 1)).await.unwrap_err();
        assert_eq!(err.kind(), "store");
        assert_eq!(store.status_updates().len(), 1);
        assert!(store.audits().is_empty());
        assert!(store.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_history_is_part_of_context() {
        let store = RecordingStore::new(vec![machine()]);
        store.sinks().telemetry.append_batch(vec![reading(9.0), reading(10.0)]).await.unwrap();
        let collaborator = ScriptedCollaborator::returning(offline_critical());

        invoker(collaborator.clone(), &store).invoke(request(AnomalyKind::LoadSpike, 1)).await.unwrap();

        assert_eq!(collaborator.calls(), 1);
        let contexts = collaborator.contexts.lock();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].history.len(), 2);
        assert_eq!(contexts[0].profile.base_power, 10.0);
    }

    #[test]
    fn test_summary_is_bounded() {
        let long = "a".repeat(1000);
        assert_eq!(summarize(&long, 20).chars().count(), 20);
        assert_eq!(summarize(" short ", 20), "short");
    }
}
