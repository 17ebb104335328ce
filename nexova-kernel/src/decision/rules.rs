/**
 * RULE ADVISOR - Collaborateur de décision local et déterministe
 *
 * Mode par défaut quand aucun service distant n'est configuré. Produit le même
 * payload non typé qu'un collaborateur distant ; il passe donc par la même validation.
 *
 * Règles :
 * - sévérité selon le ratio mesure / baseline du profil
 * - économies estimées = puissance moyenne (kW) × 10 % × 24 h × 0.12 €/kWh
 *   + variance de puissance × 0.005 (charge instable, variance > 50)
 *   + (pic - moyenne) × 0.2 × 0.12 (pic > 1.5 × moyenne)
 * - perte évitée = économies × facteur de risque
 *
 * SCORE D'EFFICACITÉ (0-100, dans `reasoning`) :
 * puissance moyenne > 30 kW : -15, température moyenne > 75 °C : -10,
 * charge instable : -8, ratio pic/moyenne élevé : -7
 */

use super::{ContextBundle, DecisionCollaborator, DecisionError};
use crate::generator::round2;
use crate::models::{ActionTaken, AnomalyKind, RiskLevel};
use async_trait::async_trait;
use serde_json::{json, Value};

const SAVINGS_SHARE: f64 = 0.1;
const HOURS_PER_DAY: f64 = 24.0;
const ENERGY_PRICE_PER_KWH: f64 = 0.12;

const CRITICAL_POWER_RATIO: f64 = 2.0;
const CRITICAL_HEAT_RATIO: f64 = 1.6;

const HIGH_AVERAGE_POWER_KW: f64 = 30.0;
const HIGH_AVERAGE_TEMP: f64 = 75.0;
const UNSTABLE_POWER_VARIANCE: f64 = 50.0;
const PEAK_TO_AVERAGE_RATIO: f64 = 1.5;
const VARIANCE_SAVINGS_FACTOR: f64 = 0.005;
const PEAK_SHAVING_SHARE: f64 = 0.2;

/// Statistiques de l'historique (la lecture courante seule si l'historique est vide)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryStats {
    pub avg_power: f64,
    pub max_power: f64,
    pub avg_temp: f64,
    pub power_variance: f64,
}

impl HistoryStats {
    pub fn from_context(context: &ContextBundle) -> Self {
        let readings = if context.history.is_empty() {
            std::slice::from_ref(&context.reading)
        } else {
            context.history.as_slice()
        };
        let n = readings.len() as f64;
        let avg_power = readings.iter().map(|r| r.power).sum::<f64>() / n;
        let avg_temp = readings.iter().map(|r| r.temperature).sum::<f64>() / n;
        let max_power = readings.iter().map(|r| r.power).fold(f64::MIN, f64::max);
        let power_variance = readings.iter().map(|r| (r.power - avg_power).powi(2)).sum::<f64>() / n;
        Self { avg_power, max_power, avg_temp, power_variance }
    }

    fn unstable(&self) -> bool {
        self.power_variance > UNSTABLE_POWER_VARIANCE
    }

    fn peaky(&self) -> bool {
        self.avg_power > 0.0 && self.max_power > self.avg_power * PEAK_TO_AVERAGE_RATIO
    }
}

/// Constat tiré de l'historique, avec sa pénalité sur le score d'efficacité
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub note: String,
    pub penalty: f64,
}

pub fn findings(stats: &HistoryStats) -> Vec<Finding> {
    let mut found = Vec::new();
    if stats.avg_power > HIGH_AVERAGE_POWER_KW {
        found.push(Finding {
            note: format!("Average power is high ({:.1} kW), shift heavy operations to off-peak hours.", stats.avg_power),
            penalty: 15.0,
        });
    }
    if stats.avg_temp > HIGH_AVERAGE_TEMP {
        found.push(Finding {
            note: format!("Temperature averaging {:.1} °C, check cooling and ventilation.", stats.avg_temp),
            penalty: 10.0,
        });
    }
    if stats.unstable() {
        found.push(Finding {
            note: format!("Unstable power draw (variance {:.1}), consider power factor correction.", stats.power_variance),
            penalty: 8.0,
        });
    }
    if stats.peaky() {
        found.push(Finding {
            note: format!(
                "Peak-to-average power ratio is {:.1}x, stagger startups or add soft-start.",
                stats.max_power / stats.avg_power
            ),
            penalty: 7.0,
        });
    }
    found
}

pub fn efficiency_score(found: &[Finding]) -> f64 {
    (100.0 - found.iter().map(|f| f.penalty).sum::<f64>()).clamp(0.0, 100.0)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RuleAdvisor;

impl RuleAdvisor {
    pub fn new() -> Self {
        Self
    }

    fn assess(context: &ContextBundle) -> (RiskLevel, ActionTaken, String, String) {
        let reading = &context.reading;
        let profile = &context.profile;
        match context.anomaly_kind {
            AnomalyKind::LoadSpike => {
                let ratio = ratio(reading.power, profile.base_power);
                let cause = format!("Power draw at {ratio:.2}x baseline ({:.2} kW)", reading.power);
                if ratio >= CRITICAL_POWER_RATIO {
                    (RiskLevel::Critical, ActionTaken::Offline, cause, "Check drive and load path before restarting.".into())
                } else {
                    (RiskLevel::Warning, ActionTaken::Maintenance, cause, "Schedule an electrical inspection.".into())
                }
            }
            AnomalyKind::Overheat => {
                let ratio = ratio(reading.temperature, profile.base_temp);
                let cause = format!("Temperature at {ratio:.2}x baseline ({:.2} °C)", reading.temperature);
                if ratio >= CRITICAL_HEAT_RATIO {
                    (RiskLevel::Critical, ActionTaken::Offline, cause, "Let the unit cool and inspect the cooling circuit.".into())
                } else {
                    (RiskLevel::Warning, ActionTaken::Maintenance, cause, "Inspect cooling and lubrication.".into())
                }
            }
            AnomalyKind::PredictiveVibration => {
                let ratio = ratio(reading.vibration, profile.base_vibration);
                (
                    RiskLevel::Warning,
                    ActionTaken::Maintenance,
                    format!("Vibration at {ratio:.2}x baseline ({:.2} mm/s)", reading.vibration),
                    "Plan bearing and alignment checks.".into(),
                )
            }
            AnomalyKind::None => (
                RiskLevel::Info,
                ActionTaken::None,
                "Readings within expected range".into(),
                "No action required.".into(),
            ),
        }
    }
}

fn ratio(measured: f64, baseline: f64) -> f64 {
    if baseline > 0.0 {
        measured / baseline
    } else {
        0.0
    }
}

fn risk_factor(risk: RiskLevel) -> f64 {
    match risk {
        RiskLevel::Critical => 10.0,
        RiskLevel::Warning => 4.0,
        RiskLevel::Info => 1.0,
    }
}

/// Économies journalières estimées à partir de la puissance observée
pub fn estimated_savings(stats: &HistoryStats) -> f64 {
    let mut savings = stats.avg_power.max(0.0) * SAVINGS_SHARE * HOURS_PER_DAY * ENERGY_PRICE_PER_KWH;
    if stats.unstable() {
        savings += stats.power_variance * VARIANCE_SAVINGS_FACTOR;
    }
    if stats.peaky() {
        savings += (stats.max_power - stats.avg_power) * PEAK_SHAVING_SHARE * ENERGY_PRICE_PER_KWH;
    }
    round2(savings)
}

#[async_trait]
impl DecisionCollaborator for RuleAdvisor {
    async fn decide(&self, context: &ContextBundle) -> Result<Value, DecisionError> {
        let (risk, action, root_cause, mut recommendation) = Self::assess(context);
        let stats = HistoryStats::from_context(context);
        let found = findings(&stats);
        let savings = estimated_savings(&stats);

        let mut reasoning = format!(
            "{} on {} ({}) after {:.1} h of runtime, {} readings of history considered, efficiency score {:.0}/100.",
            context.anomaly_kind,
            context.machine.name,
            context.machine.machine_type,
            context.reading.runtime_hours,
            context.history.len(),
            efficiency_score(&found)
        );
        if found.is_empty() {
            recommendation.push_str(" History otherwise within optimal parameters.");
        }
        for finding in &found {
            reasoning.push(' ');
            reasoning.push_str(&finding.note);
        }

        Ok(json!({
            "rootCause": root_cause,
            "riskLevel": risk,
            "actionTaken": action,
            "reasoning": reasoning,
            "estimatedSavings": savings,
            "preventedLoss": round2(savings * risk_factor(risk)),
            "humanRecommendation": recommendation,
        }))
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}
