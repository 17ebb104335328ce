/**
 * TELEMETRY GENERATOR - Synthèse des lectures capteurs
 *
 * FONCTIONNEMENT :
 * - bruit multiplicatif uniforme ±5% sur chaque valeur nominale
 * - tirages indépendants d'apparition d'anomalie (chauffe, vibration, pic de charge)
 * - un tirage gagnant OU un compteur déjà non nul fait avancer la tendance
 * - multiplicateurs dérivés des compteurs, production dégradée (plancher 10%)
 * - toutes les sorties arrondies à 2 décimales
 *
 * Le RNG est injecté (StdRng seedable) : reproductible en test.
 */

use crate::anomaly_state::{AnomalyState, AnomalyStateStore};
use crate::models::{Machine, TelemetryReading};
use crate::profiles::MachineProfile;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use time::OffsetDateTime;

const NOISE_AMPLITUDE: f64 = 0.05;
const HEAT_STEP: f64 = 0.05;
const VIBRATION_STEP: f64 = 0.02;
const SPIKE_MIN: f64 = 1.6;
const SPIKE_MAX: f64 = 2.6;
const EFFICIENCY_FLOOR: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnsetProbabilities {
    pub heat: f64,
    pub vibration: f64,
    pub power_spike: f64,
}

impl Default for OnsetProbabilities {
    fn default() -> Self {
        Self { heat: 0.02, vibration: 0.02, power_spike: 0.03 }
    }
}

/// Résultat des tirages d'un tick pour une machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnsetRolls {
    pub heat: bool,
    pub vibration: bool,
    /// Multiplicateur de pic, valable pour ce tick uniquement
    pub power_spike: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Multipliers {
    pub temperature: f64,
    pub vibration: f64,
    pub power: f64,
}

impl Multipliers {
    pub fn from_state(state: &AnomalyState, power_spike: Option<f64>) -> Self {
        Self {
            temperature: 1.0 + state.heat_trend as f64 * HEAT_STEP,
            vibration: 1.0 + state.vibration_trend as f64 * VIBRATION_STEP,
            power: power_spike.unwrap_or(1.0),
        }
    }

    pub fn efficiency(&self) -> f64 {
        (1.0 - (self.temperature - 1.0) - (self.vibration - 1.0)).max(EFFICIENCY_FLOOR)
    }
}

pub struct TelemetryGenerator {
    rng: StdRng,
    probabilities: OnsetProbabilities,
}

impl TelemetryGenerator {
    pub fn new(rng: StdRng, probabilities: OnsetProbabilities) -> Self {
        Self { rng, probabilities }
    }

    pub fn seeded(seed: u64, probabilities: OnsetProbabilities) -> Self {
        Self::new(StdRng::seed_from_u64(seed), probabilities)
    }

    pub fn from_entropy(probabilities: OnsetProbabilities) -> Self {
        Self::new(StdRng::from_entropy(), probabilities)
    }

    pub fn roll(&mut self) -> OnsetRolls {
        let heat = self.rng.gen_bool(clamp_probability(self.probabilities.heat));
        let vibration = self.rng.gen_bool(clamp_probability(self.probabilities.vibration));
        let power_spike = self
            .rng
            .gen_bool(clamp_probability(self.probabilities.power_spike))
            .then(|| self.rng.gen_range(SPIKE_MIN..=SPIKE_MAX));
        OnsetRolls { heat, vibration, power_spike }
    }

    /// Génère la lecture d'un tick et fait avancer l'état de dégradation
    pub fn generate(
        &mut self,
        machine: &Machine,
        profile: &MachineProfile,
        states: &mut AnomalyStateStore,
        tick_hours: f64,
        at: OffsetDateTime,
    ) -> TelemetryReading {
        let rolls = self.roll();
        let before = states.get(&machine.id);

        if rolls.heat || before.heat_trend > 0 {
            states.advance_heat(&machine.id);
        }
        if rolls.vibration || before.vibration_trend > 0 {
            states.advance_vibration(&machine.id);
        }
        let runtime_hours = states.advance_runtime(&machine.id, tick_hours);
        let state = states.get(&machine.id);

        self.synthesize(machine, profile, &state, rolls.power_spike, runtime_hours, at)
    }

    /// Applique bruit + multiplicateurs à un état donné (ne modifie pas l'état)
    pub fn synthesize(
        &mut self,
        machine: &Machine,
        profile: &MachineProfile,
        state: &AnomalyState,
        power_spike: Option<f64>,
        runtime_hours: f64,
        at: OffsetDateTime,
    ) -> TelemetryReading {
        let m = Multipliers::from_state(state, power_spike);

        let voltage = self.noisy(profile.baseline_voltage);
        let current = self.noisy(profile.baseline_current) * m.power;
        let power = self.noisy(profile.base_power) * m.power;
        let temperature = self.noisy(profile.base_temp) * m.temperature;
        let vibration = self.noisy(profile.base_vibration) * m.vibration;
        let production = self.noisy(profile.base_production_rate) * m.efficiency();

        TelemetryReading {
            machine_id: machine.id.clone(),
            timestamp: at,
            voltage: round2(voltage),
            current: round2(current),
            power: round2(power),
            temperature: round2(temperature),
            vibration: round2(vibration),
            production: round2(production),
            runtime_hours: round2(runtime_hours),
        }
    }

    fn noisy(&mut self, baseline: f64) -> f64 {
        baseline * self.rng.gen_range((1.0 - NOISE_AMPLITUDE)..=(1.0 + NOISE_AMPLITUDE))
    }
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
