/**
 * ANOMALY STATE STORE - Dégradation persistante par machine
 *
 * Arena indexée par machine_id, possédée par le scheduler (unique écrivain).
 * Les compteurs ne font que croître jusqu'à leur plafond : une machine qui
 * chauffe reste chaude jusqu'à intervention. Rien n'est persisté, l'état
 * disparaît au redémarrage du process.
 */

use std::collections::HashMap;

pub const HEAT_TREND_CAP: u32 = 50;
pub const VIBRATION_TREND_CAP: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnomalyState {
    pub heat_trend: u32,
    pub vibration_trend: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct MachineTrack {
    anomaly: AnomalyState,
    runtime_hours: f64,
}

#[derive(Debug, Default)]
pub struct AnomalyStateStore {
    entries: HashMap<String, MachineTrack>,
}

impl AnomalyStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crée l'entrée {0,0} à la première référence
    pub fn get(&mut self, machine_id: &str) -> AnomalyState {
        self.track(machine_id).anomaly
    }

    pub fn advance_heat(&mut self, machine_id: &str) {
        let state = &mut self.track(machine_id).anomaly;
        if state.heat_trend < HEAT_TREND_CAP {
            state.heat_trend += 1;
        }
    }

    pub fn advance_vibration(&mut self, machine_id: &str) {
        let state = &mut self.track(machine_id).anomaly;
        if state.vibration_trend < VIBRATION_TREND_CAP {
            state.vibration_trend += 1;
        }
    }

    /// Cumule le temps de marche simulé, retourne le total
    pub fn advance_runtime(&mut self, machine_id: &str, hours: f64) -> f64 {
        let track = self.track(machine_id);
        track.runtime_hours += hours.max(0.0);
        track.runtime_hours
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn track(&mut self, machine_id: &str) -> &mut MachineTrack {
        self.entries.entry(machine_id.to_string()).or_default()
    }
}
