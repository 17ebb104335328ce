use crate::models::{AnomalyKind, TelemetryReading};
use crate::profiles::MachineProfile;

pub const LOAD_SPIKE_RATIO: f64 = 1.5;
pub const OVERHEAT_RATIO: f64 = 1.3;
pub const VIBRATION_RATIO: f64 = 1.5;

/// Seuils ordonnés, le premier qui matche gagne.
/// Un pic de charge masque une température élevée de même origine.
pub fn classify(reading: &TelemetryReading, profile: &MachineProfile) -> AnomalyKind {
    if reading.power > profile.base_power * LOAD_SPIKE_RATIO {
        AnomalyKind::LoadSpike
    } else if reading.temperature > profile.base_temp * OVERHEAT_RATIO {
        AnomalyKind::Overheat
    } else if reading.vibration > profile.base_vibration * VIBRATION_RATIO {
        AnomalyKind::PredictiveVibration
    } else {
        AnomalyKind::None
    }
}
