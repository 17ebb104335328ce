/**
 * PROFILE TABLE - Valeurs nominales de télémétrie par type de machine
 *
 * Données pures : aucune logique hormis la résolution type -> profil.
 * Les types inconnus retombent sur le profil générique.
 * La config YAML peut surcharger ou ajouter des types (section `profiles`).
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineProfile {
    pub baseline_voltage: f64,
    pub baseline_current: f64,
    pub base_power: f64,
    pub base_temp: f64,
    pub base_vibration: f64,
    pub base_production_rate: f64,
}

impl Default for MachineProfile {
    fn default() -> Self {
        Self {
            baseline_voltage: 400.0,
            baseline_current: 18.0,
            base_power: 7.5,
            base_temp: 50.0,
            base_vibration: 2.0,
            base_production_rate: 30.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: HashMap<String, MachineProfile>,
    fallback: MachineProfile,
}

impl ProfileTable {
    /// Table intégrée des types connus de l'atelier
    pub fn builtin() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("CNC".to_string(), MachineProfile {
            baseline_voltage: 400.0,
            baseline_current: 24.0,
            base_power: 9.5,
            base_temp: 55.0,
            base_vibration: 2.5,
            base_production_rate: 40.0,
        });
        profiles.insert("PRESS".to_string(), MachineProfile {
            baseline_voltage: 400.0,
            baseline_current: 45.0,
            base_power: 18.0,
            base_temp: 60.0,
            base_vibration: 4.0,
            base_production_rate: 120.0,
        });
        profiles.insert("CONVEYOR".to_string(), MachineProfile {
            baseline_voltage: 230.0,
            baseline_current: 10.0,
            base_power: 2.2,
            base_temp: 38.0,
            base_vibration: 1.2,
            base_production_rate: 300.0,
        });
        profiles.insert("COMPRESSOR".to_string(), MachineProfile {
            baseline_voltage: 400.0,
            baseline_current: 32.0,
            base_power: 15.0,
            base_temp: 70.0,
            base_vibration: 3.5,
            base_production_rate: 0.0,
        });
        profiles.insert("ROBOT".to_string(), MachineProfile {
            baseline_voltage: 400.0,
            baseline_current: 12.0,
            base_power: 4.8,
            base_temp: 45.0,
            base_vibration: 1.5,
            base_production_rate: 60.0,
        });

        Self { profiles, fallback: MachineProfile::default() }
    }

    /// Table intégrée + surcharges issues de la config
    pub fn with_overrides(overrides: &HashMap<String, MachineProfile>) -> Self {
        let mut table = Self::builtin();
        for (machine_type, profile) in overrides {
            table.profiles.insert(normalize(machine_type), *profile);
        }
        table
    }

    pub fn profile_for(&self, machine_type: &str) -> &MachineProfile {
        self.profiles.get(&normalize(machine_type)).unwrap_or(&self.fallback)
    }

    pub fn entries(&self) -> &HashMap<String, MachineProfile> {
        &self.profiles
    }
}

fn normalize(machine_type: &str) -> String {
    machine_type.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = ProfileTable::builtin();
        assert_eq!(table.profile_for("cnc"), table.profile_for("CNC"));
        assert_eq!(table.profile_for(" press ").base_power, 18.0);
    }

    #[test]
    fn test_unknown_type_uses_fallback() {
        let table = ProfileTable::builtin();
        assert_eq!(*table.profile_for("LATHE"), MachineProfile::default());
    }

    #[test]
    fn test_overrides_replace_and_extend() {
        let mut overrides = HashMap::new();
        overrides.insert("cnc".to_string(), MachineProfile { base_power: 11.0, ..MachineProfile::default() });
        overrides.insert("lathe".to_string(), MachineProfile { base_temp: 42.0, ..MachineProfile::default() });

        let table = ProfileTable::with_overrides(&overrides);
        assert_eq!(table.profile_for("CNC").base_power, 11.0);
        assert_eq!(table.profile_for("LATHE").base_temp, 42.0);
        assert_eq!(table.profile_for("ROBOT").base_power, 4.8);
    }
}
