/**
 * CONFIG - Chargement de kernel.yaml
 *
 * Fichier : $NEXOVA_KERNEL_CONFIG ou ./kernel.yaml
 * Fichier absent ou invalide -> config par défaut (flotte de démo), avec warning.
 * Chaque section est optionnelle et complétée par ses valeurs par défaut.
 *
 * Surcharges env : NEXOVA_DECISION_URL (passe en mode remote), NEXOVA_DECISION_TOKEN
 */

use crate::generator::OnsetProbabilities;
use crate::models::{Machine, MachineStatus};
use crate::profiles::MachineProfile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub server: ServerConf,
    pub simulation: SimulationConf,
    pub hub: HubConf,
    pub decision: DecisionConf,
    pub storage: StorageConf,
    pub mqtt: Option<MqttConf>,
    pub machines: Vec<Machine>,
    pub profiles: HashMap<String, MachineProfile>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConf {
    pub bind: String,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SimulationConf {
    pub tick_interval_ms: u64,
    pub seed: Option<u64>,
    pub heat_probability: f64,
    pub vibration_probability: f64,
    pub power_spike_probability: f64,
}

impl Default for SimulationConf {
    fn default() -> Self {
        let p = OnsetProbabilities::default();
        Self {
            tick_interval_ms: 2000,
            seed: None,
            heat_probability: p.heat,
            vibration_probability: p.vibration,
            power_spike_probability: p.power_spike,
        }
    }
}

impl SimulationConf {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn probabilities(&self) -> OnsetProbabilities {
        OnsetProbabilities {
            heat: self.heat_probability,
            vibration: self.vibration_probability,
            power_spike: self.power_spike_probability,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HubConf {
    pub heartbeat_seconds: u64,
    pub outbound_buffer: usize,
    pub health_log_seconds: u64,
}

impl Default for HubConf {
    fn default() -> Self {
        Self { heartbeat_seconds: 30, outbound_buffer: 64, health_log_seconds: 60 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    #[default]
    Rules,
    Remote,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DecisionConf {
    pub mode: DecisionMode,
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub history_limit: usize,
    pub max_in_flight: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for DecisionConf {
    fn default() -> Self {
        Self {
            mode: DecisionMode::Rules,
            endpoint: None,
            token: None,
            timeout_ms: 10_000,
            history_limit: 20,
            max_in_flight: 32,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl DecisionConf {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConf {
    pub data_dir: Option<String>,
    pub history_capacity: usize,
}

impl Default for StorageConf {
    fn default() -> Self {
        Self { data_dir: Some("./data".into()), history_capacity: 200 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_client_id() -> String {
    "nexova-kernel".into()
}

fn default_topic_prefix() -> String {
    "nexova/telemetry".into()
}

fn demo_fleet() -> Vec<Machine> {
    [
        ("cnc-01", "CNC Mill 01", "CNC"),
        ("cnc-02", "CNC Lathe 02", "CNC"),
        ("press-01", "Hydraulic Press 01", "PRESS"),
        ("conveyor-01", "Line Conveyor 01", "CONVEYOR"),
        ("compressor-01", "Air Compressor 01", "COMPRESSOR"),
        ("robot-01", "Welding Robot 01", "ROBOT"),
    ]
    .into_iter()
    .map(|(id, name, machine_type)| Machine {
        id: id.into(),
        name: name.into(),
        machine_type: machine_type.into(),
        status: MachineStatus::Online,
    })
    .collect()
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            server: ServerConf::default(),
            simulation: SimulationConf::default(),
            hub: HubConf::default(),
            decision: DecisionConf::default(),
            storage: StorageConf::default(),
            mqtt: None,
            machines: demo_fleet(),
            profiles: HashMap::new(),
        }
    }
}

impl KernelConfig {
    /// Variables d'environnement prioritaires sur le fichier
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("NEXOVA_DECISION_URL") {
            if !url.trim().is_empty() {
                self.decision.endpoint = Some(url);
                self.decision.mode = DecisionMode::Remote;
            }
        }
        if let Ok(token) = std::env::var("NEXOVA_DECISION_TOKEN") {
            if !token.trim().is_empty() {
                self.decision.token = Some(token);
            }
        }
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("NEXOVA_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        match fs::read_to_string(&path).await {
            Ok(txt) => parse_config(&txt).unwrap_or_else(|e| {
                warn!(path = %path, error = %e, "invalid config, using defaults");
                KernelConfig::default()
            }),
            Err(e) => {
                warn!(path = %path, error = %e, "unreadable config, using defaults");
                KernelConfig::default()
            }
        }
    } else {
        info!(path = %path, "no config file, using defaults");
        KernelConfig::default()
    };
    cfg.apply_env_overrides();
    cfg
}
