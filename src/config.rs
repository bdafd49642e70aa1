use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::models::PROBE_SECTIONS;
use crate::probe::{ProbeSpec, SectionShape};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub scan: ScanConf,
    pub store: StoreConf,
    pub broadcast: BroadcastConf,
    /// Overrides par section; toute section sonde absente utilise les défauts.
    pub probes: BTreeMap<String, ProbeConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind_port: u16,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind_port: 8080 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ScanConf {
    pub interval_seconds: u64,
    pub auto_start: bool,
}

impl Default for ScanConf {
    fn default() -> Self {
        Self { interval_seconds: 10, auto_start: true }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub history_size: usize,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { history_size: 20 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BroadcastConf {
    pub queue_capacity: usize,
    /// Débordements consécutifs tolérés avant désabonnement forcé.
    pub overflow_strikes: u32,
}

impl Default for BroadcastConf {
    fn default() -> Self {
        Self { queue_capacity: 8, overflow_strikes: 12 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProbeConf {
    pub command: Option<String>,
    pub timeout_seconds: u64,
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for ProbeConf {
    fn default() -> Self {
        Self { command: None, timeout_seconds: 5, retries: 1, backoff_ms: 500 }
    }
}

impl KernelConfig {
    /// Construit la spec de chaque sonde enregistrée (une par section sonde).
    pub fn probe_specs(&self) -> Vec<ProbeSpec> {
        PROBE_SECTIONS
            .iter()
            .map(|name| {
                let conf = self.probes.get(*name).cloned().unwrap_or_default();
                ProbeSpec {
                    name: name.to_string(),
                    command: conf
                        .command
                        .unwrap_or_else(|| format!("./probes/{name}.sh")),
                    timeout: Duration::from_secs(conf.timeout_seconds),
                    retries: conf.retries,
                    backoff: Duration::from_millis(conf.backoff_ms),
                    shape: SectionShape::for_section(name),
                }
            })
            .collect()
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("VIGIL_KERNEL_CONFIG").unwrap_or_else(|_| "vigil.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            eprintln!("[kernel] config invalide: {e}");
            KernelConfig::default()
        })
    } else {
        eprintln!("[kernel] pas de vigil.yaml, usage config par défaut");
        KernelConfig::default()
    }
}
