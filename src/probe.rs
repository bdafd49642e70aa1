//! Probe invocation for the vigil kernel
//!
//! Runs one external probe under a hard timeout with retry/backoff:
//! - Probe trait = the external capability seam (named JSON record on demand)
//! - CommandProbe = shell-invoked probe, stdout parsed as JSON
//! - ProbeRunner = normalizes every outcome (success, timeout, crash,
//!   malformed output) into a ProbeResult, never blocks past the bound

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::process::Command;

use crate::models::ProbeResult;

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;

/// Capacité externe : produit un enregistrement JSON pour une section donnée.
pub trait Probe: Send + Sync {
    fn invoke(&self) -> ProbeFuture<'_>;
}

/// Forme structurelle minimale attendue pour le payload d'une section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionShape {
    Object,
    Array,
}

impl SectionShape {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            SectionShape::Object => value.is_object(),
            SectionShape::Array => value.is_array(),
        }
    }

    /// Valeur par défaut explicite quand aucune donnée n'a jamais été reçue.
    pub fn empty_value(&self) -> Value {
        match self {
            SectionShape::Object => Value::Object(Default::default()),
            SectionShape::Array => Value::Array(Vec::new()),
        }
    }

    pub fn for_section(name: &str) -> Self {
        match name {
            "failed_logins" | "top_attackers" | "portscans" | "open_ports"
            | "suspicious_processes" | "top_processes" | "recent_changes"
            | "attack_by_country" => SectionShape::Array,
            _ => SectionShape::Object,
        }
    }
}

/// Spécification immuable d'une sonde, enregistrée au démarrage.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub name: String,
    pub command: String,
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
    pub shape: SectionShape,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("timeout")]
    Timeout,
    #[error("invocation failed: {0}")]
    Invocation(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Sonde invoquée comme commande externe (la ligne est découpée avec
/// shell-words). stdout doit être du JSON; exit != 0 = échec d'invocation.
pub struct CommandProbe {
    command: String,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

impl Probe for CommandProbe {
    fn invoke(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            let parts = shell_words::split(&self.command)
                .map_err(|e| anyhow!("bad probe command: {e}"))?;
            let (bin, args) = parts
                .split_first()
                .ok_or_else(|| anyhow!("empty probe command"))?;

            // kill_on_drop : une invocation abandonnée (timeout) ne survit pas
            let output = Command::new(bin)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(anyhow!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ));
            }

            let value: Value = serde_json::from_slice(&output.stdout)?;
            Ok(value)
        })
    }
}

pub struct ProbeRunner;

impl ProbeRunner {
    /// Exécute une sonde sous timeout avec retry/backoff.
    ///
    /// Timeout = retour immédiat ok=false (le résultat éventuel est
    /// abandonné, jamais d'attente au-delà de la borne). Les autres échecs
    /// (invocation, payload difforme) sont retentés jusqu'à `spec.retries`
    /// fois; le premier succès court-circuite.
    pub async fn run(spec: &ProbeSpec, probe: &dyn Probe) -> ProbeResult {
        let mut last_error = ProbeError::Invocation("probe never ran".into());

        for attempt in 0..=spec.retries {
            if attempt > 0 {
                tokio::time::sleep(spec.backoff).await;
            }

            match tokio::time::timeout(spec.timeout, probe.invoke()).await {
                Err(_) => {
                    eprintln!("[probe] {} timed out after {:?}", spec.name, spec.timeout);
                    return Self::failure(spec, ProbeError::Timeout);
                }
                Ok(Err(e)) => {
                    eprintln!("[probe] {} attempt {} failed: {e}", spec.name, attempt + 1);
                    last_error = ProbeError::Invocation(e.to_string());
                }
                Ok(Ok(payload)) => {
                    if spec.shape.matches(&payload) {
                        return ProbeResult {
                            probe_name: spec.name.clone(),
                            fetched_at: OffsetDateTime::now_utc(),
                            ok: true,
                            payload,
                            error: None,
                        };
                    }
                    // Un payload difforme n'est jamais propagé comme valide
                    eprintln!(
                        "[probe] {} attempt {} returned unexpected shape",
                        spec.name,
                        attempt + 1
                    );
                    last_error =
                        ProbeError::MalformedPayload(format!("expected {:?}", spec.shape));
                }
            }
        }

        Self::failure(spec, last_error)
    }

    fn failure(spec: &ProbeSpec, error: ProbeError) -> ProbeResult {
        ProbeResult {
            probe_name: spec.name.clone(),
            fetched_at: OffsetDateTime::now_utc(),
            ok: false,
            payload: Value::Null,
            error: Some(error.to_string()),
        }
    }
}
