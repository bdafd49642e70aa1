use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Sections alimentées chacune par une sonde dédiée (contrat stable avec la
/// couche de présentation).
pub const PROBE_SECTIONS: [&str; 14] = [
    "login_summary",
    "failed_logins",
    "top_attackers",
    "portscans",
    "open_ports",
    "connection_stats",
    "suspicious_processes",
    "top_processes",
    "process_summary",
    "file_integrity",
    "recent_changes",
    "ip_geolocation",
    "attack_by_country",
    "threat_map",
];

/// Sections calculées par l'aggregator à partir des sections sondes.
pub const DERIVED_SECTIONS: [&str; 3] = ["security_metrics", "alert_summary", "executive_summary"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Seuils : LOW < 30, MEDIUM 30–49, HIGH 50–69, CRITICAL >= 70.
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=29 => ThreatLevel::Low,
            30..=49 => ThreatLevel::Medium,
            50..=69 => ThreatLevel::High,
            _ => ThreatLevel::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "LOW",
            ThreatLevel::Medium => "MEDIUM",
            ThreatLevel::High => "HIGH",
            ThreatLevel::Critical => "CRITICAL",
        }
    }
}

/// Métriques de risque dérivées, recalculées à chaque cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derived {
    pub threat_level: ThreatLevel,
    pub threat_score: u32,
    pub total_alerts: u32,
    pub critical_alerts: u32,
    pub high_alerts: u32,
    pub medium_alerts: u32,
    pub low_alerts: u32,
}

/// Une section fusionnée du snapshot. Quand la sonde échoue, `data` garde la
/// dernière valeur connue, `stale` passe à true et `fetched_at` reste celui
/// du dernier succès.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub data: Value,
    #[serde(with = "time::serde::rfc3339::option")]
    pub fetched_at: Option<OffsetDateTime>,
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Vue immuable d'un cycle complet : toutes les sections + métriques dérivées.
/// Jamais mutée après publication (partagée en Arc).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub sections: BTreeMap<String, Section>,
    pub derived: Derived,
}

/// Résultat normalisé d'une invocation de sonde, produit par le ProbeRunner.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub probe_name: String,
    pub fetched_at: OffsetDateTime,
    pub ok: bool,
    pub payload: Value,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireKind {
    Connection,
    Update,
    LiveUpdate,
}

/// Message poussé aux abonnés : discriminateur de type + timestamp + payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: WireKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub data: Value,
}

impl WireMessage {
    pub fn connection(subscriber_id: Uuid) -> Self {
        Self {
            kind: WireKind::Connection,
            timestamp: OffsetDateTime::now_utc(),
            data: serde_json::json!({
                "subscriber_id": subscriber_id.to_string(),
                "status": "connected",
            }),
        }
    }

    pub fn update(snapshot: &Snapshot) -> Self {
        Self::with_snapshot(WireKind::Update, snapshot)
    }

    pub fn live_update(snapshot: &Snapshot) -> Self {
        Self::with_snapshot(WireKind::LiveUpdate, snapshot)
    }

    fn with_snapshot(kind: WireKind, snapshot: &Snapshot) -> Self {
        Self {
            kind,
            timestamp: OffsetDateTime::now_utc(),
            data: serde_json::to_value(snapshot).unwrap_or(Value::Null),
        }
    }
}
