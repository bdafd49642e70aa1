/**
 * AGGREGATOR - Fusion des sondes de télémétrie sécurité en snapshot cohérent
 *
 * RÔLE :
 * Lance toutes les sondes enregistrées en parallèle (une tâche par sonde),
 * attend le fan-in complet, fusionne les résultats en un snapshot unique et
 * calcule les métriques de risque dérivées (threat score, compteurs d'alertes).
 *
 * FONCTIONNEMENT :
 * - Exécution concurrente : la latence d'un cycle ≈ la sonde la plus lente,
 *   jamais la somme des timeouts
 * - Politique de fusion : une sonde en échec dégrade sa section vers la
 *   dernière valeur connue (marquée stale), jamais d'abandon de cycle
 * - Un cycle produit toujours exactement un snapshot avec toutes les clés
 *
 * UTILITÉ DANS VIGIL :
 * 🎯 Vue cohérente : les observateurs ne voient jamais d'état partiel
 * 🎯 Résilience : une sonde cassée ne casse jamais le tableau de bord
 * 🎯 Scoring déterministe : mêmes sections = même score, testable
 */

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::models::{Derived, ProbeResult, Section, Snapshot, ThreatLevel, PROBE_SECTIONS};
use crate::probe::{Probe, ProbeRunner, ProbeSpec};
use crate::store::SnapshotStore;

pub struct Aggregator {
    probes: Vec<(ProbeSpec, Arc<dyn Probe>)>,
    store: Arc<SnapshotStore>,
    sequence: AtomicU64,
}

impl Aggregator {
    pub fn new(probes: Vec<(ProbeSpec, Arc<dyn Probe>)>, store: Arc<SnapshotStore>) -> Self {
        Self { probes, store, sequence: AtomicU64::new(0) }
    }

    /// Un cycle complet : fan-out concurrent, fan-in, fusion, dérivation.
    /// Écrivain unique : les cycles sont strictement sérialisés par la boucle
    /// de scan, jamais chevauchés.
    pub async fn run_cycle(&self) -> Snapshot {
        let previous = self.store.latest();

        let mut handles = Vec::with_capacity(self.probes.len());
        for (spec, probe) in &self.probes {
            let spec = spec.clone();
            let probe = probe.clone();
            handles.push(tokio::spawn(async move {
                ProbeRunner::run(&spec, probe.as_ref()).await
            }));
        }

        let mut results: HashMap<String, ProbeResult> = HashMap::new();
        for handle in handles {
            match handle.await {
                Ok(result) => {
                    results.insert(result.probe_name.clone(), result);
                }
                Err(e) => eprintln!("[aggregator] probe task panicked: {e}"),
            }
        }

        let generated_at = OffsetDateTime::now_utc();
        let mut sections = BTreeMap::new();
        for (spec, _) in &self.probes {
            let section = merge_section(spec, results.get(&spec.name), previous.as_deref());
            sections.insert(spec.name.clone(), section);
        }

        let derived = compute_derived(&sections);
        insert_derived_sections(&mut sections, &derived, generated_at);

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let ok_count = results.values().filter(|r| r.ok).count();
        println!(
            "[aggregator] cycle {} merged: {} ok / {} degraded, threat {}",
            sequence,
            ok_count,
            self.probes.len() - ok_count,
            derived.threat_level.as_str()
        );

        Snapshot { sequence, generated_at, sections, derived }
    }
}

/// Fusionne le résultat d'une sonde dans sa section.
/// Échec = report de la dernière valeur connue (stale), sinon défaut explicite.
fn merge_section(
    spec: &ProbeSpec,
    result: Option<&ProbeResult>,
    previous: Option<&Snapshot>,
) -> Section {
    match result {
        Some(r) if r.ok => Section {
            data: r.payload.clone(),
            fetched_at: Some(r.fetched_at),
            stale: false,
            error: None,
        },
        other => {
            let error = other
                .and_then(|r| r.error.clone())
                .or_else(|| Some("probe task failed".into()));
            match previous.and_then(|p| p.sections.get(&spec.name)) {
                Some(prev) => Section {
                    data: prev.data.clone(),
                    fetched_at: prev.fetched_at, // timestamp du dernier succès
                    stale: true,
                    error,
                },
                None => Section {
                    data: spec.shape.empty_value(),
                    fetched_at: None,
                    stale: true,
                    error,
                },
            }
        }
    }
}

/// Somme pondérée des signaux bruts, bornée par facteur.
pub fn compute_threat_score(
    failed_logins: u32,
    suspicious_processes: u32,
    portscans: u32,
    recent_changes: u32,
) -> u32 {
    failed_logins.min(50)
        + suspicious_processes.min(3) * 10
        + portscans.min(6) * 5
        + recent_changes.min(10) * 2
}

/// Fonction pure des sections fusionnées : mêmes entrées, mêmes métriques.
pub fn compute_derived(sections: &BTreeMap<String, Section>) -> Derived {
    let failed_logins = section_len(sections, "failed_logins");
    let suspicious_processes = section_len(sections, "suspicious_processes");
    let portscans = section_len(sections, "portscans");
    let recent_changes = section_len(sections, "recent_changes");

    let threat_score =
        compute_threat_score(failed_logins, suspicious_processes, portscans, recent_changes);

    Derived {
        threat_level: ThreatLevel::from_score(threat_score),
        threat_score,
        total_alerts: suspicious_processes + portscans + recent_changes + failed_logins,
        critical_alerts: suspicious_processes,
        high_alerts: portscans,
        medium_alerts: recent_changes,
        low_alerts: failed_logins,
    }
}

fn section_len(sections: &BTreeMap<String, Section>, key: &str) -> u32 {
    sections
        .get(key)
        .map(|s| match &s.data {
            Value::Array(items) => items.len() as u32,
            _ => 0,
        })
        .unwrap_or(0)
}

/// Sections calculées (security_metrics, alert_summary, executive_summary),
/// toujours fraîches puisque dérivées du cycle courant.
fn insert_derived_sections(
    sections: &mut BTreeMap<String, Section>,
    derived: &Derived,
    generated_at: OffsetDateTime,
) {
    let probes_ok = PROBE_SECTIONS
        .iter()
        .filter(|name| sections.get(**name).map(|s| !s.stale).unwrap_or(false))
        .count();
    let probes_degraded = PROBE_SECTIONS.len() - probes_ok;
    let stale_sections: Vec<&str> = PROBE_SECTIONS
        .iter()
        .filter(|name| sections.get(**name).map(|s| s.stale).unwrap_or(true))
        .copied()
        .collect();

    let security_metrics = json!({
        "threat_score": derived.threat_score,
        "failed_logins": section_len(sections, "failed_logins"),
        "suspicious_processes": section_len(sections, "suspicious_processes"),
        "portscans": section_len(sections, "portscans"),
        "recent_changes": section_len(sections, "recent_changes"),
        "probes_ok": probes_ok,
        "probes_degraded": probes_degraded,
    });

    let alert_summary = json!({
        "total_alerts": derived.total_alerts,
        "critical": derived.critical_alerts,
        "high": derived.high_alerts,
        "medium": derived.medium_alerts,
        "low": derived.low_alerts,
    });

    let executive_summary = json!({
        "threat_level": derived.threat_level.as_str(),
        "threat_score": derived.threat_score,
        "headline": headline(derived.threat_level),
        "stale_sections": stale_sections,
        "generated_at": generated_at.format(&Rfc3339).unwrap_or_default(),
    });

    for (name, data) in [
        ("security_metrics", security_metrics),
        ("alert_summary", alert_summary),
        ("executive_summary", executive_summary),
    ] {
        sections.insert(
            name.to_string(),
            Section { data, fetched_at: Some(generated_at), stale: false, error: None },
        );
    }
}

fn headline(level: ThreatLevel) -> &'static str {
    match level {
        ThreatLevel::Low => "No significant threat activity detected",
        ThreatLevel::Medium => "Elevated activity, review recommended",
        ThreatLevel::High => "High threat activity, investigation required",
        ThreatLevel::Critical => "Critical threat activity, immediate response required",
    }
}
