use chrono::NaiveDateTime;
use ntrip_common::{
    LastSeen, PortAssignments, StationCode, StationMetadata, StationMetadataMap, StationStatus,
};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use tracing::{info, warn};

/// Port-role rules and operator overrides
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Ports below this are single-site (primary) candidates
    pub network_threshold: u16,
    pub network_range: RangeInclusive<u16>,
    /// Operator-asserted primary ports; applying one forces Online
    pub overrides: BTreeMap<StationCode, u16>,
    /// Blacklisted codes are dropped from the output entirely
    pub excluded: BTreeSet<StationCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    WentOffline,
    CameOnline,
}

/// A status change between the stored state and this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub code: StationCode,
    pub kind: TransitionKind,
    /// Last time the station was seen, as of this run
    pub last_seen: LastSeen,
    /// Whether the reference source (site catalog or site API) lists the station
    pub in_catalog: bool,
}

/// Output of one reconciliation run
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub stations: StationMetadataMap,
    pub transitions: Vec<StatusTransition>,
}

impl Reconciliation {
    /// Stations with a resolved primary port, for the GIS tooling.
    pub fn port_assignments(&self) -> PortAssignments {
        port_assignments(&self.stations)
    }

    pub fn online_count(&self) -> usize {
        self.stations.values().filter(|m| m.is_online()).count()
    }
}

pub fn port_assignments(stations: &StationMetadataMap) -> PortAssignments {
    stations
        .iter()
        .filter_map(|(code, meta)| meta.port.map(|port| (code.clone(), port)))
        .collect()
}

pub struct MetadataReconciler {
    policy: ReconcilePolicy,
}

impl MetadataReconciler {
    pub fn new(policy: ReconcilePolicy) -> Self {
        Self { policy }
    }

    /// Merge discovery with prior state for every station in
    /// `known ∪ active ∪ prior ∪ overrides`, minus excluded codes.
    ///
    /// `observed_ports` sets iterate ascending, which makes "first port below
    /// the threshold" the lowest scanned single-site port.
    pub fn reconcile(
        &self,
        active: &BTreeSet<StationCode>,
        observed_ports: &BTreeMap<StationCode, BTreeSet<u16>>,
        known: &BTreeSet<StationCode>,
        prior: &StationMetadataMap,
        now: NaiveDateTime,
    ) -> Reconciliation {
        let codes: BTreeSet<&StationCode> = known
            .iter()
            .chain(active.iter())
            .chain(prior.keys())
            .chain(self.policy.overrides.keys())
            .filter(|code| !self.policy.excluded.contains(*code))
            .collect();

        let empty = BTreeSet::new();
        let mut result = Reconciliation::default();

        for code in codes {
            let observed = observed_ports.get(code).unwrap_or(&empty);
            let previous = prior.get(code);
            let seen = active.contains(code);

            let mut status = if seen {
                StationStatus::Online
            } else {
                StationStatus::Offline
            };

            let mut port = observed
                .iter()
                .copied()
                .find(|p| *p < self.policy.network_threshold);

            if let Some(&forced) = self.policy.overrides.get(code) {
                port = Some(forced);
                status = StationStatus::Online;
            }

            let mut network_port = observed
                .iter()
                .copied()
                .find(|p| self.policy.network_range.contains(p));

            let last_seen = if seen {
                LastSeen::at(now)
            } else {
                previous.map(|p| p.last_seen.clone()).unwrap_or_default()
            };

            // transient misses must not erase long-lived assignments
            if status == StationStatus::Offline && observed.is_empty() {
                if let Some(previous) = previous {
                    port = port.or(previous.port);
                    network_port = network_port.or(previous.network_port);
                }
            }

            let data_verified = match status {
                StationStatus::Online => previous.and_then(|p| p.data_verified),
                StationStatus::Offline => None,
            };

            if let Some(kind) = transition(previous.map(|p| p.status), status) {
                let event = StatusTransition {
                    code: code.clone(),
                    kind,
                    last_seen: last_seen.clone(),
                    in_catalog: known.contains(code),
                };
                log_transition(&event);
                result.transitions.push(event);
            }

            result.stations.insert(
                code.clone(),
                StationMetadata {
                    status,
                    port,
                    network_port,
                    last_seen,
                    data_verified,
                },
            );
        }

        info!(
            "Reconciled {} stations ({} online, {} transitions)",
            result.stations.len(),
            result.online_count(),
            result.transitions.len()
        );
        result
    }
}

/// Apply an external per-site liveness verdict (`code -> online`) to stored
/// metadata. Ports are always preserved; stations the source does not know
/// about go Offline if they were Online.
pub fn apply_site_status(
    prior: &StationMetadataMap,
    site_online: &BTreeMap<StationCode, bool>,
    now: NaiveDateTime,
) -> Reconciliation {
    let mut result = Reconciliation::default();

    for (code, previous) in prior {
        let mut meta = previous.clone();
        match site_online.get(code) {
            Some(true) => {
                meta.status = StationStatus::Online;
                meta.last_seen = LastSeen::at(now);
            }
            Some(false) => meta.status = StationStatus::Offline,
            None => {
                if previous.is_online() {
                    warn!("Station {} not reported by site API; marking Offline", code);
                }
                meta.status = StationStatus::Offline;
            }
        }
        if !meta.is_online() {
            meta.data_verified = None;
        }

        if let Some(kind) = transition(Some(previous.status), meta.status) {
            let event = StatusTransition {
                code: code.clone(),
                kind,
                last_seen: meta.last_seen.clone(),
                in_catalog: site_online.contains_key(code),
            };
            log_transition(&event);
            result.transitions.push(event);
        }

        result.stations.insert(code.clone(), meta);
    }

    info!(
        "Applied site status to {} stations ({} online)",
        result.stations.len(),
        result.online_count()
    );
    result
}

fn transition(previous: Option<StationStatus>, current: StationStatus) -> Option<TransitionKind> {
    match (previous, current) {
        (Some(StationStatus::Online), StationStatus::Offline) => Some(TransitionKind::WentOffline),
        (Some(StationStatus::Offline), StationStatus::Online) => Some(TransitionKind::CameOnline),
        _ => None,
    }
}

fn log_transition(event: &StatusTransition) {
    match event.kind {
        TransitionKind::WentOffline => warn!(
            "Station {} went OFFLINE (last seen {}{})",
            event.code,
            event.last_seen,
            if event.in_catalog { "" } else { ", not in catalog" }
        ),
        TransitionKind::CameOnline => info!("Station {} is back ONLINE", event.code),
    }
}
