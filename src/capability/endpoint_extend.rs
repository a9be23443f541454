//! External and backup endpoint addresses for selector-less Services
//!
//! The `endpoint-extend` label on a Service and its Endpoints picks one of
//! two modes. External IP appends a subset built from the `externalIP` and
//! `externalPort` labels. Backup IP strips the `backupIP` addresses from the
//! live subsets unless the live addresses already are exactly the backup set,
//! which means a failover has promoted them.

use std::collections::BTreeMap;

use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service};
use tracing::{debug, warn};

use super::{ip_list, lookup, port_list};
use crate::config::EmptiedSubsetPolicy;
use crate::patch::{pointer, remove, replace, ArrayField};
use crate::webhook::{to_value, AdmissionError, Source};

/// Label selecting the endpoint extension mode
pub const ENDPOINT_EXTEND_LABEL: &str = "endpoint-extend";

/// `endpoint-extend` values enabling external-IP mode
pub const EXTERNAL_IP_VALUES: [&str; 2] = ["external-ip-enabled", "endpoint-external-ip"];

/// `endpoint-extend` values enabling backup-IP mode
pub const BACKUP_IP_VALUES: [&str; 2] = ["backup-ip-enabled", "endpoint-backup-ip"];

/// Hyphen-joined external addresses
pub const EXTERNAL_IP_LABEL: &str = "externalIP";

/// Hyphen-joined external ports
pub const EXTERNAL_PORT_LABEL: &str = "externalPort";

/// Hyphen-joined disaster-recovery addresses
pub const BACKUP_IP_LABEL: &str = "backupIP";

/// Mode selected by the `endpoint-extend` label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendMode {
    /// Append a subset of external addresses
    ExternalIp,
    /// Remove backup addresses from live subsets
    BackupIp,
}

impl ExtendMode {
    /// Mode for an object's labels, `None` when the capability is inactive
    pub fn from_labels(labels: Option<&BTreeMap<String, String>>) -> Option<Self> {
        let value = lookup(labels, ENDPOINT_EXTEND_LABEL)?;
        if EXTERNAL_IP_VALUES.contains(&value) {
            Some(Self::ExternalIp)
        } else if BACKUP_IP_VALUES.contains(&value) {
            Some(Self::BackupIp)
        } else {
            None
        }
    }
}

/// Patch an Endpoints object according to its `endpoint-extend` mode
pub fn mutate(
    endpoints: &Endpoints,
    policy: EmptiedSubsetPolicy,
) -> Result<Vec<PatchOperation>, AdmissionError> {
    let labels = endpoints.metadata.labels.as_ref();
    match ExtendMode::from_labels(labels) {
        None => Ok(Vec::new()),
        Some(ExtendMode::ExternalIp) => append_external_subset(endpoints, labels),
        Some(ExtendMode::BackupIp) => strip_backup_addresses(endpoints, labels, policy),
    }
}

/// Gate a Service on the labels its Endpoints mutation will need
pub fn validate(service: &Service) -> Result<(), AdmissionError> {
    let labels = service.metadata.labels.as_ref();
    match ExtendMode::from_labels(labels) {
        None => {}
        Some(ExtendMode::ExternalIp) => {
            ip_list(labels, EXTERNAL_IP_LABEL, Source::Label)?;
            port_list(labels, EXTERNAL_PORT_LABEL, Source::Label)?;
        }
        Some(ExtendMode::BackupIp) => {
            ip_list(labels, BACKUP_IP_LABEL, Source::Label)?;
        }
    }
    Ok(())
}

/// Subset with the given addresses and ports named by position
pub fn external_subset(ips: &[String], ports: &[i32]) -> EndpointSubset {
    EndpointSubset {
        addresses: Some(
            ips.iter()
                .map(|ip| EndpointAddress {
                    ip: ip.clone(),
                    ..Default::default()
                })
                .collect(),
        ),
        ports: Some(
            ports
                .iter()
                .enumerate()
                .map(|(index, port)| EndpointPort {
                    name: Some(index.to_string()),
                    port: *port,
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}

fn append_external_subset(
    endpoints: &Endpoints,
    labels: Option<&BTreeMap<String, String>>,
) -> Result<Vec<PatchOperation>, AdmissionError> {
    let ips = ip_list(labels, EXTERNAL_IP_LABEL, Source::Label)?;
    let ports = port_list(labels, EXTERNAL_PORT_LABEL, Source::Label)?;

    let subsets = endpoints.subsets.as_ref();
    if subsets
        .into_iter()
        .flatten()
        .any(|existing| carries(existing, &ips, &ports))
    {
        debug!(
            endpoints = ?endpoints.metadata.name,
            "External subset already present"
        );
        return Ok(Vec::new());
    }

    let subset = external_subset(&ips, &ports);
    let mut field = ArrayField::of(pointer(["subsets"]), subsets);
    Ok(vec![field.push(to_value(&subset)?)])
}

/// True when `existing` has exactly these addresses and positionally named
/// ports. Fields the API server defaults (protocol) are not compared.
fn carries(existing: &EndpointSubset, ips: &[String], ports: &[i32]) -> bool {
    let addresses: Vec<&str> = existing
        .addresses
        .iter()
        .flatten()
        .map(|a| a.ip.as_str())
        .collect();
    let existing_ports: Vec<(Option<&str>, i32)> = existing
        .ports
        .iter()
        .flatten()
        .map(|p| (p.name.as_deref(), p.port))
        .collect();
    let names: Vec<String> = (0..ports.len()).map(|i| i.to_string()).collect();
    let wanted_ports: Vec<(Option<&str>, i32)> = names
        .iter()
        .map(|n| Some(n.as_str()))
        .zip(ports.iter().copied())
        .collect();

    addresses == ips && existing_ports == wanted_ports
}

fn strip_backup_addresses(
    endpoints: &Endpoints,
    labels: Option<&BTreeMap<String, String>>,
    policy: EmptiedSubsetPolicy,
) -> Result<Vec<PatchOperation>, AdmissionError> {
    let backup = ip_list(labels, BACKUP_IP_LABEL, Source::Label)?;
    let Some(subsets) = endpoints.subsets.as_ref() else {
        return Ok(Vec::new());
    };

    let observed: Vec<&str> = subsets
        .iter()
        .flat_map(|s| s.addresses.iter().flatten())
        .map(|a| a.ip.as_str())
        .collect();
    if same_multiset(&observed, &backup) {
        debug!(
            endpoints = ?endpoints.metadata.name,
            "Live addresses already are the backup set"
        );
        return Ok(Vec::new());
    }

    let field = ArrayField::of(pointer(["subsets"]), Some(subsets));
    let mut ops = Vec::new();
    let mut emptied = Vec::new();

    for (index, subset) in subsets.iter().enumerate() {
        let Some(addresses) = subset.addresses.as_ref().filter(|a| !a.is_empty()) else {
            continue;
        };
        let kept: Vec<&EndpointAddress> = addresses
            .iter()
            .filter(|a| !backup.contains(&a.ip))
            .collect();

        if kept.is_empty() {
            emptied.push(index);
            continue;
        }
        let mut path = field.element(index);
        path.push_back("addresses");
        ops.push(replace(path, to_value(&kept)?));
    }

    match policy {
        EmptiedSubsetPolicy::Leave => {
            for index in &emptied {
                warn!(
                    endpoints = ?endpoints.metadata.name,
                    subset = index,
                    "Every address in subset is a backup address, leaving it unchanged"
                );
            }
        }
        // Descending so earlier removals do not shift later indices
        EmptiedSubsetPolicy::RemoveSubset => {
            ops.extend(emptied.iter().rev().map(|&index| remove(field.element(index))));
        }
    }

    Ok(ops)
}

fn same_multiset(observed: &[&str], backup: &[String]) -> bool {
    let mut observed = observed.to_vec();
    let mut backup: Vec<&str> = backup.iter().map(String::as_str).collect();
    observed.sort_unstable();
    backup.sort_unstable();
    observed == backup
}
