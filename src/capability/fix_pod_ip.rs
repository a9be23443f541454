//! Static per-replica node and IP assignment for StatefulSet pods
//!
//! A StatefulSet carries `fix.pod.ip` on its pod template: a JSON array with
//! one `{node: [ips]}` entry per ordinal. Pod admission pins replica `N` to
//! the node of entry `N` and hands its IPs to Calico through the
//! `cni.projectcalico.org/ipAddrs` annotation.

use std::collections::BTreeMap;

use json_patch::PatchOperation;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use serde_json::Value;
use tracing::debug;

use super::{lookup, required};
use crate::patch::{add, pointer, MapField};
use crate::validate::is_valid_ipv4;
use crate::webhook::{AdmissionError, Source};

/// Annotation holding the node/IP assignment array
pub const FIX_POD_IP_ANNOTATION: &str = "fix.pod.ip";

/// Annotation read by Calico IPAM for fixed pod addresses
pub const CALICO_IP_ADDRS_ANNOTATION: &str = "cni.projectcalico.org/ipAddrs";

/// Example shown in assignment format errors
pub const FIX_POD_IP_EXAMPLE: &str = r#"[{"node-1":["10.0.0.1"]},{"node-2":["10.0.0.2"]}]"#;

/// One `{node: [ips]}` entry per StatefulSet ordinal
pub type PodIpAssignment = Vec<BTreeMap<String, Vec<String>>>;

/// Pin a StatefulSet pod to the node and IPs reserved for its ordinal
pub fn mutate(pod: &Pod) -> Result<Vec<PatchOperation>, AdmissionError> {
    let annotations = pod.metadata.annotations.as_ref();
    let Some(raw) = lookup(annotations, FIX_POD_IP_ANNOTATION) else {
        return Ok(Vec::new());
    };

    let assignment = parse_assignment(raw, Source::Annotation)?;
    let name = pod
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| AdmissionError::semantic("pod has no name to derive an ordinal from"))?;
    let index = ordinal(name, pod.metadata.generate_name.as_deref())?;

    let entry = assignment.get(index).ok_or_else(|| {
        AdmissionError::semantic(format!(
            "pod '{name}' has ordinal {index} but '{FIX_POD_IP_ANNOTATION}' has only {} entries",
            assignment.len()
        ))
    })?;
    let (node, ips) = single_node(entry, index)?;

    debug!(pod = %name, ordinal = index, node = %node, ips = ?ips, "Assigning fixed pod IP");

    let ip_addrs =
        serde_json::to_string(ips).map_err(|e| AdmissionError::Internal(e.to_string()))?;
    let mut pod_annotations = MapField::of(pointer(["metadata", "annotations"]), annotations);

    Ok(vec![
        add(pointer(["spec", "nodeName"]), Value::String(node.clone())),
        pod_annotations.insert(CALICO_IP_ADDRS_ANNOTATION, Value::String(ip_addrs)),
    ])
}

/// Check that a StatefulSet reserves a well-formed entry for every replica
pub fn validate(statefulset: &StatefulSet) -> Result<(), AdmissionError> {
    let spec = statefulset.spec.as_ref();
    let annotations = spec
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref());

    let raw = required(annotations, FIX_POD_IP_ANNOTATION, Source::TemplateAnnotation)?;
    let assignment = parse_assignment(raw, Source::TemplateAnnotation)?;

    for (index, entry) in assignment.iter().enumerate() {
        let (_, ips) = single_node(entry, index)?;
        if ips.is_empty() {
            return Err(AdmissionError::semantic(format!(
                "entry {index} of '{FIX_POD_IP_ANNOTATION}' lists no IPs"
            )));
        }
        if let Some(bad) = ips.iter().find(|ip| !is_valid_ipv4(ip)) {
            return Err(AdmissionError::Format {
                origin: Source::TemplateAnnotation,
                key: FIX_POD_IP_ANNOTATION,
                token: bad.clone(),
                example: FIX_POD_IP_EXAMPLE,
            });
        }
    }

    let replicas = spec
        .and_then(|s| s.replicas)
        .ok_or_else(|| AdmissionError::semantic("spec.replicas is not set"))?;

    if i64::from(replicas) > assignment.len() as i64 {
        return Err(AdmissionError::semantic(format!(
            "spec.replicas {replicas} must be less than or equal to the {} entries in '{FIX_POD_IP_ANNOTATION}'",
            assignment.len()
        )));
    }

    Ok(())
}

/// Ordinal of a StatefulSet pod
///
/// The name minus its generate-name prefix; when no prefix applies, the text
/// after the last `-`.
pub fn ordinal(name: &str, generate_name: Option<&str>) -> Result<usize, AdmissionError> {
    let suffix = generate_name
        .filter(|g| !g.is_empty())
        .and_then(|g| name.strip_prefix(g))
        .or_else(|| name.rsplit_once('-').map(|(_, s)| s))
        .unwrap_or(name);

    suffix.parse().map_err(|_| {
        AdmissionError::semantic(format!(
            "cannot derive an ordinal from pod name '{name}': '{suffix}' is not a number"
        ))
    })
}

fn parse_assignment(raw: &str, origin: Source) -> Result<PodIpAssignment, AdmissionError> {
    serde_json::from_str(raw).map_err(|e| AdmissionError::Decode {
        kind: format!("{origin} '{FIX_POD_IP_ANNOTATION}' (example {FIX_POD_IP_EXAMPLE})"),
        message: e.to_string(),
    })
}

fn single_node(
    entry: &BTreeMap<String, Vec<String>>,
    index: usize,
) -> Result<(&String, &Vec<String>), AdmissionError> {
    let mut nodes = entry.iter();
    match (nodes.next(), nodes.next()) {
        (Some(node), None) => Ok(node),
        _ => Err(AdmissionError::semantic(format!(
            "entry {index} of '{FIX_POD_IP_ANNOTATION}' must map exactly one node, found {}",
            entry.len()
        ))),
    }
}
