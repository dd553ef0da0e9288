//! Per-MAC binding composition.
//!
//! The base binding merged at startup covers the global, network, and
//! instance scopes. At request time the hardware scopes are layered on top:
//! MAC prefixes from shortest to longest, then the device type, the device,
//! and finally the MAC's own attributes. Network-scoped entries overlay
//! their global counterparts at every level.

use chrono::DateTime;
use futures::future::try_join_all;
use netcore_common::{
    binding::sort_assignments, Assignment, AssignmentMode, AttrKey, AttrOverride, Binding,
    BindingPatch, MacAddr,
};
use netcore_store::{Node, Store};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;

/// The stored binding record for one MAC.
#[derive(Debug, Clone, Default)]
pub struct MacEntry {
    pub type_id: Option<String>,
    pub device_id: Option<String>,
    /// Reserved assignment-mode restriction; parsed but not yet enforced.
    pub restriction: Option<String>,
    pub attrs: BTreeMap<AttrKey, AttrOverride>,
    pub assignments: Vec<Assignment>,
}

impl MacEntry {
    fn from_node(node: &Node) -> Self {
        Self {
            type_id: scalar_child(node, "type"),
            device_id: scalar_child(node, "device"),
            restriction: scalar_child(node, "restriction"),
            attrs: attrs_of(node),
            assignments: assignments_of(node),
        }
    }
}

/// Whether any binding record exists for this MAC, at network or global
/// scope. Inform only answers known hardware.
pub async fn mac_entry_exists(
    store: &Arc<dyn Store>,
    network: &str,
    mac: MacAddr,
) -> Result<bool> {
    if store
        .get(&format!("network/{network}/mac/{mac}"), false, false)
        .await?
        .is_some()
    {
        return Ok(true);
    }
    Ok(store.get(&format!("mac/{mac}"), false, false).await?.is_some())
}

/// Compose the effective binding for `mac` by overlaying the hardware scopes
/// onto the base binding.
pub async fn effective_binding(
    store: &Arc<dyn Store>,
    network: &str,
    base: &Binding,
    mac: MacAddr,
) -> Result<Binding> {
    // Round one: every prefix scope plus the MAC's own entry, in parallel.
    let global_keys: Vec<String> = mac
        .prefixes()
        .map(|p| format!("mac/{p}"))
        .chain([format!("mac/{mac}")])
        .collect();
    let network_keys: Vec<String> = mac
        .prefixes()
        .map(|p| format!("network/{network}/mac/{p}"))
        .collect();
    let entry_key = format!("network/{network}/mac/{mac}");

    let keys: Vec<&str> = global_keys
        .iter()
        .chain(network_keys.iter())
        .map(String::as_str)
        .chain([entry_key.as_str()])
        .collect();
    let nodes = try_join_all(keys.iter().map(|k| store.get(k, true, true))).await?;

    let (global_nodes, rest) = nodes.split_at(global_keys.len());
    let (network_nodes, entry_node) = rest.split_at(network_keys.len());
    let entry = entry_node[0].as_ref().map(MacEntry::from_node).unwrap_or_default();

    // The type and device references cascade the same way attributes do:
    // a longer prefix beats a shorter one, the MAC entry beats them all.
    let mut type_id = None;
    let mut device_id = None;
    for node in global_nodes.iter().chain(network_nodes.iter()).flatten() {
        if let Some(t) = scalar_child(node, "type") {
            type_id = Some(t);
        }
        if let Some(d) = scalar_child(node, "device") {
            device_id = Some(d);
        }
    }
    type_id = entry.type_id.clone().or(type_id);
    device_id = entry.device_id.clone().or(device_id);

    // Round two: type and device scopes, once the references are known.
    let mut scope_keys = Vec::new();
    if let Some(ref t) = type_id {
        scope_keys.push(format!("type/{t}"));
        scope_keys.push(format!("network/{network}/type/{t}"));
    }
    if let Some(ref d) = device_id {
        scope_keys.push(format!("device/{d}"));
        scope_keys.push(format!("network/{network}/device/{d}"));
    }
    let scope_nodes = try_join_all(scope_keys.iter().map(|k| store.get(k, true, true))).await?;

    let mut binding = base.clone();
    for node in global_nodes.iter().chain(network_nodes.iter()).flatten() {
        binding.overlay(attr_patch(node));
    }
    for node in scope_nodes.iter().flatten() {
        binding.overlay(attr_patch(node));
    }
    binding.overlay(BindingPatch {
        assignments: entry.assignments.clone(),
        attrs: entry.attrs.clone(),
        ..Default::default()
    });
    sort_assignments(&mut binding.assignments);

    Ok(binding)
}

fn attr_patch(node: &Node) -> BindingPatch {
    BindingPatch {
        attrs: attrs_of(node),
        ..Default::default()
    }
}

fn scalar_child(node: &Node, segment: &str) -> Option<String> {
    node.child(segment)
        .filter(|n| !n.dir && !n.value.is_empty())
        .map(|n| n.value.clone())
}

fn attrs_of(node: &Node) -> BTreeMap<AttrKey, AttrOverride> {
    let mut attrs = BTreeMap::new();
    if let Some(dir) = node.child("attr").filter(|n| n.dir) {
        for child in &dir.nodes {
            if child.dir {
                continue;
            }
            if let Some(key) = AttrKey::from_field(child.key_segment()) {
                attrs.insert(key, AttrOverride::from_stored(&child.value));
            }
        }
    }
    attrs
}

fn assignments_of(node: &Node) -> Vec<Assignment> {
    let Some(dir) = node.child("assignment").filter(|n| n.dir) else {
        return Vec::new();
    };
    dir.nodes
        .iter()
        .filter_map(|assignment| {
            // An assignment whose fields have all expired is just a husk.
            if assignment.nodes.is_empty() {
                return None;
            }
            let address = assignment.key_segment().parse().ok()?;
            let mode = scalar_child(assignment, "mode")
                .and_then(|m| AssignmentMode::from_str_loose(&m))
                .unwrap_or(AssignmentMode::Dynamic);
            let priority = scalar_child(assignment, "priority")
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
            let created = scalar_child(assignment, "created")
                .and_then(|t| t.parse().ok())
                .unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap());
            let assigned = scalar_child(assignment, "assigned")
                .and_then(|t| t.parse().ok())
                .unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap());
            Some(Assignment {
                mode,
                priority,
                created,
                assigned,
                address,
            })
        })
        .collect()
}
