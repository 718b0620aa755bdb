//! kfed schema: type configuration records, federated object and preference
//! shapes, and the explicit type registry controllers are started from.
//!
//! Everything here works on opaque JSON so no kind is known at compile time.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use kfed_core::{
    ApiKind, ClusterOverride, ClusterOverrides, ClusterPreference, FedError, FedResult, FederatedResource, Placement,
    QualifiedName, SchedulePreference, ScheduleTotal, TypeConfig, CORE_GROUP, CORE_VERSION, ORPHAN_ANNOTATION,
};

mod registry;

pub use registry::TypeRegistry;

/// Kind of the host-cluster objects carrying type configuration records.
pub fn type_config_kind() -> ApiKind { ApiKind::new(CORE_GROUP, CORE_VERSION, "FederatedTypeConfig") }

fn config_err(what: impl std::fmt::Display) -> FedError { FedError::Config(what.to_string()) }

/// Parse a `FederatedTypeConfig` object (record under `spec`, name from
/// `metadata.name`) or a bare record.
pub fn parse_type_config(obj: &Value) -> FedResult<TypeConfig> {
    let record = obj.get("spec").unwrap_or(obj);
    let mut tc: TypeConfig =
        serde_json::from_value(record.clone()).map_err(|e| config_err(format!("invalid type config: {}", e)))?;
    if let Some(name) = kfed_core::meta_str(obj, "name") {
        tc.name = name.to_string();
    }
    if tc.name.is_empty() {
        return Err(config_err("type config without a name"));
    }
    for (field, kind) in [
        ("target", &tc.target.kind),
        ("template", &tc.template.kind),
        ("placement", &tc.placement.kind),
        ("override", &tc.override_kind.kind),
    ] {
        if kind.is_empty() {
            return Err(config_err(format!("type config {}: {}.kind is empty", tc.name, field)));
        }
    }
    Ok(tc)
}

/// Load type configs from a (multi-document) YAML file.
pub fn load_type_configs(path: &str) -> Result<Vec<TypeConfig>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading type configs from {}", path))?;
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let yaml = serde_yaml::Value::deserialize(doc).context("parsing YAML document")?;
        if yaml.is_null() {
            continue;
        }
        let v = serde_json::to_value(yaml).context("converting YAML to JSON")?;
        out.push(parse_type_config(&v).with_context(|| format!("in {}", path))?);
    }
    Ok(out)
}

// ---------------- placement ----------------

/// Parse `spec.placement`. Explicit cluster names win over a selector;
/// a missing placement selects nothing.
pub fn parse_placement(placement: Option<&Value>) -> FedResult<Placement> {
    let Some(p) = placement.filter(|p| !p.is_null()) else { return Ok(Placement::default()) };
    if let Some(names) = p.get("clusterNames").filter(|v| !v.is_null()) {
        let arr = names.as_array().ok_or_else(|| config_err("placement.clusterNames must be a list"))?;
        let mut set = BTreeSet::new();
        for n in arr {
            let name = n.as_str().ok_or_else(|| config_err("placement.clusterNames entries must be strings"))?;
            set.insert(name.to_string());
        }
        return Ok(Placement::Clusters(set));
    }
    if let Some(sel) = p.get("clusterSelector").filter(|v| !v.is_null()) {
        let labels: BTreeMap<String, String> = match sel.get("matchLabels") {
            Some(m) => serde_json::from_value(m.clone())
                .map_err(|e| config_err(format!("placement.clusterSelector.matchLabels: {}", e)))?,
            None => BTreeMap::new(),
        };
        return Ok(Placement::Selector(labels));
    }
    Ok(Placement::default())
}

pub fn render_placement(placement: &Placement) -> Value {
    match placement {
        Placement::Clusters(names) => json!({ "clusterNames": names }),
        Placement::Selector(labels) => json!({ "clusterSelector": { "matchLabels": labels } }),
    }
}

// ---------------- overrides ----------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OverrideEntry {
    cluster_name: String,
    #[serde(default)]
    cluster_overrides: Vec<ClusterOverride>,
}

/// Parse `spec.overrides`; repeated entries for one cluster are concatenated.
pub fn parse_overrides(overrides: Option<&Value>) -> FedResult<ClusterOverrides> {
    let mut out = ClusterOverrides::new();
    let Some(v) = overrides.filter(|v| !v.is_null()) else { return Ok(out) };
    let entries: Vec<OverrideEntry> =
        serde_json::from_value(v.clone()).map_err(|e| config_err(format!("invalid overrides: {}", e)))?;
    for e in entries {
        if e.cluster_name.is_empty() {
            return Err(config_err("override entry without clusterName"));
        }
        out.entry(e.cluster_name).or_default().extend(e.cluster_overrides);
    }
    Ok(out)
}

/// Clusters in name order; clusters without patches are left out.
pub fn render_overrides(overrides: &ClusterOverrides) -> Value {
    Value::Array(
        overrides
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(cluster, list)| json!({ "clusterName": cluster, "clusterOverrides": list }))
            .collect(),
    )
}

// ---------------- federated objects ----------------

fn spec_field<'a>(obj: &'a Value, field: &str) -> Option<&'a Value> { obj.get("spec").and_then(|s| s.get(field)) }

/// Assemble a federated object from its template object and, for types that
/// keep them apart, its sibling placement and override objects.
///
/// Versions are object versions of the source objects, so status writes do
/// not invalidate recorded cluster versions.
pub fn parse_federated(
    tc: &TypeConfig,
    template_obj: &Value,
    placement_obj: Option<&Value>,
    override_obj: Option<&Value>,
) -> FedResult<FederatedResource> {
    let name = QualifiedName::from_object(template_obj).ok_or_else(|| config_err("federated object without a name"))?;
    let template = spec_field(template_obj, "template")
        .filter(|t| t.is_object())
        .cloned()
        .ok_or_else(|| config_err(format!("{} {}: spec.template missing", tc.template.kind, name)))?;

    let placement_src = if tc.placement_in_template() { Some(template_obj) } else { placement_obj };
    let placement = parse_placement(placement_src.and_then(|o| spec_field(o, "placement")))?;

    let override_src = if tc.overrides_in_template() { Some(template_obj) } else { override_obj };
    let overrides = parse_overrides(override_src.and_then(|o| spec_field(o, "overrides")))?;
    let override_version = override_src.map(kfed_core::object_version).unwrap_or_default();

    Ok(FederatedResource {
        uid: kfed_core::meta_str(template_obj, "uid").map(|s| s.to_string()),
        template_version: kfed_core::object_version(template_obj),
        template,
        placement,
        override_version,
        overrides,
        deleting: kfed_core::is_deleting(template_obj),
        orphan: kfed_core::annotation(template_obj, ORPHAN_ANNOTATION) == Some("true"),
        name,
    })
}

// ---------------- scheduling preferences ----------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferenceSpec {
    total_replicas: Option<i64>,
    total_parallelism: Option<i64>,
    total_completions: Option<i64>,
    target_kind: Option<String>,
    #[serde(default)]
    clusters: BTreeMap<String, ClusterPreference>,
}

/// Parse and validate a scheduling preference object.
pub fn parse_preference(obj: &Value) -> FedResult<SchedulePreference> {
    let name = QualifiedName::from_object(obj).ok_or_else(|| config_err("preference without a name"))?;
    let spec: PreferenceSpec = serde_json::from_value(obj.get("spec").cloned().unwrap_or_else(|| json!({})))
        .map_err(|e| config_err(format!("preference {}: {}", name, e)))?;
    let total = match (spec.total_replicas, spec.total_parallelism, spec.total_completions) {
        (Some(r), None, None) => ScheduleTotal::Replicas(r),
        (None, Some(p), Some(c)) => ScheduleTotal::Jobs { parallelism: p, completions: c },
        (None, Some(_), None) | (None, None, Some(_)) => {
            return Err(config_err(format!("preference {}: totalParallelism and totalCompletions go together", name)))
        }
        (None, None, None) => return Err(config_err(format!("preference {}: no total given", name))),
        _ => return Err(config_err(format!("preference {}: totalReplicas excludes job totals", name))),
    };
    let negative_total = match total {
        ScheduleTotal::Replicas(r) => r < 0,
        ScheduleTotal::Jobs { parallelism, completions } => parallelism < 0 || completions < 0,
    };
    if negative_total {
        return Err(config_err(format!("preference {}: totals must not be negative", name)));
    }
    if let Some((cluster, _)) = spec.clusters.iter().find(|(_, p)| p.weight < 0 || p.min_replicas < 0) {
        return Err(config_err(format!("preference {}: cluster {} has a negative weight or minimum", name, cluster)));
    }
    Ok(SchedulePreference { name, target_kind: spec.target_kind.filter(|k| !k.is_empty()), total, clusters: spec.clusters })
}
