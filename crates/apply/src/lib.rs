//! kfed apply: turn a federated object into the concrete object for one
//! member cluster, and decide whether a member copy needs a write.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::trace;

use kfed_core::{
    ApiKind, ClusterOverride, FedError, FedResult, FederatedResource, OverrideOp, Placement, TypeConfig, MANAGED_LABEL,
};
use kfed_kubehub::ClusterSet;

/// Paths no override may touch: they carry the object's identity.
const PROTECTED_PATHS: [&str; 4] = ["/apiVersion", "/kind", "/metadata/name", "/metadata/namespace"];

/// Server-populated metadata never copied from a template.
const SERVER_FIELDS: [&str; 10] = [
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
    "finalizers",
    "ownerReferences",
];

/// `kfed.io/managed=true`, for listing objects this control plane owns.
pub fn managed_selector() -> String { format!("{}=true", MANAGED_LABEL) }

fn config_err(msg: String) -> FedError {
    counter!("apply_override_errors_total", 1u64);
    FedError::Config(msg)
}

// ---------------- overrides ----------------

fn parse_index(seg: &str, path: &str) -> FedResult<usize> {
    seg.parse::<usize>().map_err(|_| config_err(format!("override path {}: {:?} is not an array index", path, seg)))
}

fn parent_mut<'a>(mut cur: &'a mut Json, segs: &[String], create: bool, path: &str) -> FedResult<Option<&'a mut Json>> {
    for seg in segs {
        cur = match cur {
            Json::Object(map) => {
                if create {
                    map.entry(seg.clone()).or_insert_with(|| Json::Object(Map::new()))
                } else {
                    match map.get_mut(seg) {
                        Some(v) => v,
                        None => return Ok(None),
                    }
                }
            }
            Json::Array(arr) => {
                let i = parse_index(seg, path)?;
                match arr.get_mut(i) {
                    Some(v) => v,
                    None if create => return Err(config_err(format!("override path {}: index {} out of range", path, i))),
                    None => return Ok(None),
                }
            }
            _ => return Err(config_err(format!("override path {} crosses a scalar at {:?}", path, seg))),
        };
    }
    Ok(Some(cur))
}

/// Apply one cluster's override list in order.
///
/// `replace` and `add` create missing intermediate objects; `add` inserts
/// into arrays (`-` appends) while `replace` overwrites an existing element.
/// `remove` of an absent path is a no-op.
pub fn apply_overrides(obj: &mut Json, overrides: &[ClusterOverride]) -> FedResult<()> {
    for o in overrides {
        let path = o.path.to_pointer();
        if PROTECTED_PATHS.contains(&path.as_str()) {
            return Err(config_err(format!("override path {} is not allowed", path)));
        }
        let segs = o.path.segments();
        let Some((last, parents)) = segs.split_last() else {
            return Err(config_err("override path must not be empty".to_string()));
        };
        match o.op {
            OverrideOp::Remove => match parent_mut(obj, parents, false, &path)? {
                Some(Json::Object(map)) => {
                    map.remove(last);
                }
                Some(Json::Array(arr)) => {
                    let i = parse_index(last, &path)?;
                    if i < arr.len() {
                        arr.remove(i);
                    }
                }
                _ => {}
            },
            op => {
                let value = o.value.clone().ok_or_else(|| config_err(format!("override path {} needs a value", path)))?;
                let parent = parent_mut(obj, parents, true, &path)?
                    .ok_or_else(|| config_err(format!("override path {} has no parent", path)))?;
                match parent {
                    Json::Object(map) => {
                        map.insert(last.clone(), value);
                    }
                    Json::Array(arr) if op == OverrideOp::Add && last == "-" => arr.push(value),
                    Json::Array(arr) => {
                        let i = parse_index(last, &path)?;
                        match op {
                            OverrideOp::Add if i <= arr.len() => arr.insert(i, value),
                            OverrideOp::Replace if i < arr.len() => arr[i] = value,
                            _ => return Err(config_err(format!("override path {}: index {} out of range", path, i))),
                        }
                    }
                    _ => return Err(config_err(format!("override path {} targets a scalar's child", path))),
                }
            }
        }
        trace!(path = %path, op = ?o.op, "override applied");
    }
    Ok(())
}

// ---------------- desired objects ----------------

fn metadata_mut(obj: &mut Json) -> FedResult<&mut Map<String, Json>> {
    let root = obj.as_object_mut().ok_or_else(|| FedError::Config("template is not an object".into()))?;
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    if !meta.is_object() {
        *meta = Json::Object(Map::new());
    }
    meta.as_object_mut().ok_or_else(|| FedError::Invariant("metadata is not an object".into()))
}

fn set_managed_label(obj: &mut Json) -> FedResult<()> {
    let meta = metadata_mut(obj)?;
    let labels = meta.entry("labels").or_insert_with(|| Json::Object(Map::new()));
    if !labels.is_object() {
        *labels = Json::Object(Map::new());
    }
    if let Some(l) = labels.as_object_mut() {
        l.insert(MANAGED_LABEL.to_string(), Json::String("true".into()));
    }
    Ok(())
}

/// The object `fed` should look like in `cluster`: template, identity and
/// kind of the target type, cluster overrides, and the managed label.
pub fn desired_object(fed: &FederatedResource, tc: &TypeConfig, cluster: &str) -> FedResult<Json> {
    let mut obj = fed.template.clone();
    if !obj.is_object() {
        return Err(FedError::Config(format!("{}: template is not an object", fed.name)));
    }
    let target = tc.target_kind();
    obj["apiVersion"] = Json::String(target.api_version());
    obj["kind"] = Json::String(target.kind.clone());
    let meta = metadata_mut(&mut obj)?;
    for f in SERVER_FIELDS {
        meta.remove(f);
    }
    meta.insert("name".into(), Json::String(fed.name.name.clone()));
    match (tc.namespaced(), fed.name.namespace()) {
        (true, Some(ns)) => {
            meta.insert("namespace".into(), Json::String(ns.to_string()));
        }
        _ => {
            meta.remove("namespace");
        }
    }
    apply_overrides(&mut obj, fed.overrides_for(cluster))?;
    set_managed_label(&mut obj)?;
    Ok(obj)
}

fn pointer_missing(obj: &Json, pointer: &str) -> bool { obj.pointer(pointer).map(|v| v.is_null()).unwrap_or(true) }

/// Carry over fields owned by the member cluster before an update.
pub fn retain_cluster_fields(kind: &ApiKind, desired: &mut Json, cluster_obj: &Json) {
    if let Ok(meta) = metadata_mut(desired) {
        for field in ["resourceVersion", "finalizers"] {
            if let Some(v) = cluster_obj.get("metadata").and_then(|m| m.get(field)) {
                meta.insert(field.to_string(), v.clone());
            }
        }
    }
    if !kind.group.is_empty() {
        return;
    }
    let retained: &[(&str, &str)] = match kind.kind.as_str() {
        "Service" => &[("/spec/clusterIP", "clusterIP"), ("/spec/clusterIPs", "clusterIPs")],
        "ServiceAccount" => &[("/secrets", "secrets")],
        _ => &[],
    };
    for (pointer, field) in retained {
        let Some(live) = cluster_obj.pointer(pointer).filter(|v| !v.is_null()).cloned() else { continue };
        if !pointer_missing(desired, pointer) {
            continue;
        }
        let parent = if pointer.starts_with("/spec/") { desired.get_mut("spec") } else { Some(&mut *desired) };
        if let Some(Json::Object(map)) = parent {
            map.insert(field.to_string(), live);
        }
    }
}

// ---------------- versions and comparison ----------------

pub use kfed_core::object_version;

pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            for f in SERVER_FIELDS {
                obj.remove(f);
            }
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// `want` is contained in `have`: every field in `want` exists with the same
/// value; extra fields in `have` (server defaults) are ignored.
fn contained(want: &Json, have: &Json) -> bool {
    match (want, have) {
        (Json::Object(w), Json::Object(h)) => w.iter().all(|(k, wv)| h.get(k).map(|hv| contained(wv, hv)).unwrap_or(wv.is_null())),
        (Json::Array(w), Json::Array(h)) => w.len() == h.len() && w.iter().zip(h).all(|(a, b)| contained(a, b)),
        (w, h) => w == h,
    }
}

fn meta_contained(desired: &Json, cluster_obj: &Json, field: &str) -> bool {
    let want = desired.get("metadata").and_then(|m| m.get(field)).cloned().unwrap_or(Json::Null);
    let have = cluster_obj.get("metadata").and_then(|m| m.get(field)).cloned().unwrap_or(Json::Null);
    want.is_null() || contained(&want, &have)
}

/// Whether `cluster_obj` must be rewritten to match `desired`.
///
/// With a recorded version matching the live object only labels and
/// annotations are checked; without one the whole body is compared.
pub fn object_needs_update(desired: &Json, cluster_obj: &Json, recorded: Option<&str>) -> bool {
    match recorded {
        Some(v) if v != object_version(cluster_obj) => true,
        Some(_) => !(meta_contained(desired, cluster_obj, "labels") && meta_contained(desired, cluster_obj, "annotations")),
        None => !contained(&strip_noisy(desired.clone()), &strip_noisy(cluster_obj.clone())),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) if av != bv => s.updates += 1,
            _ => {}
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

// ---------------- placement ----------------

/// Placement resolved against the joined clusters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPlacement {
    /// Joined clusters the object belongs in, ready or not.
    pub selected: BTreeSet<String>,
    /// The ready subset of `selected`.
    pub ready: BTreeSet<String>,
}

/// Names that are not joined clusters are dropped; an empty selector selects
/// every joined cluster.
pub fn resolve_placement(placement: &Placement, clusters: &ClusterSet) -> ResolvedPlacement {
    let selected: BTreeSet<String> = match placement {
        Placement::Clusters(names) => names.iter().filter(|n| clusters.get(n).is_some()).cloned().collect(),
        Placement::Selector(labels) => clusters.matching(labels),
    };
    let ready = selected.iter().filter(|n| clusters.is_ready(n)).cloned().collect();
    ResolvedPlacement { selected, ready }
}
