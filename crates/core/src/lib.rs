//! kfed core types: federated resources, type configs, schedule results and
//! propagated-version records shared by every controller crate.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

mod error;

pub use error::{FedError, FedResult};

/// Label stamped on every object written into a member cluster.
pub const MANAGED_LABEL: &str = "kfed.io/managed";
/// Annotation on a federated object requesting that member copies survive its deletion.
pub const ORPHAN_ANNOTATION: &str = "kfed.io/orphan";
/// Finalizer held on federated objects until member copies are cleaned up.
pub const SYNC_FINALIZER: &str = "kfed.io/sync-controller";

pub const CORE_GROUP: &str = "core.kfed.io";
pub const CORE_VERSION: &str = "v1beta1";
pub const SCHEDULING_GROUP: &str = "scheduling.kfed.io";
pub const SCHEDULING_VERSION: &str = "v1alpha1";

/// Preference key matching every ready cluster without an explicit entry.
pub const WILDCARD_CLUSTER: &str = "*";

pub mod prelude {
    pub use super::{
        ApiKind, ClusterOverride, ClusterOverrides, Delta, DeltaKind, FedError, FedResult, FederatedResource,
        Placement, PropagatedVersion, QualifiedName, ScheduleResult, SchedulePreference, TypeConfig,
    };
}

// ---------------- identities ----------------

/// Namespace/name identity of an object; `namespace` is `None` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    pub namespace: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.filter(|n| !n.is_empty()).map(|n| n.to_string()), name: name.to_string() }
    }

    /// Parse a work-queue key produced by `Display` (`ns/name` or `name`).
    pub fn parse(key: &str) -> Self {
        match key.split_once('/') {
            Some((ns, name)) => Self::new(Some(ns), name),
            None => Self::new(None, key),
        }
    }

    pub fn from_object(obj: &Value) -> Option<Self> {
        let name = meta_str(obj, "name")?;
        Some(Self::new(meta_str(obj, "namespace"), name))
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Group/version/kind triple of a served resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApiKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ApiKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.gvk_key()) }
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default = "default_true")]
    pub namespaced: bool,
}

impl TargetKind {
    pub fn api_kind(&self) -> ApiKind { ApiKind::new(&self.group, &self.version, &self.kind) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindRef {
    pub kind: String,
}

/// Type configuration record: which kinds make up one federated type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeConfig {
    #[serde(default)]
    pub name: String,
    pub target: TargetKind,
    pub template: ApiKind,
    pub placement: KindRef,
    #[serde(rename = "override")]
    pub override_kind: KindRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_preference_kind: Option<String>,
    #[serde(default)]
    pub status_enabled: bool,
}

impl TypeConfig {
    pub fn target_kind(&self) -> ApiKind { self.target.api_kind() }

    pub fn template_kind(&self) -> ApiKind { self.template.clone() }

    /// Placement objects share the template's group/version.
    pub fn placement_kind(&self) -> ApiKind {
        ApiKind::new(&self.template.group, &self.template.version, &self.placement.kind)
    }

    pub fn override_kind(&self) -> ApiKind {
        ApiKind::new(&self.template.group, &self.template.version, &self.override_kind.kind)
    }

    /// Placement lives inside the template object rather than a sibling object.
    pub fn placement_in_template(&self) -> bool { self.placement.kind == self.template.kind }

    pub fn overrides_in_template(&self) -> bool { self.override_kind.kind == self.template.kind }

    pub fn scheduling_kind(&self) -> Option<ApiKind> {
        self.scheduling_preference_kind
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| ApiKind::new(SCHEDULING_GROUP, SCHEDULING_VERSION, k))
    }

    pub fn namespaced(&self) -> bool { self.target.namespaced }

    /// Name of the PropagatedVersion record tracking `name` for this type.
    pub fn version_name(&self, name: &str) -> String { version_name(&self.target.kind, name) }

    pub fn version_prefix(&self) -> String { version_prefix(&self.target.kind) }
}

pub fn version_prefix(target_kind: &str) -> String { format!("{}-", target_kind.to_lowercase()) }

pub fn version_name(target_kind: &str, name: &str) -> String { format!("{}{}", version_prefix(target_kind), name) }

// ---------------- JSON object helpers ----------------

pub fn meta_str<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}

pub fn resource_version(obj: &Value) -> Option<&str> { meta_str(obj, "resourceVersion").filter(|s| !s.is_empty()) }

pub fn generation(obj: &Value) -> i64 {
    obj.get("metadata").and_then(|m| m.get("generation")).and_then(|v| v.as_i64()).unwrap_or(0)
}

/// `gen:<generation>` when the kind tracks generations, otherwise
/// `rv:<resourceVersion>`. Status writes leave the former untouched.
pub fn object_version(obj: &Value) -> String {
    match generation(obj) {
        g if g > 0 => format!("gen:{}", g),
        _ => format!("rv:{}", resource_version(obj).unwrap_or_default()),
    }
}

pub fn labels(obj: &Value) -> BTreeMap<String, String> { string_map(obj.get("metadata").and_then(|m| m.get("labels"))) }

pub fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
}

pub fn is_deleting(obj: &Value) -> bool {
    obj.get("metadata").and_then(|m| m.get("deletionTimestamp")).map(|v| !v.is_null()).unwrap_or(false)
}

pub fn has_finalizer(obj: &Value, finalizer: &str) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(|f| f.as_array())
        .map(|arr| arr.iter().any(|v| v.as_str() == Some(finalizer)))
        .unwrap_or(false)
}

pub fn is_managed(obj: &Value) -> bool { labels(obj).get(MANAGED_LABEL).map(|v| v == "true").unwrap_or(false) }

fn string_map(v: Option<&Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(map) = v.and_then(|v| v.as_object()) {
        for (k, v) in map {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}

// ---------------- federated resources ----------------

/// Where a federated object should exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Clusters(BTreeSet<String>),
    /// `matchLabels` selector resolved against member cluster labels.
    Selector(BTreeMap<String, String>),
}

impl Default for Placement {
    fn default() -> Self { Placement::Clusters(BTreeSet::new()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideOp {
    Add,
    #[default]
    Replace,
    Remove,
}

impl OverrideOp {
    fn is_replace(&self) -> bool { matches!(self, OverrideOp::Replace) }
}

/// JSON-pointer path split into unescaped segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "PathRepr", into = "String")]
pub struct OverridePath(SmallVec<[String; 4]>);

#[derive(Deserialize)]
#[serde(untagged)]
enum PathRepr {
    Pointer(String),
    Segments(Vec<String>),
}

impl TryFrom<PathRepr> for OverridePath {
    type Error = FedError;

    fn try_from(r: PathRepr) -> FedResult<Self> {
        match r {
            PathRepr::Pointer(p) => OverridePath::parse(&p),
            PathRepr::Segments(s) if s.is_empty() => Err(FedError::Config("override path must not be empty".into())),
            PathRepr::Segments(s) => Ok(OverridePath(s.into_iter().collect())),
        }
    }
}

impl From<OverridePath> for String {
    fn from(p: OverridePath) -> String { p.to_pointer() }
}

impl OverridePath {
    /// Parse `/a/b~1c` into `["a", "b/c"]`.
    pub fn parse(pointer: &str) -> FedResult<Self> {
        let rest = pointer
            .strip_prefix('/')
            .ok_or_else(|| FedError::Config(format!("override path {:?} must start with '/'", pointer)))?;
        if rest.is_empty() {
            return Err(FedError::Config("override path must not target the document root".into()));
        }
        Ok(OverridePath(rest.split('/').map(|s| s.replace("~1", "/").replace("~0", "~")).collect()))
    }

    pub fn segments(&self) -> &[String] { &self.0 }

    pub fn to_pointer(&self) -> String {
        let mut out = String::new();
        for seg in self.0.iter() {
            out.push('/');
            out.push_str(&seg.replace('~', "~0").replace('/', "~1"));
        }
        out
    }
}

impl fmt::Display for OverridePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.to_pointer()) }
}

/// One field patch applied on top of the template for a single cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterOverride {
    pub path: OverridePath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "OverrideOp::is_replace")]
    pub op: OverrideOp,
}

impl ClusterOverride {
    pub fn replace(path: OverridePath, value: Value) -> Self { Self { path, value: Some(value), op: OverrideOp::Replace } }
}

pub type ClusterOverrides = BTreeMap<String, Vec<ClusterOverride>>;

/// A federated object assembled from its template, placement and override sources.
#[derive(Debug, Clone, PartialEq)]
pub struct FederatedResource {
    pub name: QualifiedName,
    pub uid: Option<String>,
    pub template: Value,
    pub template_version: String,
    pub placement: Placement,
    pub override_version: String,
    pub overrides: ClusterOverrides,
    pub deleting: bool,
    pub orphan: bool,
}

impl FederatedResource {
    pub fn overrides_for(&self, cluster: &str) -> &[ClusterOverride] {
        self.overrides.get(cluster).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

// ---------------- scheduling ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPreference {
    #[serde(default)]
    pub weight: i64,
    #[serde(default)]
    pub min_replicas: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleTotal {
    Replicas(i64),
    Jobs { parallelism: i64, completions: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePreference {
    pub name: QualifiedName,
    /// Template kind the preference applies to; `None` matches every type
    /// scheduled by the same preference kind.
    pub target_kind: Option<String>,
    pub total: ScheduleTotal,
    pub clusters: BTreeMap<String, ClusterPreference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobAllocation {
    pub parallelism: i64,
    pub completions: i64,
}

/// Per-cluster distribution computed from a preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleResult {
    Replicas(BTreeMap<String, i64>),
    Jobs(BTreeMap<String, JobAllocation>),
}

impl ScheduleResult {
    /// Clusters with a positive allocation.
    pub fn placement(&self) -> BTreeSet<String> {
        match self {
            ScheduleResult::Replicas(m) => m.iter().filter(|(_, v)| **v > 0).map(|(k, _)| k.clone()).collect(),
            ScheduleResult::Jobs(m) => m
                .iter()
                .filter(|(_, v)| v.parallelism > 0 || v.completions > 0)
                .map(|(k, _)| k.clone())
                .collect(),
        }
    }
}

// ---------------- propagated versions ----------------

/// Persisted record of the versions last written to each member cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagatedVersion {
    pub namespace: Option<String>,
    pub name: String,
    pub template_version: String,
    pub override_version: String,
    pub cluster_versions: BTreeMap<String, String>,
    /// Backend concurrency token; `None` until the record has been persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl PropagatedVersion {
    pub fn qualified_name(&self) -> QualifiedName { QualifiedName::new(self.namespace.as_deref(), &self.name) }

    /// Same payload, ignoring the concurrency token.
    pub fn same_content(&self, other: &PropagatedVersion) -> bool {
        self.template_version == other.template_version
            && self.override_version == other.override_version
            && self.cluster_versions == other.cluster_versions
    }
}

// ---------------- watch deltas ----------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// A single watch observation for one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub raw: Value,
}

impl Delta {
    pub fn applied(raw: Value) -> Self { Self { kind: DeltaKind::Applied, raw } }

    pub fn deleted(raw: Value) -> Self { Self { kind: DeltaKind::Deleted, raw } }

    pub fn key(&self) -> Option<QualifiedName> { QualifiedName::from_object(&self.raw) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_round_trips_through_queue_key() {
        let q = QualifiedName::new(Some("ns"), "web");
        assert_eq!(q.to_string(), "ns/web");
        assert_eq!(QualifiedName::parse("ns/web"), q);
        let c = QualifiedName::parse("global");
        assert_eq!(c.namespace, None);
        assert_eq!(QualifiedName::new(Some(""), "x").namespace, None);
    }

    #[test]
    fn override_path_accepts_pointer_and_segments() {
        let p: OverridePath = serde_json::from_value(serde_json::json!("/spec/replicas")).unwrap();
        assert_eq!(p.segments(), ["spec".to_string(), "replicas".to_string()]);
        let s: OverridePath = serde_json::from_value(serde_json::json!(["metadata", "labels", "a/b"])).unwrap();
        assert_eq!(s.to_pointer(), "/metadata/labels/a~1b");
        assert_eq!(OverridePath::parse("/metadata/labels/a~1b").unwrap(), s);
        assert!(OverridePath::parse("spec").is_err());
        assert!(OverridePath::parse("/").is_err());
    }

    #[test]
    fn type_config_deserializes_record_shape() {
        let tc: TypeConfig = serde_json::from_value(serde_json::json!({
            "name": "deployments.apps",
            "target": { "group": "apps", "version": "v1", "kind": "Deployment", "namespaced": true },
            "template": { "group": "types.kfed.io", "version": "v1beta1", "kind": "FederatedDeployment" },
            "placement": { "kind": "FederatedDeployment" },
            "override": { "kind": "FederatedDeploymentOverride" },
            "schedulingPreferenceKind": "ReplicaSchedulingPreference",
            "statusEnabled": true
        }))
        .unwrap();
        assert!(tc.placement_in_template());
        assert!(!tc.overrides_in_template());
        assert_eq!(tc.override_kind().gvk_key(), "types.kfed.io/v1beta1/FederatedDeploymentOverride");
        assert_eq!(tc.version_name("web"), "deployment-web");
        assert_eq!(tc.scheduling_kind().unwrap().api_version(), "scheduling.kfed.io/v1alpha1");
    }

    #[test]
    fn schedule_result_placement_skips_zero() {
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), 2);
        m.insert("b".to_string(), 0);
        assert_eq!(ScheduleResult::Replicas(m).placement().into_iter().collect::<Vec<_>>(), vec!["a".to_string()]);
        let mut j = BTreeMap::new();
        j.insert("a".to_string(), JobAllocation { parallelism: 0, completions: 1 });
        j.insert("b".to_string(), JobAllocation::default());
        assert_eq!(ScheduleResult::Jobs(j).placement().len(), 1);
    }
}
