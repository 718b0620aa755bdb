//! kfed schedule: distribute replicas (or job parallelism/completions) over
//! ready clusters and render the result as placement plus overrides.
//!
//! [`schedule`] is pure; [`scheduler`] wraps it in a controller that writes
//! back onto federated objects only when the rendered result differs.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use kfed_core::{
    ClusterOverride, ClusterOverrides, ClusterPreference, JobAllocation, OverrideOp, OverridePath, Placement, ScheduleResult,
    SchedulePreference, ScheduleTotal, WILDCARD_CLUSTER,
};

pub mod scheduler;

pub use scheduler::{start_scheduler, SchedulerConfig, SchedulerHandle};

pub const REPLICAS_PATH: &str = "/spec/replicas";
pub const PARALLELISM_PATH: &str = "/spec/parallelism";
pub const COMPLETIONS_PATH: &str = "/spec/completions";

/// Ready clusters eligible for allocation with their effective preference.
/// `None` means no per-cluster table was given and the split is even.
fn eligible(pref: &SchedulePreference, ready: &BTreeSet<String>) -> Option<BTreeMap<String, ClusterPreference>> {
    if pref.clusters.is_empty() {
        return None;
    }
    let wildcard = pref.clusters.get(WILDCARD_CLUSTER);
    Some(
        ready
            .iter()
            .filter_map(|c| pref.clusters.get(c).or(wildcard).map(|p| (c.clone(), *p)))
            .collect(),
    )
}

fn even(total: i64, names: impl Iterator<Item = String>) -> BTreeMap<String, i64> {
    let names: Vec<String> = names.collect();
    if names.is_empty() {
        return BTreeMap::new();
    }
    let n = names.len() as i64;
    let (base, extra) = (total / n, total % n);
    names.into_iter().enumerate().map(|(i, c)| (c, base + i64::from((i as i64) < extra))).collect()
}

/// Minimums first (heaviest first, then by name, clamped to what is left),
/// then the rest by floor-proportional weight with leftovers to the heaviest.
fn weighted(total: i64, prefs: &BTreeMap<String, ClusterPreference>) -> BTreeMap<String, i64> {
    let mut order: Vec<(&String, &ClusterPreference)> = prefs.iter().collect();
    order.sort_by(|a, b| b.1.weight.cmp(&a.1.weight).then_with(|| a.0.cmp(b.0)));

    let mut out: BTreeMap<String, i64> = BTreeMap::new();
    let mut remaining = total.max(0);
    for (name, p) in &order {
        let take = p.min_replicas.clamp(0, remaining);
        out.insert((*name).clone(), take);
        remaining -= take;
    }
    if remaining == 0 {
        return out;
    }

    let weight_sum: i64 = order.iter().map(|(_, p)| p.weight.max(0)).sum();
    if weight_sum == 0 {
        for (name, extra) in even(remaining, prefs.keys().cloned()) {
            *out.entry(name).or_default() += extra;
        }
        return out;
    }
    let mut handed = 0;
    for (name, p) in &order {
        let share = (i128::from(remaining) * i128::from(p.weight.max(0)) / i128::from(weight_sum)) as i64;
        *out.entry((*name).clone()).or_default() += share;
        handed += share;
    }
    let mut left = remaining - handed;
    for (name, _) in order.iter().filter(|(_, p)| p.weight > 0) {
        if left == 0 {
            break;
        }
        *out.entry((*name).clone()).or_default() += 1;
        left -= 1;
    }
    out
}

fn distribute(total: i64, ready: &BTreeSet<String>, prefs: Option<&BTreeMap<String, ClusterPreference>>) -> BTreeMap<String, i64> {
    match prefs {
        None => even(total, ready.iter().cloned()),
        Some(p) => weighted(total, p),
    }
}

/// Compute the per-cluster distribution for `pref` over `ready` clusters.
///
/// Deterministic for a given input. Job totals are distributed independently
/// with the same weight table.
pub fn schedule(pref: &SchedulePreference, ready: &BTreeSet<String>) -> ScheduleResult {
    let prefs = eligible(pref, ready);
    match pref.total {
        ScheduleTotal::Replicas(total) => ScheduleResult::Replicas(distribute(total, ready, prefs.as_ref())),
        ScheduleTotal::Jobs { parallelism, completions } => {
            let p = distribute(parallelism, ready, prefs.as_ref());
            let c = distribute(completions, ready, prefs.as_ref());
            let names: BTreeSet<&String> = p.keys().chain(c.keys()).collect();
            ScheduleResult::Jobs(
                names
                    .into_iter()
                    .map(|n| {
                        let alloc = JobAllocation {
                            parallelism: p.get(n).copied().unwrap_or(0),
                            completions: c.get(n).copied().unwrap_or(0),
                        };
                        (n.clone(), alloc)
                    })
                    .collect(),
            )
        }
    }
}

/// Override paths owned by the scheduler for this kind of result.
pub fn scheduled_paths(result: &ScheduleResult) -> &'static [&'static str] {
    match result {
        ScheduleResult::Replicas(_) => &[REPLICAS_PATH],
        ScheduleResult::Jobs(_) => &[PARALLELISM_PATH, COMPLETIONS_PATH],
    }
}

/// Path/value pairs each placed cluster should carry.
fn scheduled_values(result: &ScheduleResult) -> BTreeMap<String, Vec<(&'static str, i64)>> {
    match result {
        ScheduleResult::Replicas(m) => {
            m.iter().filter(|(_, v)| **v > 0).map(|(c, v)| (c.clone(), vec![(REPLICAS_PATH, *v)])).collect()
        }
        ScheduleResult::Jobs(m) => m
            .iter()
            .filter(|(_, v)| v.parallelism > 0 || v.completions > 0)
            .map(|(c, v)| (c.clone(), vec![(PARALLELISM_PATH, v.parallelism), (COMPLETIONS_PATH, v.completions)]))
            .collect(),
    }
}

/// True unless `current` names exactly the clusters with a positive allocation.
pub fn placement_update_needed(current: &Placement, result: &ScheduleResult) -> bool {
    match current {
        Placement::Clusters(names) => *names != result.placement(),
        Placement::Selector(_) => true,
    }
}

fn sets_value(o: &ClusterOverride, path: &str, value: i64) -> bool {
    o.op != OverrideOp::Remove && o.path.to_pointer() == path && o.value.as_ref().and_then(Value::as_i64) == Some(value)
}

/// Compare scheduler-owned override paths value for value. Overrides on any
/// other path are ignored.
pub fn override_update_needed(current: &ClusterOverrides, result: &ScheduleResult) -> bool {
    let owned = scheduled_paths(result);
    let desired = scheduled_values(result);
    current.iter().any(|(cluster, list)| {
        list.iter().any(|o| {
            let pointer = o.path.to_pointer();
            if !owned.contains(&pointer.as_str()) {
                return false;
            }
            let want = desired.get(cluster).and_then(|vals| vals.iter().find(|(p, _)| pointer == *p));
            !matches!(want, Some((p, v)) if sets_value(o, p, *v))
        })
    }) || desired.iter().any(|(cluster, vals)| {
        let list = current.get(cluster).map(Vec::as_slice).unwrap_or_default();
        vals.iter().any(|(p, v)| !list.iter().any(|o| sets_value(o, p, *v)))
    })
}

/// Replace scheduler-owned overrides with `result`, keeping every other override.
pub fn merge_overrides(current: &ClusterOverrides, result: &ScheduleResult) -> ClusterOverrides {
    let owned = scheduled_paths(result);
    let mut out: ClusterOverrides = current
        .iter()
        .map(|(c, list)| {
            let kept: Vec<ClusterOverride> = list.iter().filter(|o| !owned.contains(&o.path.to_pointer().as_str())).cloned().collect();
            (c.clone(), kept)
        })
        .filter(|(_, list)| !list.is_empty())
        .collect();
    for (cluster, vals) in scheduled_values(result) {
        let list = out.entry(cluster).or_default();
        for (path, value) in vals {
            if let Ok(path) = OverridePath::parse(path) {
                list.push(ClusterOverride::replace(path, Value::from(value)));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfed_core::QualifiedName;
    use kfed_schema::{parse_overrides, parse_placement, render_overrides, render_placement};
    use serde_json::json;

    fn names(list: &[&str]) -> BTreeSet<String> { list.iter().map(|s| s.to_string()).collect() }

    fn pref(total: ScheduleTotal, clusters: &[(&str, i64, i64)]) -> SchedulePreference {
        SchedulePreference {
            name: QualifiedName::new(Some("ns"), "web"),
            target_kind: None,
            total,
            clusters: clusters
                .iter()
                .map(|(c, weight, min_replicas)| (c.to_string(), ClusterPreference { weight: *weight, min_replicas: *min_replicas }))
                .collect(),
        }
    }

    fn replicas(result: &ScheduleResult) -> BTreeMap<String, i64> {
        match result {
            ScheduleResult::Replicas(m) => m.clone(),
            other => panic!("expected replicas, got {:?}", other),
        }
    }

    #[test]
    fn even_split_is_balanced_and_deterministic() {
        for n in 1..6usize {
            let ready: BTreeSet<String> = (0..n).map(|i| format!("c{}", i)).collect();
            for total in 0..13 {
                let r = replicas(&schedule(&pref(ScheduleTotal::Replicas(total), &[]), &ready));
                assert_eq!(r.values().sum::<i64>(), total);
                let (lo, hi) = (r.values().min().copied().unwrap(), r.values().max().copied().unwrap());
                assert!(hi - lo <= 1);
                assert_eq!(r, replicas(&schedule(&pref(ScheduleTotal::Replicas(total), &[]), &ready)));
            }
        }
        let r = replicas(&schedule(&pref(ScheduleTotal::Replicas(5), &[]), &names(&["b", "a", "c"])));
        assert_eq!(r, BTreeMap::from([("a".into(), 2), ("b".into(), 2), ("c".into(), 1)]));
    }

    #[test]
    fn weights_split_the_total() {
        let r = replicas(&schedule(&pref(ScheduleTotal::Replicas(6), &[("A", 2, 0), ("B", 1, 0)]), &names(&["A", "B"])));
        assert_eq!(r, BTreeMap::from([("A".into(), 4), ("B".into(), 2)]));
    }

    #[test]
    fn minimums_come_first() {
        let r = replicas(&schedule(&pref(ScheduleTotal::Replicas(6), &[("A", 2, 3), ("B", 1, 3)]), &names(&["A", "B"])));
        assert_eq!(r, BTreeMap::from([("A".into(), 3), ("B".into(), 3)]));
        // minimums exceeding the total are honoured heaviest first
        let r = replicas(&schedule(&pref(ScheduleTotal::Replicas(4), &[("A", 1, 3), ("B", 2, 3)]), &names(&["A", "B"])));
        assert_eq!(r, BTreeMap::from([("A".into(), 1), ("B".into(), 3)]));
    }

    #[test]
    fn rounding_leftovers_go_to_heaviest_then_by_name() {
        let r = replicas(&schedule(
            &pref(ScheduleTotal::Replicas(5), &[("a", 1, 0), ("b", 1, 0), ("c", 2, 0)]),
            &names(&["a", "b", "c"]),
        ));
        // floors: a=1 b=1 c=2, one left over for c
        assert_eq!(r, BTreeMap::from([("a".into(), 1), ("b".into(), 1), ("c".into(), 3)]));
        let r = replicas(&schedule(&pref(ScheduleTotal::Replicas(1), &[("b", 1, 0), ("a", 1, 0)]), &names(&["a", "b"])));
        assert_eq!(r, BTreeMap::from([("a".into(), 1), ("b".into(), 0)]));
    }

    #[test]
    fn unready_and_unlisted_clusters_are_excluded() {
        let p = pref(ScheduleTotal::Replicas(6), &[("A", 2, 2), ("B", 1, 0)]);
        let r = replicas(&schedule(&p, &names(&["B", "C"])));
        assert_eq!(r, BTreeMap::from([("B".into(), 6)]));
        let wild = pref(ScheduleTotal::Replicas(6), &[("A", 2, 0), ("*", 1, 0)]);
        let r = replicas(&schedule(&wild, &names(&["A", "B", "C"])));
        // floors 3/1/1, the leftover unit goes to the heaviest
        assert_eq!(r, BTreeMap::from([("A".into(), 4), ("B".into(), 1), ("C".into(), 1)]));
        assert!(replicas(&schedule(&p, &names(&[]))).is_empty());
    }

    #[test]
    fn zero_weights_split_evenly_after_minimums() {
        let r = replicas(&schedule(&pref(ScheduleTotal::Replicas(5), &[("a", 0, 1), ("b", 0, 0)]), &names(&["a", "b"])));
        assert_eq!(r, BTreeMap::from([("a".into(), 3), ("b".into(), 2)]));
    }

    #[test]
    fn job_totals_are_distributed_independently() {
        let p = pref(ScheduleTotal::Jobs { parallelism: 2, completions: 9 }, &[("a", 2, 0), ("b", 1, 0)]);
        let ScheduleResult::Jobs(m) = schedule(&p, &names(&["a", "b"])) else { panic!("expected jobs") };
        assert_eq!(m["a"], JobAllocation { parallelism: 2, completions: 6 });
        assert_eq!(m["b"], JobAllocation { parallelism: 0, completions: 3 });
        assert_eq!(schedule(&p, &names(&["a", "b"])).placement(), names(&["a", "b"]));
    }

    #[test]
    fn zero_allocations_stay_out_of_placement() {
        let result = schedule(&pref(ScheduleTotal::Replicas(1), &[]), &names(&["a", "b"]));
        assert_eq!(result.placement(), names(&["a"]));
        let merged = merge_overrides(&ClusterOverrides::new(), &result);
        assert!(!merged.contains_key("b"));
    }

    #[test]
    fn rendered_result_needs_no_update() {
        let result = schedule(&pref(ScheduleTotal::Replicas(7), &[("a", 2, 0), ("b", 1, 1)]), &names(&["a", "b", "c"]));
        let user = parse_overrides(Some(&json!([
            { "clusterName": "a", "clusterOverrides": [{ "path": "/metadata/labels/tier", "value": "gold" }] },
            { "clusterName": "c", "clusterOverrides": [{ "path": "/spec/replicas", "value": 9 }] }
        ])))
        .unwrap();
        assert!(override_update_needed(&user, &result));
        assert!(placement_update_needed(&Placement::default(), &result));

        let placement = parse_placement(Some(&render_placement(&Placement::Clusters(result.placement())))).unwrap();
        let overrides = parse_overrides(Some(&render_overrides(&merge_overrides(&user, &result)))).unwrap();
        assert!(!placement_update_needed(&placement, &result));
        assert!(!override_update_needed(&overrides, &result));
        assert_eq!(overrides["a"][0].path.to_pointer(), "/metadata/labels/tier");
        assert!(!overrides.contains_key("c"));
    }

    #[test]
    fn only_owned_paths_decide_override_updates() {
        let result = schedule(&pref(ScheduleTotal::Replicas(2), &[]), &names(&["a", "b"]));
        let mut current = merge_overrides(&ClusterOverrides::new(), &result);
        let extra = parse_overrides(Some(&json!([
            { "clusterName": "c", "clusterOverrides": [{ "path": "/metadata/labels/tier", "value": "gold" }] }
        ])))
        .unwrap();
        current.extend(extra);
        assert!(!override_update_needed(&current, &result));

        let leftover = parse_overrides(Some(&json!([
            { "clusterName": "c", "clusterOverrides": [{ "path": "/spec/replicas", "value": 1 }] }
        ])))
        .unwrap();
        current.extend(leftover);
        assert!(override_update_needed(&current, &result));
    }

    #[test]
    fn changed_values_need_an_update() {
        let before = schedule(&pref(ScheduleTotal::Replicas(4), &[]), &names(&["a", "b"]));
        let after = schedule(&pref(ScheduleTotal::Replicas(6), &[]), &names(&["a", "b"]));
        let current = merge_overrides(&ClusterOverrides::new(), &before);
        assert!(!placement_update_needed(&Placement::Clusters(before.placement()), &after));
        assert!(override_update_needed(&current, &after));
        assert!(placement_update_needed(&Placement::Selector(BTreeMap::new()), &after));
    }
}
