//! Module dependency resolution.
//!
//! An edge `A -> B` means "A requires B applied first". Ordering is Kahn's
//! algorithm with the ready set kept sorted, so modules of equal rank come out
//! in ascending slug order.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EngineError, EngineResult};
use crate::models::definition::ModuleDef;

/// Orders `selected` for application. Modules in `installed` satisfy
/// dependencies and are left out of the result.
///
/// Checks run in this order, each reported before any mutation can happen:
/// unknown slugs, conflicts (every pair), missing dependencies, cycles.
pub fn resolve(
    modules: &BTreeMap<String, ModuleDef>,
    selected: &BTreeSet<String>,
    installed: &BTreeSet<String>,
) -> EngineResult<Vec<String>> {
    for slug in selected {
        if !modules.get(slug).is_some_and(|m| m.active) {
            return Err(EngineError::UnknownModule(slug.clone()));
        }
    }

    let pending: BTreeSet<&String> = selected.iter().filter(|s| !installed.contains(*s)).collect();

    let pairs = conflicting_pairs(modules, &pending, installed);
    if !pairs.is_empty() {
        return Err(EngineError::ConflictingModules { pairs });
    }

    for &slug in &pending {
        let mut deps: Vec<&String> = modules[slug.as_str()].dependencies.iter().collect();
        deps.sort();
        if let Some(missing) = deps
            .into_iter()
            .find(|&d| !pending.contains(d) && !installed.contains(d))
        {
            return Err(EngineError::MissingDependency {
                module: slug.clone(),
                missing: missing.clone(),
            });
        }
    }

    // requires[a] = pending modules a waits for; dependents[b] = modules waiting on b
    let mut requires: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for &slug in &pending {
        let deps: BTreeSet<&str> = modules[slug.as_str()]
            .dependencies
            .iter()
            .filter(|d| pending.contains(d))
            .map(String::as_str)
            .collect();
        for &d in &deps {
            dependents.entry(d).or_default().insert(slug.as_str());
        }
        requires.insert(slug.as_str(), deps);
    }

    let mut in_degree: BTreeMap<&str, usize> =
        requires.iter().map(|(slug, deps)| (*slug, deps.len())).collect();
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(s, _)| *s)
        .collect();
    let mut order = Vec::with_capacity(requires.len());

    while let Some(slug) = ready.pop_first() {
        order.push(slug.to_string());
        for &next in dependents.get(slug).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() < requires.len() {
        let done: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let remaining: BTreeSet<&str> = requires.keys().copied().filter(|s| !done.contains(s)).collect();
        return Err(EngineError::CircularDependency {
            cycle: cyclic_nodes(&requires, &remaining),
        });
    }

    Ok(order)
}

/// Every conflicting pair among `pending`, and between `pending` and
/// `installed`. A pair counts if either side lists the other. Sorted, each
/// pair once with the smaller slug first.
fn conflicting_pairs(
    modules: &BTreeMap<String, ModuleDef>,
    pending: &BTreeSet<&String>,
    installed: &BTreeSet<String>,
) -> Vec<(String, String)> {
    let lists = |a: &str, b: &str| {
        modules
            .get(a)
            .is_some_and(|m| m.conflicts.iter().any(|c| c == b))
    };
    let mut pairs = BTreeSet::new();
    for &a in pending {
        for b in pending.iter().copied().chain(installed.iter()) {
            if a == b {
                continue;
            }
            if lists(a.as_str(), b.as_str()) || lists(b.as_str(), a.as_str()) {
                let (x, y) = if a < b { (a, b) } else { (b, a) };
                pairs.insert((x.clone(), y.clone()));
            }
        }
    }
    pairs.into_iter().collect()
}

/// Nodes left after Kahn's algorithm include modules that merely depend on a
/// cycle. Keep only those that can reach themselves.
fn cyclic_nodes(requires: &BTreeMap<&str, BTreeSet<&str>>, remaining: &BTreeSet<&str>) -> Vec<String> {
    remaining
        .iter()
        .filter(|start| {
            let mut stack: Vec<&str> = requires[**start]
                .iter()
                .copied()
                .filter(|n| remaining.contains(n))
                .collect();
            let mut seen = BTreeSet::new();
            while let Some(n) = stack.pop() {
                if n == **start {
                    return true;
                }
                if seen.insert(n) {
                    stack.extend(requires[n].iter().copied().filter(|m| remaining.contains(m)));
                }
            }
            false
        })
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::migration::Version;

    fn module(slug: &str, deps: &[&str], conflicts: &[&str]) -> (String, ModuleDef) {
        (
            slug.to_string(),
            ModuleDef {
                slug: slug.into(),
                version: Version::new(1, 0, 0),
                active: true,
                dependencies: deps.iter().map(|s| s.to_string()).collect(),
                conflicts: conflicts.iter().map(|s| s.to_string()).collect(),
                units: vec![],
            },
        )
    }

    fn set(slugs: &[&str]) -> BTreeSet<String> {
        slugs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dependencies_first_then_by_slug() {
        let modules: BTreeMap<_, _> = [
            module("reports", &["finance", "members"], &[]),
            module("finance", &[], &[]),
            module("members", &[], &[]),
            module("alerts", &[], &[]),
        ]
        .into_iter()
        .collect();
        let order = resolve(&modules, &set(&["reports", "finance", "members", "alerts"]), &set(&[])).unwrap();
        assert_eq!(order, vec!["alerts", "finance", "members", "reports"]);
    }

    #[test]
    fn every_dependency_precedes_its_dependent() {
        let modules: BTreeMap<_, _> = [
            module("a", &["b", "c"], &[]),
            module("b", &["d"], &[]),
            module("c", &["d"], &[]),
            module("d", &[], &[]),
            module("e", &["a"], &[]),
        ]
        .into_iter()
        .collect();
        let order = resolve(&modules, &set(&["a", "b", "c", "d", "e"]), &set(&[])).unwrap();
        let pos = |s: &str| order.iter().position(|o| o == s).unwrap();
        for (slug, m) in &modules {
            for dep in &m.dependencies {
                assert!(pos(dep.as_str()) < pos(slug.as_str()), "{dep} must precede {slug}");
            }
        }
    }

    #[test]
    fn installed_modules_satisfy_dependencies() {
        let modules: BTreeMap<_, _> = [
            module("election_campaign", &["membership_management"], &[]),
            module("membership_management", &[], &[]),
        ]
        .into_iter()
        .collect();
        let order = resolve(
            &modules,
            &set(&["election_campaign", "membership_management"]),
            &set(&["membership_management"]),
        )
        .unwrap();
        assert_eq!(order, vec!["election_campaign"]);
    }

    #[test]
    fn missing_dependency_names_both_modules() {
        let modules: BTreeMap<_, _> = [
            module("election_campaign", &["membership_management"], &[]),
            module("membership_management", &[], &[]),
            module("financial_tracking", &[], &[]),
        ]
        .into_iter()
        .collect();
        let err = resolve(&modules, &set(&["financial_tracking", "election_campaign"]), &set(&[])).unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingDependency { ref module, ref missing }
                if module == "election_campaign" && missing == "membership_management"
        ));
    }

    #[test]
    fn cycle_reports_only_cyclic_nodes() {
        let modules: BTreeMap<_, _> = [
            module("a", &["b"], &[]),
            module("b", &["c"], &[]),
            module("c", &["a"], &[]),
            module("d", &["a"], &[]),
            module("e", &[], &[]),
        ]
        .into_iter()
        .collect();
        let err = resolve(&modules, &set(&["a", "b", "c", "d", "e"]), &set(&[])).unwrap_err();
        match err {
            EngineError::CircularDependency { cycle } => assert_eq!(cycle, vec!["a", "b", "c"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn all_conflicting_pairs_reported_once() {
        let modules: BTreeMap<_, _> = [
            module("a", &[], &["b"]),
            module("b", &[], &["a"]),
            module("c", &[], &["d"]),
            module("d", &[], &[]),
            module("x", &[], &[]),
        ]
        .into_iter()
        .collect();
        let err = resolve(&modules, &set(&["a", "b", "c", "x"]), &set(&["d"])).unwrap_err();
        match err {
            EngineError::ConflictingModules { pairs } => assert_eq!(
                pairs,
                vec![("a".to_string(), "b".to_string()), ("c".to_string(), "d".to_string())]
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_module_fails_first() {
        let modules: BTreeMap<_, _> = [module("a", &["b"], &[]), module("b", &[], &[])].into_iter().collect();
        assert!(matches!(
            resolve(&modules, &set(&["a", "ghost"]), &set(&[])),
            Err(EngineError::UnknownModule(m)) if m == "ghost"
        ));
    }
}
