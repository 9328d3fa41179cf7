use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use anyhow::{Context, Result};
use cargo_metadata::MetadataCommand;

/// A package and the crates it must never reach, directly or transitively.
struct Boundary {
    package: &'static str,
    forbidden: &'static [&'static str],
}

const BOUNDARIES: &[Boundary] = &[
    Boundary {
        package: "taskline-contracts",
        forbidden: &["sqlx", "axum", "tokio", "taskline-policy", "taskline-routines"],
    },
    Boundary {
        package: "taskline-policy",
        forbidden: &["sqlx", "axum", "taskline-routines", "taskline-gateway"],
    },
    Boundary {
        package: "taskline-routines",
        forbidden: &["axum", "taskline-policy", "taskline-gateway"],
    },
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let id_to_name: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.id.clone(), p.name.as_str()))
        .collect();

    let adjacency: HashMap<_, _> = resolve
        .nodes
        .iter()
        .map(|node| {
            let deps: Vec<_> = node.deps.iter().map(|dep| dep.pkg.clone()).collect();
            (node.id.clone(), deps)
        })
        .collect();

    let mut failed = false;
    for boundary in BOUNDARIES {
        let package = metadata
            .packages
            .iter()
            .find(|p| p.name == boundary.package)
            .with_context(|| format!("package `{}` not found in workspace", boundary.package))?;

        let violations = forbidden_reachable(
            &package.id,
            &adjacency,
            |id| id_to_name.get(id).copied(),
            boundary.forbidden,
        );

        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                boundary.package,
                boundary.forbidden.join(", ")
            );
        } else {
            failed = true;
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                boundary.package,
                violations.join(", ")
            );
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Breadth-first walk from `root`; returns the sorted names of every
/// forbidden crate it reaches.
fn forbidden_reachable<'a, Id, F>(
    root: &Id,
    adjacency: &HashMap<Id, Vec<Id>>,
    name_of: F,
    forbidden: &[&str],
) -> Vec<String>
where
    Id: Clone + Eq + Hash,
    F: Fn(&Id) -> Option<&'a str>,
{
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(root.clone());
    visited.insert(root.clone());

    let mut violations = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(&current) else {
            continue;
        };

        for dep in deps.iter().cloned() {
            if !visited.insert(dep.clone()) {
                continue;
            }

            if let Some(name) = name_of(&dep)
                && forbidden.contains(&name)
            {
                violations.push(name.to_string());
            }

            queue.push_back(dep);
        }
    }

    violations.sort();
    violations.dedup();
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(
        edges: &[(&'static str, &[&'static str])],
    ) -> HashMap<&'static str, Vec<&'static str>> {
        edges
            .iter()
            .map(|(from, to)| (*from, to.to_vec()))
            .collect()
    }

    #[test]
    fn transitive_edges_are_reported_once() {
        let adjacency = graph(&[
            ("taskline-policy", &["taskline-contracts", "helper"]),
            ("helper", &["sqlx", "taskline-contracts"]),
            ("taskline-contracts", &["serde"]),
            ("sqlx", &[]),
        ]);

        let violations = forbidden_reachable(
            &"taskline-policy",
            &adjacency,
            |id| Some(*id),
            &["sqlx", "taskline-routines"],
        );
        assert_eq!(violations, vec!["sqlx".to_string()]);
    }

    #[test]
    fn clean_graph_has_no_violations() {
        let adjacency = graph(&[
            ("taskline-policy", &["taskline-contracts"]),
            ("taskline-contracts", &["serde", "time"]),
        ]);

        assert!(
            forbidden_reachable(&"taskline-policy", &adjacency, |id| Some(*id), &["sqlx"])
                .is_empty()
        );
    }
}
