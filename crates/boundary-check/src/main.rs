use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{Metadata, MetadataCommand, PackageId};

/// Pure crates that must stay free of I/O, runtime and service dependencies.
const PURE_PACKAGES: &[&str] = &["cdc-contracts", "cdc-merge"];
const FORBIDDEN_DEPENDENCIES: &[&str] = &[
    "axum",
    "cdc-gateway",
    "cdc-ledger",
    "reqwest",
    "sqlx",
    "tokio",
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let mut failed = false;
    for package in PURE_PACKAGES {
        let violations = forbidden_reachable(&metadata, package)?;
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                package,
                FORBIDDEN_DEPENDENCIES.join(", ")
            );
        } else {
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                package,
                violations.join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn forbidden_reachable(metadata: &Metadata, package_name: &str) -> Result<Vec<String>> {
    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let root = metadata
        .packages
        .iter()
        .find(|p| p.name == package_name)
        .with_context(|| format!("package `{}` not found in workspace", package_name))?;

    let id_to_name: HashMap<&PackageId, &str> = metadata
        .packages
        .iter()
        .map(|p| (&p.id, p.name.as_str()))
        .collect();

    let adjacency: HashMap<&PackageId, Vec<&PackageId>> = resolve
        .nodes
        .iter()
        .map(|node| (&node.id, node.deps.iter().map(|dep| &dep.pkg).collect()))
        .collect();

    let mut visited = HashSet::from([&root.id]);
    let mut queue = VecDeque::from([&root.id]);
    let mut violations = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(current) else {
            continue;
        };

        for dep in deps.iter().copied() {
            if !visited.insert(dep) {
                continue;
            }

            if let Some(name) = id_to_name.get(dep)
                && FORBIDDEN_DEPENDENCIES.contains(name)
            {
                violations.push((*name).to_string());
            }

            queue.push_back(dep);
        }
    }

    violations.sort();
    violations.dedup();
    Ok(violations)
}
