use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{DependencyKind, Metadata, MetadataCommand, PackageId};

/// Each package may not reach any of the listed crates through normal or build dependencies.
const RULES: &[(&str, &[&str])] = &[
    (
        "robokache-policy",
        &[
            "robokache-auth",
            "robokache-store",
            "robokache-gateway",
            "axum",
            "reqwest",
            "sqlx",
        ],
    ),
    (
        "robokache-contracts",
        &[
            "robokache-auth",
            "robokache-policy",
            "robokache-store",
            "robokache-gateway",
            "sqlx",
        ],
    ),
    ("robokache-store", &["robokache-auth", "robokache-gateway", "axum"]),
    ("robokache-auth", &["robokache-store", "robokache-gateway", "sqlx"]),
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let graph = DependencyGraph::from_metadata(&metadata)?;

    let mut failed = false;
    for (package, forbidden) in RULES {
        let violations = graph.forbidden_reachable(package, forbidden)?;
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                package,
                forbidden.join(", ")
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

struct DependencyGraph {
    roots: HashMap<String, PackageId>,
    names: HashMap<PackageId, String>,
    edges: HashMap<PackageId, Vec<PackageId>>,
}

impl DependencyGraph {
    fn from_metadata(metadata: &Metadata) -> Result<Self> {
        let resolve = metadata
            .resolve
            .as_ref()
            .context("`cargo metadata` did not include a resolved dependency graph")?;

        let roots = metadata
            .workspace_packages()
            .into_iter()
            .map(|p| (p.name.to_string(), p.id.clone()))
            .collect();

        let names = metadata
            .packages
            .iter()
            .map(|p| (p.id.clone(), p.name.to_string()))
            .collect();

        let edges = resolve
            .nodes
            .iter()
            .map(|node| {
                let deps = node
                    .deps
                    .iter()
                    .filter(|dep| {
                        dep.dep_kinds
                            .iter()
                            .any(|info| info.kind != DependencyKind::Development)
                    })
                    .map(|dep| dep.pkg.clone())
                    .collect();
                (node.id.clone(), deps)
            })
            .collect();

        Ok(Self {
            roots,
            names,
            edges,
        })
    }

    fn forbidden_reachable(&self, package: &str, forbidden: &[&str]) -> Result<Vec<String>> {
        let start = self
            .roots
            .get(package)
            .with_context(|| format!("package `{}` not found in workspace", package))?;

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start.clone());
        visited.insert(start.clone());

        let mut violations = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(deps) = self.edges.get(&current) else {
                continue;
            };

            for dep in deps.iter().cloned() {
                if !visited.insert(dep.clone()) {
                    continue;
                }

                if let Some(name) = self.names.get(&dep)
                    && forbidden.contains(&name.as_str())
                {
                    violations.push(name.clone());
                }

                queue.push_back(dep);
            }
        }

        violations.sort();
        violations.dedup();
        Ok(violations)
    }
}
