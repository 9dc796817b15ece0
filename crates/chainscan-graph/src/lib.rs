//! Dependency graph analysis
//!
//! Read-only traversals over a resolved `DependencyArena`: the package set,
//! circular dependencies, version conflicts, and impact paths from the root
//! to a target package. Visualisation is a DOT rendering with a caller-
//! chosen depth cap; no renderer is bundled.

use chainscan_core::PackageRef;
use chainscan_resolver::{DependencyArena, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A name resolved to more than one version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionConflict {
    pub name: String,
    /// Each conflicting version with one name-path from the root to it
    pub versions: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphAnalysis {
    pub package_count: usize,
    pub max_depth: usize,
    pub cycles: Vec<Vec<PackageRef>>,
    pub version_conflicts: Vec<VersionConflict>,
}

/// Full analysis pass over the arena
pub fn analyze(arena: &DependencyArena) -> GraphAnalysis {
    GraphAnalysis {
        package_count: arena.len().saturating_sub(1),
        max_depth: arena.nodes().map(|(_, n)| n.depth).max().unwrap_or(0),
        cycles: detect_cycles(arena),
        version_conflicts: version_conflicts(arena),
    }
}

/// Every distinct `(name, version)` pair in the tree, root excluded
pub fn package_set(arena: &DependencyArena) -> BTreeSet<(String, String)> {
    arena
        .packages()
        .into_iter()
        .map(|p| (p.name, p.version))
        .collect()
}

/// Minimal cycles found by DFS with an explicit recursion stack.
/// Each cycle is reported once regardless of the entry point.
pub fn detect_cycles(arena: &DependencyArena) -> Vec<Vec<PackageRef>> {
    let mut cycles: Vec<Vec<PackageRef>> = Vec::new();
    let mut seen_cycles: HashSet<BTreeSet<NodeId>> = HashSet::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = Vec::new();
    let mut on_stack: HashSet<NodeId> = HashSet::new();

    fn dfs(
        arena: &DependencyArena,
        node: NodeId,
        visited: &mut HashSet<NodeId>,
        stack: &mut Vec<NodeId>,
        on_stack: &mut HashSet<NodeId>,
        seen_cycles: &mut HashSet<BTreeSet<NodeId>>,
        cycles: &mut Vec<Vec<PackageRef>>,
    ) {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        for &child in arena.node(node).dependencies.values() {
            if on_stack.contains(&child) {
                // back edge: the cycle is the stack slice from the child on
                let start = stack.iter().position(|&n| n == child).unwrap_or(0);
                let members: Vec<NodeId> = stack[start..].to_vec();
                let key: BTreeSet<NodeId> = members.iter().copied().collect();
                if seen_cycles.insert(key) {
                    cycles.push(
                        members
                            .iter()
                            .map(|&id| arena.node(id).package.clone())
                            .collect(),
                    );
                }
            } else if !visited.contains(&child) {
                dfs(arena, child, visited, stack, on_stack, seen_cycles, cycles);
            }
        }

        stack.pop();
        on_stack.remove(&node);
    }

    dfs(
        arena,
        arena.root(),
        &mut visited,
        &mut stack,
        &mut on_stack,
        &mut seen_cycles,
        &mut cycles,
    );

    // disconnected nodes can still form cycles when the tree was truncated
    let all: Vec<NodeId> = arena.nodes().map(|(id, _)| id).collect();
    for id in all {
        if !visited.contains(&id) {
            dfs(
                arena,
                id,
                &mut visited,
                &mut stack,
                &mut on_stack,
                &mut seen_cycles,
                &mut cycles,
            );
        }
    }

    cycles
}

/// Names resolved to more than one version, with a sample path per version
pub fn version_conflicts(arena: &DependencyArena) -> Vec<VersionConflict> {
    let mut by_name: HashMap<String, Vec<NodeId>> = HashMap::new();
    for (id, node) in arena.nodes() {
        if id == arena.root() {
            continue;
        }
        by_name
            .entry(node.package.normalized().name)
            .or_default()
            .push(id);
    }

    let mut conflicts: Vec<VersionConflict> = by_name
        .into_iter()
        .filter(|(_, ids)| {
            let versions: HashSet<&str> = ids
                .iter()
                .map(|&id| arena.node(id).package.version.as_str())
                .collect();
            versions.len() > 1
        })
        .map(|(name, ids)| VersionConflict {
            name,
            versions: ids
                .iter()
                .map(|&id| {
                    let node = arena.node(id);
                    (node.package.version.clone(), name_path(arena, id))
                })
                .collect(),
        })
        .collect();
    conflicts.sort_by(|a, b| a.name.cmp(&b.name));
    conflicts
}

/// All name-paths from the root to every node matching `target`
pub fn paths_to_target(arena: &DependencyArena, target: &PackageRef) -> Vec<Vec<String>> {
    let want = target.normalized();
    let mut paths = Vec::new();
    for (id, node) in arena.nodes() {
        if id == arena.root() {
            continue;
        }
        let have = node.package.normalized();
        if have.name == want.name && have.version == want.version {
            for path in &node.parent_paths {
                paths.push(
                    path.iter()
                        .map(|&pid| arena.node(pid).package.name.clone())
                        .collect(),
                );
            }
        }
    }
    paths
}

fn name_path(arena: &DependencyArena, id: NodeId) -> Vec<String> {
    arena
        .node(id)
        .parent_paths
        .first()
        .map(|path| {
            path.iter()
                .map(|&pid| arena.node(pid).package.name.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// DOT rendering, depth-capped. Render with any Graphviz tool:
/// `dot -Tsvg graph.dot -o graph.svg`
pub fn to_dot(arena: &DependencyArena, max_depth: usize) -> String {
    let mut out = String::new();
    out.push_str("digraph dependencies {\n");
    out.push_str("  rankdir=LR;\n");
    out.push_str("  node [shape=box, style=rounded];\n\n");

    for (id, node) in arena.nodes() {
        if node.depth > max_depth {
            continue;
        }
        let label = format!("{}\\n{}", node.package.name, node.package.version);
        if id == arena.root() {
            out.push_str(&format!(
                "  n{} [label=\"{}\", style=\"filled,rounded\", fillcolor=lightblue];\n",
                id,
                dot_escape(&label)
            ));
        } else {
            out.push_str(&format!("  n{} [label=\"{}\"];\n", id, dot_escape(&label)));
        }
    }
    out.push('\n');
    for (id, node) in arena.nodes() {
        if node.depth >= max_depth {
            continue;
        }
        for &child in node.dependencies.values() {
            if arena.node(child).depth <= max_depth {
                out.push_str(&format!("  n{} -> n{};\n", id, child));
            }
        }
    }
    out.push_str("}\n");
    out
}

fn dot_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
