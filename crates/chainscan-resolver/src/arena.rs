//! Arena-backed dependency tree
//!
//! Nodes are stored once per `(name, resolved version)` and referenced by
//! index, so shared dependencies and cycles carry no ownership problems.
//! `parent_paths` holds every distinct id-path from the root to the node,
//! bounded per node so pathological diamond graphs cannot blow up memory.

use chainscan_core::PackageRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub type NodeId = usize;

/// Paths kept per node; beyond this the set is representative, not complete
const MAX_PATHS_PER_NODE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Resolved,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyNode {
    pub package: PackageRef,
    /// `min(path length) - 1` over `parent_paths`
    pub depth: usize,
    /// child name → node id; names unique within a parent
    pub dependencies: BTreeMap<String, NodeId>,
    pub parent_paths: Vec<Vec<NodeId>>,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyArena {
    nodes: Vec<DependencyNode>,
    #[serde(skip)]
    index: HashMap<(String, String), NodeId>,
    root: NodeId,
}

impl DependencyArena {
    pub fn new(root_package: PackageRef) -> Self {
        let root_node = DependencyNode {
            package: root_package,
            depth: 0,
            dependencies: BTreeMap::new(),
            parent_paths: vec![vec![0]],
            resolution: Resolution::Resolved,
        };
        Self {
            nodes: vec![root_node],
            index: HashMap::new(),
            root: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &DependencyNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &DependencyNode)> {
        self.nodes.iter().enumerate()
    }

    fn identity(package: &PackageRef) -> (String, String) {
        let n = package.normalized();
        (n.name, n.version)
    }

    pub fn find(&self, name: &str, version: &str) -> Option<NodeId> {
        let probe = PackageRef::new(name, version, self.nodes[self.root].package.ecosystem);
        self.index.get(&Self::identity(&probe)).copied()
    }

    /// Attach `package` as `child_name` under `parent`. Returns the node id
    /// and whether the node was newly created; an existing node is linked
    /// in place and gains the new paths.
    pub fn attach(
        &mut self,
        parent: NodeId,
        child_name: &str,
        package: PackageRef,
        resolution: Resolution,
    ) -> (NodeId, bool) {
        let key = Self::identity(&package);
        let parent_paths: Vec<Vec<NodeId>> = self.nodes[parent].parent_paths.clone();
        let parent_depth = self.nodes[parent].depth;

        if let Some(&existing) = self.index.get(&key) {
            self.nodes[parent]
                .dependencies
                .insert(child_name.to_string(), existing);
            for base in parent_paths {
                if self.nodes[existing].parent_paths.len() >= MAX_PATHS_PER_NODE {
                    break;
                }
                let mut path = base;
                path.push(existing);
                if !self.nodes[existing].parent_paths.contains(&path) {
                    self.nodes[existing].parent_paths.push(path);
                }
            }
            if parent_depth + 1 < self.nodes[existing].depth {
                self.nodes[existing].depth = parent_depth + 1;
            }
            return (existing, false);
        }

        let id = self.nodes.len();
        let paths = parent_paths
            .into_iter()
            .take(MAX_PATHS_PER_NODE)
            .map(|mut base| {
                base.push(id);
                base
            })
            .collect();
        self.nodes.push(DependencyNode {
            package,
            depth: parent_depth + 1,
            dependencies: BTreeMap::new(),
            parent_paths: paths,
            resolution,
        });
        self.nodes[parent]
            .dependencies
            .insert(child_name.to_string(), id);
        self.index.insert(key, id);
        (id, true)
    }

    /// Every package in the tree, root excluded
    pub fn packages(&self) -> Vec<PackageRef> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(id, _)| *id != self.root)
            .map(|(_, n)| n.package.clone())
            .collect()
    }

    /// Rebuild the lookup index; required after deserialisation
    pub fn reindex(&mut self) {
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(id, _)| *id != self.root)
            .map(|(id, n)| (Self::identity(&n.package), id))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_core::Ecosystem;

    fn arena() -> DependencyArena {
        DependencyArena::new(PackageRef::new("root", "1.0.0", Ecosystem::Npm))
    }

    fn pkg(name: &str, version: &str) -> PackageRef {
        PackageRef::new(name, version, Ecosystem::Npm)
    }

    #[test]
    fn test_attach_builds_paths_and_depth() {
        let mut arena = arena();
        let (a, created) = arena.attach(0, "a", pkg("a", "1.0.0"), Resolution::Resolved);
        assert!(created);
        let (b, _) = arena.attach(a, "b", pkg("b", "2.0.0"), Resolution::Resolved);

        assert_eq!(arena.node(a).depth, 1);
        assert_eq!(arena.node(b).depth, 2);
        assert_eq!(arena.node(b).parent_paths, vec![vec![0, a, b]]);
    }

    #[test]
    fn test_reattach_links_existing_node() {
        let mut arena = arena();
        let (a, _) = arena.attach(0, "a", pkg("a", "1.0.0"), Resolution::Resolved);
        let (b, _) = arena.attach(0, "b", pkg("b", "1.0.0"), Resolution::Resolved);
        let (shared1, created1) = arena.attach(a, "shared", pkg("shared", "3.0.0"), Resolution::Resolved);
        let (shared2, created2) = arena.attach(b, "shared", pkg("shared", "3.0.0"), Resolution::Resolved);

        assert!(created1);
        assert!(!created2);
        assert_eq!(shared1, shared2);
        assert_eq!(arena.node(shared1).parent_paths.len(), 2);
    }

    #[test]
    fn test_distinct_versions_are_distinct_nodes() {
        let mut arena = arena();
        let (a, _) = arena.attach(0, "a", pkg("a", "1.0.0"), Resolution::Resolved);
        let (dep1, _) = arena.attach(0, "dep", pkg("dep", "1.0.0"), Resolution::Resolved);
        let (dep2, _) = arena.attach(a, "dep", pkg("dep", "2.0.0"), Resolution::Resolved);
        assert_ne!(dep1, dep2);
        assert_eq!(arena.find("dep", "1.0.0"), Some(dep1));
        assert_eq!(arena.find("dep", "2.0.0"), Some(dep2));
    }

    #[test]
    fn test_depth_is_min_path_length_minus_one() {
        let mut arena = arena();
        let (a, _) = arena.attach(0, "a", pkg("a", "1.0.0"), Resolution::Resolved);
        let (b, _) = arena.attach(a, "b", pkg("b", "1.0.0"), Resolution::Resolved);
        // b is also a direct dependency of the root
        arena.attach(0, "b", pkg("b", "1.0.0"), Resolution::Resolved);

        let node = arena.node(b);
        let min_len = node.parent_paths.iter().map(|p| p.len()).min().unwrap();
        assert_eq!(node.depth, min_len - 1);
        assert_eq!(node.depth, 1);
    }

    #[test]
    fn test_serde_round_trip_with_reindex() {
        let mut arena = arena();
        arena.attach(0, "a", pkg("a", "1.0.0"), Resolution::Resolved);
        let json = serde_json::to_string(&arena).unwrap();
        let mut restored: DependencyArena = serde_json::from_str(&json).unwrap();
        restored.reindex();
        assert_eq!(restored.len(), 2);
        assert!(restored.find("a", "1.0.0").is_some());
    }
}
