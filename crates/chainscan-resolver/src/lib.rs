//! Transitive dependency resolver
//!
//! Builds an arena-backed dependency tree by level-order BFS. Every level's
//! metadata fetches are dispatched to the bounded worker pool at once; a
//! visited set keyed by `(name, resolved version)` prevents cycles from
//! recursing: a re-encountered package is linked in place and the new path
//! is recorded on the existing node.
//!
//! Version resolution is deliberately approximate: exact pins are honoured,
//! everything else resolves to the registry's latest. Unknown packages stay
//! in the tree as `Resolution::NotFound` nodes so downstream analyses can
//! still report on them.

pub mod arena;

pub use arena::{DependencyArena, DependencyNode, NodeId, Resolution};

use async_trait::async_trait;
use chainscan_core::config::ResolverConfig;
use chainscan_core::{CancellationToken, Ecosystem, PackageRef, ScanError};
use chainscan_registry::{FetchOutcome, RegistryClient};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Metadata lookup seam, so the resolver can be exercised without a live
/// registry.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(
        &self,
        name: &str,
        spec: &str,
        ecosystem: Ecosystem,
    ) -> Result<FetchOutcome, ScanError>;
}

#[async_trait]
impl MetadataSource for RegistryClient {
    async fn fetch(
        &self,
        name: &str,
        spec: &str,
        ecosystem: Ecosystem,
    ) -> Result<FetchOutcome, ScanError> {
        self.fetch_metadata(name, spec, ecosystem).await
    }
}

pub struct Resolver<'a> {
    source: &'a dyn MetadataSource,
    config: ResolverConfig,
    concurrency: usize,
}

/// A pending edge: parent node wants `name` at `spec`
struct Want {
    parent: NodeId,
    name: String,
    spec: String,
}

impl<'a> Resolver<'a> {
    pub fn new(source: &'a dyn MetadataSource, config: ResolverConfig, concurrency: usize) -> Self {
        Self {
            source,
            config,
            concurrency: concurrency.max(1),
        }
    }

    /// Build the tree rooted at the declared target.
    ///
    /// `declared` are the root manifest's `(name, spec)` pairs. Terminates
    /// within O(N·D) node visits for any input; cycles cannot recurse.
    pub async fn build_graph(
        &self,
        root: PackageRef,
        declared: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<DependencyArena, ScanError> {
        let ecosystem = root.ecosystem;
        let mut arena = DependencyArena::new(root);
        let mut frontier: Vec<Want> = declared
            .iter()
            .map(|(name, spec)| Want {
                parent: arena.root(),
                name: name.clone(),
                spec: spec.clone(),
            })
            .collect();

        let mut depth = 0;
        while !frontier.is_empty() && depth < self.config.max_depth {
            cancel.check()?;
            depth += 1;
            debug!(depth, pending = frontier.len(), "resolving dependency level");

            // One fetch per distinct (name, spec) at this level
            let mut by_request: HashMap<(String, String), Vec<NodeId>> = HashMap::new();
            for want in frontier.drain(..) {
                by_request
                    .entry((want.name, want.spec))
                    .or_default()
                    .push(want.parent);
            }

            let fetches = by_request.keys().cloned().collect::<Vec<_>>();
            let outcomes: Vec<((String, String), Result<FetchOutcome, ScanError>)> =
                stream::iter(fetches)
                    .map(|(name, spec)| async move {
                        let outcome = self.source.fetch(&name, &spec, ecosystem).await;
                        ((name, spec), outcome)
                    })
                    .buffer_unordered(self.concurrency)
                    .collect()
                    .await;

            let mut next_frontier: Vec<Want> = Vec::new();
            for ((name, spec), outcome) in outcomes {
                cancel.check()?;
                let parents = by_request.remove(&(name.clone(), spec.clone())).unwrap_or_default();

                let (package, resolution, children) = match outcome {
                    Ok(FetchOutcome::Found(meta)) => {
                        (meta.package.clone(), Resolution::Resolved, meta.dependencies)
                    }
                    Ok(FetchOutcome::NotFound) => {
                        let version = if spec.is_empty() { "unknown".to_string() } else { spec };
                        (
                            PackageRef::new(name.clone(), version, ecosystem),
                            Resolution::NotFound,
                            Vec::new(),
                        )
                    }
                    Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
                    Err(e) => {
                        warn!(package = %name, "metadata fetch failed: {e}");
                        let version = if spec.is_empty() { "unknown".to_string() } else { spec };
                        (
                            PackageRef::new(name.clone(), version, ecosystem),
                            Resolution::NotFound,
                            Vec::new(),
                        )
                    }
                };

                for parent in parents {
                    if arena.len() >= self.config.max_nodes {
                        warn!(cap = self.config.max_nodes, "node cap reached, truncating tree");
                        return Ok(arena);
                    }
                    let (id, newly_created) =
                        arena.attach(parent, &name, package.clone(), resolution);
                    if newly_created && matches!(resolution, Resolution::Resolved) {
                        for (child_name, child_spec) in &children {
                            next_frontier.push(Want {
                                parent: id,
                                name: child_name.clone(),
                                spec: child_spec.clone(),
                            });
                        }
                    }
                }
            }
            frontier = next_frontier;
        }

        info!(
            nodes = arena.len(),
            depth_reached = depth,
            "dependency graph complete"
        );
        Ok(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainscan_registry::PackageMetadata;
    use std::collections::HashMap as Map;

    /// Canned metadata keyed by package name
    struct StubSource {
        packages: Map<String, (String, Vec<(String, String)>)>,
    }

    impl StubSource {
        fn new(entries: &[(&str, &str, &[&str])]) -> Self {
            let mut packages = Map::new();
            for (name, version, deps) in entries {
                packages.insert(
                    name.to_string(),
                    (
                        version.to_string(),
                        deps.iter().map(|d| (d.to_string(), String::new())).collect(),
                    ),
                );
            }
            Self { packages }
        }
    }

    #[async_trait]
    impl MetadataSource for StubSource {
        async fn fetch(
            &self,
            name: &str,
            _spec: &str,
            ecosystem: Ecosystem,
        ) -> Result<FetchOutcome, ScanError> {
            match self.packages.get(name) {
                Some((version, deps)) => Ok(FetchOutcome::Found(PackageMetadata {
                    package: PackageRef::new(name, version.clone(), ecosystem),
                    description: None,
                    published_at: None,
                    maintainers: vec![],
                    weekly_downloads: None,
                    dependencies: deps.clone(),
                    deprecated: false,
                    repository: None,
                    latest_version: None,
                })),
                None => Ok(FetchOutcome::NotFound),
            }
        }
    }

    fn root() -> PackageRef {
        PackageRef::new("demo", "1.0.0", Ecosystem::Npm)
    }

    #[tokio::test]
    async fn test_linear_chain_resolves_with_depths() {
        let source = StubSource::new(&[
            ("a", "1.0.0", &["b"]),
            ("b", "2.0.0", &["c"]),
            ("c", "3.0.0", &[]),
        ]);
        let resolver = Resolver::new(&source, ResolverConfig::default(), 4);
        let arena = resolver
            .build_graph(root(), &[("a".into(), "".into())], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(arena.len(), 4); // root + a + b + c
        let c = arena.find("c", "3.0.0").unwrap();
        assert_eq!(arena.node(c).depth, 3);
        // every parent path starts at the root and ends at the node
        for path in &arena.node(c).parent_paths {
            assert_eq!(*path.first().unwrap(), arena.root());
            assert_eq!(*path.last().unwrap(), c);
        }
    }

    #[tokio::test]
    async fn test_cycle_terminates_and_links_back() {
        let source = StubSource::new(&[
            ("a", "1.0.0", &["b"]),
            ("b", "1.0.0", &["c"]),
            ("c", "1.0.0", &["a"]),
        ]);
        let resolver = Resolver::new(&source, ResolverConfig::default(), 4);
        let arena = resolver
            .build_graph(root(), &[("a".into(), "".into())], &CancellationToken::new())
            .await
            .unwrap();

        // terminates, and a appears once despite being both a root dep and
        // a child of c
        assert_eq!(arena.len(), 4);
        let a = arena.find("a", "1.0.0").unwrap();
        let c = arena.find("c", "1.0.0").unwrap();
        assert!(arena.node(c).dependencies.values().any(|id| *id == a));
        // the back-edge recorded a second path onto a
        assert!(arena.node(a).parent_paths.len() >= 2);
    }

    #[tokio::test]
    async fn test_unknown_package_kept_as_not_found() {
        let source = StubSource::new(&[("a", "1.0.0", &["ghost"])]);
        let resolver = Resolver::new(&source, ResolverConfig::default(), 4);
        let arena = resolver
            .build_graph(root(), &[("a".into(), "".into())], &CancellationToken::new())
            .await
            .unwrap();

        let ghost = arena
            .packages()
            .into_iter()
            .find(|p| p.name == "ghost")
            .unwrap();
        let id = arena.find(&ghost.name, &ghost.version).unwrap();
        assert!(matches!(arena.node(id).resolution, Resolution::NotFound));
    }

    #[tokio::test]
    async fn test_max_depth_bounds_traversal() {
        let source = StubSource::new(&[
            ("a", "1.0.0", &["b"]),
            ("b", "1.0.0", &["c"]),
            ("c", "1.0.0", &["d"]),
            ("d", "1.0.0", &[]),
        ]);
        let config = ResolverConfig {
            max_depth: 2,
            max_nodes: 100,
        };
        let resolver = Resolver::new(&source, config, 4);
        let arena = resolver
            .build_graph(root(), &[("a".into(), "".into())], &CancellationToken::new())
            .await
            .unwrap();

        assert!(arena.find("b", "1.0.0").is_some());
        assert!(arena.find("c", "1.0.0").is_none());
    }

    #[tokio::test]
    async fn test_cancellation_stops_resolution() {
        let source = StubSource::new(&[("a", "1.0.0", &[])]);
        let resolver = Resolver::new(&source, ResolverConfig::default(), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = resolver
            .build_graph(root(), &[("a".into(), "".into())], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Cancelled));
    }

    #[tokio::test]
    async fn test_shared_dependency_single_node_two_paths() {
        let source = StubSource::new(&[
            ("a", "1.0.0", &["shared"]),
            ("b", "1.0.0", &["shared"]),
            ("shared", "9.9.9", &[]),
        ]);
        let resolver = Resolver::new(&source, ResolverConfig::default(), 4);
        let arena = resolver
            .build_graph(
                root(),
                &[("a".into(), "".into()), ("b".into(), "".into())],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let shared = arena.find("shared", "9.9.9").unwrap();
        assert_eq!(arena.node(shared).parent_paths.len(), 2);
        assert_eq!(arena.node(shared).depth, 2);
    }
}
