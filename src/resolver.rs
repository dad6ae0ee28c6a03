//! Staleness resolution.
//!
//! A task is out of date when its recorded inputs no longer match the
//! live filesystem, or when its declared outputs are missing. The check
//! runs in a fixed order, cheapest evidence first:
//!
//! 1. A task with no dependencies and no targets has nothing to cache;
//!    it is always stale.
//! 2. A declared target missing on disk proves staleness outright.
//! 3. Each dependency is compared against the digest store: no recorded
//!    row, a size mismatch, or a digest mismatch all prove staleness.
//!    The digest is only computed when the sizes agree, so most changed
//!    files are rejected on a metadata call alone.
//! 4. When `recursive`, a task also inherits staleness from any upstream
//!    task producing one of its dependency paths.
//!
//! Resolution is a pure read against the filesystem and the store; one
//! [`Resolver`] value is one memoized resolution pass.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::error::ResolveError;
use crate::graph::TaskGraph;
use crate::store::{DigestStore, FingerprintCache};
use crate::task::Task;

pub(crate) struct Resolver<'a> {
    graph: &'a TaskGraph,
    store: &'a DigestStore,
    cache: &'a FingerprintCache,
    /// Memoized recursive verdicts; keeps diamond-shaped graphs linear.
    memo: HashMap<NodeIndex, bool>,
}

impl<'a> Resolver<'a> {
    pub fn new(graph: &'a TaskGraph, store: &'a DigestStore, cache: &'a FingerprintCache) -> Self {
        Self {
            graph,
            store,
            cache,
            memo: HashMap::new(),
        }
    }

    /// Decides whether a single task is out of date.
    pub fn is_stale(&mut self, task: &Task, recursive: bool) -> Result<bool, ResolveError> {
        if task.dependencies().is_empty() && task.targets().is_empty() {
            tracing::debug!("'{}' has nothing to cache, always stale", task.name());
            return Ok(true);
        }

        for target in task.targets() {
            if !target.as_std_path().exists() {
                tracing::debug!("'{}': target '{}' is missing", task.name(), target);
                return Ok(true);
            }
        }

        for dependency in task.dependencies() {
            let Some(stored) = self.store.get(dependency)? else {
                tracing::debug!("'{}': no recorded state for '{}'", task.name(), dependency);
                return Ok(true);
            };

            let live_size = match self.cache.size_of(dependency) {
                Ok(size) => size,
                // A vanished input can never match recorded state.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!("'{}': dependency '{}' is gone", task.name(), dependency);
                    return Ok(true);
                }
                Err(source) => {
                    return Err(ResolveError::Io {
                        path: dependency.clone(),
                        source,
                    });
                }
            };

            if live_size != stored.size {
                tracing::debug!(
                    "'{}': size of '{}' changed ({} -> {})",
                    task.name(),
                    dependency,
                    stored.size,
                    live_size,
                );
                return Ok(true);
            }

            let live = match self.cache.evaluate(dependency) {
                Ok(fingerprint) => fingerprint,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!("'{}': dependency '{}' is gone", task.name(), dependency);
                    return Ok(true);
                }
                Err(source) => {
                    return Err(ResolveError::Io {
                        path: dependency.clone(),
                        source,
                    });
                }
            };

            if live.digest != stored.digest {
                tracing::debug!("'{}': digest of '{}' changed", task.name(), dependency);
                return Ok(true);
            }
        }

        if recursive {
            for dependency in task.dependencies() {
                if let Some(producer) = self.graph.producer_of(dependency)
                    && self.stale_node(producer)?
                {
                    tracing::debug!(
                        "'{}' is stale through upstream task '{}'",
                        task.name(),
                        self.graph.task(producer).name(),
                    );
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Memoized recursive staleness of one node. Termination is
    /// guaranteed by the acyclicity check performed at graph build time.
    fn stale_node(&mut self, index: NodeIndex) -> Result<bool, ResolveError> {
        if let Some(&verdict) = self.memo.get(&index) {
            return Ok(verdict);
        }

        let task = self.graph.task(index).clone();
        let verdict = self.is_stale(&task, true)?;
        self.memo.insert(index, verdict);

        Ok(verdict)
    }

    /// Computes the stale subset of the graph.
    ///
    /// With no `requested` tasks, every registered task is considered.
    /// With requested tasks, only their transitive upstream closure is
    /// considered; an unrelated sibling is never swept in, no matter how
    /// stale it is.
    ///
    /// A task with no targets has nothing that records it as "done", so
    /// it is kept in the set whenever it is reached at all.
    pub fn resolve(&mut self, requested: Option<&[Arc<Task>]>) -> Result<Vec<Arc<Task>>, ResolveError> {
        let candidates: Vec<NodeIndex> = match requested {
            None => self.graph.indices().collect(),
            Some(tasks) => {
                let roots = tasks.iter().filter_map(|task| self.graph.node(task));
                self.graph.upstream_closure(roots)
            }
        };

        let mut stale = Vec::new();

        for index in candidates {
            let task = self.graph.task(index);

            if task.targets().is_empty() || self.stale_node(index)? {
                stale.push(task.clone());
            }
        }

        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Fingerprint;
    use crate::task::Registry;
    use camino::{Utf8Path, Utf8PathBuf};
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        store: DigestStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
            Self {
                _dir: dir,
                root,
                store: DigestStore::open_in_memory().unwrap(),
            }
        }

        fn path(&self, name: &str) -> Utf8PathBuf {
            self.root.join(name)
        }

        /// Writes a file and records its live state in the store, as a
        /// successful prior run would have.
        fn seed(&self, name: &str, contents: &str) -> Utf8PathBuf {
            let path = self.write(name, contents);
            let fingerprint = Fingerprint::of_file(&path).unwrap();
            self.store.upsert(&path, &fingerprint).unwrap();
            path
        }

        fn write(&self, name: &str, contents: &str) -> Utf8PathBuf {
            let path = self.path(name);
            fs::write(&path, contents).unwrap();
            path
        }
    }

    fn check(fixture: &Fixture, registry: &Registry, name: &str, recursive: bool) -> bool {
        let graph = TaskGraph::build(registry).unwrap();
        let cache = FingerprintCache::new();
        let mut resolver = Resolver::new(&graph, &fixture.store, &cache);
        resolver.is_stale(registry.get(name).unwrap(), recursive).unwrap()
    }

    #[test]
    fn side_effect_tasks_are_always_stale() {
        let fixture = Fixture::new();
        let mut registry = Registry::new();
        registry.create_task("ritual", &[], &[], None).unwrap();

        assert!(check(&fixture, &registry, "ritual", true));
        assert!(check(&fixture, &registry, "ritual", false));
    }

    #[test]
    fn missing_target_is_stale() {
        let fixture = Fixture::new();
        let source = fixture.seed("main.c", "int main() {}");

        let mut registry = Registry::new();
        let absent = fixture.path("main.o");
        registry
            .create_task("compile", &[source.as_str()], &[absent.as_str()], None)
            .unwrap();

        assert!(check(&fixture, &registry, "compile", true));
    }

    #[test]
    fn unrecorded_dependency_is_stale() {
        let fixture = Fixture::new();
        // On disk, but the store has never observed it.
        let source = fixture.write("main.c", "int main() {}");
        let target = fixture.write("main.o", "obj");

        let mut registry = Registry::new();
        registry
            .create_task("compile", &[source.as_str()], &[target.as_str()], None)
            .unwrap();

        assert!(check(&fixture, &registry, "compile", true));
    }

    #[test]
    fn unchanged_inputs_are_fresh() {
        let fixture = Fixture::new();
        let source = fixture.seed("main.c", "int main() {}");
        let target = fixture.write("main.o", "obj");

        let mut registry = Registry::new();
        registry
            .create_task("compile", &[source.as_str()], &[target.as_str()], None)
            .unwrap();

        assert!(!check(&fixture, &registry, "compile", true));
    }

    #[test]
    fn size_change_is_stale() {
        let fixture = Fixture::new();
        let source = fixture.seed("main.c", "int main() {}");
        let target = fixture.write("main.o", "obj");
        fs::write(&source, "int main() { return 1; }").unwrap();

        let mut registry = Registry::new();
        registry
            .create_task("compile", &[source.as_str()], &[target.as_str()], None)
            .unwrap();

        assert!(check(&fixture, &registry, "compile", true));
    }

    #[test]
    fn content_change_with_equal_size_is_stale() {
        let fixture = Fixture::new();
        let source = fixture.seed("data.bin", "aaaa");
        let target = fixture.write("data.out", "out");
        fs::write(&source, "aaab").unwrap();

        let mut registry = Registry::new();
        registry
            .create_task("process", &[source.as_str()], &[target.as_str()], None)
            .unwrap();

        assert!(check(&fixture, &registry, "process", true));
    }

    #[test]
    fn deleted_dependency_is_stale_not_an_error() {
        let fixture = Fixture::new();
        let source = fixture.seed("gone.txt", "was here");
        let target = fixture.write("out.txt", "out");
        fs::remove_file(&source).unwrap();

        let mut registry = Registry::new();
        registry
            .create_task("copy", &[source.as_str()], &[target.as_str()], None)
            .unwrap();

        assert!(check(&fixture, &registry, "copy", true));
    }

    fn chain(fixture: &Fixture) -> Registry {
        // source -> (upstream) -> mid -> (downstream) -> out
        let source = fixture.seed("source.txt", "v1");
        let mid = fixture.seed("mid.txt", "m1");
        let out = fixture.write("out.txt", "o1");

        let mut registry = Registry::new();
        registry
            .create_task("upstream", &[source.as_str()], &[mid.as_str()], None)
            .unwrap();
        registry
            .create_task("downstream", &[mid.as_str()], &[out.as_str()], None)
            .unwrap();
        registry
    }

    #[test]
    fn staleness_propagates_downstream_when_recursive() {
        let fixture = Fixture::new();
        let registry = chain(&fixture);

        // Touch the upstream input; the downstream task's own files are
        // untouched on disk.
        fs::write(fixture.path("source.txt"), "v2 longer").unwrap();

        assert!(check(&fixture, &registry, "upstream", true));
        assert!(check(&fixture, &registry, "downstream", true));
    }

    #[test]
    fn recursive_false_isolates_from_upstream() {
        let fixture = Fixture::new();
        let registry = chain(&fixture);
        fs::write(fixture.path("source.txt"), "v2 longer").unwrap();

        assert!(!check(&fixture, &registry, "downstream", false));
    }

    #[test]
    fn fresh_chain_is_fresh_both_ways() {
        let fixture = Fixture::new();
        let registry = chain(&fixture);

        assert!(!check(&fixture, &registry, "downstream", true));
        assert!(!check(&fixture, &registry, "downstream", false));
    }

    #[test]
    fn scoped_resolution_excludes_stale_siblings() {
        let fixture = Fixture::new();
        let registry = {
            let mut registry = Registry::new();
            let source = fixture.seed("source.txt", "v1");
            let mid = fixture.seed("mid.txt", "m1");
            let out = fixture.write("out.txt", "o1");
            registry
                .create_task("upstream", &[source.as_str()], &[mid.as_str()], None)
                .unwrap();
            registry
                .create_task("downstream", &[mid.as_str()], &[out.as_str()], None)
                .unwrap();
            // Independently stale: its target does not exist.
            let missing = fixture.path("stray.out");
            registry
                .create_task("stray", &[], &[missing.as_str()], None)
                .unwrap();
            registry
        };

        fs::write(fixture.path("source.txt"), "v2 longer").unwrap();

        let graph = TaskGraph::build(&registry).unwrap();
        let cache = FingerprintCache::new();
        let mut resolver = Resolver::new(&graph, &fixture.store, &cache);

        let requested = vec![registry.get("downstream").unwrap().clone()];
        let stale = resolver.resolve(Some(&requested)).unwrap();
        let names: Vec<_> = stale.iter().map(|task| task.name().to_string()).collect();

        assert_eq!(names, ["upstream", "downstream"]);
    }

    #[test]
    fn full_resolution_keeps_aggregators() {
        let fixture = Fixture::new();
        let source = fixture.seed("source.txt", "v1");
        let out = fixture.seed("out.txt", "o1");

        let mut registry = Registry::new();
        registry
            .create_task("build", &[source.as_str()], &[out.as_str()], None)
            .unwrap();
        // Nothing records an aggregator as done; it runs every time.
        registry
            .create_task("all", &[out.as_str()], &[], None)
            .unwrap();

        let graph = TaskGraph::build(&registry).unwrap();
        let cache = FingerprintCache::new();
        let mut resolver = Resolver::new(&graph, &fixture.store, &cache);

        let stale = resolver.resolve(None).unwrap();
        let names: Vec<_> = stale.iter().map(|task| task.name().to_string()).collect();

        assert_eq!(names, ["all"]);
    }
}
