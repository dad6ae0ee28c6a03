//! The execution engine.
//!
//! [`Controller`] composes the registry, the digest store and the in-run
//! fingerprint cache into one build run. The stale subset is executed as
//! a parallel topological walk: dependency counts are taken over the
//! stale set, tasks whose count is zero are handed to a bounded worker
//! pool, and every completion decrements the counts of its dependents,
//! spawning them the moment they become ready. Results come back over a
//! channel to the scheduling thread.
//!
//! After the first failure no new task is started; tasks already running
//! are left to finish, and the failure is returned once the set has
//! drained.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::Instant;

use camino::Utf8Path;
use petgraph::graph::NodeIndex;

use crate::core::Fingerprint;
use crate::error::{BuildError, ResolveError};
use crate::graph::TaskGraph;
use crate::resolver::Resolver;
use crate::store::{DigestStore, FingerprintCache};
use crate::task::{Registry, Task};

/// One build run: owns the digest store connection and the in-run
/// fingerprint cache. Discard the instance to discard the cache.
pub struct Controller<'a> {
    registry: &'a Registry,
    store: DigestStore,
    cache: FingerprintCache,
    num_concurrent: usize,
}

impl<'a> Controller<'a> {
    /// `num_concurrent` bounds how many independent tasks may execute at
    /// once; `1` degenerates to strict sequential execution.
    pub fn new(registry: &'a Registry, store: DigestStore, num_concurrent: usize) -> Self {
        Self {
            registry,
            store,
            cache: FingerprintCache::new(),
            num_concurrent: num_concurrent.max(1),
        }
    }

    /// Whether a single task is out of date. With `recursive` the task
    /// also inherits staleness from upstream producers of its inputs;
    /// without it only the task's own file comparison counts.
    pub fn is_stale(&self, task: &Task, recursive: bool) -> Result<bool, ResolveError> {
        let graph = TaskGraph::build(self.registry)?;
        Resolver::new(&graph, &self.store, &self.cache).is_stale(task, recursive)
    }

    /// The stale subset of the graph. Pass `None` to consider every
    /// registered task, or a slice of tasks to restrict the walk to
    /// their transitive upstream closure; an unrelated sibling is never
    /// swept in, no matter how stale it is.
    pub fn resolve_stale_tasks(
        &self,
        requested: Option<&[Arc<Task>]>,
    ) -> Result<Vec<Arc<Task>>, ResolveError> {
        let graph = TaskGraph::build(self.registry)?;
        Resolver::new(&graph, &self.store, &self.cache).resolve(requested)
    }

    /// The live (digest, size) of a file, memoized for the lifetime of
    /// this Controller; a second call never re-reads the file.
    pub fn evaluate_size_digest(&self, path: impl AsRef<Utf8Path>) -> Result<Fingerprint, ResolveError> {
        let path = path.as_ref();
        self.cache.evaluate(path).map_err(|source| ResolveError::Io {
            path: path.to_owned(),
            source,
        })
    }

    /// Brings one task up to date: resolves the stale transitive-upstream
    /// set and executes it in dependency order. Blocks until every member
    /// has reached a terminal state.
    pub fn execute_sync(&self, task: &Arc<Task>) -> Result<(), BuildError> {
        let graph = TaskGraph::build(self.registry)?;
        let stale = Resolver::new(&graph, &self.store, &self.cache)
            .resolve(Some(std::slice::from_ref(task)))?;

        self.run_set(&graph, &stale)
    }

    /// Brings the whole graph up to date.
    pub fn execute_all(&self) -> Result<(), BuildError> {
        let graph = TaskGraph::build(self.registry)?;
        let stale = Resolver::new(&graph, &self.store, &self.cache).resolve(None)?;

        self.run_set(&graph, &stale)
    }

    fn run_set(&self, graph: &TaskGraph, stale: &[Arc<Task>]) -> Result<(), BuildError> {
        if stale.is_empty() {
            tracing::info!("everything is up to date");
            return Ok(());
        }

        let started = Instant::now();

        let members: Vec<NodeIndex> = stale
            .iter()
            .filter_map(|task| graph.node(task))
            .collect();
        let set: HashSet<NodeIndex> = members.iter().copied().collect();

        // Count producers inside the stale set only; a fresh upstream
        // task is skipped entirely and must not gate anyone.
        let mut counts: HashMap<NodeIndex, usize> = members
            .iter()
            .map(|&index| (index, graph.incoming_within(index, &set)))
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_concurrent)
            .build()?;

        tracing::info!("{} task(s) to run", members.len());

        let mut failure: Option<BuildError> = None;

        // The scheduling loop stays on the calling thread; only Action
        // execution is offloaded to the pool.
        pool.in_place_scope(|scope| {
            let (sender, receiver) = channel::<(NodeIndex, Result<(), BuildError>)>();
            let mut in_flight = 0usize;

            let mut spawn = |index: NodeIndex, in_flight: &mut usize| {
                let task = graph.task(index).clone();
                let sender = sender.clone();
                *in_flight += 1;

                scope.spawn(move |_| {
                    let result = self.run_task(&task);
                    sender.send((index, result)).unwrap();
                });
            };

            for &index in &members {
                if counts[&index] == 0 {
                    spawn(index, &mut in_flight);
                }
            }

            while in_flight > 0 {
                let (index, result) = receiver.recv().unwrap();
                in_flight -= 1;

                match result {
                    Ok(()) => {
                        if failure.is_some() {
                            continue;
                        }

                        // Unlock dependents; spawn the ones that became
                        // ready.
                        for next in graph.dependents_of(index) {
                            if let Some(count) = counts.get_mut(&next) {
                                *count -= 1;
                                if *count == 0 {
                                    spawn(next, &mut in_flight);
                                }
                            }
                        }
                    }
                    // First failure wins; the rest of the set drains
                    // without new starts.
                    Err(err) => {
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                }
            }
        });

        match failure {
            Some(err) => Err(err),
            None => {
                tracing::info!(
                    "finished {} task(s) in {}ms",
                    members.len(),
                    started.elapsed().as_millis(),
                );
                Ok(())
            }
        }
    }

    /// Runs one task to a terminal state on the current worker.
    fn run_task(&self, task: &Task) -> Result<(), BuildError> {
        tracing::info!("running task '{}'", task.name());

        if let Some(action) = task.action() {
            action
                .run(task)
                .map_err(|err| BuildError::Task(task.name().to_string(), err))?;
        }

        for target in task.targets() {
            if !target.as_std_path().exists() {
                return Err(BuildError::MissingTarget {
                    task: task.name().to_string(),
                    target: target.clone(),
                });
            }
        }

        // The action just rewrote its targets; the memoized state is out
        // of date, and downstream tasks must observe the new contents.
        for target in task.targets() {
            let fingerprint = self.cache.refresh(target).map_err(|source| BuildError::Io {
                path: target.clone(),
                source,
            })?;
            self.store.upsert(target, &fingerprint)?;
        }

        // Dependency rows are populated lazily: whatever the staleness
        // check already evaluated is persisted here, so the next run can
        // compare against it.
        for dependency in task.dependencies() {
            match self.cache.evaluate(dependency) {
                Ok(fingerprint) => self.store.upsert(dependency, &fingerprint)?,
                // An external input that vanished mid-run; the next
                // resolution will flag it.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(BuildError::Io {
                        path: dependency.clone(),
                        source,
                    });
                }
            }
        }

        Ok(())
    }
}
