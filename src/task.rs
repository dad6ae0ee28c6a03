//! The task record and its registry.
//!
//! A [`Task`] is an immutable unit of work: a unique name, the file paths
//! it reads, the file paths it is expected to produce, and an optional
//! [`Action`]. Tasks never reference each other directly; the dependency
//! graph is recovered later by matching dependency paths against the
//! targets declared by other tasks.

use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::action::Action;
use crate::error::RegistryError;

/// A named unit of work with declared input and output file paths.
///
/// Created once through [`Registry::create_task`] and immutable afterwards.
/// Handed out as `Arc<Task>` so the scheduler can share it across workers.
#[derive(Debug)]
pub struct Task {
    name: Arc<str>,
    dependencies: Vec<Utf8PathBuf>,
    targets: Vec<Utf8PathBuf>,
    action: Option<Action>,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    /// File paths this task reads. Order is preserved but carries no
    /// meaning beyond deterministic iteration.
    pub fn dependencies(&self) -> &[Utf8PathBuf] {
        &self.dependencies
    }

    /// File paths this task is expected to produce or update.
    pub fn targets(&self) -> &[Utf8PathBuf] {
        &self.targets
    }

    pub fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }
}

/// The registry owning task identity for one build session.
///
/// There is no process-wide state; construct one `Registry` per session
/// and pass it by reference to the [`Controller`](crate::Controller).
#[derive(Debug, Default)]
pub struct Registry {
    tasks: Vec<Arc<Task>>,
    index: HashMap<Arc<str>, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a task. An action of `None` makes a no-op
    /// task, useful purely to aggregate dependencies.
    ///
    /// Fails with [`RegistryError::DuplicateTask`] if the name is taken.
    pub fn create_task(
        &mut self,
        name: impl AsRef<str>,
        dependencies: &[&str],
        targets: &[&str],
        action: Option<Action>,
    ) -> Result<Arc<Task>, RegistryError> {
        let name: Arc<str> = Arc::from(name.as_ref());

        if self.index.contains_key(&*name) {
            return Err(RegistryError::DuplicateTask(name.to_string()));
        }

        let task = Arc::new(Task {
            name: name.clone(),
            dependencies: dependencies.iter().map(Utf8PathBuf::from).collect(),
            targets: targets.iter().map(Utf8PathBuf::from).collect(),
            action,
        });

        self.index.insert(name, self.tasks.len());
        self.tasks.push(task.clone());

        Ok(task)
    }

    /// Looks a task up by name. Absence is a normal result; the resolver
    /// uses it to tell task-produced paths apart from plain files.
    pub fn get(&self, name: &str) -> Option<&Arc<Task>> {
        self.index.get(name).map(|&at| &self.tasks[at])
    }

    /// Iterates over all tasks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
