use std::process::ExitStatus;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Raised at graph-construction time; always fatal to the offending
/// `create_task` call.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task '{0}' is already registered")]
    DuplicateTask(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("digest store:\n{0}")]
    Sql(#[from] rusqlite::Error),
}

/// Errors surfaced while deciding which tasks are out of date. Staleness
/// evaluation never writes anywhere, so everything here is a read failure.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cycle detected in the task graph at '{0}'")]
    Cycle(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("couldn't read '{path}':\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Callable(#[from] anyhow::Error),

    #[error("couldn't spawn '{command}':\n{source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}:\n{stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// A build failure is fatal to the current run; nothing is retried and a
/// failed task's targets are never recorded in the digest store.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Task '{0}':\n{1}")]
    Task(String, ActionError),

    #[error("task '{task}' did not create target '{target}'")]
    MissingTarget { task: String, target: Utf8PathBuf },

    #[error("couldn't fingerprint '{path}':\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("couldn't build the worker pool:\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum KumadeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Error while running the build.\n{0}")]
    Build(#[from] BuildError),
}
