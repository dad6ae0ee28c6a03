use std::fmt::Debug;
use std::process::Command;
use std::sync::Arc;

use crate::error::ActionError;
use crate::task::Task;

/// Callable pointer used for in-process actions. The type is erased
/// behind `dyn Fn` so the engine can hold heterogeneous work units.
type ActionFnPtr = Arc<dyn Fn(&Task) -> anyhow::Result<()> + Send + Sync>;

/// The executable behavior bound to a task.
///
/// A closed set of two variants: an in-process callable receiving the
/// owning [`Task`], or an external command line run with the inherited
/// environment. The engine never interprets what an action does; it only
/// checks that the declared targets exist afterwards.
pub enum Action {
    Call(ActionFnPtr),
    Command { program: String, args: Vec<String> },
}

/// What a successful action produced. The command variant carries the
/// exit status and captured output so the caller can report it; the
/// engine itself ignores both.
#[derive(Debug)]
pub enum Outcome {
    Call,
    Command {
        status: std::process::ExitStatus,
        stdout: String,
        stderr: String,
    },
}

impl Action {
    /// Wraps an in-process callable.
    pub fn call<F>(func: F) -> Self
    where
        F: Fn(&Task) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Action::Call(Arc::new(func))
    }

    /// Wraps an external command line. The child inherits the current
    /// environment; stdout and stderr are captured.
    pub fn command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Action::Command {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn run(&self, task: &Task) -> Result<Outcome, ActionError> {
        match self {
            Action::Call(func) => {
                func(task)?;
                Ok(Outcome::Call)
            }
            Action::Command { program, args } => {
                let rendered = self.render();
                tracing::debug!("spawning '{}'", rendered);

                let output = Command::new(program).args(args).output().map_err(|source| {
                    ActionError::Spawn {
                        command: rendered.clone(),
                        source,
                    }
                })?;

                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

                if !output.status.success() {
                    return Err(ActionError::Failed {
                        command: rendered,
                        status: output.status,
                        stderr,
                    });
                }

                Ok(Outcome::Command {
                    status: output.status,
                    stdout,
                    stderr,
                })
            }
        }
    }

    fn render(&self) -> String {
        match self {
            Action::Call(_) => String::from("<fn>"),
            Action::Command { program, args } => {
                let mut acc = program.clone();
                for arg in args {
                    acc.push(' ');
                    acc.push_str(arg);
                }
                acc
            }
        }
    }
}

impl Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Call(_) => write!(f, "Action::Call(*)"),
            Action::Command { .. } => write!(f, "Action::Command({})", self.render()),
        }
    }
}
