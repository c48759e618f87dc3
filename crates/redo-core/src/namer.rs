//! Task naming: derive a stable task name from a function and its
//! arguments.

use crate::domain::CallArgs;

/// Derives a task name from the wrapped function's declared name and the
/// full argument tuple (receiver included, when there is one), so callers
/// sharing a runner can still produce per-argument names.
pub trait Namer: Send + Sync {
    fn task_name(&self, func_name: &str, args: &CallArgs) -> String;
}

/// Default namer: the task is named after the function itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNamer;

impl Namer for DefaultNamer {
    fn task_name(&self, func_name: &str, _args: &CallArgs) -> String {
        func_name.to_string()
    }
}
