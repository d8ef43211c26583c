//! Script engine abstraction.
//!
//! The orchestrator only relies on three operations: compiling source into a
//! [`Program`], asking the program which lifecycle [`Hook`]s it defines, and
//! creating independent [`ExecutionClone`]s of it. Each virtual user owns one
//! clone and calls hooks on it; clones share the compiled program but no
//! mutable state.
//!
//! Two engines are provided: [`JsEngine`] runs JavaScript through QuickJS, and
//! [`NativeProgram`] runs Rust closures.
mod js;
mod native;

pub use js::{JsClone, JsEngine, JsProgram};
pub use native::{NativeClone, NativeHook, NativeProgram, NativeProgramBuilder};

use std::fmt;

use serde::Serialize;
use strum::{Display, EnumIter, IntoStaticStr};
use tokio_util::sync::CancellationToken;

use crate::error::ScriptError;

/// Data returned by a hook and threaded into later hooks.
pub type HookValue = serde_json::Value;

/// A lifecycle hook a script may define at top level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Hook {
    /// Called once before any virtual user starts.
    BeforeAll,
    /// Called at the start of every iteration.
    BeforeEach,
    /// The iteration body. Required.
    Run,
    /// Called at the end of every iteration.
    AfterEach,
    /// Called once after every virtual user has stopped.
    AfterAll,
}

impl Hook {
    /// The function name a script uses for this hook.
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Identifies an execution clone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloneId {
    /// The clone running `before_all` and `after_all`.
    Main,
    /// The clone owned by a virtual user.
    Worker(u32),
}

impl fmt::Display for CloneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloneId::Main => write!(f, "main"),
            CloneId::Worker(n) => write!(f, "vu-{n}"),
        }
    }
}

/// Results of the hooks that already ran, passed to the next hook.
///
/// Scripts receive this as a single object argument; absent results are left
/// out.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct HookArgs<'a> {
    /// Result of `before_all`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_all: Option<&'a HookValue>,
    /// Result of `before_each` in the current iteration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_each: Option<&'a HookValue>,
    /// Result of `run` in the current iteration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<&'a HookValue>,
    /// Cancellation of the run; waiting built-ins such as `load.sleep`
    /// return early once it fires.
    #[serde(skip)]
    pub cancel: Option<&'a CancellationToken>,
}

/// Compiles script source.
pub trait ScriptEngine {
    /// The compiled form.
    type Program: Program;

    /// Compiles `source`; `name` is used in error messages.
    fn compile(&self, name: &str, source: &str) -> Result<Self::Program, ScriptError>;
}

/// A compiled script, shareable across threads.
pub trait Program: Send + Sync + 'static {
    /// The per-thread execution context.
    type Instance: ExecutionClone;

    /// Returns whether the script defines `hook`.
    fn defines(&self, hook: Hook) -> bool;

    /// Creates an independent execution context.
    ///
    /// Called on the thread that will own the clone.
    fn instantiate(&self, id: CloneId) -> Result<Self::Instance, ScriptError>;
}

/// An execution context owned by a single thread.
pub trait ExecutionClone {
    /// Calls `hook`, which must be defined by the program.
    fn call(&mut self, hook: Hook, args: HookArgs<'_>) -> Result<Option<HookValue>, ScriptError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn hook_names() {
        let names = Hook::iter().map(Hook::name).collect::<Vec<_>>();
        assert_eq!(names, ["before_all", "before_each", "run", "after_each", "after_all"]);
        assert_eq!(Hook::AfterEach.to_string(), "after_each");
    }

    #[test]
    fn hook_args_skip_missing_results() {
        let before_all = json!({"token": "abc"});
        let args = HookArgs { before_all: Some(&before_all), ..Default::default() };
        assert_eq!(serde_json::to_value(args).unwrap(), json!({"before_all": {"token": "abc"}}));
    }

    #[test]
    fn clone_ids() {
        assert_eq!(CloneId::Main.to_string(), "main");
        assert_eq!(CloneId::Worker(3).to_string(), "vu-3");
    }
}
