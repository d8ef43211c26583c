use std::{collections::HashMap, sync::Arc};

use super::{CloneId, ExecutionClone, Hook, HookArgs, HookValue, Program};
use crate::error::ScriptError;

/// A hook implemented in Rust.
///
/// Receives the id of the clone it runs on, so per-clone state can be kept
/// by the closure if needed.
pub type NativeHook = Arc<dyn Fn(CloneId, HookArgs<'_>) -> Result<Option<HookValue>, ScriptError> + Send + Sync>;

/// A program whose hooks are Rust closures.
///
/// Useful to drive the orchestrator from Rust code without a script.
///
/// ```
/// use loadscript::script::NativeProgram;
///
/// let program = NativeProgram::builder()
///     .before_all(|_, _| Ok(Some(serde_json::json!({"token": "abc"}))))
///     .run(|_, args| {
///         assert!(args.before_all.is_some());
///         Ok(None)
///     })
///     .build();
/// ```
#[derive(Clone, Default)]
pub struct NativeProgram {
    hooks: HashMap<Hook, NativeHook>,
}

impl NativeProgram {
    /// Starts building a program.
    pub fn builder() -> NativeProgramBuilder {
        NativeProgramBuilder::default()
    }
}

/// Builder for [`NativeProgram`].
#[derive(Default)]
pub struct NativeProgramBuilder {
    hooks: HashMap<Hook, NativeHook>,
}

macro_rules! hook_setter {
    ($(#[$doc:meta] $name:ident => $hook:expr),* $(,)?) => {
        $(
            #[$doc]
            pub fn $name<F>(self, f: F) -> Self
            where
                F: Fn(CloneId, HookArgs<'_>) -> Result<Option<HookValue>, ScriptError> + Send + Sync + 'static,
            {
                self.hook($hook, f)
            }
        )*
    };
}

impl NativeProgramBuilder {
    /// Defines `hook`.
    pub fn hook<F>(mut self, hook: Hook, f: F) -> Self
    where
        F: Fn(CloneId, HookArgs<'_>) -> Result<Option<HookValue>, ScriptError> + Send + Sync + 'static,
    {
        self.hooks.insert(hook, Arc::new(f));
        self
    }

    hook_setter! {
        /// Defines `before_all`.
        before_all => Hook::BeforeAll,
        /// Defines `before_each`.
        before_each => Hook::BeforeEach,
        /// Defines `run`.
        run => Hook::Run,
        /// Defines `after_each`.
        after_each => Hook::AfterEach,
        /// Defines `after_all`.
        after_all => Hook::AfterAll,
    }

    /// Finishes the program.
    pub fn build(self) -> NativeProgram {
        NativeProgram { hooks: self.hooks }
    }
}

impl Program for NativeProgram {
    type Instance = NativeClone;

    fn defines(&self, hook: Hook) -> bool {
        self.hooks.contains_key(&hook)
    }

    fn instantiate(&self, id: CloneId) -> Result<NativeClone, ScriptError> {
        Ok(NativeClone { id, hooks: self.hooks.clone() })
    }
}

/// Execution clone of a [`NativeProgram`].
pub struct NativeClone {
    id: CloneId,
    hooks: HashMap<Hook, NativeHook>,
}

impl ExecutionClone for NativeClone {
    fn call(&mut self, hook: Hook, args: HookArgs<'_>) -> Result<Option<HookValue>, ScriptError> {
        match self.hooks.get(&hook) {
            Some(f) => f(self.id, args),
            None => Err(ScriptError::Runtime(format!("{hook}() is not defined"))),
        }
    }
}
