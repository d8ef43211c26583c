//! JavaScript engine backed by QuickJS.
//!
//! Every execution clone owns a separate QuickJS runtime and re-evaluates the
//! script source in it, so clones never share a heap. Hook data crosses
//! between runtimes as JSON.
mod globals;

use std::{rc::Rc, sync::Arc};

use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Object, Runtime, Value};
use strum::IntoEnumIterator;

use self::globals::Bridge;
use super::{CloneId, ExecutionClone, Hook, HookArgs, HookValue, Program, ScriptEngine};
use crate::{error::ScriptError, http::HttpClient, recorder::Recorder};

/// Compiles JavaScript sources.
#[derive(Debug, Clone)]
pub struct JsEngine {
    recorder: Recorder,
    http:     HttpClient,
}

impl JsEngine {
    /// Creates an engine whose `http` built-in sends through `http` and
    /// records into `recorder`.
    pub fn new(recorder: Recorder, http: HttpClient) -> Self {
        Self { recorder, http }
    }
}

impl ScriptEngine for JsEngine {
    type Program = JsProgram;

    fn compile(&self, name: &str, source: &str) -> Result<JsProgram, ScriptError> {
        // probe without a bridge: nothing can be sent from here
        let (context, _runtime) = evaluate(name, source, None)?;
        let hooks = context.with(|ctx| {
            let mut hooks = Vec::new();
            for hook in Hook::iter() {
                let value = lookup(&ctx, hook).catch(&ctx).map_err(caught)?;
                if value.is_undefined() {
                    continue;
                }
                if !value.is_function() {
                    return Err(ScriptError::InvalidHook { hook, found: value.type_name().to_owned() });
                }
                hooks.push(hook);
            }
            Ok(hooks)
        })?;

        Ok(JsProgram {
            name: name.to_owned(),
            source: source.into(),
            hooks,
            recorder: self.recorder.clone(),
            http: self.http.clone(),
        })
    }
}

/// A compiled JavaScript program.
#[derive(Debug, Clone)]
pub struct JsProgram {
    name:     String,
    source:   Arc<str>,
    hooks:    Vec<Hook>,
    recorder: Recorder,
    http:     HttpClient,
}

impl Program for JsProgram {
    type Instance = JsClone;

    fn defines(&self, hook: Hook) -> bool {
        self.hooks.contains(&hook)
    }

    fn instantiate(&self, id: CloneId) -> Result<JsClone, ScriptError> {
        let bridge = Rc::new(Bridge::new(id, self.recorder.clone(), self.http.clone()));
        let (context, runtime) = evaluate(&self.name, &self.source, Some(bridge.clone()))?;
        tracing::debug!(clone = %id, script = %self.name, "execution context ready");
        Ok(JsClone { id, context, runtime, bridge })
    }
}

/// A QuickJS runtime with the script evaluated in it.
pub struct JsClone {
    id:      CloneId,
    // dropped before the runtime
    context: Context,
    runtime: Runtime,
    bridge:  Rc<Bridge>,
}

impl ExecutionClone for JsClone {
    fn call(&mut self, hook: Hook, args: HookArgs<'_>) -> Result<Option<HookValue>, ScriptError> {
        let cancel = args.cancel;
        let args = serde_json::to_string(&args)?;
        let bridge = &self.bridge;

        let result = self.context.with(|ctx| {
            let func: Function = lookup(&ctx, hook)
                .and_then(|v| v.get())
                .catch(&ctx)
                .map_err(caught)?;
            let data = json_parse(&ctx, &args).catch(&ctx).map_err(caught)?;

            let guard = bridge.enter(cancel);
            let value: Value = func.call((data,)).catch(&ctx).map_err(caught)?;
            drop(guard);

            let json = json_stringify(&ctx, value).catch(&ctx).map_err(caught)?;
            Ok::<_, ScriptError>(json)
        });
        bridge.flush();

        match result? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

impl Drop for JsClone {
    fn drop(&mut self) {
        self.runtime.run_gc();
        tracing::trace!(clone = %self.id, "execution context dropped");
    }
}

fn evaluate(name: &str, source: &str, bridge: Option<Rc<Bridge>>) -> Result<(Context, Runtime), ScriptError> {
    let runtime = Runtime::new().map_err(|e| ScriptError::Runtime(e.to_string()))?;
    let context = Context::full(&runtime).map_err(|e| ScriptError::Runtime(e.to_string()))?;

    context.with(|ctx| {
        globals::install(&ctx, bridge).map_err(|e| ScriptError::Runtime(e.to_string()))?;
        ctx.eval::<Value, _>(source)
            .catch(&ctx)
            .map(|_| ())
            .map_err(|e| ScriptError::Compile { name: name.to_owned(), message: format_js_error(&e) })
    })?;

    Ok((context, runtime))
}

/// Resolves a top-level binding, including `let`/`const` ones which are not
/// properties of the global object.
fn lookup<'js>(ctx: &Ctx<'js>, hook: Hook) -> rquickjs::Result<Value<'js>> {
    let name = hook.name();
    ctx.eval(format!("typeof {name} === 'undefined' ? undefined : {name}"))
}

fn caught(error: CaughtError<'_>) -> ScriptError {
    match error {
        CaughtError::Error(e) => ScriptError::Runtime(e.to_string()),
        other => ScriptError::Exception(format_js_error(&other)),
    }
}

fn format_js_error(error: &CaughtError<'_>) -> String {
    match error {
        CaughtError::Exception(ex) => {
            let message = ex.message().unwrap_or_else(|| "unknown error".to_owned());
            match ex.stack() {
                Some(stack) if !stack.trim().is_empty() => format!("{message}\n{stack}"),
                _ => message,
            }
        }
        CaughtError::Value(value) => match value.as_string().and_then(|s| s.to_string().ok()) {
            Some(s) => s,
            None => format!("{value:?}"),
        },
        CaughtError::Error(e) => e.to_string(),
    }
}

/// `JSON.stringify(value)`; `None` when the value has no JSON form.
fn json_stringify<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Option<String>> {
    let json: Object = ctx.globals().get("JSON")?;
    let stringify: Function = json.get("stringify")?;
    stringify.call((value,))
}

fn json_parse<'js>(ctx: &Ctx<'js>, text: &str) -> rquickjs::Result<Value<'js>> {
    let json: Object = ctx.globals().get("JSON")?;
    let parse: Function = json.get("parse")?;
    parse.call((text,))
}
