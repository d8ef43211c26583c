//! Built-ins exposed to scripts: `load.http`, `load.sleep`, `os.getenv` and
//! `console`.
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use rquickjs::{
    Ctx, Exception, Function, Object, Value,
    convert::Coerced,
    function::{Opt, Rest},
};

use tokio::select;
use tokio_util::sync::CancellationToken;

use super::{json_parse, json_stringify};
use crate::{
    error::RecorderError,
    http::{HttpClient, HttpOptions},
    record::NO_REASON,
    recorder::{Recorder, ResultHandle},
    script::CloneId,
};

type Slot = Rc<RefCell<Option<ResultHandle>>>;

/// Per-clone state shared by the built-ins.
pub(super) struct Bridge {
    id:       CloneId,
    recorder: Recorder,
    http:     HttpClient,
    active:   Cell<bool>,
    cancel:   RefCell<Option<CancellationToken>>,
    pending:  RefCell<Vec<Slot>>,
}

impl Bridge {
    pub(super) fn new(id: CloneId, recorder: Recorder, http: HttpClient) -> Self {
        Self { id, recorder, http, active: Cell::new(false), cancel: RefCell::default(), pending: RefCell::default() }
    }

    /// Marks a hook as running until the guard is dropped.
    pub(super) fn enter(&self, cancel: Option<&CancellationToken>) -> ActiveGuard<'_> {
        self.active.set(true);
        *self.cancel.borrow_mut() = cancel.cloned();
        ActiveGuard(self)
    }

    fn track(&self, handle: ResultHandle) -> Slot {
        let slot = Rc::new(RefCell::new(Some(handle)));
        self.pending.borrow_mut().push(slot.clone());
        slot
    }

    /// Forwards every result the hook left unsealed with its current outcome.
    pub(super) fn flush(&self) {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        for slot in pending {
            let Some(handle) = slot.borrow_mut().take() else {
                continue;
            };
            if let Err(e) = handle.submit() {
                tracing::debug!(clone = %self.id, error = %e, "dropping unsealed result");
            }
        }
    }
}

pub(super) struct ActiveGuard<'a>(&'a Bridge);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.set(false);
        self.0.cancel.borrow_mut().take();
    }
}

/// Installs the built-ins into `ctx`.
///
/// Without a bridge `load.http` always throws; this is used to probe a
/// script for its hooks without sending anything.
pub(super) fn install<'js>(ctx: &Ctx<'js>, bridge: Option<Rc<Bridge>>) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    let id = bridge.as_ref().map(|b| b.id).unwrap_or(CloneId::Main);

    let load = Object::new(ctx.clone())?;
    let sleeper = bridge.clone();
    load.set("sleep", Function::new(ctx.clone(), move |ms: f64| sleep(sleeper.as_deref(), ms))?)?;
    load.set(
        "http",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, options: Opt<Value<'js>>| {
            http(&ctx, bridge.as_deref(), options.0)
        })?,
    )?;
    globals.set("load", load)?;

    let os = Object::new(ctx.clone())?;
    os.set("getenv", Function::new(ctx.clone(), |name: Coerced<String>| std::env::var(name.0).ok())?)?;
    globals.set("os", os)?;

    let console = Object::new(ctx.clone())?;
    console.set(
        "log",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::info!(clone = %id, "{}", join(args));
        })?,
    )?;
    console.set(
        "warn",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::warn!(clone = %id, "{}", join(args));
        })?,
    )?;
    console.set(
        "error",
        Function::new(ctx.clone(), move |args: Rest<Coerced<String>>| {
            tracing::error!(clone = %id, "{}", join(args));
        })?,
    )?;
    globals.set("console", console)?;

    Ok(())
}

fn join(args: Rest<Coerced<String>>) -> String {
    args.0.into_iter().map(|s| s.0).collect::<Vec<_>>().join(" ")
}

/// Pauses the hook for `ms` milliseconds, or until the run is cancelled.
fn sleep(bridge: Option<&Bridge>, ms: f64) {
    if ms.is_nan() || ms <= 0.0 {
        return;
    }
    let duration = Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX);
    let cancel = bridge.and_then(|b| b.cancel.borrow().clone());
    match (bridge, cancel) {
        (Some(bridge), Some(cancel)) => bridge.http.block_on(async {
            select! {
                biased;
                _ = cancel.cancelled() => (),
                _ = tokio::time::sleep(duration) => (),
            }
        }),
        _ => std::thread::sleep(duration),
    }
}

fn http<'js>(ctx: &Ctx<'js>, bridge: Option<&Bridge>, options: Option<Value<'js>>) -> rquickjs::Result<Value<'js>> {
    let Some(bridge) = bridge.filter(|b| b.active.get()) else {
        return Err(Exception::throw_message(ctx, "http() can only be called inside a lifecycle hook"));
    };
    let options = match options {
        Some(v) if v.is_object() => json_stringify(ctx, v)?.unwrap_or_default(),
        _ => return Err(Exception::throw_type(ctx, "http() expects an options object")),
    };
    let request = HttpOptions::from_json(&options)
        .and_then(HttpOptions::into_request)
        .map_err(|e| Exception::throw_type(ctx, &e.to_string()))?;

    let exchange = bridge.http.send(&bridge.recorder, request);
    let response = serde_json::to_string(&exchange.response)
        .map_err(|e| Exception::throw_message(ctx, &e.to_string()))?;
    let slot = bridge.track(exchange.result);

    let value = json_parse(ctx, &response)?;
    let Some(object) = value.clone().into_object() else {
        return Err(Exception::throw_message(ctx, "http() produced a non-object response"));
    };

    let success = slot.clone();
    object.set("success", Function::new(ctx.clone(), move |ctx: Ctx<'js>| seal(&ctx, &success, None))?)?;
    object.set(
        "fail",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, reason: Opt<Coerced<String>>| {
            let reason = reason.0.map(|r| r.0).unwrap_or_else(|| NO_REASON.to_owned());
            seal(&ctx, &slot, Some(reason))
        })?,
    )?;

    Ok(value)
}

fn seal(ctx: &Ctx<'_>, slot: &Slot, reason: Option<String>) -> rquickjs::Result<()> {
    let Some(handle) = slot.borrow_mut().take() else {
        return Err(Exception::throw_message(ctx, &RecorderError::AlreadySealed.to_string()));
    };
    let result = match reason {
        None => handle.success(),
        Some(reason) => handle.fail(reason),
    };
    result.map_err(|e| Exception::throw_message(ctx, &e.to_string()))
}
