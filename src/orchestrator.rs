//! Lifecycle orchestration: drives a [`Program`] across virtual users.
//!
//! Every virtual user runs on its own named OS thread (`vu-N`) and owns one
//! execution clone, so the number of concurrent users is not bounded by the
//! runtime's blocking pool. `before_all` and `after_all` run on a separate
//! main clone on a blocking thread, which stays alive for the whole run so
//! that both hooks see the same script state.
use std::{ops::AddAssign, sync::Arc, thread, time::Duration};

use serde::Serialize;
use tokio::{
    runtime::Handle,
    select,
    sync::oneshot,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::LifecycleError,
    script::{CloneId, ExecutionClone, Hook, HookArgs, HookValue, Program},
};

/// Options of a single run.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Number of virtual users.
    pub vus: u32,

    /// How long the virtual users keep iterating.
    pub duration: Duration,

    /// Log response bodies.
    pub verbose: bool,

    /// Pause between two iterations of the same virtual user.
    pub iteration_delay: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { vus: 10, duration: Duration::from_secs(60), verbose: false, iteration_delay: Duration::ZERO }
    }
}

impl RunOptions {
    /// Checks the option ranges.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.vus == 0 {
            return Err(LifecycleError::Configuration("vus must be at least 1".into()));
        }
        if self.duration.is_zero() {
            return Err(LifecycleError::Configuration("duration must be greater than zero".into()));
        }
        Ok(())
    }
}

/// The optional hooks a program defines. `run` is always present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct LifecycleSpec {
    pub before_all:  bool,
    pub before_each: bool,
    pub after_each:  bool,
    pub after_all:   bool,
}

impl LifecycleSpec {
    /// Looks up the hooks of `program`.
    pub fn resolve<P: Program>(program: &P) -> Result<Self, LifecycleError> {
        if !program.defines(Hook::Run) {
            return Err(LifecycleError::Configuration("script must define a `run` function".into()));
        }
        Ok(Self {
            before_all:  program.defines(Hook::BeforeAll),
            before_each: program.defines(Hook::BeforeEach),
            after_each:  program.defines(Hook::AfterEach),
            after_all:   program.defines(Hook::AfterAll),
        })
    }

    fn needs_main_clone(&self) -> bool {
        self.before_all || self.after_all
    }
}

/// Iteration statistics of a finished run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleStats {
    /// Iterations whose `run` returned.
    pub iterations:  u64,
    /// Non-fatal `before_each`/`after_each` failures.
    pub hook_errors: u64,
}

impl AddAssign for LifecycleStats {
    fn add_assign(&mut self, other: Self) {
        self.iterations += other.iterations;
        self.hook_errors += other.hook_errors;
    }
}

/// Runs `program` with `opts.vus` virtual users until `opts.duration` has
/// elapsed or `cancel` is cancelled.
///
/// Only the first fatal error is returned. `after_all` runs once every
/// virtual user has stopped, unless a fatal error occurred.
pub async fn run<P: Program>(
    cancel: CancellationToken,
    program: Arc<P>,
    opts: &RunOptions,
) -> Result<LifecycleStats, LifecycleError> {
    opts.validate()?;
    let spec = LifecycleSpec::resolve(program.as_ref())?;
    let cancel = cancel.child_token();

    let mut main = spec.needs_main_clone().then(|| MainClone::spawn(program.clone(), spec));
    let before_all = match &mut main {
        Some(main) => main.before_all().await?,
        None => None,
    };
    let before_all = Arc::new(before_all);

    tracing::debug!(vus = opts.vus, duration = ?opts.duration, "starting virtual users");
    let mut set = JoinSet::new();
    for worker in 0..opts.vus {
        let program = program.clone();
        let before_all = before_all.clone();
        let delay = opts.iteration_delay;
        let handle = Handle::current();
        let (tx, rx) = oneshot::channel();

        let spawned = thread::Builder::new().name(format!("vu-{worker}")).spawn({
            let cancel = cancel.clone();
            move || {
                let span = tracing::debug_span!("vu", id = worker);
                let _enter = span.enter();
                let vu =
                    VirtualUser { worker, spec, before_all: before_all.as_ref().as_ref(), cancel: &cancel, delay };
                let res = vu.run(program.as_ref(), &handle);
                if res.is_err() {
                    cancel.cancel();
                }
                let _ = tx.send(res);
            }
        });
        if let Err(source) = spawned {
            cancel.cancel();
            set.spawn(async move { Err(LifecycleError::Spawn { worker, source }) });
            break;
        }
        // a dropped sender means the thread unwound before reporting
        set.spawn(async move { rx.await.unwrap_or(Err(LifecycleError::Aborted { worker })) });
    }

    let deadline = tokio::time::sleep(opts.duration);
    tokio::pin!(deadline);

    let mut stats = LifecycleStats::default();
    let mut first_error = None;
    loop {
        select! {
            biased;
            _ = &mut deadline, if !cancel.is_cancelled() => cancel.cancel(),
            res = set.join_next() => match res {
                None => break,
                Some(res) => match res.map_err(LifecycleError::from).and_then(|r| r) {
                    Ok(s) => stats += s,
                    Err(e) => {
                        cancel.cancel();
                        if first_error.is_none() {
                            first_error = Some(e);
                        } else {
                            tracing::debug!(error = %e, "discarding subsequent error");
                        }
                    }
                },
            },
        }
    }
    if opts.verbose {
        tracing::info!(iterations = stats.iterations, hook_errors = stats.hook_errors, "virtual users stopped");
    } else {
        tracing::debug!(iterations = stats.iterations, "virtual users stopped");
    }

    let Some(main) = main else {
        return first_error.map_or(Ok(stats), Err);
    };
    match first_error {
        None => main.finish(true).await.map(|_| stats),
        Some(e) => {
            if let Err(discarded) = main.finish(false).await {
                tracing::debug!(error = %discarded, "discarding subsequent error");
            }
            Err(e)
        }
    }
}

struct VirtualUser<'a> {
    worker:     u32,
    spec:       LifecycleSpec,
    before_all: Option<&'a HookValue>,
    cancel:     &'a CancellationToken,
    delay:      Duration,
}

impl VirtualUser<'_> {
    fn run<P: Program>(&self, program: &P, handle: &Handle) -> Result<LifecycleStats, LifecycleError> {
        let id = CloneId::Worker(self.worker);
        let mut clone = program.instantiate(id).map_err(|source| LifecycleError::Instantiate { id, source })?;

        let mut stats = LifecycleStats::default();
        while !self.cancel.is_cancelled() {
            self.iteration(&mut clone, &mut stats)?;

            if !self.delay.is_zero() {
                handle.block_on(async {
                    select! {
                        biased;
                        _ = self.cancel.cancelled() => (),
                        _ = tokio::time::sleep(self.delay) => (),
                    }
                });
            }
        }
        Ok(stats)
    }

    fn iteration<C: ExecutionClone>(&self, clone: &mut C, stats: &mut LifecycleStats) -> Result<(), LifecycleError> {
        let mut args = HookArgs { before_all: self.before_all, cancel: Some(self.cancel), ..Default::default() };

        let before_each = if self.spec.before_each {
            match clone.call(Hook::BeforeEach, args) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "before_each() failed, skipping iteration");
                    stats.hook_errors += 1;
                    return Ok(());
                }
            }
        } else {
            None
        };
        args.before_each = before_each.as_ref();

        let run = clone
            .call(Hook::Run, args)
            .map_err(|source| LifecycleError::Run { worker: self.worker, source })?;
        stats.iterations += 1;

        if self.spec.after_each {
            args.run = run.as_ref();
            if let Err(e) = clone.call(Hook::AfterEach, args) {
                tracing::warn!(error = %e, "after_each() failed");
                stats.hook_errors += 1;
            }
        }
        Ok(())
    }
}

/// The clone running `before_all` and `after_all`.
struct MainClone {
    ready:  Option<oneshot::Receiver<Result<Option<HookValue>, LifecycleError>>>,
    finish: oneshot::Sender<bool>,
    done:   JoinHandle<Result<(), LifecycleError>>,
}

impl MainClone {
    fn spawn<P: Program>(program: Arc<P>, spec: LifecycleSpec) -> Self {
        let (ready_tx, ready) = oneshot::channel();
        let (finish, finish_rx) = oneshot::channel::<bool>();

        let done = tokio::task::spawn_blocking(move || {
            let span = tracing::debug_span!("main");
            let _enter = span.enter();

            let mut clone = match program.instantiate(CloneId::Main) {
                Ok(clone) => clone,
                Err(source) => {
                    let _ = ready_tx.send(Err(LifecycleError::Instantiate { id: CloneId::Main, source }));
                    return Ok(());
                }
            };

            let before_all = if spec.before_all {
                match clone.call(Hook::BeforeAll, HookArgs::default()) {
                    Ok(v) => v,
                    Err(source) => {
                        let _ = ready_tx.send(Err(LifecycleError::Hook { hook: Hook::BeforeAll, source }));
                        return Ok(());
                    }
                }
            } else {
                None
            };
            if ready_tx.send(Ok(before_all.clone())).is_err() {
                return Ok(());
            }

            // a dropped sender means the run was abandoned
            let run_after_all = finish_rx.blocking_recv().unwrap_or(false);
            if run_after_all && spec.after_all {
                let args = HookArgs { before_all: before_all.as_ref(), ..Default::default() };
                clone
                    .call(Hook::AfterAll, args)
                    .map_err(|source| LifecycleError::Hook { hook: Hook::AfterAll, source })?;
            }
            Ok(())
        });

        Self { ready: Some(ready), finish, done }
    }

    /// Waits for `before_all` and returns its result.
    async fn before_all(&mut self) -> Result<Option<HookValue>, LifecycleError> {
        let Some(ready) = self.ready.take() else {
            return Ok(None);
        };
        match ready.await {
            Ok(res) => res,
            // the thread ended without reporting, which only happens on panic
            Err(_) => Err(match (&mut self.done).await {
                Err(e) => e.into(),
                Ok(Err(e)) => e,
                Ok(Ok(())) => LifecycleError::Configuration("main execution context exited early".into()),
            }),
        }
    }

    /// Lets the main clone run `after_all` (when `run_after_all`) and waits
    /// for it to exit.
    async fn finish(self, run_after_all: bool) -> Result<(), LifecycleError> {
        let _ = self.finish.send(run_after_all);
        self.done.await?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::{
        error::ScriptError,
        script::{NativeClone, NativeProgram},
    };

    /// Counts how many clones were created.
    struct Counting {
        inner:          NativeProgram,
        instantiations: AtomicU32,
    }

    impl Counting {
        fn new(inner: NativeProgram) -> Arc<Self> {
            Arc::new(Self { inner, instantiations: AtomicU32::new(0) })
        }

        fn instantiations(&self) -> u32 {
            self.instantiations.load(Ordering::SeqCst)
        }
    }

    impl Program for Counting {
        type Instance = NativeClone;

        fn defines(&self, hook: Hook) -> bool {
            self.inner.defines(hook)
        }

        fn instantiate(&self, id: CloneId) -> Result<NativeClone, ScriptError> {
            self.instantiations.fetch_add(1, Ordering::SeqCst);
            self.inner.instantiate(id)
        }
    }

    fn opts(vus: u32, duration: Duration) -> RunOptions {
        RunOptions { vus, duration, ..Default::default() }
    }

    fn fail(message: &str) -> ScriptError {
        ScriptError::Exception(message.into())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_run_is_a_configuration_error() {
        let program = Counting::new(NativeProgram::builder().before_all(|_, _| Ok(None)).build());

        let err = run(CancellationToken::new(), program.clone(), &opts(4, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Configuration(_)), "{err}");
        assert_eq!(program.instantiations(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_options_are_rejected() {
        let program = Arc::new(NativeProgram::builder().run(|_, _| Ok(None)).build());

        let err = run(CancellationToken::new(), program.clone(), &opts(0, Duration::from_secs(1))).await;
        assert!(matches!(err, Err(LifecycleError::Configuration(_))));
        let err = run(CancellationToken::new(), program, &opts(1, Duration::ZERO)).await;
        assert!(matches!(err, Err(LifecycleError::Configuration(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_failure_cancels_every_worker() {
        let calls = Arc::new(AtomicU32::new(0));
        let program = {
            let calls = calls.clone();
            Arc::new(
                NativeProgram::builder()
                    .run(move |_, _| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(fail("always"))
                    })
                    .build(),
            )
        };

        let started = std::time::Instant::now();
        let err = run(CancellationToken::new(), program, &opts(3, Duration::from_secs(60))).await.unwrap_err();

        assert!(matches!(err, LifecycleError::Run { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(calls.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn iterations_scale_with_duration_and_vus() {
        let program = Arc::new(
            NativeProgram::builder()
                .run(|_, _| {
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(None)
                })
                .build(),
        );

        let stats = run(CancellationToken::new(), program, &opts(5, Duration::from_secs(2))).await.unwrap();
        assert!((950..=1050).contains(&stats.iterations), "iterations: {}", stats.iterations);
        assert_eq!(stats.hook_errors, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn every_vu_runs_beyond_the_blocking_pool_size() {
        let seen = Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
        let program = {
            let seen = seen.clone();
            Arc::new(
                NativeProgram::builder()
                    .run(move |id, _| {
                        seen.lock().unwrap().insert(id);
                        std::thread::sleep(Duration::from_millis(10));
                        Ok(None)
                    })
                    .build(),
            )
        };

        let stats = run(CancellationToken::new(), program, &opts(600, Duration::from_secs(2))).await.unwrap();
        assert!(stats.iterations >= 600);
        assert_eq!(seen.lock().unwrap().len(), 600);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn before_each_failure_skips_only_that_iteration() {
        let counter = Arc::new(AtomicU32::new(0));
        let runs = Arc::new(AtomicU32::new(0));
        let program = {
            let (counter, runs) = (counter.clone(), runs.clone());
            Arc::new(
                NativeProgram::builder()
                    .before_each(move |_, _| {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        if n % 2 == 0 { Err(fail("odd one out")) } else { Ok(Some(json!(n))) }
                    })
                    .run(move |_, args| {
                        assert!(args.before_each.is_some());
                        runs.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(1));
                        Ok(None)
                    })
                    .build(),
            )
        };

        let stats = run(CancellationToken::new(), program, &opts(1, Duration::from_millis(200))).await.unwrap();
        assert!(stats.iterations > 0);
        assert!(stats.hook_errors > 0);
        assert_eq!(stats.iterations, u64::from(runs.load(Ordering::SeqCst)));
        assert_eq!(stats.iterations + stats.hook_errors, u64::from(counter.load(Ordering::SeqCst)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn before_all_data_reaches_every_hook() {
        let after_all = Arc::new(AtomicU32::new(0));
        let program = {
            let after_all = after_all.clone();
            let expect = |args: HookArgs<'_>| match args.before_all {
                Some(v) if v == &json!({"token": "abc"}) => Ok(()),
                other => Err(fail(&format!("unexpected before_all: {other:?}"))),
            };
            Arc::new(
                NativeProgram::builder()
                    .before_all(|_, _| Ok(Some(json!({"token": "abc"}))))
                    .before_each(move |_, args| expect(args).map(|_| Some(json!(1))))
                    .run(move |_, args| {
                        expect(args)?;
                        std::thread::sleep(Duration::from_millis(1));
                        Ok(args.before_each.cloned())
                    })
                    .after_each(move |_, args| match args.run {
                        Some(v) if v == &json!(1) => expect(args).map(|_| None),
                        _ => Err(fail("missing run result")),
                    })
                    .after_all(move |id, args| {
                        assert_eq!(id, CloneId::Main);
                        expect(args)?;
                        after_all.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    })
                    .build(),
            )
        };

        let stats = run(CancellationToken::new(), program, &opts(3, Duration::from_millis(200))).await.unwrap();
        assert!(stats.iterations > 0);
        assert_eq!(stats.hook_errors, 0);
        assert_eq!(after_all.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn after_all_is_skipped_after_a_run_error() {
        let after_all = Arc::new(AtomicU32::new(0));
        let program = {
            let after_all = after_all.clone();
            Arc::new(
                NativeProgram::builder()
                    .run(|_, _| Err(fail("broken")))
                    .after_all(move |_, _| {
                        after_all.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    })
                    .build(),
            )
        };

        let err = run(CancellationToken::new(), program, &opts(2, Duration::from_secs(60))).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Run { .. }));
        assert_eq!(after_all.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn before_all_failure_starts_no_worker() {
        let program = Counting::new(
            NativeProgram::builder()
                .before_all(|_, _| Err(fail("no token")))
                .run(|_, _| Ok(None))
                .build(),
        );

        let err = run(CancellationToken::new(), program.clone(), &opts(4, Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Hook { hook: Hook::BeforeAll, .. }), "{err}");
        assert_eq!(program.instantiations(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn after_all_error_is_returned() {
        let program = Arc::new(
            NativeProgram::builder()
                .run(|_, _| {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(None)
                })
                .after_all(|_, _| Err(fail("cleanup failed")))
                .build(),
        );

        let err = run(CancellationToken::new(), program, &opts(1, Duration::from_millis(50))).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Hook { hook: Hook::AfterAll, .. }), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_cancellation_stops_the_run() {
        let program = Arc::new(
            NativeProgram::builder()
                .run(|_, _| {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(None)
                })
                .build(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let mut options = opts(2, Duration::from_secs(60));
        options.iteration_delay = Duration::from_millis(5);
        let stats = run(cancel, program, &options).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(stats.iterations > 0);
    }
}
