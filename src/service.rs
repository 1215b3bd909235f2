//! Defines the Service trait, implemented by every long-running VRCore
//! component, and the [`ServiceRunner`] that drives one on its own thread.
//! This enforces a common lifecycle: `on_start` acquires resources and marks
//! the service ready, `run` loops until a stop is requested, and `on_stop`
//! tears down, whatever happened before it.

use crate::error::{Error, Result};
use crate::signal::{Signal, SharedSignal};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Longest a `run` loop should go without checking for a stop request.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Readiness and stop flags handed to every lifecycle hook.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    name: String,
    ready: SharedSignal,
    stop: SharedSignal,
}

impl ServiceContext {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ready: Signal::shared(),
            stop: Signal::shared(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares the service operational.
    pub fn mark_ready(&self) {
        self.ready.set();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_set()
    }

    /// Sleeps up to `timeout`, waking early on a stop request. Returns whether
    /// a stop was requested.
    pub fn wait_stop(&self, timeout: Duration) -> bool {
        self.stop.wait(timeout)
    }

    /// The stop flag, for helper threads owned by the service.
    pub fn stop_signal(&self) -> SharedSignal {
        Arc::clone(&self.stop)
    }
}

///
/// A long-running component of the controller. All structs that own a thread
/// of control must implement Service, so that they can be started, probed and
/// stopped the same way.
///
pub trait Service: Send + Sync + 'static {
    /// Name used for the thread and in log lines.
    fn name(&self) -> &str;

    /// Acquires resources and starts helper threads. Should call
    /// `ctx.mark_ready()` once the service is operational.
    fn on_start(&self, ctx: &ServiceContext) -> Result<()> {
        ctx.mark_ready();
        Ok(())
    }

    /// Blocking main loop. Must return soon after `ctx.stop_requested()`.
    fn run(&self, ctx: &ServiceContext) -> Result<()>;

    /// Releases everything `on_start` acquired. Must tolerate a partial start.
    fn on_stop(&self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// Component specific health, folded into `is_online`. Keep it fast.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Runs a [`Service`] on its own thread and exposes its lifecycle.
pub struct ServiceRunner<S: Service> {
    service: Arc<S>,
    ctx: ServiceContext,
    fatal: Arc<AtomicBool>,
    stopped: SharedSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<S: Service> ServiceRunner<S> {
    pub fn new(service: S) -> Self {
        Self::from_arc(Arc::new(service))
    }

    /// Wraps a service that other components also hold a handle to.
    pub fn from_arc(service: Arc<S>) -> Self {
        let ctx = ServiceContext::new(service.name());
        Self {
            service,
            ctx,
            fatal: Arc::new(AtomicBool::new(false)),
            stopped: Signal::shared(),
            handle: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Spawns the service thread. Only the first call does anything.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("{} : start() called more than once, ignoring.", self.service.name());
            return Ok(());
        }

        let service = Arc::clone(&self.service);
        let ctx = self.ctx.clone();
        let fatal = Arc::clone(&self.fatal);
        let stopped = Arc::clone(&self.stopped);

        let handle = thread::Builder::new()
            .name(format!("{}-svc", self.service.name()))
            .spawn(move || {
                lifecycle(service.as_ref(), &ctx, &fatal);
                stopped.set();
            })
            .map_err(|e| {
                self.fatal.store(true, Ordering::SeqCst);
                Error::Io(e)
            })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Requests a cooperative stop. Does not block.
    pub fn stop(&self) {
        self.ctx.stop.set();
    }

    pub fn stop_requested(&self) -> bool {
        self.ctx.stop_requested()
    }

    /// Waits up to `timeout` for the service to become ready.
    pub fn ready(&self, timeout: Duration) -> bool {
        self.ctx.ready.wait(timeout)
    }

    pub fn is_alive(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Thread alive, ready, not fatal and healthy by the service's own check.
    pub fn is_online(&self) -> bool {
        self.is_alive() && self.ctx.ready.is_set() && !self.is_fatal() && self.service.is_healthy()
    }

    /// Waits up to `timeout` for the thread to finish, teardown included.
    pub fn stopped(&self, timeout: Duration) -> bool {
        self.stopped.wait(timeout)
    }

    /// Like [`stopped`](Self::stopped), and reaps the thread when it has
    /// finished.
    pub fn join(&self, timeout: Duration) -> bool {
        if !self.stopped(timeout) {
            return false;
        }
        if let Some(handle) = self.handle.lock().take() {
            // The thread has already set `stopped`, so this returns at once.
            let _ = handle.join();
        }
        true
    }
}

impl<S: Service> Drop for ServiceRunner<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `on_start`, `run`, then `on_stop` no matter how the first two ended.
fn lifecycle<S: Service + ?Sized>(service: &S, ctx: &ServiceContext, fatal: &AtomicBool) {
    let name = service.name();

    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        service.on_start(ctx).map_err(|e| {
            error!("{} : error during on_start : {}.", name, e);
            e
        })?;
        if !ctx.ready.is_set() {
            debug!("{} : on_start returned without marking ready.", name);
        }
        service.run(ctx)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("{} : stopped with error : {}.", name, e);
            fatal.store(true, Ordering::SeqCst);
        }
        Err(panic) => {
            error!("{} : panicked : {}.", name, panic_message(&*panic));
            fatal.store(true, Ordering::SeqCst);
        }
    }

    match catch_unwind(AssertUnwindSafe(|| service.on_stop(ctx))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{} : error during on_stop : {}.", name, e),
        Err(panic) => warn!("{} : panicked in on_stop : {}.", name, panic_message(&*panic)),
    }
    info!("{} : terminated.", name);
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
