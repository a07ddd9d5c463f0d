//! Threads
//!
//! A [`Thread`] is a shared handle to an OS thread's record: identity,
//! lifecycle state, interrupt flag, group membership, park target and an
//! optional interruptible blocker registered while the thread sits in a
//! blocking I/O call.
//!
//! Lifecycle: NEW -> (start, exactly once) -> RUNNABLE <-> BLOCKED/WAITING/
//! TIMED_WAITING -> TERMINATED. States only move forward to TERMINATED;
//! the intermediate ones are advisory and set around suspension points.
//!
//! OS threads not started through this module (the process main thread,
//! test harness threads) are attached on their first call to
//! [`Thread::current`] and detached when their thread-local storage is torn
//! down.

mod group;
mod local;

pub use group::ThreadGroup;
pub use local::{InheritableThreadLocal, ThreadLocal};

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use efc_core::{Error, Result, SpinLock};

use crate::park::{ParkEvent, ParkTimeout, Parker, WaitList};
use local::{InheritedValue, LocalMap};

pub const MIN_PRIORITY: i32 = 1;
pub const NORM_PRIORITY: i32 = 5;
pub const MAX_PRIORITY: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    New = 0,
    Runnable = 1,
    Blocked = 2,
    Waiting = 3,
    TimedWaiting = 4,
    Terminated = 5,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadState::New,
            1 => ThreadState::Runnable,
            2 => ThreadState::Blocked,
            3 => ThreadState::Waiting,
            4 => ThreadState::TimedWaiting,
            _ => ThreadState::Terminated,
        }
    }
}

/// Callback that unblocks a thread suspended in a blocking operation.
///
/// Registered with [`Thread::set_blocker`] for the duration of the
/// operation; [`Thread::interrupt`] invokes it before unparking.
pub trait Interruptible: Send + Sync {
    fn interrupt(&self, target: &Thread);
}

/// Receives the message of a panic that escaped a thread body.
pub type UncaughtHandler = Arc<dyn Fn(&Thread, &str) + Send + Sync>;

type Body = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ThreadInner {
    id: u64,
    name: SpinLock<Arc<str>>,
    state: AtomicU8,
    started: AtomicBool,
    interrupted: AtomicBool,
    daemon: AtomicBool,
    priority: AtomicI32,
    group: SpinLock<Option<ThreadGroup>>,
    handler: SpinLock<Option<UncaughtHandler>>,
    parker: SpinLock<Option<Arc<Parker>>>,
    sleep_event: Arc<ParkEvent>,
    blocker: Mutex<Option<Arc<dyn Interruptible>>>,
    joiners: WaitList,
    body: SpinLock<Option<Body>>,
    stack_size: Option<usize>,
    inherited: SpinLock<Vec<InheritedValue>>,
}

/// Shared handle to a thread record.
#[derive(Clone)]
pub struct Thread {
    inner: Arc<ThreadInner>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static REGISTRY: SpinLock<BTreeMap<u64, Thread>> = SpinLock::new(BTreeMap::new());
static DEFAULT_HANDLER: SpinLock<Option<UncaughtHandler>> = SpinLock::new(None);

struct Context {
    thread: RefCell<Option<Thread>>,
    attached: Cell<bool>,
    locals: RefCell<LocalMap>,
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.attached.get() {
            if let Some(thread) = self.thread.get_mut().take() {
                thread.exit();
            }
        }
    }
}

thread_local! {
    static CONTEXT: Context = Context {
        thread: RefCell::new(None),
        attached: Cell::new(false),
        locals: RefCell::new(LocalMap::new()),
    };
}

/// Run `f` on the current thread's thread-local table.
pub(crate) fn with_locals<R>(f: impl FnOnce(&mut LocalMap) -> R) -> Result<R> {
    CONTEXT
        .try_with(|c| {
            let mut map = c
                .locals
                .try_borrow_mut()
                .map_err(|_| Error::illegal_state("thread-local table is busy"))?;
            Ok(f(&mut map))
        })
        .map_err(|_| Error::illegal_state("thread is exiting"))?
}

/// Thread id of the caller, attaching it if needed.
#[inline]
pub fn current_id() -> u64 {
    CONTEXT
        .try_with(|c| c.thread.borrow().as_ref().map(Thread::id))
        .ok()
        .flatten()
        .unwrap_or_else(|| Thread::current().id())
}

/// Text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

impl Thread {
    fn record(
        name: Option<String>,
        group: Option<ThreadGroup>,
        daemon: bool,
        priority: i32,
        stack_size: Option<usize>,
        body: Option<Body>,
    ) -> Thread {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let name = name.unwrap_or_else(|| format!("Thread-{}", id));
        Thread {
            inner: Arc::new(ThreadInner {
                id,
                name: SpinLock::new(Arc::from(name)),
                state: AtomicU8::new(ThreadState::New as u8),
                started: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
                daemon: AtomicBool::new(daemon),
                priority: AtomicI32::new(priority),
                group: SpinLock::new(group),
                handler: SpinLock::new(None),
                parker: SpinLock::new(None),
                sleep_event: ParkEvent::new(),
                blocker: Mutex::new(None),
                joiners: WaitList::new(),
                body: SpinLock::new(body),
                stack_size,
                inherited: SpinLock::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ThreadInner>) -> Thread {
        Thread { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ThreadInner> {
        &self.inner
    }

    /// Create an unstarted thread running `f`.
    pub fn new<F>(f: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        Builder::new().build(f)
    }

    /// Create and start a thread running `f`.
    pub fn spawn<F>(f: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        Builder::new().spawn(f)
    }

    /// The calling thread, attaching it on first use.
    pub fn current() -> Thread {
        CONTEXT
            .try_with(|c| {
                if let Some(t) = c.thread.borrow().as_ref() {
                    return t.clone();
                }
                let t = Thread::attach();
                *c.thread.borrow_mut() = Some(t.clone());
                c.attached.set(true);
                t
            })
            // Thread-local storage already torn down: hand out a record
            // that is never registered
            .unwrap_or_else(|_| {
                let t = Thread::record(
                    Some("<exiting>".to_string()),
                    None,
                    false,
                    NORM_PRIORITY,
                    None,
                    None,
                );
                t.inner.started.store(true, Ordering::Relaxed);
                t.inner.state.store(ThreadState::Runnable as u8, Ordering::Relaxed);
                *t.inner.parker.lock() = Some(Parker::allocate());
                t
            })
    }

    fn attach() -> Thread {
        let name = std::thread::current().name().map(str::to_string);
        let group = ThreadGroup::main();
        let t = Thread::record(name, Some(group.clone()), false, NORM_PRIORITY, None, None);
        t.inner.started.store(true, Ordering::Relaxed);
        *t.inner.parker.lock() = Some(Parker::allocate());
        t.inner
            .state
            .store(ThreadState::Runnable as u8, Ordering::SeqCst);
        if let Err(e) = group.add(&t) {
            log::warn!("attaching thread \"{}\": {}", t.name(), e);
        }
        REGISTRY.lock().insert(t.id(), t.clone());
        log::trace!("attached thread {} \"{}\"", t.id(), t.name());
        t
    }

    /// Start the thread. Fails with `IllegalThreadState` on a second call.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::IllegalThreadState("thread already started".into()));
        }
        let group = match self.group() {
            Some(g) => g,
            None => return Err(Error::IllegalThreadState("thread has no group".into())),
        };
        if let Err(e) = group.add(self) {
            self.inner.started.store(false, Ordering::Release);
            return Err(e);
        }
        REGISTRY.lock().insert(self.id(), self.clone());
        *self.inner.parker.lock() = Some(Parker::allocate());
        self.inner
            .state
            .store(ThreadState::Runnable as u8, Ordering::SeqCst);

        let body = self.inner.body.lock().take();
        let mut builder = std::thread::Builder::new().name(self.name().to_string());
        if let Some(size) = self.inner.stack_size {
            builder = builder.stack_size(size);
        }
        let me = self.clone();
        match builder.spawn(move || run_main(me, body)) {
            Ok(_) => Ok(()),
            Err(e) => {
                log::error!("failed to spawn thread \"{}\": {}", self.name(), e);
                self.exit();
                Err(e.into())
            }
        }
    }

    /// Release everything the running thread held and wake its joiners.
    fn exit(&self) {
        *self
            .inner
            .blocker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        if let Some(parker) = self.inner.parker.lock().take() {
            Parker::release(parker);
        }
        let group = self.inner.group.lock().take();
        if let Some(group) = group {
            group.thread_terminated(self);
        }
        REGISTRY.lock().remove(&self.id());
        self.inner
            .state
            .store(ThreadState::Terminated as u8, Ordering::SeqCst);
        self.inner.joiners.fire_all();
        log::trace!("thread {} \"{}\" exited", self.id(), self.name());
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> Arc<str> {
        Arc::clone(&self.inner.name.lock())
    }

    pub fn set_name(&self, name: &str) {
        *self.inner.name.lock() = Arc::from(name);
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// Started and not yet terminated.
    pub fn is_alive(&self) -> bool {
        !matches!(self.state(), ThreadState::New | ThreadState::Terminated)
    }

    pub fn is_daemon(&self) -> bool {
        self.inner.daemon.load(Ordering::Relaxed)
    }

    /// Only allowed before `start`.
    pub fn set_daemon(&self, on: bool) -> Result<()> {
        if self.inner.started.load(Ordering::Acquire) {
            return Err(Error::IllegalThreadState(
                "daemon flag can only be set before start".into(),
            ));
        }
        self.inner.daemon.store(on, Ordering::Relaxed);
        Ok(())
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority.load(Ordering::Relaxed)
    }

    /// Set the priority, clamped to the group's maximum.
    pub fn set_priority(&self, priority: i32) -> Result<()> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(Error::illegal_argument(format!(
                "priority {} outside [{}, {}]",
                priority, MIN_PRIORITY, MAX_PRIORITY
            )));
        }
        let cap = self.group().map(|g| g.max_priority()).unwrap_or(MAX_PRIORITY);
        self.inner
            .priority
            .store(priority.min(cap), Ordering::Relaxed);
        Ok(())
    }

    /// The thread's group; `None` once it has terminated.
    pub fn group(&self) -> Option<ThreadGroup> {
        self.inner.group.lock().clone()
    }

    pub fn set_uncaught_handler(&self, handler: Option<UncaughtHandler>) {
        *self.inner.handler.lock() = handler;
    }

    pub fn uncaught_handler(&self) -> Option<UncaughtHandler> {
        self.inner.handler.lock().clone()
    }

    /// Handler used when neither the thread nor any of its groups handles
    /// a panic.
    pub fn set_default_uncaught_handler(handler: Option<UncaughtHandler>) {
        *DEFAULT_HANDLER.lock() = handler;
    }

    pub fn default_uncaught_handler() -> Option<UncaughtHandler> {
        DEFAULT_HANDLER.lock().clone()
    }

    fn dispatch_uncaught(&self, message: &str) {
        if let Some(handler) = self.uncaught_handler() {
            handler(self, message);
        } else if let Some(group) = self.group() {
            group.uncaught_exception(self, message);
        } else {
            default_uncaught(self, message);
        }
    }

    // ── Interrupts ──

    /// Set the interrupt flag, run the registered blocker, unpark.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        {
            let blocker = self
                .inner
                .blocker
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(b) = blocker.as_ref() {
                b.interrupt(self);
            }
        }
        self.unpark();
        self.inner.sleep_event.unpark();
    }

    /// Peek at the interrupt flag.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Read and clear the current thread's interrupt flag.
    pub fn interrupted() -> bool {
        let me = Thread::current();
        if !me.inner.interrupted.load(Ordering::SeqCst) {
            return false;
        }
        me.inner.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Register (or clear, with `None`) the current thread's blocker.
    pub fn set_blocker(blocker: Option<Arc<dyn Interruptible>>) {
        let me = Thread::current();
        *me.inner
            .blocker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = blocker;
    }

    // ── Parking ──

    /// Give this thread's parker a permit.
    pub fn unpark(&self) {
        let parker = self.inner.parker.lock().clone();
        if let Some(p) = parker {
            p.unpark();
        }
    }

    /// Park the current thread without consulting the interrupt flag.
    pub(crate) fn park_raw(&self, timeout: ParkTimeout) -> bool {
        debug_assert_eq!(self.id(), current_id());
        let parker = self.inner.parker.lock().clone();
        match parker {
            Some(p) => p.park_timeout(timeout),
            None => false,
        }
    }

    // ── Sleep / yield / join ──

    /// Sleep for `duration`; an interrupt ends the sleep with
    /// `Interrupted` and clears the flag.
    pub fn sleep(duration: Duration) -> Result<()> {
        if Thread::interrupted() {
            return Err(Error::Interrupted);
        }
        let me = Thread::current();
        let deadline = Instant::now().checked_add(duration);
        me.set_state(ThreadState::TimedWaiting);
        let result = loop {
            let timeout = match deadline {
                None => ParkTimeout::Forever,
                Some(d) => match ParkTimeout::until_instant(d) {
                    Some(t) => t,
                    None => break Ok(()),
                },
            };
            me.inner.sleep_event.park(timeout);
            if Thread::interrupted() {
                break Err(Error::Interrupted);
            }
        };
        me.set_state(ThreadState::Runnable);
        result
    }

    pub fn yield_now() {
        std::thread::yield_now();
    }

    /// Wait for this thread to terminate.
    pub fn join(&self) -> Result<()> {
        self.join_deadline(None).map(|_| ())
    }

    /// Wait at most `timeout`; `Ok(false)` if the thread is still alive.
    pub fn join_timeout(&self, timeout: Duration) -> Result<bool> {
        self.join_deadline(Instant::now().checked_add(timeout))
    }

    fn join_deadline(&self, deadline: Option<Instant>) -> Result<bool> {
        if self.id() == current_id() {
            return Err(Error::IllegalThreadState("a thread cannot join itself".into()));
        }
        if Thread::interrupted() {
            return Err(Error::Interrupted);
        }
        let me = Thread::current();
        let event = Arc::clone(&me.inner.sleep_event);
        me.set_state(if deadline.is_some() {
            ThreadState::TimedWaiting
        } else {
            ThreadState::Waiting
        });
        let result = loop {
            if !self.is_alive() {
                break Ok(true);
            }
            self.inner.joiners.push(&event);
            if !self.is_alive() {
                self.inner.joiners.remove(&event);
                break Ok(true);
            }
            let timeout = match deadline {
                None => ParkTimeout::Forever,
                Some(d) => match ParkTimeout::until_instant(d) {
                    Some(t) => t,
                    None => {
                        self.inner.joiners.remove(&event);
                        break Ok(false);
                    }
                },
            };
            event.park(timeout);
            self.inner.joiners.remove(&event);
            if Thread::interrupted() {
                break Err(Error::Interrupted);
            }
        };
        me.set_state(ThreadState::Runnable);
        result
    }

    // ── Registry ──

    /// Number of live threads known to the registry.
    pub fn active_count() -> usize {
        REGISTRY.lock().len()
    }

    /// Snapshot of every live thread.
    pub fn enumerate() -> Vec<Thread> {
        REGISTRY.lock().values().cloned().collect()
    }

    pub fn by_id(id: u64) -> Option<Thread> {
        REGISTRY.lock().get(&id).cloned()
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Thread {}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn default_uncaught(thread: &Thread, message: &str) {
    match Thread::default_uncaught_handler() {
        Some(handler) => handler(thread, message),
        None => log::error!(
            "uncaught panic in thread {} \"{}\": {}",
            thread.id(),
            thread.name(),
            message
        ),
    }
}

fn run_main(thread: Thread, body: Option<Body>) {
    let inherited = std::mem::take(&mut *thread.inner.inherited.lock());
    CONTEXT.with(|c| {
        *c.thread.borrow_mut() = Some(thread.clone());
        c.attached.set(false);
        c.locals.borrow_mut().seed(inherited);
    });
    log::trace!("thread {} \"{}\" running", thread.id(), thread.name());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        if let Some(body) = body {
            body();
        }
    }));
    if let Err(payload) = outcome {
        let message = panic_message(payload.as_ref());
        thread.dispatch_uncaught(&message);
    }

    // Values may touch other thread-locals while dropping
    let locals = CONTEXT.with(|c| std::mem::take(&mut *c.locals.borrow_mut()));
    drop(locals);
    thread.exit();
}

/// Configures a thread before creation.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    group: Option<ThreadGroup>,
    daemon: Option<bool>,
    priority: Option<i32>,
    stack_size: Option<usize>,
    handler: Option<UncaughtHandler>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn group(mut self, group: ThreadGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn daemon(mut self, on: bool) -> Self {
        self.daemon = Some(on);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn uncaught_handler(mut self, handler: UncaughtHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Create the thread in state NEW.
    ///
    /// The group, daemon flag and priority default to the creating
    /// thread's. Inheritable thread-locals are copied now.
    pub fn build<F>(self, f: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let parent = Thread::current();
        let group = match self.group {
            Some(g) => g,
            None => parent.group().unwrap_or_else(ThreadGroup::main),
        };
        let priority = match self.priority {
            Some(p) if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&p) => {
                return Err(Error::illegal_argument(format!("priority {} out of range", p)))
            }
            Some(p) => p,
            None => parent.priority(),
        }
        .min(group.max_priority());
        let daemon = self.daemon.unwrap_or_else(|| parent.is_daemon());

        group.add_unstarted()?;
        let thread = Thread::record(
            self.name,
            Some(group),
            daemon,
            priority,
            self.stack_size,
            Some(Box::new(f)),
        );
        *thread.inner.handler.lock() = self.handler;
        *thread.inner.inherited.lock() = local::inherit_from_current();
        Ok(thread)
    }

    pub fn spawn<F>(self, f: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = self.build(f)?;
        thread.start()?;
        Ok(thread)
    }
}

/// Create the root groups and attach the calling thread.
pub fn init() {
    let _ = ThreadGroup::main();
    let _ = Thread::current();
}

pub fn teardown() {
    Thread::set_default_uncaught_handler(None);
}
