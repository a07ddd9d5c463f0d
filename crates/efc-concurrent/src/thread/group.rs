//! Thread groups
//!
//! Groups form a tree rooted at the "system" group; "main" is its first
//! child and the default home of attached threads. A child holds its
//! parent strongly; a group holds its member threads and child groups
//! weakly, so dropping the last handle to an empty subtree frees it.
//!
//! Traversals lock one level at a time: copy the members out, unlock,
//! then recurse. Enumerate and destroy therefore never hold two group
//! locks at once.
//!
//! The daemon flag, destroyed flag and max priority share one 32-bit word,
//! one byte lane each, updated with byte CAS.

use std::sync::atomic::AtomicU32;
use std::sync::{Arc, OnceLock, Weak};

use efc_core::atomic::{cmpxchg_byte, load_byte_acquire};
use efc_core::{Error, Result, SpinLock};

use super::{default_uncaught, Thread, ThreadInner, UncaughtHandler, MAX_PRIORITY, MIN_PRIORITY};

const DAEMON_LANE: usize = 0;
const DESTROYED_LANE: usize = 1;
const PRIORITY_LANE: usize = 2;

#[derive(Default)]
struct Members {
    threads: Vec<Weak<ThreadInner>>,
    groups: Vec<Weak<GroupInner>>,
    unstarted: usize,
}

impl Members {
    fn live_threads(&self) -> Vec<Thread> {
        self.threads
            .iter()
            .filter_map(Weak::upgrade)
            .map(Thread::from_inner)
            .collect()
    }

    fn live_groups(&self) -> Vec<ThreadGroup> {
        self.groups
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| ThreadGroup { inner })
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.unstarted == 0
            && self.threads.iter().all(|w| w.strong_count() == 0)
            && self.groups.iter().all(|w| w.strong_count() == 0)
    }
}

pub(crate) struct GroupInner {
    name: String,
    parent: Option<ThreadGroup>,
    flags: AtomicU32,
    members: SpinLock<Members>,
    handler: SpinLock<Option<UncaughtHandler>>,
}

#[derive(Clone)]
pub struct ThreadGroup {
    inner: Arc<GroupInner>,
}

static SYSTEM: OnceLock<ThreadGroup> = OnceLock::new();
static MAIN: OnceLock<ThreadGroup> = OnceLock::new();

fn pack_flags(daemon: bool, max_priority: i32) -> u32 {
    (daemon as u32) | ((max_priority as u32 & 0xFF) << (PRIORITY_LANE * 8))
}

impl ThreadGroup {
    fn create(parent: Option<ThreadGroup>, name: &str) -> ThreadGroup {
        let (daemon, max_priority) = match &parent {
            Some(p) => (p.is_daemon(), p.max_priority()),
            None => (false, MAX_PRIORITY),
        };
        ThreadGroup {
            inner: Arc::new(GroupInner {
                name: name.to_string(),
                parent,
                flags: AtomicU32::new(pack_flags(daemon, max_priority)),
                members: SpinLock::new(Members::default()),
                handler: SpinLock::new(None),
            }),
        }
    }

    /// Root of the group tree.
    pub fn system() -> ThreadGroup {
        SYSTEM
            .get_or_init(|| ThreadGroup::create(None, "system"))
            .clone()
    }

    /// Default group of attached threads.
    pub fn main() -> ThreadGroup {
        MAIN.get_or_init(|| {
            let system = ThreadGroup::system();
            let main = ThreadGroup::create(Some(system.clone()), "main");
            system
                .inner
                .members
                .lock()
                .groups
                .push(Arc::downgrade(&main.inner));
            main
        })
        .clone()
    }

    /// Create a child of `parent`. Fails if `parent` is destroyed.
    pub fn new(parent: &ThreadGroup, name: &str) -> Result<ThreadGroup> {
        let child = ThreadGroup::create(Some(parent.clone()), name);
        let mut members = parent.inner.members.lock();
        if parent.is_destroyed() {
            return Err(Error::IllegalThreadState(format!(
                "thread group \"{}\" is destroyed",
                parent.name()
            )));
        }
        members.groups.push(Arc::downgrade(&child.inner));
        Ok(child)
    }

    /// Child of the current thread's group.
    pub fn with_name(name: &str) -> Result<ThreadGroup> {
        let parent = Thread::current().group().unwrap_or_else(ThreadGroup::main);
        ThreadGroup::new(&parent, name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<ThreadGroup> {
        self.inner.parent.clone()
    }

    /// True if `self` is `other` or one of its ancestors.
    pub fn parent_of(&self, other: &ThreadGroup) -> bool {
        let mut cursor = Some(other.clone());
        while let Some(g) = cursor {
            if g == *self {
                return true;
            }
            cursor = g.parent();
        }
        false
    }

    pub fn is_daemon(&self) -> bool {
        load_byte_acquire(&self.inner.flags, DAEMON_LANE) != 0
    }

    pub fn set_daemon(&self, on: bool) {
        let new = on as u8;
        loop {
            let cur = load_byte_acquire(&self.inner.flags, DAEMON_LANE);
            if cmpxchg_byte(&self.inner.flags, DAEMON_LANE, cur, new) == cur {
                return;
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        load_byte_acquire(&self.inner.flags, DESTROYED_LANE) != 0
    }

    pub fn max_priority(&self) -> i32 {
        load_byte_acquire(&self.inner.flags, PRIORITY_LANE) as i32
    }

    /// Lower (or raise, up to the parent's cap) the maximum priority of
    /// this group and every subgroup. Out-of-range values are ignored.
    pub fn set_max_priority(&self, priority: i32) {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return;
        }
        let capped = match &self.inner.parent {
            Some(p) => priority.min(p.max_priority()),
            None => priority,
        } as u8;
        loop {
            let cur = load_byte_acquire(&self.inner.flags, PRIORITY_LANE);
            if cmpxchg_byte(&self.inner.flags, PRIORITY_LANE, cur, capped) == cur {
                break;
            }
        }
        let children = self.inner.members.lock().live_groups();
        for child in children {
            child.set_max_priority(capped as i32);
        }
    }

    // ── Membership ──

    pub(crate) fn add_unstarted(&self) -> Result<()> {
        let mut members = self.inner.members.lock();
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        members.unstarted += 1;
        Ok(())
    }

    pub(crate) fn add(&self, thread: &Thread) -> Result<()> {
        let mut members = self.inner.members.lock();
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        members.threads.retain(|w| w.strong_count() > 0);
        members.threads.push(Arc::downgrade(thread.inner()));
        members.unstarted = members.unstarted.saturating_sub(1);
        Ok(())
    }

    pub(crate) fn thread_terminated(&self, thread: &Thread) {
        let empty = {
            let mut members = self.inner.members.lock();
            let target = Arc::as_ptr(thread.inner());
            members
                .threads
                .retain(|w| w.strong_count() > 0 && w.as_ptr() != target);
            members.is_empty()
        };
        if empty && self.is_daemon() && !self.is_destroyed() {
            self.auto_destroy();
        }
    }

    fn remove_group(&self, child: &ThreadGroup) {
        let empty = {
            let mut members = self.inner.members.lock();
            let target = Arc::as_ptr(&child.inner);
            members
                .groups
                .retain(|w| w.strong_count() > 0 && w.as_ptr() != target);
            members.is_empty()
        };
        if empty && self.is_daemon() && !self.is_destroyed() {
            self.auto_destroy();
        }
    }

    fn auto_destroy(&self) {
        match self.destroy() {
            Ok(()) => log::debug!("daemon thread group \"{}\" destroyed", self.name()),
            // Lost a race with a new member or another destroyer
            Err(e) => log::trace!("daemon group \"{}\" kept: {}", self.name(), e),
        }
    }

    fn destroyed_error(&self) -> Error {
        Error::IllegalThreadState(format!("thread group \"{}\" is destroyed", self.name()))
    }

    /// Destroy this group and all its subgroups.
    ///
    /// Fails with `IllegalThreadState` if the group is already destroyed
    /// or any group in the subtree still has live threads. The root group
    /// is emptied but never marked destroyed.
    pub fn destroy(&self) -> Result<()> {
        let children = {
            let members = self.inner.members.lock();
            if self.is_destroyed() {
                return Err(self.destroyed_error());
            }
            if members.threads.iter().any(|w| w.strong_count() > 0) {
                return Err(Error::IllegalThreadState(format!(
                    "thread group \"{}\" has live threads",
                    self.name()
                )));
            }
            members.live_groups()
        };
        for child in &children {
            child.destroy()?;
        }
        if let Some(parent) = &self.inner.parent {
            {
                let mut members = self.inner.members.lock();
                if cmpxchg_byte(&self.inner.flags, DESTROYED_LANE, 0, 1) != 0 {
                    return Err(self.destroyed_error());
                }
                members.groups.clear();
                members.threads.clear();
            }
            parent.remove_group(self);
        }
        Ok(())
    }

    // ── Traversal ──

    /// Live threads in this group and, recursively, its subgroups.
    pub fn active_count(&self) -> usize {
        let (threads, groups) = {
            let m = self.inner.members.lock();
            (m.live_threads().len(), m.live_groups())
        };
        threads + groups.iter().map(ThreadGroup::active_count).sum::<usize>()
    }

    pub fn active_group_count(&self) -> usize {
        let groups = self.inner.members.lock().live_groups();
        groups.len()
            + groups
                .iter()
                .map(ThreadGroup::active_group_count)
                .sum::<usize>()
    }

    /// Snapshot of live threads, optionally including subgroups.
    pub fn enumerate(&self, recurse: bool) -> Vec<Thread> {
        let mut out = Vec::new();
        self.collect_threads(recurse, &mut out);
        out
    }

    fn collect_threads(&self, recurse: bool, out: &mut Vec<Thread>) {
        let (threads, groups) = {
            let m = self.inner.members.lock();
            (m.live_threads(), if recurse { m.live_groups() } else { Vec::new() })
        };
        out.extend(threads);
        for g in groups {
            g.collect_threads(recurse, out);
        }
    }

    pub fn enumerate_groups(&self, recurse: bool) -> Vec<ThreadGroup> {
        let mut out = Vec::new();
        let groups = self.inner.members.lock().live_groups();
        for g in groups {
            out.push(g.clone());
            if recurse {
                out.extend(g.enumerate_groups(true));
            }
        }
        out
    }

    /// Interrupt every live thread in the subtree.
    pub fn interrupt(&self) {
        for t in self.enumerate(true) {
            t.interrupt();
        }
    }

    // ── Uncaught panics ──

    pub fn set_uncaught_handler(&self, handler: Option<UncaughtHandler>) {
        *self.inner.handler.lock() = handler;
    }

    /// Route a panic: this group's handler, else the parent's, else the
    /// process default.
    pub fn uncaught_exception(&self, thread: &Thread, message: &str) {
        let handler = self.inner.handler.lock().clone();
        match (handler, &self.inner.parent) {
            (Some(h), _) => h(thread, message),
            (None, Some(parent)) => parent.uncaught_exception(thread, message),
            (None, None) => default_uncaught(thread, message),
        }
    }
}

impl PartialEq for ThreadGroup {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ThreadGroup {}

impl std::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("name", &self.name())
            .field("max_priority", &self.max_priority())
            .field("daemon", &self.is_daemon())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
