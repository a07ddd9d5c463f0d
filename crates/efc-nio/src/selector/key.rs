//! Selection keys

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use efc_core::{Error, Result, SpinLock};

use super::{Attachment, Selector, SelectorInner, OP_ACCEPT, OP_CONNECT, OP_READ, OP_WRITE};
use crate::channel::SelectableChannel;

pub(crate) struct KeyInner {
    id: u64,
    channel: Arc<dyn SelectableChannel>,
    selector: Weak<SelectorInner>,
    selector_id: u64,
    interest: AtomicU32,
    ready: AtomicU32,
    valid: AtomicBool,
    attachment: SpinLock<Option<Attachment>>,
}

/// The registration of one channel with one selector.
///
/// Cloning yields another handle to the same registration.
#[derive(Clone)]
pub struct SelectionKey {
    inner: Arc<KeyInner>,
}

impl SelectionKey {
    pub(crate) fn new(
        id: u64,
        channel: Arc<dyn SelectableChannel>,
        selector: &Arc<SelectorInner>,
        interest: u32,
        attachment: Option<Attachment>,
    ) -> Self {
        SelectionKey {
            inner: Arc::new(KeyInner {
                id,
                channel,
                selector: Arc::downgrade(selector),
                selector_id: selector.id,
                interest: AtomicU32::new(interest),
                ready: AtomicU32::new(0),
                valid: AtomicBool::new(true),
                attachment: SpinLock::new(attachment),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<KeyInner>) -> Self {
        SelectionKey { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<KeyInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn is_inner(&self, other: &Weak<KeyInner>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), other.as_ptr())
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn channel(&self) -> &Arc<dyn SelectableChannel> {
        &self.inner.channel
    }

    /// The selector, unless it has been dropped.
    pub fn selector(&self) -> Option<Selector> {
        self.inner.selector.upgrade().map(Selector::from_inner)
    }

    pub(crate) fn selector_id(&self) -> u64 {
        self.inner.selector_id
    }

    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::CancelledKey)
        }
    }

    /// Request deregistration at the selector's next select.
    pub fn cancel(&self) {
        if !self.inner.valid.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.inner.selector.upgrade() {
            Some(sel) => sel.cancelled.push(self.clone()),
            None => {
                let core = self.channel().core();
                core.remove_key(self);
                if let Err(e) = core.kill() {
                    log::debug!("kill after orphaned cancel: {}", e);
                }
            }
        }
    }

    pub(crate) fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::SeqCst);
    }

    pub fn interest_ops(&self) -> Result<u32> {
        self.ensure_valid()?;
        Ok(self.raw_interest())
    }

    pub(crate) fn raw_interest(&self) -> u32 {
        self.inner.interest.load(Ordering::SeqCst)
    }

    /// Replace the interest set; takes effect at the next select.
    pub fn set_interest_ops(&self, ops: u32) -> Result<()> {
        self.ensure_valid()?;
        if ops & !self.channel().valid_ops() != 0 {
            return Err(Error::illegal_argument(format!("ops {:#x} not supported", ops)));
        }
        self.inner.interest.store(ops, Ordering::SeqCst);
        self.request_update();
        Ok(())
    }

    /// Have the selector recompute kernel interest for this key.
    pub(crate) fn request_update(&self) {
        if let Some(sel) = self.inner.selector.upgrade() {
            sel.updates.push(self.inner.id);
        }
    }

    pub fn ready_ops(&self) -> Result<u32> {
        self.ensure_valid()?;
        Ok(self.inner.ready.load(Ordering::SeqCst))
    }

    pub(crate) fn ready_cell(&self) -> &AtomicU32 {
        &self.inner.ready
    }

    fn ready_has(&self, op: u32) -> bool {
        self.ready_ops().map_or(false, |r| r & op != 0)
    }

    pub fn is_readable(&self) -> bool {
        self.ready_has(OP_READ)
    }

    pub fn is_writable(&self) -> bool {
        self.ready_has(OP_WRITE)
    }

    pub fn is_connectable(&self) -> bool {
        self.ready_has(OP_CONNECT)
    }

    pub fn is_acceptable(&self) -> bool {
        self.ready_has(OP_ACCEPT)
    }

    /// Swap the attachment, returning the previous one.
    pub fn attach(&self, attachment: Option<Attachment>) -> Option<Attachment> {
        std::mem::replace(&mut *self.inner.attachment.lock(), attachment)
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.inner.attachment.lock().clone()
    }
}

impl PartialEq for SelectionKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SelectionKey {}

impl fmt::Debug for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionKey")
            .field("id", &self.inner.id)
            .field("fd", &self.inner.channel.core().fd())
            .field("interest", &self.raw_interest())
            .field("ready", &self.inner.ready.load(Ordering::Relaxed))
            .field("valid", &self.is_valid())
            .finish()
    }
}
