//! Reference-counted message bodies.
//!
//! A channel message body is shared by every packet produced while fanning
//! the message out. Each packet holds one reference for as long as it is
//! alive; the sender holds one more until the fan-out loop finishes. The
//! body is freed when the last reference is released.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

/// A body with explicit acquire/release accounting.
pub trait MessageBuffer: Send + Sync + fmt::Debug {
    /// Take one more reference.
    fn acquire(&self);

    /// Drop one reference. Returns `true` when this released the last one.
    fn release(&self) -> bool;

    /// The body bytes. Empty once the buffer has been freed.
    fn content(&self) -> Bytes;

    /// References currently held.
    fn ref_count(&self) -> usize;
}

/// Default [`MessageBuffer`] backed by [`Bytes`].
///
/// Starts with no owners; the first [`MessageBuffer::acquire`] is taken
/// by whoever builds the message around it.
pub struct SharedBuffer {
    content: Mutex<Option<Bytes>>,
    refs: AtomicUsize,
}

impl SharedBuffer {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: Mutex::new(Some(content.into())),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }

    /// Whether the last reference has been released.
    pub fn is_freed(&self) -> bool {
        self.content.lock().is_none()
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("refs", &self.ref_count())
            .field("freed", &self.is_freed())
            .finish()
    }
}

impl MessageBuffer for SharedBuffer {
    fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) -> bool {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => {
                self.content.lock().take();
                true
            }
            Ok(_) => false,
            Err(_) => {
                warn!("release of a message buffer without owners");
                false
            }
        }
    }

    fn content(&self) -> Bytes {
        self.content.lock().clone().unwrap_or_default()
    }

    fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}
