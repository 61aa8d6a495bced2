use std::cell::OnceCell;
use std::sync::Arc;

use bytes::Bytes;

use crate::errors::{PlayWireError, Result};

/// A function that returns an owned buffer to whatever pool it came from.
/// Boxed so `Payload::Owned` does not need to know about a concrete pool type.
pub type ReleaseFn = Box<dyn FnOnce(Vec<u8>) + Send + Sync>;

/// Ownership-tracked byte sequence handed across `Post`/`Reply` boundaries.
///
/// `Empty` and `Borrowed` are cheap to clone and never need releasing.
/// `Owned` came from a buffer pool and must be released exactly once.
/// `Lazy` defers serialization of a typed message until first read.
pub enum Payload {
    Empty,
    Borrowed(Bytes),
    Owned {
        bytes: Vec<u8>,
        release: Option<ReleaseFn>,
        released: bool,
    },
    Lazy {
        serialize: Arc<dyn Fn() -> Vec<u8> + Send + Sync>,
        cached: OnceCell<Bytes>,
    },
}

impl Payload {
    pub fn empty() -> Self {
        Payload::Empty
    }

    pub fn borrowed(bytes: impl Into<Bytes>) -> Self {
        Payload::Borrowed(bytes.into())
    }

    /// Wraps a pooled buffer; `release` is invoked exactly once, either
    /// explicitly via [`Payload::release`] or when the payload is dropped.
    pub fn owned(bytes: Vec<u8>, release: ReleaseFn) -> Self {
        Payload::Owned { bytes, release: Some(release), released: false }
    }

    /// An owned buffer with no backing pool; release is a no-op.
    pub fn owned_unpooled(bytes: Vec<u8>) -> Self {
        Payload::Owned { bytes, release: None, released: false }
    }

    pub fn lazy(serialize: impl Fn() -> Vec<u8> + Send + Sync + 'static) -> Self {
        Payload::Lazy { serialize: Arc::new(serialize), cached: OnceCell::new() }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.view()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// A read-only view over the payload's bytes. Fails if the payload has
    /// already been released.
    pub fn view(&self) -> Result<Bytes> {
        match self {
            Payload::Empty => Ok(Bytes::new()),
            Payload::Borrowed(b) => Ok(b.clone()),
            Payload::Owned { bytes, released, .. } => {
                if *released {
                    Err(PlayWireError::PayloadReleased)
                } else {
                    Ok(Bytes::copy_from_slice(bytes))
                }
            }
            Payload::Lazy { serialize, cached } => {
                let bytes = cached.get_or_init(|| Bytes::from(serialize()));
                Ok(bytes.clone())
            }
        }
    }

    /// Releases a pooled buffer back to its source. Idempotent for every
    /// variant except `Owned`, where calling it twice is an error.
    pub fn release(&mut self) -> Result<()> {
        if let Payload::Owned { bytes, release, released } = self {
            if *released {
                return Err(PlayWireError::PayloadReleased);
            }
            *released = true;
            if let Some(f) = release.take() {
                f(std::mem::take(bytes));
            }
        }
        Ok(())
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Payload::Owned { released, .. } = self {
            if !*released {
                let _ = self.release();
            }
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Empty => write!(f, "Payload::Empty"),
            Payload::Borrowed(b) => write!(f, "Payload::Borrowed({} bytes)", b.len()),
            Payload::Owned { bytes, released, .. } => {
                write!(f, "Payload::Owned({} bytes, released={released})", bytes.len())
            }
            Payload::Lazy { .. } => write!(f, "Payload::Lazy"),
        }
    }
}

/// Transport-agnostic payload envelope used at the user-facing API.
#[derive(Debug)]
pub struct Packet {
    pub msg_id: String,
    pub payload: Payload,
}

impl Packet {
    pub fn new(msg_id: impl Into<String>, payload: Payload) -> Self {
        Packet { msg_id: msg_id.into(), payload }
    }
}
