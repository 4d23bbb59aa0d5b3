//! In-flight request tracking.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::Packet;

#[derive(Debug)]
struct Inner {
    next_nonce: u32,
    pending: HashMap<u32, oneshot::Sender<Packet>>,
}

/// Nonce allocator and response slots for one socket.
///
/// Nonces are monotonic per socket, start at 1 and never yield 0, which
/// the wire reserves for "no response expected".
#[derive(Debug)]
pub struct RequestMap {
    inner: Mutex<Inner>,
}

impl Default for RequestMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_nonce: 1,
                pending: HashMap::new(),
            }),
        }
    }

    /// Allocate a nonce and the channel its response will arrive on.
    pub fn get(&self) -> (u32, oneshot::Receiver<Packet>) {
        let mut inner = self.inner.lock();

        let mut nonce = inner.next_nonce;
        while nonce == 0 || inner.pending.contains_key(&nonce) {
            nonce = nonce.wrapping_add(1);
        }
        inner.next_nonce = nonce.wrapping_add(1);

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(nonce, tx);
        (nonce, rx)
    }

    /// Take the response slot for `nonce`, if one is waiting.
    pub fn find(&self, nonce: u32) -> Option<oneshot::Sender<Packet>> {
        self.inner.lock().pending.remove(&nonce)
    }

    /// Forget a request, e.g. after its timeout fired.
    pub fn delete(&self, nonce: u32) -> bool {
        self.inner.lock().pending.remove(&nonce).is_some()
    }

    /// Drop every pending slot. Waiting requesters observe a closed channel.
    pub fn clear(&self) {
        self.inner.lock().pending.clear();
    }

    /// Number of requests awaiting a response.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
