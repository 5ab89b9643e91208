//! Matching of replies to outstanding calls by transaction id.
//!
//! Any number of requests may be in flight on one connection while a single
//! reader pulls replies off it. Each caller registers its xid before the
//! call goes out and waits on the returned receiver; the reader hands every
//! reply to whoever registered its xid. The first reply for an xid wins,
//! later duplicates (retransmission answers) find no entry and are dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::trace;

/// Outstanding calls of one server connection, keyed by xid.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `xid` and returns the receiver its reply will arrive on.
    ///
    /// Registering an xid twice replaces the earlier waiter, whose receiver
    /// then reports a closed channel.
    pub fn register(&self, xid: u32) -> oneshot::Receiver<Vec<u8>> {
        let (sender, receiver) = oneshot::channel();
        let mut calls = self.calls.lock().expect("unable to lock pending calls mutex");
        calls.insert(xid, sender);
        receiver
    }

    /// Delivers a reply. Returns false if nobody is waiting for `xid`.
    pub fn complete(&self, xid: u32, reply: Vec<u8>) -> bool {
        let waiter = {
            let mut calls = self.calls.lock().expect("unable to lock pending calls mutex");
            calls.remove(&xid)
        };
        match waiter {
            Some(sender) => sender.send(reply).is_ok(),
            None => {
                trace!("Dropping reply for unknown xid {}", xid);
                false
            }
        }
    }

    /// Forgets a call that will not wait for its reply any more.
    pub fn cancel(&self, xid: u32) -> bool {
        let mut calls = self.calls.lock().expect("unable to lock pending calls mutex");
        calls.remove(&xid).is_some()
    }

    /// Drops every waiter; their receivers observe a closed channel.
    pub fn cancel_all(&self) {
        let mut calls = self.calls.lock().expect("unable to lock pending calls mutex");
        calls.clear();
    }

    pub fn len(&self) -> usize {
        self.calls.lock().expect("unable to lock pending calls mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
