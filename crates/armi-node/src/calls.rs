//! Outstanding-call table -- one slot per in-flight outbound call.
//!
//! The caller registers a slot under its serial, transmits, and awaits the
//! slot under a timeout. The receive task completes the slot when the paired
//! response arrives; a response for an unknown serial (late, after timeout)
//! is dropped without waking anyone.

use std::collections::HashMap;
use std::sync::Mutex;

use armi_protocol::CallOutcome;
use tokio::sync::oneshot;

use crate::error::ArmiError;

type Slot = oneshot::Sender<Result<CallOutcome, ArmiError>>;

#[derive(Default)]
pub(crate) struct CallTable {
    pending: Mutex<HashMap<u64, Slot>>,
}

impl CallTable {
    /// Register a slot for a freshly minted serial.
    pub fn register(&self, serial: u64) -> oneshot::Receiver<Result<CallOutcome, ArmiError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(serial, tx);
        rx
    }

    /// Complete the call with its response. Returns false when the serial is
    /// unknown -- already timed out or never issued -- in which case the
    /// response is dropped.
    pub fn complete(&self, serial: u64, outcome: CallOutcome) -> bool {
        match self.pending.lock().unwrap().remove(&serial) {
            Some(slot) => slot.send(Ok(outcome)).is_ok(),
            None => false,
        }
    }

    /// Forget a call whose watchdog fired; a response arriving later finds
    /// no slot.
    pub fn discard(&self, serial: u64) {
        self.pending.lock().unwrap().remove(&serial);
    }

    /// Wake every outstanding caller with a terminal error. Used when the
    /// connection dies.
    pub fn abort_all(&self, reason: &str) {
        let drained: Vec<Slot> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            let _ = slot.send(Err(ArmiError::Closed(reason.to_owned())));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
