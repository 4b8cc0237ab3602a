//! In-flight operation records
//!
//! Every suspended socket call is one `OpEntry` in the engine's token
//! table: the operation kind, the engine-owned I/O buffer, and the
//! oneshot slot the waiting task parks on. The entry (and therefore the
//! buffer the kernel may still reference) lives until the operation's
//! terminal CQE has been dispatched.

use tokio::sync::oneshot;

/// Token reserved for the eventfd waker read. Never allocated to users.
pub const WAKE_TOKEN: u64 = u64::MAX;

/// Token reserved for fire-and-forget cancel SQEs pushed from the
/// poller's drop-path queue. Never allocated to users.
pub const CANCEL_TOKEN: u64 = u64::MAX - 1;

/// First token value that is NOT allocatable to user operations.
pub const RESERVED_TOKEN_FLOOR: u64 = CANCEL_TOKEN;

/// What kind of SQE an operation translates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Connect a socket; the entry buffer holds the encoded sockaddr.
    Connect,
    /// Accept one connection; the CQE result is the new fd.
    Accept,
    /// Receive into the entry buffer.
    Recv,
    /// Send the entry buffer.
    Send,
    /// Close the fd.
    Close,
    /// Cancel the operation carrying `target` as its token.
    Cancel { target: u64 },
    /// No-op; completes immediately. Used to nudge the poller.
    Nop,
}

impl OpKind {
    /// Whether this kind carries an I/O buffer in its entry.
    pub fn has_buffer(&self) -> bool {
        matches!(self, OpKind::Connect | OpKind::Recv | OpKind::Send)
    }
}

/// Terminal signal delivered to a waiter.
#[derive(Debug)]
pub enum CqOutcome {
    /// The kernel completed the operation. `res` is the raw CQE result
    /// (byte count, new fd, or negative errno); `buf` returns the
    /// engine-owned buffer, with received data for `Recv`.
    Done { res: i32, buf: Option<Vec<u8>> },
    /// The ring was torn down before the operation completed.
    Shutdown,
}

/// One outstanding operation, owned by the engine until its terminal
/// completion has been dispatched.
#[derive(Debug)]
pub struct OpEntry {
    pub kind: OpKind,
    /// Owned I/O buffer. The kernel-visible pointer targets this Vec's
    /// heap allocation, so the entry must outlive the SQE.
    pub buf: Option<Vec<u8>>,
    /// Completion slot; firing it resumes the waiting task.
    pub slot: oneshot::Sender<CqOutcome>,
}

impl OpEntry {
    /// Fire the slot with a kernel result, handing the buffer back.
    pub fn complete(self, res: i32) {
        // A dropped receiver means the waiter went away (task cancelled);
        // the buffer dies here, safely after the terminal CQE.
        let _ = self.slot.send(CqOutcome::Done { res, buf: self.buf });
    }

    /// Fire the slot with the shutdown signal.
    pub fn fail_shutdown(self) {
        let _ = self.slot.send(CqOutcome::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_tokens_distinct() {
        assert_ne!(WAKE_TOKEN, CANCEL_TOKEN);
        assert!(RESERVED_TOKEN_FLOOR <= WAKE_TOKEN);
        assert!(RESERVED_TOKEN_FLOOR <= CANCEL_TOKEN);
    }

    #[test]
    fn test_buffer_kinds() {
        assert!(OpKind::Connect.has_buffer());
        assert!(OpKind::Recv.has_buffer());
        assert!(OpKind::Send.has_buffer());
        assert!(!OpKind::Accept.has_buffer());
        assert!(!OpKind::Close.has_buffer());
        assert!(!OpKind::Nop.has_buffer());
        assert!(!(OpKind::Cancel { target: 7 }).has_buffer());
    }

    #[test]
    fn test_complete_delivers_buffer_back() {
        let (tx, mut rx) = oneshot::channel();
        let entry = OpEntry {
            kind: OpKind::Recv,
            buf: Some(vec![1, 2, 3]),
            slot: tx,
        };
        entry.complete(3);
        match rx.try_recv().unwrap() {
            CqOutcome::Done { res, buf } => {
                assert_eq!(res, 3);
                assert_eq!(buf.unwrap(), vec![1, 2, 3]);
            }
            CqOutcome::Shutdown => panic!("expected Done"),
        }
    }

    #[test]
    fn test_complete_tolerates_dropped_waiter() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let entry = OpEntry {
            kind: OpKind::Send,
            buf: Some(vec![0; 8]),
            slot: tx,
        };
        // Must not panic; the buffer is released here.
        entry.complete(8);
    }
}
