//! # ringsock-uring — the io_uring engine behind ringsock sockets
//!
//! One kernel ring per process lifetime epoch, shared by every socket.
//! User tasks submit tagged operations and park on completion slots; a
//! dedicated poller thread owns all CQ consumption and resumes waiters.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          Socket layer (ringsock)                        │
//! │   engine.submit(Recv, fd, buf).wait().await             │
//! └──────────────────┬──────────────────────────────────────┘
//!                    │ token + SQE push (submission lock)
//!                    ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         RingEngine                                      │
//! │   token table: token → { kind, buffer, oneshot slot }   │
//! │   back-pressure: linear back-off while SQ saturated     │
//! └──────────────────┬──────────────────────────────────────┘
//!                    │
//! ┌──────────────────▼──────────────────────────────────────┐
//! │         Poller (dedicated OS thread)                    │
//! │   bounded CQ wait → drain CQEs → fire slots             │
//! │   eventfd waker read armed on the ring for early wakes  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Cancellation: dropping a waiter enqueues a best-effort AsyncCancel;
//! the operation's buffer stays table-owned until its terminal CQE, so
//! the kernel never touches freed memory. [`ring::cleanup`] tears the
//! epoch down, failing pending waiters with `Shutdown`.

pub mod engine;
pub mod op;
pub mod ring;

pub use engine::{Completion, RingEngine};
pub use op::OpKind;
