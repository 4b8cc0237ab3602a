//! # RingEngine — the io_uring submission/completion engine
//!
//! One engine owns one kernel ring plus a dedicated poller thread. It:
//! 1. Translates [`OpKind`]s into SQEs tagged with monotonically
//!    increasing tokens
//! 2. Applies submission back-pressure (linear back-off while the SQ
//!    is saturated)
//! 3. Polls the CQ on the poller thread and fires each completion's
//!    oneshot slot
//! 4. Wakes early via an eventfd with a read armed on the ring
//! 5. Tears down by cancelling in-flight operations and failing any
//!    stragglers with `Shutdown`
//!
//! User tasks never touch the CQ. They park on the slot inside a
//! [`Completion`] guard; dropping the guard before the terminal CQE
//! enqueues a best-effort kernel cancel, and the operation's buffer
//! stays alive in the token table until that terminal CQE lands.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use dashmap::DashMap;
use io_uring::{opcode, squeue, types, IoUring};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use ringsock_core::{RingConfig, SockError, SockResult};

use crate::op::{CqOutcome, OpEntry, OpKind, CANCEL_TOKEN, WAKE_TOKEN};

/// Bounded CQ wait per poller iteration; shutdown is detected at least
/// this often even if the waker write is lost.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// How long an explicit cancel waits for its target's terminal CQE.
const CANCEL_GRACE: Duration = Duration::from_millis(200);

/// Total budget for the shutdown drain (cancel-all plus CQ reaping).
const SHUTDOWN_GRACE: Duration = Duration::from_millis(400);

/// Capacity of the drop-path cancel queue.
const CANCEL_QUEUE_CAPACITY: usize = 1024;

/// 8-byte landing pad for the armed eventfd read. The kernel writes
/// into it; nothing ever reads it back.
struct WakeBuf(std::cell::UnsafeCell<[u8; 8]>);

// Safety: only the kernel writes through the pointer, and only while a
// wake read is armed; the engine never reads the contents.
unsafe impl Sync for WakeBuf {}
unsafe impl Send for WakeBuf {}

/// The process-wide ring engine for one epoch.
pub struct RingEngine {
    ring: IoUring,
    config: RingConfig,
    /// Next user token; reserved values are unreachable in practice.
    next_token: AtomicU64,
    /// token → in-flight operation. Owns each operation's buffer until
    /// the terminal CQE is dispatched.
    table: DashMap<u64, OpEntry>,
    /// Held only around SQE push + sync; the doorbell rings outside it.
    sq_lock: Mutex<()>,
    /// Always-readable-when-poked idle file used to interrupt the
    /// poller's bounded CQ wait.
    wake_fd: RawFd,
    wake_buf: WakeBuf,
    /// Tokens whose waiters vanished (future dropped); the poller turns
    /// these into AsyncCancel SQEs.
    cancel_queue: ArrayQueue<u64>,
    shutting_down: AtomicBool,
    poller: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RingEngine {
    /// Build the ring, arm the waker, and start the poller thread.
    pub fn start(config: RingConfig) -> std::io::Result<Arc<Self>> {
        let config = config.clamped();
        let ring = IoUring::builder().build(config.queue_depth)?;

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let engine = Arc::new(RingEngine {
            ring,
            next_token: AtomicU64::new(0),
            table: DashMap::new(),
            sq_lock: Mutex::new(()),
            wake_fd,
            wake_buf: WakeBuf(std::cell::UnsafeCell::new([0u8; 8])),
            cancel_queue: ArrayQueue::new(CANCEL_QUEUE_CAPACITY),
            shutting_down: AtomicBool::new(false),
            poller: Mutex::new(None),
            config,
        });

        engine.arm_waker();

        let handle = thread::Builder::new()
            .name("ringsock-poller".into())
            .spawn({
                let engine = engine.clone();
                move || poller_loop(engine)
            })?;
        *engine.poller.lock().expect("poller handle lock poisoned") = Some(handle);

        debug!(
            queue_depth = engine.config.queue_depth,
            "ring engine started"
        );
        Ok(engine)
    }

    /// The config snapshot this epoch was built with.
    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// True once `shutdown()` has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn alloc_token(&self) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        debug_assert!(token < crate::op::RESERVED_TOKEN_FLOOR);
        token
    }

    /// Register an operation and push its SQE, applying back-pressure.
    ///
    /// Returns a [`Completion`] guard to await. Fails with `QueueFull`
    /// once the configured retries are exhausted, or `Shutdown` if
    /// `cleanup` races in.
    pub async fn submit(
        self: &Arc<Self>,
        kind: OpKind,
        fd: RawFd,
        buf: Option<Vec<u8>>,
    ) -> SockResult<Completion> {
        if self.is_shutting_down() {
            return Err(SockError::Shutdown);
        }

        let token = self.alloc_token();
        let mut buf = buf;
        let sqe = build_sqe(kind, fd, buf.as_mut(), token)?;

        let (tx, rx) = oneshot::channel();
        self.table.insert(
            token,
            OpEntry {
                kind,
                buf,
                slot: tx,
            },
        );

        let mut attempt = 0u32;
        loop {
            if self.is_shutting_down() {
                self.table.remove(&token);
                return Err(SockError::Shutdown);
            }
            if self.push_sqe(&sqe) {
                break;
            }
            if attempt >= self.config.queue_retries {
                self.table.remove(&token);
                return Err(SockError::QueueFull);
            }
            attempt += 1;
            tokio::time::sleep(self.config.retry_base_delay * attempt).await;
        }

        Ok(Completion {
            engine: self.clone(),
            token,
            rx,
            terminal: false,
        })
    }

    /// Submit and wait under a deadline. On expiry the cancel protocol
    /// runs (cancel SQE, bounded wait for the terminal CQE) before
    /// `TimedOut` is surfaced.
    pub async fn submit_with_deadline(
        self: &Arc<Self>,
        kind: OpKind,
        fd: RawFd,
        buf: Option<Vec<u8>>,
        limit: Duration,
    ) -> SockResult<(i32, Option<Vec<u8>>)> {
        let mut comp = self.submit(kind, fd, buf).await?;
        match tokio::time::timeout(limit, comp.wait()).await {
            Ok(result) => result,
            Err(_) => {
                let _ = self.submit_cancel(comp.token()).await;
                let _ = tokio::time::timeout(CANCEL_GRACE, comp.wait()).await;
                Err(SockError::TimedOut)
            }
        }
    }

    /// Best-effort cancellation of a previously submitted operation.
    ///
    /// Issues an AsyncCancel SQE and awaits its own completion.
    /// "Cancelled", "already completed", and "not found" all count as
    /// success.
    pub async fn submit_cancel(self: &Arc<Self>, target: u64) -> SockResult<()> {
        let mut comp = self.submit(OpKind::Cancel { target }, -1, None).await?;
        match comp.wait().await {
            Ok(_) => Ok(()),
            Err(SockError::Os(errno)) if errno == libc::ENOENT || errno == libc::EALREADY => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drop-path cancellation: called when a waiter disappears without
    /// observing its completion. Never blocks; the poller picks the
    /// token up on its next iteration.
    fn request_cancel(&self, token: u64) {
        if self.is_shutting_down() {
            return;
        }
        if self.cancel_queue.push(token).is_err() {
            // Queue saturated; the operation still completes (or dies
            // with the ring) and the table entry keeps its buffer valid.
            trace!(token, "cancel queue full, dropping request");
        }
        self.wake();
    }

    /// Interrupt the poller's bounded CQ wait.
    fn wake(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wake_fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated — a wake is already
        // pending, which is all we need.
        if ret < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno != libc::EAGAIN {
                warn!(errno, "waker write failed");
            }
        }
    }

    /// Stop the poller, drain pending operations, release the ring.
    /// Idempotent; blocks briefly (bounded by the shutdown grace).
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            // Second caller: still wait for the poller to be gone.
            if let Some(handle) = self.poller.lock().expect("poller handle lock poisoned").take()
            {
                let _ = handle.join();
            }
            return;
        }
        debug!("ring engine shutting down");
        self.wake();
        if let Some(handle) = self.poller.lock().expect("poller handle lock poisoned").take() {
            let _ = handle.join();
        }
    }

    /// Push one SQE and ring the doorbell. Returns false when the SQ
    /// is full (caller decides whether to retry).
    fn push_sqe(&self, sqe: &squeue::Entry) -> bool {
        let pushed = {
            let _guard = self.sq_lock.lock().expect("submission lock poisoned");
            // Safety: the submission lock serializes every SQ writer.
            let mut sq = unsafe { self.ring.submission_shared() };
            let ok = unsafe { sq.push(sqe) }.is_ok();
            sq.sync();
            ok
        };
        // Ring the doorbell either way: on a full SQ this nudges the
        // kernel to consume entries so a retry can land.
        if let Err(e) = self.ring.submit() {
            warn!(error = %e, "io_uring submit failed");
        }
        pushed
    }

    /// Re-arm the eventfd read that interrupts the poller's CQ wait.
    fn arm_waker(&self) {
        let sqe = opcode::Read::new(
            types::Fd(self.wake_fd),
            self.wake_buf.0.get() as *mut u8,
            std::mem::size_of::<u64>() as u32,
        )
        .build()
        .user_data(WAKE_TOKEN);
        if !self.push_sqe(&sqe) {
            warn!("failed to arm waker read");
        }
    }

    /// Turn queued drop-path cancels into AsyncCancel SQEs.
    fn drain_cancel_requests(&self) {
        while let Some(target) = self.cancel_queue.pop() {
            if !self.table.contains_key(&target) {
                continue; // already completed
            }
            let sqe = opcode::AsyncCancel::new(target)
                .build()
                .user_data(CANCEL_TOKEN);
            if !self.push_sqe(&sqe) {
                let _ = self.cancel_queue.push(target);
                break;
            }
        }
    }

    /// Drain ready CQEs and fire their slots.
    fn dispatch_completions(&self) {
        // Safety: the poller thread is the only CQ consumer.
        let mut cq = unsafe { self.ring.completion_shared() };
        cq.sync();
        while let Some(cqe) = cq.next() {
            let token = cqe.user_data();
            let res = cqe.result();
            match token {
                WAKE_TOKEN => {
                    if !self.is_shutting_down() {
                        self.arm_waker();
                    }
                }
                CANCEL_TOKEN => {
                    // Ack of a drop-path cancel; ENOENT / EALREADY are
                    // the expected races.
                    trace!(res, "cancel ack");
                }
                token => match self.table.remove(&token) {
                    Some((_, entry)) => entry.complete(res),
                    None => trace!(token, "completion for unknown token"),
                },
            }
        }
        cq.sync();
    }

    /// Bounded CQ wait: returns after ≥1 CQE or the poll timeout.
    fn wait_for_completions(&self, limit: Duration) {
        let ts = types::Timespec::new()
            .sec(limit.as_secs())
            .nsec(limit.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);
        if let Err(e) = self.ring.submitter().submit_with_args(1, &args) {
            match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                _ => warn!(error = %e, "ring wait failed"),
            }
        }
    }

    /// Shutdown drain: cancel everything in flight, reap CQEs for the
    /// grace period, then fail the stragglers with `Shutdown`.
    fn drain_on_shutdown(&self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;

        while !self.table.is_empty() && Instant::now() < deadline {
            let pending: Vec<u64> = self.table.iter().map(|e| *e.key()).collect();
            for token in pending {
                let sqe = opcode::AsyncCancel::new(token)
                    .build()
                    .user_data(CANCEL_TOKEN);
                if !self.push_sqe(&sqe) {
                    break;
                }
            }
            self.wait_for_completions(Duration::from_millis(50));
            self.dispatch_completions();
        }

        let leftover: Vec<u64> = self.table.iter().map(|e| *e.key()).collect();
        if !leftover.is_empty() {
            debug!(count = leftover.len(), "failing stragglers with Shutdown");
        }
        for token in leftover {
            if let Some((_, entry)) = self.table.remove(&token) {
                entry.fail_shutdown();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.table.len()
    }

    /// Fill the SQ without ringing the doorbell, so the next push sees
    /// a saturated queue.
    #[cfg(test)]
    pub(crate) fn saturate_sq_for_test(&self) {
        let _guard = self.sq_lock.lock().expect("submission lock poisoned");
        let mut sq = unsafe { self.ring.submission_shared() };
        loop {
            let sqe = opcode::Nop::new().build().user_data(CANCEL_TOKEN);
            if unsafe { sq.push(&sqe) }.is_err() {
                break;
            }
        }
        sq.sync();
    }
}

impl Drop for RingEngine {
    fn drop(&mut self) {
        if self.wake_fd >= 0 {
            unsafe {
                libc::close(self.wake_fd);
            }
        }
    }
}

/// Guard held by a suspended task. Awaiting [`Completion::wait`] parks
/// on the completion slot; dropping the guard before the terminal CQE
/// requests a kernel-side cancel while the token table keeps the
/// operation's buffer alive.
pub struct Completion {
    engine: Arc<RingEngine>,
    token: u64,
    rx: oneshot::Receiver<CqOutcome>,
    terminal: bool,
}

impl Completion {
    /// The 64-bit token correlating this operation's CQE.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Park until the terminal completion. Negative kernel results are
    /// mapped through the errno taxonomy; success hands back the raw
    /// result and the engine-owned buffer.
    pub async fn wait(&mut self) -> SockResult<(i32, Option<Vec<u8>>)> {
        if self.terminal {
            // The slot has already fired; polling the receiver again
            // would panic.
            return Err(SockError::Shutdown);
        }
        match (&mut self.rx).await {
            Ok(CqOutcome::Done { res, buf }) => {
                self.terminal = true;
                if res < 0 {
                    Err(SockError::from_raw_result(res))
                } else {
                    Ok((res, buf))
                }
            }
            Ok(CqOutcome::Shutdown) | Err(_) => {
                self.terminal = true;
                Err(SockError::Shutdown)
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.terminal {
            self.engine.request_cancel(self.token);
        }
    }
}

/// Translate an operation into its SQE.
fn build_sqe(
    kind: OpKind,
    fd: RawFd,
    buf: Option<&mut Vec<u8>>,
    token: u64,
) -> SockResult<squeue::Entry> {
    let entry = match kind {
        OpKind::Connect => {
            let addr = buf.ok_or_else(|| {
                SockError::Configuration("connect submitted without an address".into())
            })?;
            opcode::Connect::new(
                types::Fd(fd),
                addr.as_ptr() as *const libc::sockaddr,
                addr.len() as libc::socklen_t,
            )
            .build()
        }
        OpKind::Accept => opcode::Accept::new(
            types::Fd(fd),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .flags(libc::SOCK_CLOEXEC)
        .build(),
        OpKind::Recv => {
            let b = buf.ok_or_else(|| {
                SockError::Configuration("recv submitted without a buffer".into())
            })?;
            opcode::Recv::new(types::Fd(fd), b.as_mut_ptr(), b.len() as u32).build()
        }
        OpKind::Send => {
            let b = buf.ok_or_else(|| {
                SockError::Configuration("send submitted without a buffer".into())
            })?;
            opcode::Send::new(types::Fd(fd), b.as_ptr(), b.len() as u32).build()
        }
        OpKind::Close => opcode::Close::new(types::Fd(fd)).build(),
        OpKind::Cancel { target } => opcode::AsyncCancel::new(target).build(),
        OpKind::Nop => opcode::Nop::new().build(),
    };
    Ok(entry.user_data(token))
}

/// The poller loop — runs on a dedicated OS thread.
fn poller_loop(engine: Arc<RingEngine>) {
    debug!("poller started");
    loop {
        if engine.is_shutting_down() {
            break;
        }
        engine.drain_cancel_requests();
        engine.wait_for_completions(POLL_TIMEOUT);
        engine.dispatch_completions();
    }
    engine.drain_on_shutdown();
    debug!("poller exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine(depth: u32, retries: u32) -> Arc<RingEngine> {
        RingEngine::start(RingConfig {
            queue_depth: depth,
            queue_retries: retries,
            ..RingConfig::default()
        })
        .expect("ring setup failed")
    }

    #[tokio::test]
    async fn test_nop_completes() {
        let engine = test_engine(64, 0);
        let mut comp = engine.submit(OpKind::Nop, -1, None).await.unwrap();
        let (res, buf) = comp.wait().await.unwrap();
        assert_eq!(res, 0);
        assert!(buf.is_none());
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_tokens_are_monotonic() {
        let engine = test_engine(64, 0);
        let comp_a = engine.submit(OpKind::Nop, -1, None).await.unwrap();
        let comp_b = engine.submit(OpKind::Nop, -1, None).await.unwrap();
        assert!(comp_b.token() > comp_a.token());
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_queue_full_after_retries() {
        let engine = test_engine(8, 0);
        engine.saturate_sq_for_test();
        let err = engine
            .submit(OpKind::Nop, -1, None)
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, SockError::QueueFull);
        // The failed submission must not leave a stale table entry.
        assert_eq!(engine.outstanding(), 0);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_parked_recv() {
        let engine = test_engine(64, 0);
        let (a, b) = socketpair();

        let mut comp = engine
            .submit(OpKind::Recv, a, Some(vec![0u8; 4096]))
            .await
            .unwrap();
        let token = comp.token();

        let start = Instant::now();
        engine.submit_cancel(token).await.unwrap();
        let err = tokio::time::timeout(Duration::from_millis(200), comp.wait())
            .await
            .expect("cancel did not resolve the waiter in time")
            .unwrap_err();
        assert!(matches!(err, SockError::Cancelled | SockError::Shutdown));
        assert!(start.elapsed() < Duration::from_millis(200));

        engine.shutdown();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_ops() {
        let engine = test_engine(64, 0);
        let (a, b) = socketpair();

        let mut comp = engine
            .submit(OpKind::Recv, a, Some(vec![0u8; 1024]))
            .await
            .unwrap();

        let start = Instant::now();
        let shutdown_engine = engine.clone();
        let handle = tokio::task::spawn_blocking(move || shutdown_engine.shutdown());

        let err = comp.wait().await.unwrap_err();
        assert!(matches!(
            err,
            SockError::Shutdown | SockError::Cancelled | SockError::Closed
        ));
        assert!(start.elapsed() < Duration::from_millis(500));

        handle.await.unwrap();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let engine = test_engine(64, 0);
        engine.shutdown();
        engine.shutdown();
        assert!(engine.is_shutting_down());
    }

    /// Connected AF_UNIX pair; no data in flight, so recvs park.
    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }
}
