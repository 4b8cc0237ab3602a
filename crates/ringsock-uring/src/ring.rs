//! Process-wide ring lifecycle
//!
//! Exactly one [`RingEngine`] exists per lifetime epoch. The first
//! socket operation creates it lazily from the configuration snapshot;
//! [`cleanup`] stops the poller, drains pending operations, releases
//! the kernel resources, and bumps the epoch so the next operation
//! builds a fresh engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use ringsock_core::{config, SockError, SockResult};

use crate::engine::RingEngine;

static RING: Mutex<Option<Arc<RingEngine>>> = Mutex::new(None);
static EPOCH: AtomicU64 = AtomicU64::new(0);

/// The current epoch number; starts at 0 and increments on each lazy
/// engine creation.
pub fn epoch() -> u64 {
    EPOCH.load(Ordering::Acquire)
}

/// Handle to the current engine, creating it on first use.
pub fn current() -> SockResult<Arc<RingEngine>> {
    let mut guard = RING.lock().expect("ring lock poisoned");
    if let Some(engine) = guard.as_ref() {
        if !engine.is_shutting_down() {
            return Ok(engine.clone());
        }
        // A raced cleanup left a dead engine behind; replace it.
        *guard = None;
    }

    let engine = RingEngine::start(config::current())
        .map_err(|e| SockError::Configuration(format!("io_uring setup failed: {}", e)))?;
    *guard = Some(engine.clone());
    let epoch = EPOCH.fetch_add(1, Ordering::AcqRel) + 1;
    debug!(epoch, "ring epoch started");
    Ok(engine)
}

/// Tear down the current epoch's ring, if any. Idempotent.
///
/// Blocks briefly while the poller drains: pending operations observe
/// `Shutdown` (or `Cancelled`), and once this returns no waiter of the
/// old epoch remains suspended.
pub fn cleanup() -> SockResult<()> {
    let engine = RING.lock().expect("ring lock poisoned").take();
    if let Some(engine) = engine {
        engine.shutdown();
        debug!(epoch = epoch(), "ring epoch ended");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::OpKind;
    use std::time::{Duration, Instant};

    // These tests share the process-global ring; SERIAL keeps them
    // from interleaving cleanup/init, and each leaves the ring torn
    // down on exit.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[tokio::test]
    async fn test_lazy_init_and_epoch_bump() {
        let _serial = serial();
        cleanup().unwrap();
        let before = epoch();

        let engine = current().unwrap();
        assert_eq!(epoch(), before + 1);

        // Same epoch: same engine.
        let again = current().unwrap();
        assert!(Arc::ptr_eq(&engine, &again));

        cleanup().unwrap();
        let fresh = current().unwrap();
        assert_eq!(epoch(), before + 2);
        assert!(!Arc::ptr_eq(&engine, &fresh));
        cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let _serial = serial();
        let _ = current().unwrap();
        cleanup().unwrap();
        cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_releases_pending_waiter_quickly() {
        let _serial = serial();
        cleanup().unwrap();
        let engine = current().unwrap();

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

        let mut comp = engine
            .submit(OpKind::Recv, fds[0], Some(vec![0u8; 512]))
            .await
            .unwrap();

        let cleaner = tokio::task::spawn_blocking(|| {
            std::thread::sleep(Duration::from_millis(200));
            cleanup()
        });

        let start = Instant::now();
        let err = comp.wait().await.unwrap_err();
        assert!(matches!(
            err,
            SockError::Shutdown | SockError::Cancelled | SockError::Closed
        ));
        // 200 ms delay plus the ≤500 ms drain budget.
        assert!(start.elapsed() < Duration::from_millis(700));

        cleaner.await.unwrap().unwrap();
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
