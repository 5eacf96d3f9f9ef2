//! Multi-threaded tests for livemerge-concurrency
//!
//! These exercise the primitives the way the job coordinator does:
//!
//! 1. **Lease exclusivity** - structural changes on one chain never overlap
//! 2. **Cancellation fan-out** - one cancel reaches every waiter promptly
//! 3. **Throttled workers** - several loops sharing one limiter stay paced
//! 4. **Polling** - a waiter observes a value published by another thread
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test -p livemerge-concurrency --test concurrent_tests
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use livemerge_concurrency::{poll_until, Backoff, CancelToken, ChainLeases, Throttle, WaitOptions};
use livemerge_core::{ChainId, ErrorKind};

// ============================================================================
// Lease Exclusivity
// ============================================================================

mod lease_exclusivity {
    use super::*;

    #[test]
    fn test_many_chains_do_not_block_each_other() {
        let leases = Arc::new(ChainLeases::new());
        let chains: Vec<ChainId> = (0..8).map(|_| ChainId::new()).collect();
        let barrier = Arc::new(Barrier::new(chains.len()));

        // Every thread holds its own lease across the barrier; if leases were
        // shared the barrier would never release.
        let handles: Vec<_> = chains
            .iter()
            .map(|chain| {
                let leases = Arc::clone(&leases);
                let barrier = Arc::clone(&barrier);
                let chain = *chain;
                thread::spawn(move || {
                    let _lease = leases.acquire(chain);
                    barrier.wait();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(leases.len(), 8);
    }

    #[test]
    fn test_read_modify_write_under_lease_is_atomic() {
        let leases = Arc::new(ChainLeases::new());
        let chain = ChainId::new();
        let counter = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let leases = Arc::clone(&leases);
                let counter = Arc::clone(&counter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        let _lease = leases.acquire(chain);
                        let v = counter.load(Ordering::Relaxed);
                        thread::yield_now();
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 800);
    }
}

// ============================================================================
// Cancellation
// ============================================================================

mod cancellation {
    use super::*;

    #[test]
    fn test_cancel_wakes_all_sleepers() {
        let token = CancelToken::new();
        let woke = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let token = token.clone();
                let woke = Arc::clone(&woke);
                thread::spawn(move || {
                    if !token.sleep(Duration::from_secs(30)) {
                        woke.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        token.cancel();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woke.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}

// ============================================================================
// Throttling
// ============================================================================

mod throttling {
    use super::*;

    #[test]
    fn test_shared_throttle_paces_total_bytes() {
        let throttle = Arc::new(Throttle::new(2 << 20));
        let cancel = CancelToken::new();
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                let cancel = cancel.clone();
                thread::spawn(move || {
                    for _ in 0..4 {
                        assert!(throttle.consume(32 * 1024, &cancel));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        // 512 KiB at 2 MiB/s
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}

// ============================================================================
// Polling
// ============================================================================

mod polling {
    use super::*;

    #[test]
    fn test_poll_sees_value_from_other_thread() {
        let ready = Arc::new(AtomicBool::new(false));
        let publisher = {
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                ready.store(true, Ordering::Release);
            })
        };

        let opts = WaitOptions {
            interval: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
            backoff: Backoff::Exponential,
            max_interval: Duration::from_millis(20),
        };
        let value = poll_until("ready flag", &opts, None, || {
            Ok(ready.load(Ordering::Acquire).then_some(42))
        })
        .unwrap();
        assert_eq!(value, 42);
        publisher.join().unwrap();
    }

    #[test]
    fn test_poll_cancelled_from_other_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        let opts = WaitOptions {
            interval: Duration::from_millis(10),
            timeout: Duration::from_secs(30),
            ..WaitOptions::default()
        };
        let err = poll_until::<(), _>("job", &opts, Some(&token), || Ok(None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        canceller.join().unwrap();
    }
}
