//! Cross-thread tests for signals and gates driven by the shared runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tcplink_core::{AsyncRuntime, AsyncRuntimeConfig, CancellationToken, Gate, Signal};

#[test]
fn test_signal_emitted_from_runtime_workers() {
    let runtime = AsyncRuntime::new(AsyncRuntimeConfig::default().with_worker_threads(4)).unwrap();
    let signal = Arc::new(Signal::<usize>::new());
    let received = Arc::new(Mutex::new(Vec::new()));

    let received_clone = received.clone();
    signal.connect(move |&n| received_clone.lock().push(n));

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let signal = signal.clone();
            runtime.spawn(async move { signal.emit(n) })
        })
        .collect();
    for handle in handles {
        runtime.block_on(handle).unwrap();
    }

    let mut values = received.lock().clone();
    values.sort_unstable();
    assert_eq!(values, (0..8).collect::<Vec<_>>());
}

#[test]
fn test_gate_rendezvous_with_blocking_caller() {
    let runtime = AsyncRuntime::new(AsyncRuntimeConfig::default()).unwrap();
    let gate = Arc::new(Gate::closed());

    let opener = gate.clone();
    runtime.spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        opener.set();
    });

    let opened = runtime.block_on(gate.wait_timeout(Duration::from_secs(2)));
    assert!(opened);
}

#[test]
fn test_cancellation_stops_worker_loop() {
    let runtime = AsyncRuntime::new(AsyncRuntimeConfig::default()).unwrap();
    let token = CancellationToken::new();
    let ticks = Arc::new(AtomicUsize::new(0));

    let worker = {
        let token = token.clone();
        let ticks = ticks.clone();
        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        ticks.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        })
    };

    std::thread::sleep(Duration::from_millis(30));
    token.cancel();
    runtime.block_on(worker).unwrap();

    let after_cancel = ticks.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(ticks.load(Ordering::SeqCst), after_cancel);
}
