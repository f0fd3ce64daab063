//! End-to-end scheduler scenarios: quiescence, yielding, affinity and
//! timeout modes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand::scheduler;
use strand::{Affinity, Coroutine, Reactor, TimeoutMode};

fn wait_until(what: &str, deadline: Duration, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Lets freshly spawned workers reach their wait phase, so the remind
/// path (rather than the 3 s wait timeout) picks new tasks up.
fn settle() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    std::thread::sleep(Duration::from_millis(100));
}

#[test]
fn two_yielding_tasks_reach_quiescence() {
    let reactor = Reactor::new("quiesce", 2);
    reactor.start();
    settle();

    let finished = Arc::new(AtomicU32::new(0));
    for _ in 0..2 {
        let finished = finished.clone();
        reactor
            .schedule(move || {
                strand::yield_now();
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    wait_until("both tasks to finish", Duration::from_secs(10), || {
        finished.load(Ordering::SeqCst) == 2
    });
    wait_until("task count to drain", Duration::from_secs(10), || {
        reactor.task_count() == 0
    });
    reactor.stop();
}

#[test]
fn batch_schedule_runs_every_coroutine() {
    let reactor = Reactor::new("batch", 2);
    reactor.start();
    settle();

    let finished = Arc::new(AtomicU32::new(0));
    let coroutines: Vec<_> = (0..8)
        .map(|_| {
            let finished = finished.clone();
            Coroutine::new(move || {
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();
    reactor.batch_schedule(coroutines);

    wait_until("batch to finish", Duration::from_secs(10), || {
        finished.load(Ordering::SeqCst) == 8
    });
    reactor.stop();
}

#[test]
fn discard_mode_drops_expired_tasks() {
    let reactor = Reactor::with_options("disc", 1, TimeoutMode::Discard, 200);
    reactor.start();
    settle();

    let expired_ran = Arc::new(AtomicBool::new(false));
    // Occupy the only worker for longer than the task timeout.
    reactor
        .schedule(|| std::thread::sleep(Duration::from_millis(600)))
        .unwrap();
    {
        let expired_ran = expired_ran.clone();
        reactor
            .schedule(move || {
                expired_ran.store(true, Ordering::SeqCst);
            })
            .unwrap();
    }

    wait_until("queue to drain", Duration::from_secs(10), || {
        reactor.task_count() == 0
    });
    assert!(
        !expired_ran.load(Ordering::SeqCst),
        "an expired task must be discarded in DISCARD mode"
    );
    reactor.stop();
}

#[test]
fn trigger_mode_runs_expired_tasks() {
    let reactor = Reactor::with_options("trig", 1, TimeoutMode::Trigger, 200);
    reactor.start();
    settle();

    let expired_ran = Arc::new(AtomicBool::new(false));
    reactor
        .schedule(|| std::thread::sleep(Duration::from_millis(600)))
        .unwrap();
    {
        let expired_ran = expired_ran.clone();
        reactor
            .schedule(move || {
                expired_ran.store(true, Ordering::SeqCst);
            })
            .unwrap();
    }

    wait_until("expired task to run", Duration::from_secs(10), || {
        expired_ran.load(Ordering::SeqCst)
    });
    reactor.stop();
}

#[test]
fn affinity_is_bypassed_after_the_deadline() {
    // One worker, named "aff_th_0"; the task is pinned to a worker that
    // does not exist, so only the deadline bypass can dispatch it.
    let reactor = Reactor::with_options("aff", 1, TimeoutMode::Trigger, 100);
    reactor.start();
    settle();

    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        reactor
            .schedule_with(Affinity::Name("aff_th_9".to_string()), move || {
                ran.store(true, Ordering::SeqCst);
            })
            .unwrap();
    }

    wait_until("pinned task to be bypassed", Duration::from_secs(10), || {
        ran.load(Ordering::SeqCst)
    });
    reactor.stop();
}

#[test]
fn matching_name_affinity_dispatches_to_that_worker() {
    let reactor = Reactor::new("named", 2);
    reactor.start();
    settle();

    let (tx, rx) = crossbeam_channel::bounded(1);
    reactor
        .schedule_with(Affinity::Name("named_th_1".to_string()), move || {
            let name = std::thread::current().name().unwrap_or_default().to_string();
            tx.send(name).unwrap();
        })
        .unwrap();

    let name = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(name, "named_th_1");
    reactor.stop();
}

#[test]
fn reschedule_current_yields_and_resumes() {
    let reactor = Reactor::new("resch", 2);
    reactor.start();
    settle();

    let (tx, rx) = crossbeam_channel::bounded(1);
    reactor
        .schedule(move || {
            let before = scheduler::current_scheduler_name().unwrap();
            scheduler::reschedule_current(Affinity::Any);
            // Resumed after the yield, possibly on another worker.
            let after = scheduler::current_scheduler_name().unwrap();
            tx.send((before, after)).unwrap();
        })
        .unwrap();

    let (before, after) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(before, "resch");
    assert_eq!(after, "resch");
    reactor.stop();
}

#[test]
fn tasks_can_schedule_more_tasks() {
    let reactor = Reactor::new("nest", 2);
    reactor.start();
    settle();

    let (tx, rx) = crossbeam_channel::bounded(1);
    reactor
        .schedule(move || {
            let nested = scheduler::current_reactor().expect("worker must know its reactor");
            let tx = tx.clone();
            nested
                .schedule(move || {
                    tx.send(scheduler::current_scheduler_timeout().unwrap()).unwrap();
                })
                .unwrap();
        })
        .unwrap();

    let timeout = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(timeout, strand::reactor::DEFAULT_TASK_TIMEOUT_MS);
    reactor.stop();
}

#[test]
fn panicking_task_does_not_kill_the_pool() {
    let reactor = Reactor::new("panic", 1);
    reactor.start();
    settle();

    reactor.schedule(|| panic!("task body failure")).unwrap();

    let survived = Arc::new(AtomicBool::new(false));
    {
        let survived = survived.clone();
        reactor
            .schedule(move || {
                survived.store(true, Ordering::SeqCst);
            })
            .unwrap();
    }

    wait_until("the pool to survive a panic", Duration::from_secs(10), || {
        survived.load(Ordering::SeqCst)
    });
    reactor.stop();
}
