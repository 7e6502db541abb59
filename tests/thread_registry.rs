use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use thread_safepoint::config::SafepointConfig;
use thread_safepoint::handle::OccurrenceState;
use thread_safepoint::prelude::*;
use thread_safepoint::safepoint;

fn wait_until(condition: impl Fn() -> bool) {
    let backoff = Backoff::new();
    while !condition() {
        backoff.snooze();
    }
}

#[test]
fn threads_register_on_entry_and_retire_on_exit() {
    const WORKERS: usize = 4;
    let coordinator = SafepointCoordinator::new();
    let (exit_tx, exit_rx) = flume::bounded::<()>(WORKERS);
    let (id_tx, id_rx) = flume::unbounded();

    crossbeam::scope(|s| {
        for _ in 0..WORKERS {
            s.spawn(|_| {
                let local = coordinator.enter_thread().unwrap();
                id_tx.send(local.id()).unwrap();
                exit_rx.recv().unwrap();
            });
        }

        let ids: Vec<_> = (0..WORKERS).map(|_| id_rx.recv().unwrap()).collect();
        assert_eq!(coordinator.thread_count(), WORKERS);
        let mut registered = coordinator.thread_ids();
        registered.sort_by_key(|id| format!("{id:?}"));
        let mut expected = ids.clone();
        expected.sort_by_key(|id| format!("{id:?}"));
        assert_eq!(registered, expected);
        assert!(ids.iter().all(|id| coordinator.is_entered(*id)));

        for _ in 0..WORKERS {
            exit_tx.send(()).unwrap();
        }
    })
    .unwrap();

    assert_eq!(coordinator.thread_count(), 0);
    assert!(coordinator.thread_ids().is_empty());
}

#[test]
fn nested_entry_shares_one_registration() {
    let coordinator = SafepointCoordinator::new();
    let outer = coordinator.enter_thread().unwrap();
    {
        let inner = coordinator.enter_thread().unwrap();
        assert_eq!(inner.id(), outer.id());
        assert_eq!(coordinator.thread_count(), 1);
    }
    assert!(coordinator.is_entered(outer.id()));
    assert!(safepoint::current().is_ok());

    let id = outer.id();
    drop(outer);
    assert!(!coordinator.is_entered(id));
    assert_eq!(safepoint::current().unwrap_err(), SafepointError::NotEntered);
}

#[test]
fn retiring_thread_drops_its_queue() {
    let coordinator = SafepointCoordinator::new();
    let events = coordinator.subscribe();
    let (id_tx, id_rx) = flume::bounded(1);
    let (exit_tx, exit_rx) = flume::bounded::<()>(1);

    crossbeam::scope(|s| {
        s.spawn(|_| {
            let local = coordinator.enter_thread().unwrap();
            id_tx.send(local.id()).unwrap();
            exit_rx.recv().unwrap();
        });

        let target = id_rx.recv().unwrap();
        let action = ThreadLocalAction::new(false, false, |_| Ok(()));
        let handles: Vec<_> = (0..3)
            .map(|_| coordinator.submit_to(target, &action).unwrap())
            .collect();
        exit_tx.send(()).unwrap();

        for handle in &handles {
            assert_eq!(handle.wait(), ActionOutcome::Completed);
            assert_eq!(handle.state_for(target), Some(OccurrenceState::Dropped));
        }
    })
    .unwrap();

    let received: Vec<_> = events.try_iter().collect();
    assert!(received.iter().any(|event| matches!(
        event,
        SafepointEvent::ThreadRetired { dropped: 3, .. }
    )));
    let stats = coordinator.stats();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.performed, 0);
}

#[test]
fn close_cancels_queued_work_and_refuses_new_work() {
    let coordinator = SafepointCoordinator::new();
    let (id_tx, id_rx) = flume::bounded(1);
    let (closed_tx, closed_rx) = flume::bounded::<()>(1);

    crossbeam::scope(|s| {
        let worker = s.spawn(|_| {
            let local = coordinator.enter_thread().unwrap();
            id_tx.send(local.id()).unwrap();
            closed_rx.recv().unwrap();
            local.poll(&Location::new("after-close")).unwrap();
            local.has_pending_actions()
        });

        let target = id_rx.recv().unwrap();
        let action = ThreadLocalAction::new(true, false, |_| panic!("cancelled by close"));
        let handle = coordinator.submit_to(target, &action).unwrap();

        coordinator.close();
        assert!(coordinator.is_closed());
        assert!(handle.is_cancelled());
        assert_eq!(
            coordinator.submit_all(&action).unwrap_err(),
            SafepointError::Closed
        );
        assert_eq!(
            coordinator.enter_thread().unwrap_err(),
            SafepointError::Closed
        );

        closed_tx.send(()).unwrap();
        assert!(!worker.join().unwrap());
        assert_eq!(handle.state_for(target), Some(OccurrenceState::Cancelled));
    })
    .unwrap();
}

#[test]
fn coordinators_are_independent() {
    let first = SafepointCoordinator::new();
    let second = SafepointCoordinator::new();
    assert_ne!(first.id(), second.id());

    let local = first.enter_thread().unwrap();
    assert!(first.is_entered(local.id()));
    assert!(!second.is_entered(local.id()));

    let action = ThreadLocalAction::new(false, false, |_| Ok(()));
    let handle = second.submit_all(&action).unwrap();
    assert_eq!(handle.target_count(), 0);
    assert!(!local.has_pending_actions());
}

#[test]
fn reconfiguring_reaches_polling_threads() {
    let coordinator = SafepointCoordinator::new();
    let stop = AtomicBool::new(false);
    let (id_tx, id_rx) = flume::bounded(1);

    crossbeam::scope(|s| {
        s.spawn(|_| {
            let local = coordinator.enter_thread().unwrap();
            id_tx.send(local.id()).unwrap();
            let location = Location::new("spin");
            while !stop.load(Ordering::Acquire) {
                local.poll(&location).unwrap();
                thread::yield_now();
            }
        });

        id_rx.recv().unwrap();
        assert_eq!(coordinator.stats().hits, 0);

        coordinator.reconfigure(
            SafepointConfig::default()
                .with_safepoint_a_lot(true)
                .with_collect_stats(true),
        );
        assert!(coordinator.config().safepoint_a_lot);
        wait_until(|| {
            let stats = coordinator.stats();
            stats.hits > 10 && stats.polls > 10
        });
        stop.store(true, Ordering::Release);
    })
    .unwrap();
}

#[test]
fn dropped_subscribers_are_pruned() {
    let coordinator = SafepointCoordinator::with_config(
        SafepointConfig::default().with_event_capacity(1),
    );
    let kept = coordinator.subscribe();
    drop(coordinator.subscribe());

    let local = coordinator.enter_thread().unwrap();
    let action = ThreadLocalAction::new(false, false, |_| Ok(()));
    coordinator.submit_to(local.id(), &action).unwrap();
    local.poll(&Location::new("events")).unwrap();

    // Capacity one: the first event is kept, the rest are dropped rather than blocking.
    let received: Vec<_> = kept.try_iter().collect();
    assert_eq!(
        received,
        vec![SafepointEvent::ThreadEntered { thread: local.id() }]
    );
}
