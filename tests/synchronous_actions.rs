use crossbeam_utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use thread_safepoint::handle::OccurrenceState;
use thread_safepoint::prelude::*;

fn wait_until(condition: impl Fn() -> bool) {
    let backoff = Backoff::new();
    while !condition() {
        backoff.snooze();
    }
}

#[test]
fn synchronous_action_returns_only_after_every_target_performed() {
    const WORKERS: usize = 3;
    let coordinator = SafepointCoordinator::new();
    let stop = AtomicBool::new(false);
    let performed = Arc::new(AtomicUsize::new(0));

    crossbeam::scope(|s| {
        for _ in 0..WORKERS {
            s.spawn(|_| {
                let local = coordinator.enter_thread().unwrap();
                let location = Location::new("sync:loop");
                while !stop.load(Ordering::Acquire) {
                    local.poll(&location).unwrap();
                    // Every poll either saw nothing or took part in the whole rendezvous.
                    let seen = performed.load(Ordering::SeqCst);
                    assert!(seen == 0 || seen == WORKERS, "observed {seen}");
                    thread::yield_now();
                }
            });
        }

        wait_until(|| coordinator.thread_count() == WORKERS);
        let counter = Arc::clone(&performed);
        let action = ThreadLocalAction::new(false, true, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let handle = coordinator.submit_all(&action).unwrap();
        assert!(handle.is_synchronous());
        assert_eq!(handle.wait(), ActionOutcome::Completed);
        stop.store(true, Ordering::Release);
    })
    .unwrap();

    assert_eq!(performed.load(Ordering::SeqCst), WORKERS);
}

#[test]
fn retiring_target_releases_the_rendezvous() {
    let coordinator = SafepointCoordinator::new();
    let (id_tx, id_rx) = flume::bounded(2);
    let (retire_tx, retire_rx) = flume::bounded::<()>(1);
    let (submitted_tx, submitted_rx) = flume::bounded::<()>(1);
    let performed = Arc::new(AtomicUsize::new(0));

    crossbeam::scope(|s| {
        s.spawn(|_| {
            let local = coordinator.enter_thread().unwrap();
            id_tx.send(local.id()).unwrap();
            submitted_rx.recv().unwrap();
            local.poll(&Location::new("poller")).unwrap();
        });
        s.spawn(|_| {
            let local = coordinator.enter_thread().unwrap();
            id_tx.send(local.id()).unwrap();
            retire_rx.recv().unwrap();
            drop(local);
        });

        let targets = [id_rx.recv().unwrap(), id_rx.recv().unwrap()];
        let counter = Arc::clone(&performed);
        let action = ThreadLocalAction::new(false, true, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let handle = coordinator.submit(Some(&targets[..]), &action).unwrap();
        assert_eq!(handle.target_count(), 2);
        submitted_tx.send(()).unwrap();
        retire_tx.send(()).unwrap();

        assert_eq!(handle.wait(), ActionOutcome::Completed);
        let states: Vec<_> = targets.iter().filter_map(|id| handle.state_for(*id)).collect();
        assert!(states.contains(&OccurrenceState::Done));
        assert!(states.contains(&OccurrenceState::Dropped));
    })
    .unwrap();

    assert_eq!(performed.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelling_releases_threads_waiting_at_the_rendezvous() {
    let coordinator = SafepointCoordinator::new();
    let (waiting_tx, waiting_rx) = flume::bounded(1);
    let (late_tx, late_rx) = flume::bounded(1);
    let (release_tx, release_rx) = flume::bounded::<()>(1);
    let (submitted_tx, submitted_rx) = flume::bounded::<()>(1);
    let performed = Arc::new(AtomicUsize::new(0));

    crossbeam::scope(|s| {
        let waiting = s.spawn(|_| {
            let local = coordinator.enter_thread().unwrap();
            waiting_tx.send(local.id()).unwrap();
            submitted_rx.recv().unwrap();
            local.poll(&Location::new("rendezvous")).unwrap();
        });
        s.spawn(|_| {
            let local = coordinator.enter_thread().unwrap();
            late_tx.send(local.id()).unwrap();
            release_rx.recv().unwrap();
            local.poll(&Location::new("late")).unwrap();
        });

        let waiting_id = waiting_rx.recv().unwrap();
        let late_id = late_rx.recv().unwrap();
        let counter = Arc::clone(&performed);
        let action = ThreadLocalAction::new(false, true, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let handle = coordinator.submit_all(&action).unwrap();
        assert_eq!(handle.target_count(), 2);
        submitted_tx.send(()).unwrap();

        let state = coordinator.thread(waiting_id).unwrap();
        wait_until(|| state.pending_count() == 0);
        assert!(handle.cancel());
        waiting.join().unwrap();

        release_tx.send(()).unwrap();
        assert_eq!(handle.wait(), ActionOutcome::Cancelled);
        wait_until(|| handle.state_for(late_id) == Some(OccurrenceState::Cancelled));
        assert_eq!(handle.state_for(waiting_id), Some(OccurrenceState::Cancelled));
    })
    .unwrap();

    assert_eq!(performed.load(Ordering::SeqCst), 0);
}

#[test]
fn synchronous_submission_from_synchronous_action_is_rejected() {
    let coordinator = SafepointCoordinator::new();
    let local = coordinator.enter_thread().unwrap();
    let nested = coordinator.clone();
    let rejected = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&rejected);

    let outer = ThreadLocalAction::new(false, true, move |access| {
        let inner = ThreadLocalAction::new(false, true, |_| Ok(()));
        let result = nested.submit_to(access.thread_id(), &inner);
        flag.store(
            matches!(result, Err(SafepointError::RecursiveSynchronous)),
            Ordering::SeqCst,
        );

        let asynchronous = ThreadLocalAction::new(false, false, |_| Ok(()));
        nested.submit_to(access.thread_id(), &asynchronous).unwrap();
        Ok(())
    });

    coordinator.submit_to(local.id(), &outer).unwrap();
    local.poll(&Location::new("outer")).unwrap();
    assert!(rejected.load(Ordering::SeqCst));
    assert!(local.has_pending_actions());
    local.poll(&Location::new("outer")).unwrap();
    assert!(!local.has_pending_actions());
}

#[test]
fn concurrent_submitters_with_opposite_target_orders_complete() {
    const ROUNDS: usize = 2_000;
    let coordinator = SafepointCoordinator::new();
    let stop = AtomicBool::new(false);
    let (id_tx, id_rx) = flume::bounded(2);
    let performed = Arc::new(AtomicUsize::new(0));

    let hung = crossbeam::scope(|s| {
        for _ in 0..2 {
            s.spawn(|_| {
                let local = coordinator.enter_thread().unwrap();
                id_tx.send(local.id()).unwrap();
                let location = Location::new("sync:overlap");
                while !stop.load(Ordering::Acquire) {
                    local.poll(&location).unwrap();
                    thread::yield_now();
                }
            });
        }

        let (first, second) = (id_rx.recv().unwrap(), id_rx.recv().unwrap());
        let submitters: Vec<_> = [[first, second], [second, first]]
            .into_iter()
            .map(|targets| {
                let coordinator = &coordinator;
                let counter = Arc::clone(&performed);
                s.spawn(move |_| {
                    let action = ThreadLocalAction::new(false, true, move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    for _ in 0..ROUNDS {
                        let handle = coordinator.submit(Some(&targets[..]), &action).unwrap();
                        if handle.wait_timeout(Duration::from_secs(10)).is_none() {
                            // Release the targets so the scope can join.
                            handle.cancel();
                            return Some((handle.state_for(targets[0]), handle.state_for(targets[1])));
                        }
                    }
                    None
                })
            })
            .collect();

        let hung: Vec<_> = submitters
            .into_iter()
            .filter_map(|submitter| submitter.join().unwrap())
            .collect();
        stop.store(true, Ordering::Release);
        hung
    })
    .unwrap();

    assert!(hung.is_empty(), "rendezvous never completed: {hung:?}");
    assert_eq!(performed.load(Ordering::SeqCst), 2 * 2 * ROUNDS);
}
