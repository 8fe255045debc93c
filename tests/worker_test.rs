//! Integration tests for the worker loop and host lifecycle.

use std::any::TypeId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sampleapp_bg::config::{OverflowPolicy, QueueConfig};
use sampleapp_bg::engine::{BackgroundHost, ShutdownOutcome};
use sampleapp_bg::error::{Error, Result};
use sampleapp_bg::event::{Event, EventBus, EventKind};
use sampleapp_bg::queue::{self, TaskQueue};
use sampleapp_bg::scope::{Instance, ScopeFactory, ServiceContainer, ServiceScope};
use sampleapp_bg::WorkerState;
use tokio::sync::{broadcast, oneshot};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(capacity: usize, shutdown_timeout: Duration) -> QueueConfig {
    QueueConfig {
        capacity,
        overflow: OverflowPolicy::Wait,
        shutdown_timeout,
    }
}

fn start_with(
    config: &QueueConfig,
    scopes: Arc<dyn ScopeFactory>,
) -> (TaskQueue, BackgroundHost, broadcast::Receiver<Event>) {
    let events = EventBus::new(1024);
    let rx = events.subscribe();
    let (queue, receiver) = queue::channel(config);
    let host = BackgroundHost::start_with_events(receiver, scopes, config, events);
    (queue, host, rx)
}

fn start(capacity: usize) -> (TaskQueue, BackgroundHost, broadcast::Receiver<Event>) {
    start_with(
        &config(capacity, Duration::from_secs(5)),
        Arc::new(ServiceContainer::new()),
    )
}

/// Drain the event stream up to and including `WorkerStopped`.
async fn collect_events(rx: &mut broadcast::Receiver<Event>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let stop = event.kind == EventKind::WorkerStopped;
                kinds.push(event.kind);
                if stop {
                    return kinds;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return kinds,
        }
    }
}

/// A scoped dependency that records which scope built it.
struct Widget {
    scope_serial: usize,
}

/// Scope factory that counts scopes created and disposals performed.
#[derive(Default)]
struct CountingFactory {
    created: AtomicUsize,
    disposed: Arc<AtomicUsize>,
    fail_create: bool,
}

struct CountingScope {
    serial: usize,
    widget: Option<Instance>,
    disposed: Arc<AtomicUsize>,
}

impl ScopeFactory for CountingFactory {
    fn create_scope(&self) -> Result<Box<dyn ServiceScope>> {
        if self.fail_create {
            return Err(Error::Scope("scope provider unavailable".to_string()));
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingScope {
            serial,
            widget: None,
            disposed: Arc::clone(&self.disposed),
        }))
    }
}

impl ServiceScope for CountingScope {
    fn resolve_any(&mut self, type_id: TypeId, type_name: &'static str) -> Result<Instance> {
        if type_id != TypeId::of::<Widget>() {
            return Err(Error::Resolve { type_name });
        }
        let serial = self.serial;
        let widget = self.widget.get_or_insert_with(|| {
            Arc::new(Widget {
                scope_serial: serial,
            }) as Instance
        });
        Ok(Arc::clone(widget))
    }

    fn dispose(&mut self) {
        self.widget = None;
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_producer_items_run_in_enqueue_order() {
    let (queue, host, _events) = start(64);
    let seen = Arc::new(Mutex::new(Vec::new()));

    for n in 0..20 {
        let seen = Arc::clone(&seen);
        queue
            .queue_work(move |_| async move {
                seen.lock().unwrap().push(n);
                Ok(())
            })
            .await
            .unwrap();
    }
    drop(queue);

    assert_eq!(host.join().await, ShutdownOutcome::Graceful);
    assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn slow_item_still_finishes_before_the_next_one() {
    let (queue, host, _events) = start(8);
    let seen = Arc::new(Mutex::new(Vec::<&str>::new()));

    let a = Arc::clone(&seen);
    queue
        .queue_work(move |_| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            a.lock().unwrap().push("A");
            Ok(())
        })
        .await
        .unwrap();
    let b = Arc::clone(&seen);
    queue
        .queue_work(move |_| async move {
            b.lock().unwrap().push("B");
            Ok(())
        })
        .await
        .unwrap();
    drop(queue);

    host.join().await;
    assert_eq!(*seen.lock().unwrap(), vec!["A", "B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_each_item_runs_exactly_once() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 25;

    let (queue, host, _events) = start(4);
    let runs = Arc::new(Mutex::new(vec![0_usize; PRODUCERS * PER_PRODUCER]));
    let order = Arc::new(Mutex::new(vec![Vec::new(); PRODUCERS]));

    let mut producers = Vec::new();
    for p in 0..PRODUCERS {
        let queue = queue.clone();
        let runs = Arc::clone(&runs);
        let order = Arc::clone(&order);
        producers.push(tokio::spawn(async move {
            for n in 0..PER_PRODUCER {
                let runs = Arc::clone(&runs);
                let order = Arc::clone(&order);
                queue
                    .queue_work(move |_| async move {
                        runs.lock().unwrap()[p * PER_PRODUCER + n] += 1;
                        order.lock().unwrap()[p].push(n);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    drop(queue);

    assert_eq!(host.join().await, ShutdownOutcome::Graceful);
    assert!(runs.lock().unwrap().iter().all(|&count| count == 1));
    // each producer's own items keep their relative order
    for seen in order.lock().unwrap().iter() {
        assert_eq!(*seen, (0..PER_PRODUCER).collect::<Vec<_>>());
    }
}

// ---------------------------------------------------------------------------
// Fault isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_and_panicking_items_do_not_stop_the_loop() {
    let (queue, host, mut events) = start(8);
    let ran = Arc::new(AtomicUsize::new(0));

    queue
        .queue_work(|_| async { anyhow::bail!("first item failed") })
        .await
        .unwrap();
    queue
        .queue_work(|_| async { panic!("second item panicked") })
        .await
        .unwrap();
    let counter = Arc::clone(&ran);
    queue
        .queue_work(move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    drop(queue);

    host.join().await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    let kinds = collect_events(&mut events).await;
    assert!(kinds.iter().any(|k| matches!(
        k,
        EventKind::WorkFailed { error, .. } if error.contains("first item failed")
    )));
    assert!(kinds.iter().any(|k| matches!(
        k,
        EventKind::WorkPanicked { message, .. } if message.contains("second item panicked")
    )));
    assert_eq!(
        kinds
            .iter()
            .filter(|k| matches!(k, EventKind::WorkCompleted { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn failing_scoped_item_is_logged_disposed_and_followed() {
    let factory = Arc::new(CountingFactory::default());
    let disposed = Arc::clone(&factory.disposed);
    let (queue, host, mut events) =
        start_with(&config(8, Duration::from_secs(5)), factory.clone());

    queue
        .queue_scoped_work::<Widget, _, _>(|_widget, _| async {
            Err(anyhow::anyhow!("invalid operation: todo item is locked"))
        })
        .await
        .unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    queue
        .queue_work(move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    drop(queue);

    host.join().await;
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    let kinds = collect_events(&mut events).await;
    assert!(kinds.iter().any(|k| matches!(
        k,
        EventKind::WorkFailed { error, .. } if error.contains("invalid operation")
    )));
}

#[tokio::test]
async fn scope_creation_failure_is_an_item_failure() {
    let factory = Arc::new(CountingFactory {
        fail_create: true,
        ..CountingFactory::default()
    });
    let (queue, host, mut events) = start_with(&config(8, Duration::from_secs(5)), factory);

    queue
        .queue_scoped_work::<Widget, _, _>(|_, _| async { Ok(()) })
        .await
        .unwrap();
    queue.queue_work(|_| async { Ok(()) }).await.unwrap();
    drop(queue);

    host.join().await;
    let kinds = collect_events(&mut events).await;
    assert!(kinds.iter().any(|k| matches!(
        k,
        EventKind::WorkFailed { error, .. } if error.contains("scope provider unavailable")
    )));
    assert!(kinds.iter().any(|k| matches!(k, EventKind::WorkCompleted { .. })));
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_scoped_item_gets_its_own_instance_and_disposal() {
    let factory = Arc::new(CountingFactory::default());
    let disposed = Arc::clone(&factory.disposed);
    let (queue, host, _events) = start_with(&config(16, Duration::from_secs(5)), factory.clone());
    let serials = Arc::new(Mutex::new(Vec::new()));

    for n in 0..6 {
        let serials = Arc::clone(&serials);
        queue
            .queue_scoped_work::<Widget, _, _>(move |widget, _| async move {
                serials.lock().unwrap().push(widget.scope_serial);
                anyhow::ensure!(n % 3 != 2, "item {n} fails on purpose");
                Ok(())
            })
            .await
            .unwrap();
    }
    drop(queue);
    host.join().await;

    let mut serials = serials.lock().unwrap().clone();
    assert_eq!(serials.len(), 6);
    serials.sort_unstable();
    serials.dedup();
    assert_eq!(serials.len(), 6, "scoped instances must not be shared");

    assert_eq!(factory.created.load(Ordering::SeqCst), 6);
    assert_eq!(disposed.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn panicking_scoped_item_still_disposes_its_scope() {
    let factory = Arc::new(CountingFactory::default());
    let disposed = Arc::clone(&factory.disposed);
    let (queue, host, _events) = start_with(&config(4, Duration::from_secs(5)), factory);

    queue
        .queue_scoped_work::<Widget, _, _>(|_, _| async { panic!("scoped panic") })
        .await
        .unwrap();
    drop(queue);
    host.join().await;

    assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_resolution_still_disposes_the_scope() {
    let factory = Arc::new(CountingFactory::default());
    let disposed = Arc::clone(&factory.disposed);
    let (queue, host, mut events) = start_with(&config(4, Duration::from_secs(5)), factory);

    // the counting scope only knows Widget
    queue
        .queue_scoped_work::<String, _, _>(|_, _| async { Ok(()) })
        .await
        .unwrap();
    drop(queue);
    host.join().await;

    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    let kinds = collect_events(&mut events).await;
    assert!(kinds.iter().any(|k| matches!(
        k,
        EventKind::WorkFailed { error, .. } if error.contains("no scoped registration")
    )));
}

#[tokio::test]
async fn container_scopes_run_dispose_hooks() {
    let disposed = Arc::new(AtomicUsize::new(0));
    let hook = Arc::clone(&disposed);
    let mut services = ServiceContainer::new();
    services.register_scoped_with_dispose(
        |_| Ok(String::from("repository")),
        move |_: &String| {
            hook.fetch_add(1, Ordering::SeqCst);
        },
    );
    let (queue, host, _events) =
        start_with(&config(4, Duration::from_secs(5)), Arc::new(services));

    for _ in 0..3 {
        queue
            .queue_scoped_work::<String, _, _>(|repo, _| async move {
                anyhow::ensure!(repo.as_str() == "repository", "unexpected {repo}");
                Ok(())
            })
            .await
            .unwrap();
    }
    drop(queue);
    host.join().await;

    assert_eq!(disposed.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_queue_suspends_the_producer_until_the_worker_frees_a_slot() {
    let (queue, host, _events) = start(1);

    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    queue
        .queue_work(move |_| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(())
        })
        .await
        .unwrap();
    started_rx.await.unwrap();

    // the worker is busy; this fills the only slot
    queue.queue_work(|_| async { Ok(()) }).await.unwrap();

    let producer = queue.clone();
    let mut blocked = tokio::spawn(async move { producer.queue_work(|_| async { Ok(()) }).await });

    let early = tokio::time::timeout(Duration::from_millis(100), &mut blocked).await;
    assert!(early.is_err(), "enqueue should wait while the queue is full");

    release_tx.send(()).unwrap();
    let id = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("enqueue should complete once a slot frees up")
        .unwrap();
    assert!(id.is_ok());

    drop(queue);
    host.join().await;
}

#[tokio::test]
async fn reject_policy_reports_full_instead_of_waiting() {
    let config = QueueConfig {
        capacity: 1,
        overflow: OverflowPolicy::Reject,
        shutdown_timeout: Duration::from_secs(5),
    };
    let (queue, host, _events) = start_with(&config, Arc::new(ServiceContainer::new()));

    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    queue
        .queue_work(move |_| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(())
        })
        .await
        .unwrap();
    started_rx.await.unwrap();
    queue.queue_work(|_| async { Ok(()) }).await.unwrap();

    let err = queue.queue_work(|_| async { Ok(()) }).await.unwrap_err();
    assert!(matches!(err, Error::QueueFull { capacity: 1 }));

    release_tx.send(()).unwrap();
    drop(queue);
    host.join().await;
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_lets_in_flight_work_finish_and_discards_the_rest() {
    let (queue, host, mut events) = start(8);
    let mut state = host.watch_state();
    let finished = Arc::new(AtomicUsize::new(0));
    let later = Arc::new(AtomicUsize::new(0));

    let (started_tx, started_rx) = oneshot::channel();
    let done = Arc::clone(&finished);
    queue
        .queue_work(move |_| async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(100)).await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    let never = Arc::clone(&later);
    queue
        .queue_work(move |_| async move {
            never.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    started_rx.await.unwrap();
    assert_eq!(host.shutdown().await, ShutdownOutcome::Graceful);

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(later.load(Ordering::SeqCst), 0);
    assert_eq!(*state.borrow_and_update(), WorkerState::Stopped);

    let kinds = collect_events(&mut events).await;
    assert!(kinds.contains(&EventKind::DrainStarted));
    assert!(kinds.contains(&EventKind::WorkDiscarded { count: 1 }));
    assert_eq!(kinds.last(), Some(&EventKind::WorkerStopped));

    let err = queue.queue_work(|_| async { Ok(()) }).await.unwrap_err();
    assert!(matches!(err, Error::QueueClosed));
}

#[tokio::test]
async fn overrunning_item_is_aborted_after_the_shutdown_timeout() {
    let (queue, host, mut events) = start_with(
        &config(4, Duration::from_millis(50)),
        Arc::new(ServiceContainer::new()),
    );

    let (started_tx, started_rx) = oneshot::channel();
    queue
        .queue_work(move |_| async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await
        .unwrap();
    started_rx.await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), host.shutdown())
        .await
        .expect("shutdown must not hang on a stuck item");
    assert_eq!(outcome, ShutdownOutcome::Forced);

    let kinds = collect_events(&mut events).await;
    assert!(kinds.iter().any(|k| matches!(k, EventKind::ForcedStop { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn item_that_never_yields_does_not_hold_up_shutdown() {
    let (queue, host, mut events) = start_with(
        &config(4, Duration::from_millis(50)),
        Arc::new(ServiceContainer::new()),
    );

    let (started_tx, started_rx) = oneshot::channel();
    queue
        .queue_work(move |_| async move {
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(1500));
            Ok(())
        })
        .await
        .unwrap();
    started_rx.await.unwrap();

    let begun = std::time::Instant::now();
    let outcome = host.shutdown().await;
    assert_eq!(outcome, ShutdownOutcome::Forced);
    assert!(
        begun.elapsed() < Duration::from_millis(1000),
        "shutdown took {:?}",
        begun.elapsed()
    );

    let kinds = collect_events(&mut events).await;
    assert!(kinds.iter().any(|k| matches!(k, EventKind::ForcedStop { .. })));
    assert!(!kinds.iter().any(|k| matches!(k, EventKind::WorkCompleted { .. })));
}

#[tokio::test]
async fn overrunning_scoped_item_still_disposes_its_scope() {
    let factory = Arc::new(CountingFactory::default());
    let disposed = Arc::clone(&factory.disposed);
    let (queue, host, _events) = start_with(&config(4, Duration::from_millis(50)), factory);

    let (started_tx, started_rx) = oneshot::channel();
    queue
        .queue_scoped_work::<Widget, _, _>(move |_widget, _| async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await
        .unwrap();
    started_rx.await.unwrap();

    assert_eq!(host.shutdown().await, ShutdownOutcome::Forced);
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn enqueue_is_refused_once_shutdown_is_requested() {
    let (queue, host, _events) = start(8);
    let finished = Arc::new(AtomicUsize::new(0));
    let late = Arc::new(AtomicUsize::new(0));

    let (started_tx, started_rx) = oneshot::channel();
    let done = Arc::clone(&finished);
    queue
        .queue_work(move |_| async move {
            let _ = started_tx.send(());
            tokio::time::sleep(Duration::from_millis(300)).await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    started_rx.await.unwrap();

    host.request_shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let counter = Arc::clone(&late);
    let err = queue
        .queue_work(move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueClosed));
    assert!(queue.is_closed());

    assert_eq!(host.shutdown().await, ShutdownOutcome::Graceful);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(late.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shutdown_of_an_idle_worker_is_graceful() {
    let (_queue, host, mut events) = start(4);
    let mut state = host.watch_state();

    assert_eq!(host.shutdown().await, ShutdownOutcome::Graceful);
    assert_eq!(*state.borrow_and_update(), WorkerState::Stopped);

    let kinds = collect_events(&mut events).await;
    assert_eq!(
        kinds,
        vec![
            EventKind::WorkerStarted,
            EventKind::DrainStarted,
            EventKind::WorkerStopped
        ]
    );
}

#[tokio::test]
async fn worker_exits_when_every_queue_handle_is_dropped() {
    let (queue, host, _events) = start(4);
    queue.queue_work(|_| async { Ok(()) }).await.unwrap();
    drop(queue);

    let outcome = tokio::time::timeout(Duration::from_secs(5), host.join())
        .await
        .expect("worker should stop once producers are gone");
    assert_eq!(outcome, ShutdownOutcome::Graceful);
}

#[tokio::test]
async fn each_item_gets_an_independent_token() {
    let (queue, host, _events) = start(4);
    let (token_tx, token_rx) = oneshot::channel();
    let (flag_tx, flag_rx) = oneshot::channel();

    queue
        .queue_work(move |token| async move {
            token.cancel();
            let _ = token_tx.send(());
            Ok(())
        })
        .await
        .unwrap();
    queue
        .queue_work(move |token| async move {
            let _ = flag_tx.send(token.is_cancelled());
            Ok(())
        })
        .await
        .unwrap();

    token_rx.await.unwrap();
    assert!(!flag_rx.await.unwrap(), "cancelling one item's token leaked to the next");
    assert_eq!(host.state(), WorkerState::Running);

    drop(queue);
    host.join().await;
}
