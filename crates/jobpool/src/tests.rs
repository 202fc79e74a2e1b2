use crate::{
    Dispatcher, DispatcherConfig, Error, Event, EventLevel, EventSink, Job, JobOutput, MemorySink,
    dispatcher::supervise,
    event::Reporter,
    queue::availability_queue,
    sync::WaitGroup,
    worker::Worker,
};
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

const QUIT_DEADLINE: Duration = Duration::from_secs(10);

fn dispatcher(max_workers: usize) -> (Dispatcher, Arc<MemorySink>) {
    dispatcher_with(DispatcherConfig::new(max_workers))
}

fn dispatcher_with(config: DispatcherConfig) -> (Dispatcher, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let dispatcher = Dispatcher::with_config(config, sink.clone()).expect("valid config");
    (dispatcher, sink)
}

/// A job that counts its invocations before reporting `output`.
fn counted(
    calls: &Arc<AtomicUsize>,
    output: impl FnOnce() -> JobOutput + Send + 'static,
) -> Job {
    let calls = calls.clone();
    Job::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        output()
    })
}

async fn quit(dispatcher: Dispatcher) {
    timeout(QUIT_DEADLINE, dispatcher.quit())
        .await
        .expect("quit must not deadlock");
}

fn success_ids(sink: &MemorySink) -> Vec<String> {
    let mut ids: Vec<_> = sink
        .job_events(EventLevel::Info)
        .into_iter()
        .filter_map(|e| e.job_id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_successful_jobs_are_logged_as_successes() {
    let (mut dispatcher, sink) = dispatcher(10);
    dispatcher.run().unwrap();

    dispatcher
        .dispatch(|| JobOutput::success("job-id-#1"))
        .await
        .unwrap();
    dispatcher
        .dispatch(|| JobOutput::success("job-id-#2"))
        .await
        .unwrap();

    quit(dispatcher).await;

    assert_eq!(success_ids(&sink), ["job-id-#1", "job-id-#2"]);
    assert!(sink.errors().is_empty());
    assert!(
        sink.events()
            .last()
            .is_some_and(|e| e.message == "Dispatcher finished")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_job_is_reported_once_and_never_retried() {
    let (mut dispatcher, sink) = dispatcher(10);
    dispatcher.run().unwrap();

    let calls: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    dispatcher
        .dispatch(counted(&calls[0], || JobOutput::success("01")))
        .await
        .unwrap();
    dispatcher
        .dispatch(counted(&calls[1], || JobOutput::failure("02", "OH NO")))
        .await
        .unwrap();
    dispatcher
        .dispatch(counted(&calls[2], || JobOutput::success("03")))
        .await
        .unwrap();

    quit(dispatcher).await;

    for c in &calls {
        assert_eq!(c.load(Ordering::SeqCst), 1);
    }

    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].job_id.as_deref(), Some("02"));
    assert!(errors[0].message.contains("OH NO"));
    assert_eq!(success_ids(&sink), ["01", "03"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quits_a_pool_that_never_ran_a_job() {
    let (mut dispatcher, sink) = dispatcher(1);
    dispatcher.run().unwrap();
    quit(dispatcher).await;

    assert!(sink.errors().is_empty());
    assert!(
        sink.events()
            .iter()
            .any(|e| e.message == "Stopping Worker 0")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quits_a_pool_that_was_never_started() {
    let (dispatcher, _sink) = dispatcher(3);
    quit(dispatcher).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backlog_on_a_single_worker_runs_sequentially() {
    let (mut dispatcher, sink) = dispatcher(1);
    dispatcher.run().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for id in ["first", "second"] {
        let order = order.clone();
        dispatcher
            .dispatch(move || {
                order.lock().push(format!("{id}:start"));
                std::thread::sleep(Duration::from_millis(20));
                order.lock().push(format!("{id}:end"));
                JobOutput::success(id)
            })
            .await
            .unwrap();
    }

    quit(dispatcher).await;

    assert_eq!(
        *order.lock(),
        ["first:start", "first:end", "second:start", "second:end"]
    );
    assert_eq!(success_ids(&sink), ["first", "second"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_dispatched_job_runs_exactly_once() {
    const JOBS: usize = 200;

    let (mut dispatcher, sink) = dispatcher(4);
    dispatcher.run().unwrap();

    let calls: Vec<_> = (0..JOBS).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    for (n, c) in calls.iter().enumerate() {
        dispatcher
            .dispatch(counted(c, move || JobOutput::success(format!("{n:03}"))))
            .await
            .unwrap();
    }

    quit(dispatcher).await;

    assert!(calls.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    assert_eq!(sink.job_events(EventLevel::Info).len(), JOBS);
    assert!(sink.errors().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_pool_size() {
    const POOL: usize = 3;

    let (mut dispatcher, _sink) = dispatcher(POOL);
    dispatcher.run().unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for n in 0..30 {
        let active = active.clone();
        let peak = peak.clone();
        dispatcher
            .dispatch(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
                JobOutput::success(n.to_string())
            })
            .await
            .unwrap();
    }

    quit(dispatcher).await;

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= POOL, "peak concurrency was {peak}");
    assert_eq!(active.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatch_returns_while_every_worker_is_busy() {
    let (mut dispatcher, sink) = dispatcher(1);
    dispatcher.run().unwrap();

    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    dispatcher
        .dispatch(move || {
            let _ = release_rx.recv();
            JobOutput::success("blocker")
        })
        .await
        .unwrap();

    // The only worker is busy; acceptance must not wait for it.
    timeout(
        Duration::from_secs(1),
        dispatcher.dispatch(|| JobOutput::success("queued")),
    )
    .await
    .expect("dispatch returns without an idle worker")
    .unwrap();

    release_tx.send(()).unwrap();
    quit(dispatcher).await;

    assert_eq!(success_ids(&sink), ["blocker", "queued"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_submitters_share_one_pool() {
    let (mut dispatcher, sink) = dispatcher(4);
    dispatcher.run().unwrap();

    let submitters: Vec<_> = (0..8)
        .map(|s| {
            let handle = dispatcher.handle();
            tokio::spawn(async move {
                for n in 0..25 {
                    handle
                        .dispatch(move || JobOutput::success(format!("{s}-{n}")))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    for result in futures::future::join_all(submitters).await {
        result.expect("submitter task");
    }
    quit(dispatcher).await;

    assert_eq!(sink.job_events(EventLevel::Info).len(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_job_stops_only_its_worker() {
    let (mut dispatcher, sink) = dispatcher(2);
    dispatcher.run().unwrap();

    dispatcher
        .dispatch(|| -> JobOutput { panic!("job exploded") })
        .await
        .unwrap();

    timeout(Duration::from_secs(5), async {
        while !dispatcher.workers().iter().any(|w| w.is_finished()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("panicked worker exits");

    // The pool keeps serving with the remaining worker.
    for n in 0..5 {
        dispatcher
            .dispatch(move || JobOutput::success(n.to_string()))
            .await
            .unwrap();
    }

    let finished = dispatcher
        .workers()
        .iter()
        .filter(|w| w.is_finished())
        .count();
    assert_eq!(finished, 1);

    quit(dispatcher).await;

    assert_eq!(sink.job_events(EventLevel::Info).len(), 5);
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("job exploded"));
    assert!(errors[0].message.starts_with("Panic on Worker"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_pool_reports_jobs_as_lost() {
    let (mut dispatcher, sink) = dispatcher(0);
    dispatcher.run().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    dispatcher
        .dispatch(counted(&calls, || JobOutput::success("never")))
        .await
        .unwrap();

    quit(dispatcher).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("job #1"));
    assert!(errors[0].message.contains("job dropped"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_misuse_is_rejected() {
    let (mut dispatcher, _sink) = dispatcher(1);

    assert_eq!(
        dispatcher.dispatch(|| JobOutput::success("early")).await,
        Err(Error::NotRunning)
    );
    assert!(!dispatcher.is_running());

    dispatcher.run().unwrap();
    assert!(dispatcher.is_running());
    assert_eq!(dispatcher.run(), Err(Error::AlreadyRunning));

    let handle = dispatcher.handle();
    quit(dispatcher).await;

    assert_eq!(
        handle.dispatch(|| JobOutput::success("late")).await,
        Err(Error::DispatcherStopped)
    );
}

#[tokio::test]
async fn rejects_invalid_config() {
    let sink = Arc::new(MemorySink::new());
    let result = Dispatcher::with_config(DispatcherConfig::new(1).with_tag(""), sink);
    assert!(matches!(result, Err(Error::InvalidConfig { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_tag_is_attached_to_every_event() {
    let (mut dispatcher, sink) = dispatcher_with(DispatcherConfig::new(2).with_tag("Pool"));
    dispatcher.run().unwrap();
    dispatcher
        .dispatch(|| JobOutput::success("tagged"))
        .await
        .unwrap();
    quit(dispatcher).await;

    let events = sink.events();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.tag == "Pool"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_timeout_bounds_quit_with_a_hung_job() {
    let config = DispatcherConfig::new(1).with_shutdown_timeout(Duration::from_millis(100));
    let (mut dispatcher, _sink) = dispatcher_with(config);
    dispatcher.run().unwrap();

    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    dispatcher
        .dispatch(move || {
            let _ = release_rx.recv();
            JobOutput::success("hung")
        })
        .await
        .unwrap();

    timeout(Duration::from_secs(5), dispatcher.quit())
        .await
        .expect("bounded quit returns despite the hung job");

    // Let the blocking thread finish so the runtime can shut down.
    release_tx.send(()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatcher_loop_panic_triggers_emergency_shutdown() {
    let sink = Arc::new(MemorySink::new());
    let reporter = Reporter::new(sink.clone(), "Worker");
    let (queue_tx, _queue_rx) = availability_queue(2);
    let workers_group = WaitGroup::new();
    let token = CancellationToken::new();

    let mut workers: Vec<_> = (0..2)
        .map(|id| {
            Worker::new(
                id,
                queue_tx.clone(),
                workers_group.clone(),
                token.clone(),
                reporter.clone(),
            )
        })
        .collect();
    workers.iter_mut().for_each(Worker::start);
    assert_eq!(workers_group.count(), 2);

    let failing_loop: JoinHandle<()> = tokio::spawn(async { panic!("loop exploded") });
    timeout(
        Duration::from_secs(5),
        supervise(failing_loop, token.clone(), workers_group.clone(), reporter),
    )
    .await
    .expect("supervisor finishes the emergency shutdown");

    assert!(token.is_cancelled());
    assert_eq!(workers_group.count(), 0);

    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "Panic on Dispatcher. loop exploded");
    let emergency_stops = sink
        .events()
        .iter()
        .filter(|e| e.message.contains("emergency shutdown"))
        .count();
    assert_eq!(emergency_stops, 2);

    // Workers already gone: stopping them afterwards returns immediately.
    for worker in &mut workers {
        timeout(Duration::from_secs(1), worker.stop())
            .await
            .expect("stop after emergency shutdown");
    }
}

/// Keeps events like [`MemorySink`] but panics on every job success.
struct PanickyOnSuccess {
    inner: MemorySink,
}

impl EventSink for PanickyOnSuccess {
    fn record(&self, event: Event) {
        if event.message.ends_with("executed with success") {
            panic!("sink failed on: {}", event.message);
        }
        self.inner.record(event);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_sink_does_not_hang_quit() {
    let sink = Arc::new(PanickyOnSuccess {
        inner: MemorySink::new(),
    });
    let mut dispatcher = Dispatcher::with_config(DispatcherConfig::new(2), sink.clone()).unwrap();
    dispatcher.run().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    for n in 0..3 {
        dispatcher
            .dispatch(counted(&calls, move || JobOutput::success(n.to_string())))
            .await
            .unwrap();
    }

    quit(dispatcher).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let messages: Vec<_> = sink.inner.events().into_iter().map(|e| e.message).collect();
    assert_eq!(
        messages
            .iter()
            .filter(|m| m.starts_with("Stopping Worker"))
            .count(),
        2
    );
    assert_eq!(messages.last().map(String::as_str), Some("Dispatcher finished"));
}
