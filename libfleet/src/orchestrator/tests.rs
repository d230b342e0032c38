use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::*;
use crate::executor::{FleetConnector, RemoteTargetExecutor};
use crate::job::{TargetState, CANCELED_BEFORE_START};
use crate::target::AuthRef;

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Succeed(Duration),
    Fail(Duration),
    Panic,
    /// Ignores its deadline entirely.
    Hang,
    /// Returns without reaching a terminal state.
    Misreport,
    /// Reports `Canceled` although the target was dispatched.
    ReportCanceled,
}

#[derive(Debug, Default)]
struct Stats {
    calls: AtomicUsize,
    current: AtomicUsize,
    peak: AtomicUsize,
    log: Mutex<Vec<String>>,
    timeouts: Mutex<Vec<Duration>>,
}

impl Stats {
    fn position(&self, entry: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{} not logged", entry))
    }
}

/// Executor whose behavior is scripted per host.
#[derive(Debug, Default)]
struct ScriptedExecutor {
    behaviors: HashMap<String, Behavior>,
    stats: Arc<Stats>,
}

impl ScriptedExecutor {
    fn with(mut self, host: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(host.to_string(), behavior);
        self
    }
}

#[async_trait]
impl TargetExecutor for ScriptedExecutor {
    async fn run(
        &self,
        index: usize,
        target: &TargetDescriptor,
        _action: &FleetAction,
        timeout: Duration,
    ) -> TargetResult {
        let stats = &self.stats;
        stats.calls.fetch_add(1, Ordering::SeqCst);
        stats.timeouts.lock().unwrap().push(timeout);
        let now = stats.current.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak.fetch_max(now, Ordering::SeqCst);
        stats.log.lock().unwrap().push(format!("start:{}", index));

        let behavior = self
            .behaviors
            .get(target.host())
            .copied()
            .unwrap_or(Behavior::Succeed(Duration::from_millis(10)));
        let mut result = TargetResult::running(index, target);
        let started = Instant::now();
        match behavior {
            Behavior::Succeed(delay) => {
                tokio::time::sleep(delay).await;
                result
                    .succeed(format!("{}\n", target.name()), String::new(), started.elapsed())
                    .unwrap();
            }
            Behavior::Fail(delay) => {
                tokio::time::sleep(delay).await;
                result
                    .fail(
                        format!("connect failed: {}: no route to host", target.address()),
                        String::new(),
                        String::new(),
                        started.elapsed(),
                    )
                    .unwrap();
            }
            Behavior::Panic => panic!("executor blew up on {}", target.name()),
            Behavior::Hang => futures::future::pending::<()>().await,
            Behavior::Misreport => {}
            Behavior::ReportCanceled => {
                result = TargetResult::queued(index, target);
                result.cancel().unwrap();
            }
        }

        stats.current.fetch_sub(1, Ordering::SeqCst);
        stats.log.lock().unwrap().push(format!("end:{}", index));
        result
    }
}

fn targets(n: usize) -> Vec<TargetDescriptor> {
    (0..n)
        .map(|i| {
            TargetDescriptor::new(format!("node-{}", i), "ops".into(), format!("10.0.0.{}", i))
                .with_group(if i % 2 == 0 { "even" } else { "odd" })
        })
        .collect()
}

fn all(n: usize) -> Vec<usize> {
    (0..n).collect()
}

fn orchestrator(executor: ScriptedExecutor) -> (Orchestrator<ScriptedExecutor>, JobEvents) {
    let (tx, events) = events(64);
    (Orchestrator::new(executor, tx), events)
}

/// Receive events up to and including `Finished`.
async fn collect(events: &mut JobEvents) -> Vec<JobEvent> {
    let mut out = vec![];
    while let Some(event) = events.next().await {
        let finished = matches!(event, JobEvent::Finished(_));
        out.push(event);
        if finished {
            break;
        }
    }
    out
}

fn finished_job(events: &[JobEvent]) -> &FleetJob {
    match events.last() {
        Some(JobEvent::Finished(job)) => job,
        other => panic!("expected Finished, got {:?}", other),
    }
}

fn assert_complete(job: &FleetJob, selection: &[usize]) {
    assert_eq!(selection.len(), job.results().len());
    for (i, result) in job.results().iter().enumerate() {
        assert_eq!(selection[i], *result.target_index());
        assert!(result.is_terminal(), "{:?} is not terminal", result);
    }
}

#[tokio::test]
async fn test_five_targets_two_workers() {
    let executor = ScriptedExecutor::default();
    let stats = executor.stats.clone();
    let (mut orchestrator, mut events) = orchestrator(executor);
    orchestrator.set_max_concurrency(2).unwrap();

    let targets = targets(5);
    orchestrator
        .start(&targets, &all(5), FleetAction::run_command("true"))
        .unwrap();
    let events = collect(&mut events).await;

    match &events[0] {
        JobEvent::Started(job) => {
            assert_eq!("Run: true", job.title());
            assert_eq!(5, job.results().len());
            assert!(job.results().iter().all(|r| *r.state() == TargetState::Queued));
        }
        other => panic!("expected Started, got {:?}", other),
    }

    let progress: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress { done, total, .. } => Some((*done, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)], progress);
    assert_eq!(
        1,
        events
            .iter()
            .filter(|e| matches!(e, JobEvent::Finished(_)))
            .count()
    );

    let job = finished_job(&events);
    assert_complete(job, &all(5));
    assert!(job.summary().all_ok());
    assert_eq!("node-3\n", job.results()[3].stdout());
    assert!(job.finished_at().is_some());
    assert!(stats.peak.load(Ordering::SeqCst) <= 2);
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_progress_results_grow_monotonically() {
    let (mut orchestrator, mut events) = orchestrator(ScriptedExecutor::default());
    orchestrator.set_max_concurrency(3).unwrap();
    let targets = targets(6);
    orchestrator
        .start(&targets, &all(6), FleetAction::run_command("true"))
        .unwrap();

    let mut last_terminal = 0;
    for event in collect(&mut events).await {
        if let JobEvent::Progress { job, done, .. } = event {
            let terminal = job.results().iter().filter(|r| r.is_terminal()).count();
            assert_eq!(done, terminal);
            assert!(terminal > last_terminal);
            last_terminal = terminal;
        }
    }
    assert_eq!(6, last_terminal);
}

#[tokio::test]
async fn test_unreachable_target_fails_alone() {
    let executor = ScriptedExecutor::default().with("10.0.0.1", Behavior::Fail(Duration::from_millis(5)));
    let (orchestrator, mut events) = orchestrator(executor);
    let targets = targets(3);
    orchestrator
        .start(&targets, &all(3), FleetAction::run_command("uptime"))
        .unwrap();

    let events = collect(&mut events).await;
    let job = finished_job(&events);
    assert_complete(job, &all(3));
    let summary = job.summary();
    assert_eq!((2, 1, 0), (summary.ok, summary.failed, summary.canceled));
    assert_eq!(TargetState::Failed, *job.results()[1].state());
    assert!(job.results()[1]
        .error()
        .as_deref()
        .unwrap()
        .starts_with("connect failed: "));
}

#[tokio::test]
async fn test_results_ordered_regardless_of_completion_order() {
    // Earlier targets are slower, so completion order is reversed.
    let executor = ScriptedExecutor::default()
        .with("10.0.0.0", Behavior::Succeed(Duration::from_millis(120)))
        .with("10.0.0.2", Behavior::Succeed(Duration::from_millis(60)))
        .with("10.0.0.4", Behavior::Succeed(Duration::from_millis(5)));
    let stats = executor.stats.clone();
    let (mut orchestrator, mut events) = orchestrator(executor);
    orchestrator.set_max_concurrency(3).unwrap();

    let targets = targets(5);
    orchestrator
        .start(&targets, &[4, 0, 2], FleetAction::run_command("true"))
        .unwrap();
    let events = collect(&mut events).await;
    let job = finished_job(&events);

    assert_eq!(&vec![0, 2, 4], job.targets());
    assert_complete(job, &[0, 2, 4]);
    assert!(stats.position("end:4") < stats.position("end:0"));
}

#[tokio::test]
async fn test_concurrency_bound() {
    let mut executor = ScriptedExecutor::default();
    for i in 0..20 {
        executor = executor.with(
            &format!("10.0.0.{}", i),
            Behavior::Succeed(Duration::from_millis(5 + (i as u64 * 7) % 30)),
        );
    }
    let stats = executor.stats.clone();
    let (mut orchestrator, mut events) = orchestrator(executor);
    orchestrator.set_max_concurrency(3).unwrap();

    let targets = targets(20);
    orchestrator
        .start(&targets, &all(20), FleetAction::run_command("true"))
        .unwrap();
    let events = collect(&mut events).await;

    for event in &events {
        if let JobEvent::Progress { job, .. } = event {
            let running = job
                .results()
                .iter()
                .filter(|r| *r.state() == TargetState::Running)
                .count();
            assert!(running <= 3, "{} targets running", running);
        }
    }
    assert_complete(finished_job(&events), &all(20));
    let peak = stats.peak.load(Ordering::SeqCst);
    assert!((1..=3).contains(&peak), "peak concurrency {}", peak);
    assert_eq!(20, stats.calls.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_slow_target_does_not_hold_back_the_queue() {
    let executor = ScriptedExecutor::default()
        .with("10.0.0.0", Behavior::Succeed(Duration::from_millis(300)));
    let stats = executor.stats.clone();
    let (mut orchestrator, mut events) = orchestrator(executor);
    orchestrator.set_max_concurrency(2).unwrap();

    let targets = targets(5);
    orchestrator
        .start(&targets, &all(5), FleetAction::run_command("true"))
        .unwrap();
    collect(&mut events).await;

    // The second slot keeps refilling while target 0 is still running.
    assert!(stats.position("end:4") < stats.position("end:0"));
    for i in 1..5 {
        assert!(stats.position(&format!("start:{}", i)) < stats.position("end:0"));
    }
}

#[tokio::test]
async fn test_cancel_immediately_after_start() {
    let executor = ScriptedExecutor::default();
    let stats = executor.stats.clone();
    let (mut orchestrator, mut events) = orchestrator(executor);
    orchestrator.set_max_concurrency(1).unwrap();

    let targets = targets(10);
    orchestrator
        .start(&targets, &all(10), FleetAction::run_command("true"))
        .unwrap();
    orchestrator.cancel();

    let events = collect(&mut events).await;
    let job = finished_job(&events);
    assert_complete(job, &all(10));
    let summary = job.summary();
    assert!(summary.canceled >= 9);
    assert!(summary.ok + summary.failed <= 1);
    assert!(stats.calls.load(Ordering::SeqCst) <= 1);
    for result in job.results() {
        if *result.state() == TargetState::Canceled {
            assert_eq!(Duration::ZERO, *result.duration());
            assert_eq!(Some(CANCELED_BEFORE_START), result.error().as_deref());
            assert!(result.stdout().is_empty());
        }
    }
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_cancel_lets_in_flight_target_finish() {
    let executor = ScriptedExecutor::default()
        .with("10.0.0.0", Behavior::Succeed(Duration::from_millis(200)));
    let stats = executor.stats.clone();
    let (mut orchestrator, mut events) = orchestrator(executor);
    orchestrator.set_max_concurrency(1).unwrap();

    let targets = targets(4);
    orchestrator
        .start(&targets, &all(4), FleetAction::run_command("true"))
        .unwrap();
    assert!(matches!(events.next().await, Some(JobEvent::Started(_))));
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.cancel();

    let job = events.finished().await.unwrap();
    assert_complete(&job, &all(4));
    assert_eq!(TargetState::Ok, *job.results()[0].state());
    for result in &job.results()[1..] {
        assert_eq!(TargetState::Canceled, *result.state());
    }
    assert_eq!(1, stats.calls.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cancel_when_idle_is_a_noop() {
    let (orchestrator, mut events) = orchestrator(ScriptedExecutor::default());
    orchestrator.cancel();

    let targets = targets(2);
    orchestrator
        .start(&targets, &all(2), FleetAction::run_command("true"))
        .unwrap();
    let job = events.finished().await.unwrap();
    assert!(job.summary().all_ok());
}

#[tokio::test]
async fn test_is_running_lifecycle() {
    let (orchestrator, mut events) = orchestrator(ScriptedExecutor::default());
    assert!(!orchestrator.is_running());

    let targets = targets(3);
    orchestrator
        .start(&targets, &all(3), FleetAction::run_command("true"))
        .unwrap();
    assert!(orchestrator.is_running());
    assert_eq!(
        Err(OrchestratorError::AlreadyRunning),
        orchestrator.start(&targets, &all(3), FleetAction::run_command("true"))
    );

    events.finished().await.unwrap();
    assert!(!orchestrator.is_running());

    // A second job can follow the first.
    let second = orchestrator
        .start(&targets, &[1], FleetAction::check_service("sshd"))
        .unwrap();
    assert!(orchestrator.is_running());
    let job = events.finished().await.unwrap();
    assert_eq!(&second, job.id());
    assert_eq!("Check service: sshd", job.title());
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_start_preconditions() {
    let (mut orchestrator, _events) = orchestrator(ScriptedExecutor::default());
    let targets = targets(3);
    let action = FleetAction::run_command("true");

    assert_eq!(
        Err(OrchestratorError::NoTargets),
        orchestrator.start(&targets, &[], action.clone())
    );
    assert_eq!(
        Err(OrchestratorError::TargetOutOfRange { index: 3, len: 3 }),
        orchestrator.start(&targets, &[0, 3], action.clone())
    );
    assert_eq!(
        Err(OrchestratorError::DuplicateTarget(1)),
        orchestrator.start(&targets, &[1, 2, 1], action.clone())
    );
    assert!(matches!(
        orchestrator.start(&targets, &[0], FleetAction::restart_service("a b")),
        Err(OrchestratorError::InvalidAction(_))
    ));
    assert_eq!(
        Err(OrchestratorError::InvalidConcurrency),
        orchestrator.set_max_concurrency(0)
    );
    assert_eq!(DEFAULT_MAX_CONCURRENCY, orchestrator.max_concurrency());
    assert!(!orchestrator.is_running());
}

#[test]
fn test_start_outside_runtime() {
    let (tx, _events) = events(1);
    let orchestrator = Orchestrator::new(ScriptedExecutor::default(), tx);
    assert_eq!(
        Err(OrchestratorError::NoRuntime),
        orchestrator.start(&targets(1), &[0], FleetAction::run_command("true"))
    );
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_command_timeout_is_passed_to_executor() {
    let executor = ScriptedExecutor::default();
    let stats = executor.stats.clone();
    let (mut orchestrator, mut events) = orchestrator(executor);
    let targets = targets(1);

    orchestrator.set_command_timeout(Duration::from_secs(7));
    orchestrator
        .start(&targets, &[0], FleetAction::run_command("true"))
        .unwrap();
    events.finished().await.unwrap();

    orchestrator.set_command_timeout(Duration::ZERO);
    assert_eq!(DEFAULT_COMMAND_TIMEOUT, orchestrator.command_timeout());
    orchestrator
        .start(&targets, &[0], FleetAction::run_command("true"))
        .unwrap();
    events.finished().await.unwrap();

    assert_eq!(
        vec![Duration::from_secs(7), Duration::from_secs(90)],
        *stats.timeouts.lock().unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn test_hung_executor_is_timed_out() {
    let executor = ScriptedExecutor::default().with("10.0.0.1", Behavior::Hang);
    let (mut orchestrator, mut events) = orchestrator(executor);
    orchestrator.set_command_timeout(Duration::from_secs(2));

    let targets = targets(3);
    orchestrator
        .start(&targets, &all(3), FleetAction::run_command("sleep infinity"))
        .unwrap();
    let job = events.finished().await.unwrap();

    assert_complete(&job, &all(3));
    let hung = &job.results()[1];
    assert_eq!(TargetState::Failed, *hung.state());
    assert_eq!(Some("timed out"), hung.error().as_deref());
    assert!(*hung.duration() >= Duration::from_secs(2));
    assert!(*hung.duration() <= Duration::from_secs(2) + EXECUTOR_GRACE + Duration::from_secs(1));
    assert_eq!(2, job.summary().ok);
}

#[tokio::test]
async fn test_panicking_executor_still_yields_a_result() {
    let executor = ScriptedExecutor::default().with("10.0.0.0", Behavior::Panic);
    let (orchestrator, mut events) = orchestrator(executor);
    let targets = targets(2);
    orchestrator
        .start(&targets, &all(2), FleetAction::run_command("true"))
        .unwrap();

    let job = events.finished().await.unwrap();
    assert_complete(&job, &all(2));
    assert_eq!(TargetState::Failed, *job.results()[0].state());
    assert!(job.results()[0]
        .error()
        .as_deref()
        .unwrap()
        .starts_with("executor panicked"));
    assert_eq!(TargetState::Ok, *job.results()[1].state());
}

#[tokio::test]
async fn test_non_terminal_result_is_repaired() {
    let executor = ScriptedExecutor::default().with("10.0.0.0", Behavior::Misreport);
    let (orchestrator, mut events) = orchestrator(executor);
    let targets = targets(1);
    orchestrator
        .start(&targets, &[0], FleetAction::run_command("true"))
        .unwrap();

    let job = events.finished().await.unwrap();
    assert_complete(&job, &[0]);
    assert_eq!(TargetState::Failed, *job.results()[0].state());
}

#[tokio::test]
async fn test_canceled_result_after_dispatch_is_repaired() {
    let executor = ScriptedExecutor::default().with("10.0.0.1", Behavior::ReportCanceled);
    let (orchestrator, mut events) = orchestrator(executor);
    let targets = targets(2);
    orchestrator
        .start(&targets, &all(2), FleetAction::run_command("true"))
        .unwrap();

    let job = events.finished().await.unwrap();
    assert_complete(&job, &all(2));
    assert_eq!(TargetState::Ok, *job.results()[0].state());
    assert_eq!(TargetState::Failed, *job.results()[1].state());
    assert_ne!(Some(CANCELED_BEFORE_START), job.results()[1].error().as_deref());
    assert_eq!(0, job.summary().canceled);
}

#[tokio::test]
async fn test_unbounded_command_timeout_still_finishes() {
    let executor = ScriptedExecutor::default();
    let stats = executor.stats.clone();
    let (mut orchestrator, mut events) = orchestrator(executor);
    orchestrator.set_command_timeout(Duration::MAX);
    let targets = targets(3);
    orchestrator
        .start(&targets, &all(3), FleetAction::run_command("true"))
        .unwrap();

    let job = tokio::time::timeout(Duration::from_secs(5), events.finished())
        .await
        .unwrap()
        .unwrap();
    assert_complete(&job, &all(3));
    assert!(job.summary().all_ok());
    assert_eq!(vec![Duration::MAX; 3], *stats.timeouts.lock().unwrap());
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn test_finished_is_queued_before_running_clears() {
    let (tx, mut events) = events(1);
    let orchestrator = Orchestrator::new(ScriptedExecutor::default(), tx);
    let targets = targets(1);
    let first = orchestrator
        .start(&targets, &[0], FleetAction::run_command("true"))
        .unwrap();
    assert!(matches!(events.next().await, Some(JobEvent::Started(_))));

    // `Progress` takes the only slot, so `Finished` cannot be queued yet.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.is_running());
    assert_eq!(
        Err(OrchestratorError::AlreadyRunning),
        orchestrator.start(&targets, &[0], FleetAction::run_command("true"))
    );

    assert!(matches!(events.next().await, Some(JobEvent::Progress { .. })));
    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let second = orchestrator
        .start(&targets, &[0], FleetAction::run_command("true"))
        .unwrap();

    match events.next().await {
        Some(JobEvent::Finished(job)) => assert_eq!(&first, job.id()),
        other => panic!("expected the first job's Finished, got {:?}", other),
    }
    assert!(matches!(events.next().await, Some(JobEvent::Started(_))));
    let job = events.finished().await.unwrap();
    assert_eq!(&second, job.id());
}

#[tokio::test]
async fn test_dropped_receiver_does_not_stall_job() {
    let executor = ScriptedExecutor::default();
    let stats = executor.stats.clone();
    let (orchestrator, events) = orchestrator(executor);
    drop(events);

    let targets = targets(4);
    orchestrator
        .start(&targets, &all(4), FleetAction::run_command("true"))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(4, stats.calls.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_local_and_unreachable_targets() {
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let targets = vec![
        TargetDescriptor::local("local-a"),
        TargetDescriptor::new("gone", "root", "127.0.0.1")
            .with_port(closed_port)
            .with_auth(AuthRef::Password {
                password: "unused".into(),
            }),
        TargetDescriptor::local("local-b"),
    ];
    let (tx, mut events) = events(16);
    let mut orchestrator = Orchestrator::new(RemoteTargetExecutor::new(FleetConnector::default()), tx);
    orchestrator.set_command_timeout(Duration::from_secs(10));
    orchestrator
        .start(&targets, &all(3), FleetAction::run_command("echo ok"))
        .unwrap();

    let job = events.finished().await.unwrap();
    assert_complete(&job, &all(3));
    assert_eq!(TargetState::Ok, *job.results()[0].state());
    assert_eq!("ok\n", job.results()[0].stdout());
    assert_eq!(TargetState::Failed, *job.results()[1].state());
    assert!(job.results()[1]
        .error()
        .as_deref()
        .unwrap()
        .starts_with("connect failed: "));
    assert_eq!(TargetState::Ok, *job.results()[2].state());
}
