mod support;

use std::sync::Arc;
use std::time::Duration;

use rse_common::{AttemptId, Result, RseError, ShuffleConfig};
use rse_reduce::{CompletionEvent, CompletionStatus, ReduceCopier, ShuffleCoordinator, SortedInput};
use rse_shuffle::{MergedStream, Record, ShuffleTransport};
use support::{files_in, is_sorted, records_for, FlakyTransport, Harness, BASE};

const DEADLINE: Duration = Duration::from_secs(30);

async fn run_copier(
    cfg: ShuffleConfig,
    transport: Arc<dyn ShuffleTransport>,
    coordinator: Arc<dyn ShuffleCoordinator>,
) -> Result<(MergedStream, rse_reduce::ShuffleReport)> {
    let copier = ReduceCopier::new(cfg, transport, coordinator).expect("valid config");
    tokio::time::timeout(DEADLINE, copier.fetch_outputs())
        .await
        .expect("shuffle finished in time")
}

fn drain(stream: MergedStream) -> Vec<Record> {
    stream.collect::<Result<Vec<_>>>().expect("final stream")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_host_is_penalized_with_doubling_backoff() {
    let h = Harness::new("penalty");
    let mut expected = 0;
    for (task, host) in [(0, "h1"), (1, "h1"), (2, "h2"), (3, "h2")] {
        let records = records_for(task, 50, 16);
        expected += records.len();
        let attempt = h.producer(task, 0, &records);
        h.succeeded(attempt, host).await;
    }

    let transport = Arc::new(FlakyTransport::new(h.transport()).time_out("h2", 2));
    let (stream, report) = run_copier(h.config(4), transport.clone(), Arc::new(h.coordinator.clone()))
        .await
        .expect("shuffle");

    assert_eq!(report.copied, 4);
    assert_eq!(report.total_failures, 2);
    let h2 = report
        .backoffs
        .iter()
        .filter(|b| b.host == "h2")
        .map(|b| (b.failures, b.delay))
        .collect::<Vec<_>>();
    assert_eq!(h2, vec![(1, BASE), (2, BASE * 2)]);
    assert!(report.escalations.is_empty());
    assert!(transport.opens() >= 6);

    let out = drain(stream);
    assert_eq!(out.len(), expected);
    assert!(is_sorted(&out));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_budget_spills_large_outputs_and_merges_memory() {
    let h = Harness::new("placement");
    let mut cfg = h.config(3);
    cfg.memory_budget_bytes = 1000;
    cfg.max_in_mem_outputs = 1;
    cfg.io_sort_factor = 2;

    let small = records_for(0, 3, 4);
    let a = h.producer(0, 0, &small);
    h.succeeded(a, "h-mem").await;
    let mut expected = small.len();
    for (task, host) in [(1, "h-disk1"), (2, "h-disk2")] {
        let records = records_for(task, 20, 24);
        expected += records.len();
        let attempt = h.producer(task, 0, &records);
        h.succeeded(attempt, host).await;
    }

    // Keep the large fetches behind the small one so its merge runs first.
    let transport = Arc::new(
        FlakyTransport::new(h.transport())
            .delay("h-disk1", Duration::from_millis(150))
            .delay("h-disk2", Duration::from_millis(150)),
    );
    let spill = cfg.attempt_spill_dir();
    let (stream, report) = run_copier(cfg, transport, Arc::new(h.coordinator.clone()))
        .await
        .expect("shuffle");

    assert_eq!(report.copied, 3);
    assert_eq!(report.fetched_in_memory, 1);
    assert_eq!(report.fetched_to_disk, 2);
    assert_eq!(report.in_memory_merges, 1);
    assert!(report.max_disk_segments <= 3);

    let out = drain(stream);
    assert_eq!(out.len(), expected);
    assert!(is_sorted(&out));
    assert_eq!(files_in(&spill), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_disk_outputs_are_compacted_within_the_admission_cap() {
    let h = Harness::new("compaction");
    let producers = 10;
    let mut cfg = h.config(producers);
    // Every output is larger than the whole budget, so all of them spill.
    cfg.memory_budget_bytes = 256;
    cfg.io_sort_factor = 2;
    cfg.num_copiers = 4;
    let cap = 2 * cfg.io_sort_factor - 1;

    let mut expected = 0;
    for task in 0..producers as u64 {
        let records = records_for(task, 20, 24);
        expected += records.len();
        let attempt = h.producer(task, 0, &records);
        h.succeeded(attempt, &format!("h{}", task % 5)).await;
    }

    let spill = cfg.attempt_spill_dir();
    let (stream, report) = run_copier(cfg, Arc::new(h.transport()), Arc::new(h.coordinator.clone()))
        .await
        .expect("shuffle");

    assert_eq!(report.copied, producers);
    assert_eq!(report.fetched_to_disk, producers as u64);
    assert_eq!(report.fetched_in_memory, 0);
    assert!(report.disk_merges > 0, "{report:?}");
    assert!(report.max_disk_segments <= cap, "{report:?}");

    let out = drain(stream);
    assert_eq!(out.len(), expected);
    assert!(is_sorted(&out));
    assert_eq!(files_in(&spill), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_producers_abort_with_one_fatal_report() {
    let h = Harness::new("abort");
    let mut cfg = h.config(4);
    cfg.max_backoff = cfg.backoff_base;
    cfg.num_copiers = 4;
    // No producer output was written, so every fetch fails.
    for (task, host) in [(0, "h1"), (1, "h2"), (2, "h3"), (3, "h4")] {
        h.succeeded(AttemptId::new(task, 0), host).await;
    }

    let spill = cfg.attempt_spill_dir();
    let err = run_copier(cfg, Arc::new(h.transport()), Arc::new(h.coordinator.clone()))
        .await
        .expect_err("shuffle must give up");
    assert!(matches!(err, RseError::ShuffleFailed(_)), "got {err:?}");

    let log = h.log.lock().await;
    assert_eq!(log.fatal_errors().len(), 1);
    assert!(log.fetch_failures().len() >= 4);
    assert_eq!(files_in(&spill), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicates_obsolete_and_tip_failed_producers_are_handled() {
    let h = Harness::new("events");
    let r0 = records_for(0, 30, 8);
    let r1 = records_for(1, 30, 8);
    let r2 = records_for(2, 30, 8);

    let a0 = h.producer(0, 0, &r0);
    h.succeeded(a0, "h1").await;
    // Speculative attempts of task 1 on two hosts.
    let a1 = h.producer(1, 0, &r1);
    let a1_spec = h.producer(1, 1, &r1);
    h.succeeded(a1, "h1").await;
    h.succeeded(a1_spec, "h2").await;
    // Task 2's first attempt is lost before it can be fetched.
    h.succeeded(AttemptId::new(2, 0), "h3").await;
    h.publish(CompletionEvent::with_status(AttemptId::new(2, 0), CompletionStatus::Failed))
        .await;
    let a2 = h.producer(2, 1, &r2);
    h.succeeded(a2, "h2").await;
    h.publish(CompletionEvent::with_status(AttemptId::new(3, 0), CompletionStatus::TipFailed))
        .await;

    let (stream, report) = run_copier(h.config(4), Arc::new(h.transport()), Arc::new(h.coordinator.clone()))
        .await
        .expect("shuffle");
    assert_eq!(report.copied, 4);
    assert_eq!(report.total_failures, 0);

    let out = drain(stream);
    assert_eq!(out.len(), r0.len() + r1.len() + r2.len());
    assert!(is_sorted(&out));
    assert!(h.log.lock().await.fetch_failures().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coordinator_reset_replaces_known_locations() {
    let h = Harness::new("reset");
    let r0 = records_for(0, 10, 8);
    let r1 = records_for(1, 10, 8);
    let a1 = h.producer(1, 0, &r1);
    // Attempt (0, 0) never wrote output; after the reset (0, 1) replaces it.
    h.succeeded(AttemptId::new(0, 0), "ghost").await;
    h.succeeded(a1, "h1").await;

    let copier = ReduceCopier::new(h.config(2), Arc::new(h.transport()), Arc::new(h.coordinator.clone()))
        .expect("valid config");
    let run = tokio::spawn(async move { copier.fetch_outputs().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let a0 = h.producer(0, 1, &r0);
    h.log.lock().await.reset(vec![
        CompletionEvent::succeeded(a0, "h1", "", Duration::ZERO),
        CompletionEvent::succeeded(a1, "h1", "", Duration::ZERO),
    ]);

    let (stream, report) = tokio::time::timeout(DEADLINE, run)
        .await
        .expect("shuffle finished in time")
        .expect("join")
        .expect("shuffle");
    assert_eq!(report.copied, 2);
    let out = drain(stream);
    assert_eq!(out.len(), r0.len() + r1.len());
    assert!(is_sorted(&out));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn copier_works_through_the_sorted_input_boundary() {
    let h = Harness::new("sorted_input");
    let r0 = records_for(0, 5, 8);
    let a0 = h.producer(0, 0, &r0);
    h.succeeded(a0, "h1").await;

    let copier = ReduceCopier::new(h.config(1), Arc::new(h.transport()), Arc::new(h.coordinator.clone()))
        .expect("valid config");
    let stream = tokio::time::timeout(DEADLINE, copier.into_sorted_stream())
        .await
        .expect("in time")
        .expect("shuffle");
    assert_eq!(drain(stream), r0);
}
