//! Execution cycle behaviour: ordering, exclusion, retries, degradation.

mod support;

use std::sync::Arc;
use std::time::Duration;

use ntest::timeout;

use lifecycle::execution::{ExecutionConfig, ExecutionEngine, RetryPolicy};
use lifecycle::testing::{PolicyBuilder, ScriptedDriver, TargetBuilder};
use lifecycle::{
    ActionType, AlwaysOpen, DriverError, ExecutionErrorKind, ExecutionOutcome, LifecycleMetrics,
    LifecycleService, LogQuery, QueueFilter, QueueStatus, SkipReason, TargetId,
};
use support::{MB, config, minutes, now, register, service};

#[tokio::test]
async fn test_compression_end_to_end() {
    let driver = Arc::new(ScriptedDriver::new().with_compression_ratio(0.16));
    let service = service(&config().build(), driver.clone());
    let target = TargetBuilder::new("sales", "orders")
        .subobject("p2024_01")
        .size(500 * MB)
        .aged_days(120, now())
        .build();
    service.import_targets(vec![target.clone()]).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("compress-90d", "sales")
            .compress("HIGH")
            .older_than_days(90)
            .build(),
    )
    .await;

    service.evaluate_at(now()).await.unwrap();
    let report = service.execute_at(now(), None).await.unwrap();

    assert_eq!(report.dispatched, 1);
    assert_eq!(report.succeeded, 1);
    let log = report.entry_for(&target.id()).unwrap();
    assert_eq!(log.outcome, ExecutionOutcome::Success);
    assert_eq!(log.before_size, Some(500 * MB));
    assert_eq!(log.after_size, Some(80 * MB));
    assert_eq!(log.compression_ratio(), Some(6.25));

    let updated = service.store().get_target(&target.id()).await.unwrap().unwrap();
    assert_eq!(updated.compression_profile, "HIGH");
    assert_eq!(updated.size_bytes, 80 * MB);

    let entry = service.explain("compress-90d", &target.id()).await.unwrap();
    assert_eq!(entry.status, QueueStatus::Done);
    assert_eq!(entry.attempts, 1);

    assert_eq!(service.metrics().bytes_reclaimed(), 420 * MB);
    let persisted = service.execution_log(&LogQuery::default()).await.unwrap();
    assert_eq!(persisted.len(), 1);
}

#[tokio::test]
async fn test_priority_order_and_target_exclusion() {
    let driver = Arc::new(ScriptedDriver::new());
    let service = service(&config().build(), driver.clone());
    let target = TargetBuilder::new("sales", "orders")
        .aged_days(200, now())
        .build();
    service.import_targets(vec![target.clone()]).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("tier-archive", "sales")
            .move_to("archive")
            .older_than_days(180)
            .priority(200)
            .build(),
    )
    .await;
    register(
        &service,
        PolicyBuilder::new("compress-90d", "sales")
            .older_than_days(90)
            .priority(100)
            .build(),
    )
    .await;
    service.evaluate_at(now()).await.unwrap();

    let pending = service
        .queue_entries(&QueueFilter::dispatchable())
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].priority, 100);

    let first = service.execute_at(now(), None).await.unwrap();
    assert_eq!(first.dispatched, 1);
    assert_eq!(first.skipped_for(SkipReason::TargetBusy), 1);
    let moved = service.explain("tier-archive", &target.id()).await.unwrap();
    assert_eq!(moved.status, QueueStatus::Pending);
    assert!(moved.eligible);

    let second = service.execute_at(now() + minutes(5), None).await.unwrap();
    assert_eq!(second.dispatched, 1);
    assert_eq!(
        service.explain("tier-archive", &target.id()).await.unwrap().status,
        QueueStatus::Done
    );

    let actions: Vec<ActionType> = driver.calls().await.into_iter().map(|c| c.action).collect();
    assert_eq!(actions, vec![ActionType::Compress, ActionType::Move]);

    let updated = service.store().get_target(&target.id()).await.unwrap().unwrap();
    assert_eq!(updated.compression_profile, "HIGH");
    assert_eq!(updated.tier, "archive");
}

#[tokio::test]
async fn test_transient_failures_retry_until_max_attempts() {
    let target = TargetBuilder::new("sales", "orders")
        .aged_days(120, now())
        .build();
    let driver = Arc::new(ScriptedDriver::new().failing(
        &target.id(),
        vec![
            DriverError::busy("object locked"),
            DriverError::busy("object locked"),
            DriverError::busy("object locked"),
        ],
    ));
    let config = config().with_max_attempts(3).without_retry_backoff().build();
    let service = service(&config, driver.clone());
    service.import_targets(vec![target.clone()]).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("compress-90d", "sales")
            .older_than_days(90)
            .build(),
    )
    .await;
    service.evaluate_at(now()).await.unwrap();

    for attempt in 1..=2 {
        let report = service
            .execute_at(now() + minutes(i64::from(attempt)), None)
            .await
            .unwrap();
        assert_eq!(report.retried, 1);
        let entry = service.explain("compress-90d", &target.id()).await.unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, attempt);
        assert!(entry.last_error.as_deref().unwrap().contains("object locked"));
    }

    let report = service.execute_at(now() + minutes(3), None).await.unwrap();
    assert_eq!(report.failed, 1);
    let entry = service.explain("compress-90d", &target.id()).await.unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.attempts, 3);

    // Terminal entries are not dispatched again.
    let report = service.execute_at(now() + minutes(4), None).await.unwrap();
    assert_eq!(report.candidates, 0);
    assert_eq!(driver.calls_for(&target.id()).await, 3);

    let outcomes: Vec<ExecutionOutcome> = service
        .execution_log(&LogQuery::default())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ExecutionOutcome::Retrying,
            ExecutionOutcome::Retrying,
            ExecutionOutcome::Failed
        ]
    );
    assert_eq!(service.recent_failure_count(now()).await.unwrap(), 3);
}

#[tokio::test]
async fn test_retry_waits_for_backoff() {
    let target = TargetBuilder::new("sales", "orders")
        .aged_days(120, now())
        .build();
    let driver = Arc::new(
        ScriptedDriver::new().failing(&target.id(), vec![DriverError::insufficient_space("full")]),
    );
    // Default backoff: one minute before the first retry.
    let service = service(&config().build(), driver.clone());
    service.import_targets(vec![target.clone()]).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("compress-90d", "sales")
            .older_than_days(90)
            .build(),
    )
    .await;
    service.evaluate_at(now()).await.unwrap();

    let report = service.execute_at(now(), None).await.unwrap();
    assert_eq!(report.retried, 1);
    let entry = service.explain("compress-90d", &target.id()).await.unwrap();
    assert_eq!(entry.next_attempt_at, Some(now() + minutes(1)));

    let early = service
        .execute_at(now() + chrono::Duration::seconds(30), None)
        .await
        .unwrap();
    assert_eq!(early.candidates, 0);

    let due = service.execute_at(now() + minutes(2), None).await.unwrap();
    assert_eq!(due.succeeded, 1);
    assert_eq!(
        service.explain("compress-90d", &target.id()).await.unwrap().status,
        QueueStatus::Done
    );
}

#[tokio::test]
async fn test_drop_with_failed_statistics_refresh_is_warning() {
    let target = TargetBuilder::new("sales", "orders")
        .subobject("p2019_01")
        .aged_days(2000, now())
        .build();
    let driver = Arc::new(ScriptedDriver::new().failing_statistics(&target.id()));
    let service = service(&config().build(), driver);
    service.import_targets(vec![target.clone()]).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("purge-5y", "sales")
            .purge()
            .refresh_statistics()
            .older_than_months(60)
            .build(),
    )
    .await;
    service.evaluate_at(now()).await.unwrap();

    let report = service.execute_at(now(), None).await.unwrap();

    assert_eq!(report.warnings, 1);
    let log = report.entry_for(&target.id()).unwrap();
    assert_eq!(log.outcome, ExecutionOutcome::Warning);
    assert_eq!(log.after_size, Some(0));
    assert!(log.warnings[0].starts_with("statistics refresh failed"));

    let entry = service.explain("purge-5y", &target.id()).await.unwrap();
    assert_eq!(entry.status, QueueStatus::Done);
    assert!(service.store().get_target(&target.id()).await.unwrap().is_none());
    assert_eq!(service.metrics().operations_with_warnings(), 1);
}

#[tokio::test]
async fn test_fatal_failure_does_not_abort_batch() {
    let targets: Vec<_> = (0..5)
        .map(|i| {
            TargetBuilder::new("sales", "orders")
                .subobject(&format!("p{i}"))
                .aged_days(120, now())
                .build()
        })
        .collect();
    let driver = Arc::new(ScriptedDriver::new().failing(
        &targets[2].id(),
        vec![DriverError::permission_denied("no privilege on tablespace")],
    ));
    let service = service(&config().build(), driver);
    service.import_targets(targets.clone()).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("compress-90d", "sales")
            .older_than_days(90)
            .build(),
    )
    .await;
    service.evaluate_at(now()).await.unwrap();

    let report = service.execute_at(now(), None).await.unwrap();

    assert_eq!(report.dispatched, 5);
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed, 1);
    let failed = report.entry_for(&targets[2].id()).unwrap();
    assert_eq!(failed.error_kind, Some(ExecutionErrorKind::PermissionDenied));

    for status in [QueueStatus::Pending, QueueStatus::Running] {
        let open = service
            .queue_entries(&QueueFilter::with_status(status))
            .await
            .unwrap();
        assert!(open.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(10000)]
async fn test_concurrency_cap_is_respected() {
    let driver = Arc::new(ScriptedDriver::new().with_latency(Duration::from_millis(50)));
    let config = config().with_max_concurrent(3).build();
    let service = service(&config, driver.clone());
    let targets: Vec<_> = (0..10)
        .map(|i| {
            TargetBuilder::new("sales", "events")
                .subobject(&format!("p{i:02}"))
                .aged_days(120, now())
                .build()
        })
        .collect();
    service.import_targets(targets).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("compress-90d", "sales")
            .older_than_days(90)
            .build(),
    )
    .await;
    service.evaluate_at(now()).await.unwrap();

    let report = service.execute_at(now(), None).await.unwrap();

    assert_eq!(report.succeeded, 10);
    assert!(driver.peak_concurrency() <= 3);
    assert!(driver.peak_concurrency() > 1);
    assert!(service.metrics().peak_in_flight() <= 3);
    assert_eq!(service.metrics().in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(10000)]
async fn test_one_action_per_target_at_a_time() {
    let driver = Arc::new(ScriptedDriver::new().with_latency(Duration::from_millis(20)));
    let service = service(&config().build(), driver.clone());
    let target = TargetBuilder::new("sales", "orders")
        .aged_days(400, now())
        .build();
    service.import_targets(vec![target.clone()]).await.unwrap();
    for (name, builder) in [
        ("compress-90d", PolicyBuilder::new("compress-90d", "sales").priority(100)),
        ("tier-archive", PolicyBuilder::new("tier-archive", "sales").move_to("archive").priority(200)),
        ("freeze-1y", PolicyBuilder::new("freeze-1y", "sales").mark_read_only().priority(300)),
    ] {
        let policy = register(&service, builder.older_than_days(90).build()).await;
        assert_eq!(policy.name(), name);
    }
    service.evaluate_at(now()).await.unwrap();

    for cycle in 0..3 {
        let report = service
            .execute_at(now() + minutes(cycle), None)
            .await
            .unwrap();
        assert_eq!(report.dispatched, 1);
    }

    assert!(!driver.target_overlap_detected());
    let updated = service.store().get_target(&target.id()).await.unwrap().unwrap();
    assert!(updated.read_only);
    assert_eq!(updated.tier, "archive");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(10000)]
async fn test_concurrent_executors_never_run_an_entry_twice() {
    let driver = Arc::new(ScriptedDriver::new().with_latency(Duration::from_millis(10)));
    let service = service(&config().build(), driver.clone());
    let targets: Vec<_> = (0..6)
        .map(|i| {
            TargetBuilder::new("sales", "events")
                .subobject(&format!("p{i}"))
                .aged_days(120, now())
                .build()
        })
        .collect();
    service.import_targets(targets).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("compress-90d", "sales")
            .older_than_days(90)
            .build(),
    )
    .await;
    service.evaluate_at(now()).await.unwrap();

    let engine = |service: &LifecycleService| {
        ExecutionEngine::new(
            service.store().clone(),
            driver.clone(),
            Arc::new(AlwaysOpen),
            ExecutionConfig {
                max_concurrent: 4,
                max_operations_per_cycle: 100,
                retry: RetryPolicy::default(),
            },
            LifecycleMetrics::new(),
        )
    };
    let first = engine(&service);
    let second = engine(&service);
    let (a, b) = tokio::join!(first.run_cycle_at(now(), None), second.run_cycle_at(now(), None));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.dispatched + b.dispatched, 6);
    assert_eq!(driver.calls().await.len(), 6);
    let done = service
        .queue_entries(&QueueFilter::with_status(QueueStatus::Done))
        .await
        .unwrap();
    assert_eq!(done.len(), 6);
    assert!(done.iter().all(|e| e.attempts == 1));
}

#[tokio::test]
async fn test_maintenance_window_gates_dispatch() {
    let config = config().with_window(22, 4).build();
    let driver = Arc::new(ScriptedDriver::new());
    let service = LifecycleService::from_config(&config, driver.clone())
        .await
        .unwrap();
    let target = TargetBuilder::new("sales", "orders")
        .aged_days(120, now())
        .build();
    service.import_targets(vec![target.clone()]).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("compress-90d", "sales")
            .older_than_days(90)
            .build(),
    )
    .await;
    service.evaluate_at(now()).await.unwrap();

    let midday = now() + chrono::Duration::hours(10);
    let closed = service.execute_at(midday, None).await.unwrap();
    assert!(!closed.window_open);
    assert_eq!(closed.dispatched, 0);
    assert!(driver.calls().await.is_empty());

    // 02:00 UTC lies inside the 22:00-04:00 window.
    let open = service.execute_at(now(), None).await.unwrap();
    assert!(open.window_open);
    assert_eq!(open.succeeded, 1);
}

#[tokio::test]
async fn test_cycle_limit_bounds_dispatch() {
    let driver = Arc::new(ScriptedDriver::new());
    let service = service(&config().build(), driver);
    let targets: Vec<_> = (0..4)
        .map(|i| {
            TargetBuilder::new("sales", "events")
                .subobject(&format!("p{i}"))
                .aged_days(120, now())
                .build()
        })
        .collect();
    service.import_targets(targets).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("compress-90d", "sales")
            .older_than_days(90)
            .build(),
    )
    .await;
    service.evaluate_at(now()).await.unwrap();

    let report = service.execute_at(now(), Some(3)).await.unwrap();
    assert_eq!(report.dispatched, 3);
    assert_eq!(report.skipped_for(SkipReason::CycleLimit), 1);

    let remaining = service
        .queue_entries(&QueueFilter::dispatchable())
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].target_id, TargetId::from("sales.events.p3"));
}

#[tokio::test]
async fn test_dropped_target_withdraws_lower_priority_siblings() {
    let driver = Arc::new(ScriptedDriver::new());
    let service = service(&config().build(), driver.clone());
    let target = TargetBuilder::new("sales", "orders")
        .subobject("p2019_01")
        .aged_days(2000, now())
        .build();
    service.import_targets(vec![target.clone()]).await.unwrap();
    register(
        &service,
        PolicyBuilder::new("purge-5y", "sales")
            .purge()
            .older_than_months(60)
            .priority(100)
            .build(),
    )
    .await;
    register(
        &service,
        PolicyBuilder::new("compress-90d", "sales")
            .older_than_days(90)
            .priority(200)
            .build(),
    )
    .await;
    service.evaluate_at(now()).await.unwrap();

    let first = service.execute_at(now(), None).await.unwrap();
    assert_eq!(first.succeeded, 1);
    assert_eq!(first.skipped_for(SkipReason::TargetBusy), 1);

    let sibling = service.explain("compress-90d", &target.id()).await.unwrap();
    assert_eq!(sibling.status, QueueStatus::Pending);
    assert!(!sibling.eligible);
    assert_eq!(sibling.reason, "target dropped");

    service.evaluate_at(now() + minutes(1)).await.unwrap();
    let second = service.execute_at(now() + minutes(5), None).await.unwrap();

    assert_eq!(second.dispatched, 0);
    assert_eq!(second.failed, 0);
    assert_eq!(driver.calls().await.len(), 1);
    assert_eq!(service.recent_failure_count(now()).await.unwrap(), 0);
    assert_eq!(
        service.explain("compress-90d", &target.id()).await.unwrap().reason,
        "target dropped"
    );
}
