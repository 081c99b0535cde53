use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::common::{Log, bus_with_recording_sink, entries, new_log, recorder};
use crate::event::middleware::{Middleware, MiddlewareContext, Stage, StageCallback};
use crate::event::{EventBus, EventData, RegisterParams, sync_handler, sync_middleware};

fn stage_recorder(log: &Log, label: &str) -> StageCallback {
    let log = Arc::clone(log);
    let label = label.to_string();
    sync_middleware(move |_ctx: &MiddlewareContext| {
        log.lock().unwrap().push(label.clone());
        Ok(())
    })
}

fn recording_middleware(log: &Log, prefix: &str) -> Middleware {
    Stage::ALL.into_iter().fold(Middleware::new(), |middleware, stage| {
        middleware.with_stage(stage, stage_recorder(log, &format!("{prefix}:{stage}")))
    })
}

fn failing(message: &'static str) -> StageCallback {
    sync_middleware(move |_ctx: &MiddlewareContext| Err(message.into()))
}

#[tokio::test]
async fn test_every_stage_runs_once_per_source() {
    let bus = EventBus::new();
    let counts: Arc<[AtomicUsize; 3]> = Arc::new(Default::default());
    let counting = || {
        Stage::ALL.into_iter().fold(Middleware::new(), |middleware, stage| {
            let counts = Arc::clone(&counts);
            middleware.with_stage(
                stage,
                sync_middleware(move |_ctx: &MiddlewareContext| {
                    counts[stage as usize].fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
        })
    };

    let log = new_log();
    bus.use_middleware(counting());
    bus.on(RegisterParams::new("audited", recorder(&log, "handler"))
        .need_await(true)
        .middleware(counting()))
        .unwrap();

    bus.emit("audited", None).await.unwrap();

    assert_eq!(entries(&log), vec!["handler"]);
    for stage in Stage::ALL {
        assert_eq!(counts[stage as usize].load(Ordering::SeqCst), 2, "{stage} stage count");
    }
}

#[tokio::test]
async fn test_stage_order_around_the_handler() {
    let bus = EventBus::new();
    let log = new_log();
    bus.use_middleware(recording_middleware(&log, "global"));
    bus.on(RegisterParams::new("ordered", recorder(&log, "handler"))
        .need_await(true)
        .middleware(recording_middleware(&log, "own")))
        .unwrap();

    bus.emit("ordered", None).await.unwrap();

    assert_eq!(
        entries(&log),
        vec![
            "own:before",
            "global:before",
            "own:processing",
            "global:processing",
            "handler",
            "own:after",
            "global:after",
        ]
    );
}

#[tokio::test]
async fn test_global_middleware_wraps_every_handler() {
    let bus = EventBus::new();
    let log = new_log();
    bus.use_middleware(Middleware::new().with_before(stage_recorder(&log, "seen")));
    bus.on(RegisterParams::new("a", recorder(&log, "a")).need_await(true)).unwrap();
    bus.on(RegisterParams::new("b", recorder(&log, "b")).need_await(true)).unwrap();

    bus.emit("a", None).await.unwrap();
    bus.emit("b", None).await.unwrap();

    assert_eq!(entries(&log), vec!["seen", "a", "seen", "b"]);
}

#[tokio::test]
async fn test_installed_in_registration_order() {
    let bus = EventBus::new();
    let log = new_log();
    bus.use_middleware(Middleware::new().with_after(stage_recorder(&log, "first")));
    bus.use_middleware(Middleware::new().with_after(stage_recorder(&log, "second")));
    bus.on(RegisterParams::new("evt", recorder(&log, "handler")).need_await(true)).unwrap();

    bus.emit("evt", None).await.unwrap();
    assert_eq!(entries(&log), vec!["handler", "first", "second"]);
}

#[tokio::test]
async fn test_cleanup_stops_future_invocations() {
    let bus = EventBus::new();
    let log = new_log();
    let registration = bus.use_middleware(recording_middleware(&log, "global"));
    bus.on(RegisterParams::new("evt", recorder(&log, "handler")).need_await(true)).unwrap();

    assert_eq!(registration.stages(), Stage::ALL.to_vec());
    assert_eq!(bus.engine().global_middleware_count(Stage::Processing), 1);

    registration.remove();
    registration.remove();
    assert!(registration.stages().is_empty());
    assert_eq!(bus.engine().global_middleware_count(Stage::Processing), 0);

    bus.emit("evt", None).await.unwrap();
    assert_eq!(entries(&log), vec!["handler"]);
}

#[tokio::test]
async fn test_cleanup_leaves_finished_emissions_untouched() {
    let bus = EventBus::new();
    let log = new_log();
    let registration = bus.use_middleware(recording_middleware(&log, "global"));
    bus.on(RegisterParams::new("evt", recorder(&log, "handler")).need_await(true)).unwrap();

    bus.emit("evt", None).await.unwrap();
    let first = vec!["global:before", "global:processing", "handler", "global:after"];
    assert_eq!(entries(&log), first);

    registration.remove();
    bus.emit("evt", None).await.unwrap();

    let mut expected = first.clone();
    expected.push("handler");
    assert_eq!(entries(&log), expected);
}

#[tokio::test]
async fn test_cleanup_mid_flight_keeps_stages_already_run() {
    let bus = EventBus::new();
    let log = new_log();
    let registration = bus.use_middleware(recording_middleware(&log, "global"));
    let log_in = Arc::clone(&log);
    bus.on(RegisterParams::new(
        "evt",
        sync_handler(move |_data: &EventData| {
            registration.remove();
            log_in.lock().unwrap().push("handler".to_string());
            Ok(())
        }),
    )
    .need_await(true))
    .unwrap();

    bus.emit("evt", None).await.unwrap();
    assert_eq!(entries(&log), vec!["global:before", "global:processing", "handler"]);

    bus.emit("evt", None).await.unwrap();
    assert_eq!(entries(&log), vec!["global:before", "global:processing", "handler", "handler"]);
    assert_eq!(bus.engine().global_middleware_count(Stage::After), 0);
}

#[tokio::test]
async fn test_cleanup_only_removes_its_own_callbacks() {
    let bus = EventBus::new();
    let log = new_log();
    let shared = stage_recorder(&log, "shared");

    let first = bus.use_middleware(Middleware::new().with_before(Arc::clone(&shared)));
    let _second = bus.use_middleware(Middleware::new().with_before(Arc::clone(&shared)));
    bus.on(RegisterParams::new("evt", recorder(&log, "handler")).need_await(true)).unwrap();

    bus.emit("evt", None).await.unwrap();
    assert_eq!(entries(&log), vec!["shared", "shared", "handler"]);

    first.remove();
    bus.emit("evt", None).await.unwrap();
    assert_eq!(entries(&log), vec!["shared", "shared", "handler", "shared", "handler"]);
}

#[tokio::test]
async fn test_partial_middleware_only_installs_given_stages() {
    let bus = EventBus::new();
    let log = new_log();
    let registration = bus.use_middleware(Middleware::new().with_before(stage_recorder(&log, "before")));

    assert_eq!(registration.stages(), vec![Stage::Before]);
    assert_eq!(bus.engine().global_middleware_count(Stage::Before), 1);
    assert_eq!(bus.engine().global_middleware_count(Stage::After), 0);
}

#[tokio::test]
async fn test_middleware_failure_is_reported_and_handler_still_runs() {
    let (bus, sink) = bus_with_recording_sink();
    let log = new_log();
    bus.use_middleware(Middleware::new().with_processing(failing("global refused")));
    let subscription = bus
        .on(RegisterParams::new("guarded", recorder(&log, "handler"))
            .need_await(true)
            .middleware(Middleware::new().with_before(failing("own refused"))))
        .unwrap();

    bus.emit("guarded", None).await.unwrap();

    assert_eq!(entries(&log), vec!["handler"]);
    let failures = sink.failures();
    assert_eq!(failures.len(), 2);

    assert_eq!(failures[0].origin, "middleware:before");
    assert_eq!(failures[0].event, "guarded");
    assert_eq!(failures[0].handler_id, Some(subscription.id()));
    assert_eq!(failures[0].message, "Callback returned an error: own refused");

    assert_eq!(failures[1].origin, "global:processing");
    assert_eq!(failures[1].message, "Callback returned an error: global refused");
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_the_queue() {
    let (bus, sink) = bus_with_recording_sink();
    let log = new_log();
    bus.on(RegisterParams::new(
        "fragile",
        sync_handler(|_data: &EventData| panic!("kaboom")),
    )
    .need_await(true)
    .priority(10))
    .unwrap();
    bus.on(RegisterParams::new("fragile", recorder(&log, "survivor")).need_await(true))
        .unwrap();

    bus.emit("fragile", None).await.unwrap();

    assert_eq!(entries(&log), vec!["survivor"]);
    let failures = sink.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].origin, "handler");
    assert_eq!(failures[0].message, "Callback panicked: kaboom");
}

#[tokio::test]
async fn test_handler_error_runs_after_stage() {
    let (bus, sink) = bus_with_recording_sink();
    let log = new_log();
    bus.use_middleware(Middleware::new().with_after(stage_recorder(&log, "after")));
    bus.on(RegisterParams::new("refuse", sync_handler(|_data: &EventData| Err("nope".into())))
        .need_await(true))
        .unwrap();

    bus.emit("refuse", None).await.unwrap();

    assert_eq!(entries(&log), vec!["after"]);
    assert_eq!(sink.failures()[0].message, "Callback returned an error: nope");
}

#[tokio::test]
async fn test_context_describes_the_entry() {
    let bus = EventBus::new();
    let seen: Arc<Mutex<Vec<MiddlewareContext>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    bus.use_middleware(Middleware::new().with_before(sync_middleware(move |ctx: &MiddlewareContext| {
        seen_in.lock().unwrap().push(ctx.clone());
        Ok(())
    })));

    let subscription = bus
        .on(RegisterParams::new("  report.ready ", recorder(&new_log(), "handler"))
            .priority(7.9)
            .need_await(true))
        .unwrap();

    let payload = EventData::new();
    payload.insert("pages", 3);
    bus.emit("report.ready", Some(payload.clone())).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let ctx = &seen[0];
    assert_eq!(ctx.event.as_str(), "report.ready");
    assert_eq!(ctx.priority.value(), 7);
    assert!(ctx.need_await);
    assert_eq!(ctx.handler_id, subscription.id());
    assert!(ctx.data.same_record(&payload));
}

#[test]
fn test_middleware_builders() {
    let log = new_log();
    let middleware = Middleware::new()
        .with_before(stage_recorder(&log, "b"))
        .with_after(stage_recorder(&log, "a"));

    assert!(!middleware.is_empty());
    assert!(middleware.stage(Stage::Before).is_some());
    assert!(middleware.stage(Stage::Processing).is_none());
    assert!(Middleware::new().is_empty());
    assert_eq!(
        format!("{middleware:?}"),
        "Middleware { before: true, processing: false, after: true }"
    );
    assert_eq!(Stage::Processing.to_string(), "processing");
}
