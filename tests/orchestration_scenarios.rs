//! End-to-end orchestration scenarios over in-memory ports and an
//! in-process service transport double.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{
    build_engine, fenced, service_with_fields, spawn_webhook_capture, wait_for_status, Behavior,
    FakeTransport,
};
use orra::domain::models::{Action, ActionParam, EntryType, Status};
use orra::domain::ports::storage::Storage;

fn echo_action(message: &str) -> (Action, Vec<ActionParam>) {
    (
        Action {
            kind: "user".into(),
            content: "echo".into(),
        },
        vec![ActionParam::new("message", json!(message))],
    )
}

fn echo_plan_response() -> String {
    fenced(&json!({
        "tasks": [
            {"id": "task0", "input": {"message": "Hello World"}},
            {"id": "task1", "service": "s_echo", "input": {"message": "$task0.message"}}
        ],
        "parallelGroups": [["task1"]]
    }))
}

#[tokio::test]
async fn s1_echo_happy_path() {
    let transport = FakeTransport::new();
    let (engine, _storage) = build_engine(vec![echo_plan_response()], Arc::clone(&transport));
    let (webhook_url, mut webhooks) = spawn_webhook_capture().await;

    let project = engine.register_project(Some(webhook_url)).await.unwrap();
    let service = engine
        .register_service(service_with_fields(
            "s_echo",
            &project.id,
            "echo-service",
            &["message"],
            false,
        ))
        .await
        .unwrap();
    transport
        .connect(
            &service.id,
            engine.idempotency_store(&service.id).await.unwrap(),
            Behavior::EchoTask,
        )
        .await;

    let (action, params) = echo_action("Hello World");
    let orchestration = engine
        .prepare_orchestration(&project.id, action, params, None, None)
        .await
        .unwrap();
    assert_eq!(orchestration.status, Status::Pending);
    assert_eq!(
        orchestration.task_zero.as_ref().unwrap()["message"],
        "Hello World"
    );
    let plan = orchestration.plan.as_ref().unwrap();
    assert_eq!(
        plan.get_task("task1").unwrap().input["message"],
        "$task0.message"
    );

    engine.execute(&orchestration.id).await.unwrap();
    wait_for_status(&engine, &orchestration.id, Status::Completed, Duration::from_secs(10)).await;

    let finished = engine.get_orchestration(&orchestration.id).await.unwrap();
    assert_eq!(finished.results, vec![json!({"message": "Hello World"})]);

    let (event, body) = tokio::time::timeout(Duration::from_secs(10), webhooks.recv())
        .await
        .expect("webhook within budget")
        .expect("webhook delivered");
    assert_eq!(event, "orchestration.completed");
    assert_eq!(body["type"], "orchestration.completed");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["project_id"], project.id);
    assert_eq!(body["orchestration_id"], orchestration.id);
    assert_eq!(body["results"][0]["message"], "Hello World");
}

#[tokio::test]
async fn s2_cache_hit_substitutes_params() {
    let transport = FakeTransport::new();
    // One scripted response only: the second preparation must be served
    // from the vector cache.
    let (engine, _storage) = build_engine(vec![echo_plan_response()], Arc::clone(&transport));

    let project = engine
        .register_project(Some("http://127.0.0.1:1/hook".into()))
        .await
        .unwrap();
    let service = engine
        .register_service(service_with_fields(
            "s_echo",
            &project.id,
            "echo-service",
            &["message"],
            false,
        ))
        .await
        .unwrap();
    transport
        .connect(
            &service.id,
            engine.idempotency_store(&service.id).await.unwrap(),
            Behavior::EchoTask,
        )
        .await;

    let (action, params) = echo_action("Hello World");
    let first = engine
        .prepare_orchestration(&project.id, action, params, None, None)
        .await
        .unwrap();
    assert_eq!(first.status, Status::Pending);

    let (action, params) = echo_action("Goodbye");
    let second = engine
        .prepare_orchestration(&project.id, action, params, None, None)
        .await
        .unwrap();
    assert_eq!(second.status, Status::Pending);
    assert_eq!(second.task_zero.as_ref().unwrap()["message"], "Goodbye");
    assert_eq!(
        second.plan.as_ref().unwrap().task_zero().unwrap().input["message"],
        "Goodbye"
    );

    engine.execute(&second.id).await.unwrap();
    wait_for_status(&engine, &second.id, Status::Completed, Duration::from_secs(10)).await;
    let finished = engine.get_orchestration(&second.id).await.unwrap();
    assert_eq!(finished.results, vec![json!({"message": "Goodbye"})]);
}

#[tokio::test]
async fn s3_not_actionable_spawns_no_workers() {
    let transport = FakeTransport::new();
    let response = fenced(&json!({
        "tasks": [
            {"id": "final", "input": {"error": "no service can translate text"}}
        ]
    }));
    let (engine, _storage) = build_engine(vec![response], Arc::clone(&transport));

    let project = engine
        .register_project(Some("http://127.0.0.1:1/hook".into()))
        .await
        .unwrap();
    engine
        .register_service(service_with_fields(
            "s_echo",
            &project.id,
            "echo-service",
            &["message"],
            false,
        ))
        .await
        .unwrap();

    let (action, params) = echo_action("Hello");
    let orchestration = engine
        .prepare_orchestration(&project.id, action, params, None, None)
        .await
        .unwrap();
    assert_eq!(orchestration.status, Status::NotActionable);
    assert_eq!(
        orchestration.error.as_ref().unwrap()["error"],
        "no service can translate text"
    );
    // No execution: no log was created for the orchestration.
    assert!(engine
        .log_manager()
        .get_log(&orchestration.id)
        .await
        .is_none());
    // Not executable either.
    assert!(engine.execute(&orchestration.id).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn s4_paused_service_recovers() {
    let transport = FakeTransport::new();
    let (engine, _storage) = build_engine(vec![echo_plan_response()], Arc::clone(&transport));

    let project = engine
        .register_project(Some("http://127.0.0.1:1/hook".into()))
        .await
        .unwrap();
    let service = engine
        .register_service(service_with_fields(
            "s_echo",
            &project.id,
            "echo-service",
            &["message"],
            false,
        ))
        .await
        .unwrap();
    transport
        .connect(
            &service.id,
            engine.idempotency_store(&service.id).await.unwrap(),
            Behavior::EchoTask,
        )
        .await;
    transport.set_unhealthy(&service.id, true).await;

    let (action, params) = echo_action("Hello World");
    let orchestration = engine
        .prepare_orchestration(&project.id, action, params, None, None)
        .await
        .unwrap();
    engine.execute(&orchestration.id).await.unwrap();

    // Give the worker time to observe the unhealthy service and pause.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let state = engine.log_manager().get_state(&orchestration.id).await.unwrap();
        if state.tasks_statuses.get("task1") == Some(&Status::Paused) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task never paused");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    transport.set_unhealthy(&service.id, false).await;
    wait_for_status(&engine, &orchestration.id, Status::Completed, Duration::from_secs(60)).await;

    let log = engine.log_manager().get_log(&orchestration.id).await.unwrap();
    let statuses = log.entries_of_type(EntryType::TaskStatus).await;
    let labels: Vec<Status> = statuses
        .iter()
        .filter_map(|e| {
            serde_json::from_slice::<orra::domain::models::TaskStatusPayload>(&e.value).ok()
        })
        .map(|p| p.status)
        .collect();
    assert!(labels.contains(&Status::Paused));
    assert!(labels.contains(&Status::Processing));
    assert!(labels.contains(&Status::Completed));
}

fn chain_plan_response() -> String {
    fenced(&json!({
        "tasks": [
            {"id": "task0", "input": {"item": "Widget"}},
            {"id": "task1", "service": "s_alpha", "input": {"item": "$task0.item"}},
            {"id": "task2", "service": "s_beta", "input": {"item": "$task1.item"}},
            {"id": "task3", "service": "s_gamma", "input": {"item": "$task2.item"}}
        ],
        "parallelGroups": [["task1"], ["task2"], ["task3"]]
    }))
}

async fn register_chain(
    engine: &Arc<orra::PlanEngine>,
    transport: &Arc<FakeTransport>,
    project_id: &str,
    gamma_behavior: Behavior,
    alpha_ttl_ms: u64,
) {
    for (id, name, revertible, behavior) in [
        (
            "s_alpha",
            "inventory",
            true,
            Behavior::EchoWithCompensation { ttl_ms: alpha_ttl_ms },
        ),
        (
            "s_beta",
            "payments",
            true,
            Behavior::EchoWithCompensation { ttl_ms: 3_600_000 },
        ),
        ("s_gamma", "delivery", false, gamma_behavior.clone()),
    ] {
        let service = engine
            .register_service(service_with_fields(id, project_id, name, &["item"], revertible))
            .await
            .unwrap();
        transport
            .connect(
                &service.id,
                engine.idempotency_store(&service.id).await.unwrap(),
                behavior,
            )
            .await;
    }
}

#[tokio::test(start_paused = true)]
async fn s5_retry_exhaustion_fails_and_compensates_in_reverse() {
    let transport = FakeTransport::new();
    let (engine, _storage) = build_engine(vec![chain_plan_response()], Arc::clone(&transport));

    let project = engine
        .register_project(Some("http://127.0.0.1:1/hook".into()))
        .await
        .unwrap();
    register_chain(
        &engine,
        &transport,
        &project.id,
        Behavior::AlwaysFail("delivery is down".into()),
        3_600_000,
    )
    .await;

    let orchestration = engine
        .prepare_orchestration(
            &project.id,
            Action {
                kind: "user".into(),
                content: "ship the widget".into(),
            },
            vec![ActionParam::new("item", json!("Widget"))],
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(orchestration.status, Status::Pending);

    engine.execute(&orchestration.id).await.unwrap();
    wait_for_status(&engine, &orchestration.id, Status::Failed, Duration::from_secs(300)).await;

    let failed = engine.get_orchestration(&orchestration.id).await.unwrap();
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error["producer"], "task3");
    assert!(error["error"].as_str().unwrap().contains("delivery is down"));

    let log = engine.log_manager().get_log(&orchestration.id).await.unwrap();
    let failures = log.entries_of_type(EntryType::TaskFailure).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempt_num, 5);

    // Compensation runs over the stored entries of task2 then task1.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    loop {
        if log.entries_of_type(EntryType::CompensationComplete).await.len() == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "compensation did not finish"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let dispatched = transport.compensation_dispatches.lock().await.clone();
    assert_eq!(dispatched, vec!["s_beta".to_string(), "s_alpha".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn s6_expired_compensation_is_recorded_and_reported() {
    let transport = FakeTransport::new();
    let response = fenced(&json!({
        "tasks": [
            {"id": "task0", "input": {"item": "Widget"}},
            {"id": "task1", "service": "s_alpha", "input": {"item": "$task0.item"}},
            {"id": "task2", "service": "s_gamma", "input": {"item": "$task1.item"}}
        ],
        "parallelGroups": [["task1"], ["task2"]]
    }));
    let (engine, storage) = build_engine(vec![response], Arc::clone(&transport));

    let project = engine
        .register_project(Some("http://127.0.0.1:1/hook".into()))
        .await
        .unwrap();
    engine
        .add_compensation_failure_webhook(&project.id, "http://127.0.0.1:1/comp".into())
        .await
        .unwrap();
    for (id, name, revertible, behavior) in [
        (
            "s_alpha",
            "inventory",
            true,
            // TTL zero: the stored compensation is expired by the time the
            // compensation worker reaches it.
            Behavior::EchoWithCompensation { ttl_ms: 0 },
        ),
        (
            "s_gamma",
            "delivery",
            false,
            Behavior::AlwaysFail("delivery is down".into()),
        ),
    ] {
        let service = engine
            .register_service(service_with_fields(id, &project.id, name, &["item"], revertible))
            .await
            .unwrap();
        transport
            .connect(
                &service.id,
                engine.idempotency_store(&service.id).await.unwrap(),
                behavior,
            )
            .await;
    }

    let orchestration = engine
        .prepare_orchestration(
            &project.id,
            Action {
                kind: "user".into(),
                content: "ship the widget".into(),
            },
            vec![ActionParam::new("item", json!("Widget"))],
            None,
            None,
        )
        .await
        .unwrap();
    engine.execute(&orchestration.id).await.unwrap();
    wait_for_status(&engine, &orchestration.id, Status::Failed, Duration::from_secs(300)).await;

    // The expired entry is appended first, the durable record follows;
    // poll on the record so both are visible.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    let records = loop {
        let records = storage.list_prefix("failedcomp:info:").await.unwrap();
        if !records.is_empty() {
            break records;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "compensation never expired"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    let log = engine.log_manager().get_log(&orchestration.id).await.unwrap();
    assert_eq!(log.entries_of_type(EntryType::CompensationExpired).await.len(), 1);
    assert_eq!(records.len(), 1);
    let record: orra::domain::models::FailedCompensation =
        serde_json::from_slice(&records[0].1).unwrap();
    assert_eq!(record.status, "expired");
    assert_eq!(record.task_id, "task1");
    assert_eq!(record.orchestration_id, orchestration.id);
    let by_project = storage
        .list_prefix(&format!("failedcomp:project:{}:", project.id))
        .await
        .unwrap();
    assert_eq!(by_project.len(), 1);
}

#[tokio::test]
async fn aborted_task_aborts_orchestration_with_payload() {
    let transport = FakeTransport::new();
    let (engine, _storage) = build_engine(vec![echo_plan_response()], Arc::clone(&transport));

    let project = engine
        .register_project(Some("http://127.0.0.1:1/hook".into()))
        .await
        .unwrap();
    let service = engine
        .register_service(service_with_fields(
            "s_echo",
            &project.id,
            "echo-service",
            &["message"],
            false,
        ))
        .await
        .unwrap();
    transport
        .connect(
            &service.id,
            engine.idempotency_store(&service.id).await.unwrap(),
            Behavior::Abort(json!({"reason": "operator stop"})),
        )
        .await;

    let (action, params) = echo_action("Hello World");
    let orchestration = engine
        .prepare_orchestration(&project.id, action, params, None, None)
        .await
        .unwrap();
    engine.execute(&orchestration.id).await.unwrap();
    wait_for_status(&engine, &orchestration.id, Status::Aborted, Duration::from_secs(10)).await;

    let aborted = engine.get_orchestration(&orchestration.id).await.unwrap();
    assert_eq!(aborted.abort_payload.as_ref().unwrap()["reason"], "operator stop");
    let log = engine.log_manager().get_log(&orchestration.id).await.unwrap();
    assert_eq!(log.entries_of_type(EntryType::TaskAbortedOutput).await.len(), 1);
    // No task_output for the aborted task.
    assert!(log
        .entries_of_type(EntryType::TaskOutput)
        .await
        .iter()
        .all(|e| e.id != "task1"));
}
