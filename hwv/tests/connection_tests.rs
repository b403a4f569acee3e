//! Background task lifecycle through the connection registry.

mod common;

use common::TestWorkspace;
use hwv::connection::{CommandOptions, Connection};
use hwv::task::{ExecutionMode, TaskStatus};
use hwv_common::testing::TestGuard;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

async fn local(ws: &TestWorkspace) -> (hwv::Engine, Arc<dyn Connection>) {
    let engine = ws.engine();
    let connection = engine
        .connections
        .get_connection("local", "local")
        .await
        .expect("local connection");
    if !connection.is_connected() {
        connection.connect().await.expect("connect local");
    }
    (engine, connection)
}

#[tokio::test]
async fn test_background_wait_is_idempotent() {
    let _guard = TestGuard::new("test_background_wait_is_idempotent");
    let ws = TestWorkspace::new();
    let (engine, connection) = local(&ws).await;

    let started = connection
        .execute_command("echo background", ExecutionMode::Background, &CommandOptions::default())
        .await;
    assert_eq!(started.status, TaskStatus::Running);

    let first = connection
        .wait_for_task(&started.task_id, Some(Duration::from_secs(10)))
        .await;
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(first.stdout.trim(), "background");

    let second = connection
        .wait_for_task(&started.task_id, Some(Duration::from_secs(10)))
        .await;
    assert_eq!(second.status, first.status);
    assert_eq!(second.stdout, first.stdout);
    assert_eq!(second.end_time, first.end_time);

    engine.shutdown().await;
}

#[tokio::test]
#[serial(process_timing)]
async fn test_wait_timeout_then_terminate() {
    let ws = TestWorkspace::new();
    let (engine, connection) = local(&ws).await;

    let started = connection
        .execute_command("echo partial; sleep 30", ExecutionMode::Background, &CommandOptions::default())
        .await;
    let waited = connection
        .wait_for_task(&started.task_id, Some(Duration::from_millis(500)))
        .await;
    assert_eq!(waited.status, TaskStatus::Timeout);

    assert!(!connection.terminate_task(&started.task_id).await);
    let after = connection.wait_for_task(&started.task_id, None).await;
    assert_eq!(after.status, TaskStatus::Timeout);
    assert_eq!(after.stdout.trim(), "partial");

    engine.shutdown().await;
}

#[tokio::test]
#[serial(process_timing)]
async fn test_terminate_running_task() {
    let ws = TestWorkspace::new();
    let (engine, connection) = local(&ws).await;

    let started = connection
        .execute_command("sleep 30", ExecutionMode::Background, &CommandOptions::default())
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(connection.terminate_task(&started.task_id).await);

    let result = connection
        .wait_for_task(&started.task_id, Some(Duration::from_secs(5)))
        .await;
    assert_eq!(result.status, TaskStatus::Terminated);

    engine.shutdown().await;
}

#[tokio::test]
#[serial(process_timing)]
async fn test_synchronous_timeout_kills_command() {
    let ws = TestWorkspace::new();
    let (engine, connection) = local(&ws).await;

    let options = CommandOptions::default().with_timeout(Duration::from_millis(300));
    let started = std::time::Instant::now();
    let result = connection
        .execute_command("sleep 30", ExecutionMode::Synchronous, &options)
        .await;
    assert_eq!(result.status, TaskStatus::Timeout);
    assert!(started.elapsed() < Duration::from_secs(10));

    engine.shutdown().await;
}
