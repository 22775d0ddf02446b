#![cfg(unix)]

use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use orchestrator::{AgentConfig, OrchestratorConfig};
use serde_json::{json, Value};
use server::{create_router, state::AppState};
use tempfile::TempDir;

const HAPPY_AGENT: &str = r##"
case "$FORMIC_STAGE" in
  brief) echo "writing brief"; echo "# Brief" > README.md ;;
  plan) echo "writing plan"; echo "- [ ] step" > PLAN.md ;;
  execute) echo "executing plan" ;;
esac
"##;

const SLOW_AGENT: &str = r#"
case "$FORMIC_STAGE" in
  brief) echo "thinking"; exec sleep 30 ;;
esac
"#;

fn config(script: &str) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_agent(AgentConfig::new("sh").with_args(["-c", script]))
        .with_kill_grace(Duration::from_millis(300))
}

async fn setup_test_server(script: &str) -> (TestServer, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let state = AppState::new(config(script));
    state
        .open_workspace(temp_dir.path())
        .await
        .expect("Failed to open workspace");

    let server = TestServer::new(create_router(state)).expect("Failed to create test server");
    (server, temp_dir)
}

async fn create_task(server: &TestServer, title: &str) -> Value {
    let response = server
        .post("/api/tasks")
        .json(&json!({ "title": title, "context": "Some context", "priority": "high" }))
        .await;
    response.assert_status(StatusCode::CREATED);
    response.json()
}

async fn wait_settled(server: &TestServer, id: &str) -> Value {
    for _ in 0..500 {
        let body: Value = server.get(&format!("/api/tasks/{}/workflow", id)).await.json();
        if body["isRunning"] == false {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("workflow for {} never settled", id);
}

mod health {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;

        let response = server.get("/health").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["openWorkspaces"], 1);
    }

    #[tokio::test]
    async fn test_openapi_document() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;

        let body: Value = server.get("/api/openapi.json").await.json();
        assert!(body["paths"]["/api/tasks/{id}/run"].is_object());
        assert!(body["components"]["schemas"]["WorkflowStatus"].is_object());
    }
}

mod tasks_crud {
    use super::*;

    #[tokio::test]
    async fn test_create_task_returns_201_created() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;

        let body = create_task(&server, "Test Task").await;

        assert_eq!(body["title"], "Test Task");
        assert_eq!(body["context"], "Some context");
        assert_eq!(body["priority"], "high");
        assert_eq!(body["status"], "todo");
        assert_eq!(body["workflowStep"], "none");
        let id = body["id"].as_str().unwrap();
        assert_eq!(body["docsPath"], format!(".formic/tasks/{}", id));
    }

    #[tokio::test]
    async fn test_create_task_with_blank_title_is_400() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;

        let response = server
            .post("/api/tasks")
            .json(&json!({ "title": "   ", "context": "x" }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], "validation");
    }

    #[tokio::test]
    async fn test_board_lists_tasks_in_creation_order() {
        let (server, temp_dir) = setup_test_server(HAPPY_AGENT).await;
        create_task(&server, "First").await;
        create_task(&server, "Second").await;

        let body: Value = server.get("/api/board").await.json();
        let tasks = body["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0]["title"], "First");
        assert_eq!(tasks[1]["title"], "Second");
        assert_eq!(
            body["meta"]["projectName"],
            temp_dir.path().file_name().unwrap().to_str().unwrap()
        );
    }

    #[tokio::test]
    async fn test_get_unknown_task_is_404() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;

        let response = server
            .get(&format!("/api/tasks/{}", uuid::Uuid::new_v4()))
            .await;

        response.assert_status_not_found();
        let body: Value = response.json();
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_update_task_fields() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;
        let task = create_task(&server, "Original").await;
        let id = task["id"].as_str().unwrap();

        let response = server
            .put(&format!("/api/tasks/{}", id))
            .json(&json!({ "title": "Renamed", "priority": "low" }))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["title"], "Renamed");
        assert_eq!(body["priority"], "low");
        assert_eq!(body["context"], "Some context");
    }

    #[tokio::test]
    async fn test_update_to_active_status_is_409() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;
        let task = create_task(&server, "Shortcut").await;
        let path = format!("/api/tasks/{}", task["id"].as_str().unwrap());

        let response = server
            .put(&path)
            .json(&json!({ "status": "running" }))
            .await;

        response.assert_status(StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["error"], "invalid_transition");

        let current: Value = server.get(&path).await.json();
        assert_eq!(current["status"], "todo");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;
        let task = create_task(&server, "Doomed").await;
        let path = format!("/api/tasks/{}", task["id"].as_str().unwrap());

        server.delete(&path).await.assert_status(StatusCode::NO_CONTENT);
        server.delete(&path).await.assert_status(StatusCode::NO_CONTENT);
        server.get(&path).await.assert_status_not_found();
    }
}

mod workflow {
    use super::*;

    #[tokio::test]
    async fn test_run_reaches_review() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;
        let task = create_task(&server, "Pipeline").await;
        let id = task["id"].as_str().unwrap();

        let response = server.post(&format!("/api/tasks/{}/run", id)).await;
        response.assert_status(StatusCode::ACCEPTED);
        let started: Value = response.json();
        assert_eq!(started["status"], "briefing");
        assert_eq!(started["isRunning"], true);

        let status = wait_settled(&server, id).await;
        assert_eq!(status["status"], "review");
        assert!(status["logs"]["brief"]
            .as_str()
            .unwrap()
            .contains("writing brief"));
        assert!(status["logs"]["execute"]
            .as_str()
            .unwrap()
            .contains("executing plan"));
    }

    #[tokio::test]
    async fn test_run_twice_is_conflict_and_stop_cancels() {
        let (server, _temp_dir) = setup_test_server(SLOW_AGENT).await;
        let task = create_task(&server, "Slow").await;
        let id = task["id"].as_str().unwrap();

        server
            .post(&format!("/api/tasks/{}/run", id))
            .await
            .assert_status(StatusCode::ACCEPTED);

        let again = server.post(&format!("/api/tasks/{}/run", id)).await;
        again.assert_status(StatusCode::CONFLICT);
        assert_eq!(again.json::<Value>()["error"], "already_running");

        let stopped = server.post(&format!("/api/tasks/{}/stop", id)).await;
        stopped.assert_status_ok();
        let body: Value = stopped.json();
        assert_eq!(body["status"], "cancelled");
        assert_eq!(body["isRunning"], false);
        assert_eq!(body["workflowStep"], "brief");
    }

    #[tokio::test]
    async fn test_stop_without_run_is_conflict() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;
        let task = create_task(&server, "Idle").await;

        let response = server
            .post(&format!("/api/tasks/{}/stop", task["id"].as_str().unwrap()))
            .await;

        response.assert_status(StatusCode::CONFLICT);
        assert_eq!(response.json::<Value>()["error"], "not_running");
    }

    #[tokio::test]
    async fn test_delete_and_status_change_refused_while_running() {
        let (server, _temp_dir) = setup_test_server(SLOW_AGENT).await;
        let task = create_task(&server, "Busy").await;
        let id = task["id"].as_str().unwrap();
        server.post(&format!("/api/tasks/{}/run", id)).await;

        let delete = server.delete(&format!("/api/tasks/{}", id)).await;
        delete.assert_status(StatusCode::CONFLICT);
        assert_eq!(delete.json::<Value>()["error"], "task_running");

        let update = server
            .put(&format!("/api/tasks/{}", id))
            .json(&json!({ "status": "done" }))
            .await;
        update.assert_status(StatusCode::CONFLICT);

        server.post(&format!("/api/tasks/{}/stop", id)).await.assert_status_ok();
        server
            .delete(&format!("/api/tasks/{}", id))
            .await
            .assert_status(StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_failed_task_reset_to_todo() {
        let (server, _temp_dir) = setup_test_server("echo nope >&2; exit 3").await;
        let task = create_task(&server, "Broken").await;
        let id = task["id"].as_str().unwrap();

        server.post(&format!("/api/tasks/{}/run", id)).await;
        let status = wait_settled(&server, id).await;
        assert_eq!(status["status"], "failed");
        assert!(status["logs"]["brief"].as_str().unwrap().contains("nope"));

        let rerun = server.post(&format!("/api/tasks/{}/run", id)).await;
        rerun.assert_status(StatusCode::CONFLICT);
        assert_eq!(rerun.json::<Value>()["error"], "invalid_transition");

        let reset: Value = server
            .put(&format!("/api/tasks/{}", id))
            .json(&json!({ "status": "todo" }))
            .await
            .json();
        assert_eq!(reset["status"], "todo");
        assert_eq!(reset["workflowStep"], "none");
    }

    #[tokio::test]
    async fn test_finished_stage_log_stream() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;
        let task = create_task(&server, "Logged").await;
        let id = task["id"].as_str().unwrap();
        server.post(&format!("/api/tasks/{}/run", id)).await;
        wait_settled(&server, id).await;

        let response = server
            .get(&format!("/api/tasks/{}/logs/plan/stream", id))
            .await;

        response.assert_status_ok();
        let text = response.text();
        assert!(text.contains("event: stdout"));
        assert!(text.contains("writing plan"));
        assert!(text.contains("event: end"));
    }
}

mod logs {
    use super::*;

    #[tokio::test]
    async fn test_unknown_stage_is_400() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;
        let task = create_task(&server, "T").await;

        server
            .get(&format!("/api/tasks/{}/logs/deploy/stream", task["id"].as_str().unwrap()))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stage_that_never_ran_is_404() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;
        let task = create_task(&server, "T").await;

        server
            .get(&format!("/api/tasks/{}/logs/brief/stream", task["id"].as_str().unwrap()))
            .await
            .assert_status_not_found();
    }
}

mod workspaces {
    use super::*;

    #[tokio::test]
    async fn test_no_workspace_is_conflict() {
        let server = TestServer::new(create_router(AppState::new(config(HAPPY_AGENT)))).unwrap();

        let response = server.get("/api/board").await;
        response.assert_status(StatusCode::CONFLICT);
        assert_eq!(response.json::<Value>()["error"], "no_workspace");
    }

    #[tokio::test]
    async fn test_open_and_switch_workspaces() {
        let (server, first) = setup_test_server(HAPPY_AGENT).await;
        create_task(&server, "In first").await;

        let second = TempDir::new().unwrap();
        let opened: Value = server
            .post("/api/workspaces")
            .json(&json!({ "path": second.path() }))
            .await
            .json();
        assert_eq!(opened["active"], true);
        assert_eq!(opened["taskCount"], 0);

        let board: Value = server.get("/api/board").await.json();
        assert!(board["tasks"].as_array().unwrap().is_empty());

        let listed: Value = server.get("/api/workspaces").await.json();
        let entries = listed.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().filter(|e| e["active"] == true).count(), 1);

        let switched = server
            .post("/api/workspaces/switch")
            .json(&json!({ "path": first.path() }))
            .await;
        switched.assert_status_ok();
        assert_eq!(switched.json::<Value>()["taskCount"], 1);

        let board: Value = server.get("/api/board").await.json();
        assert_eq!(board["tasks"][0]["title"], "In first");
    }

    #[tokio::test]
    async fn test_switch_to_unopened_workspace_is_404() {
        let (server, _temp_dir) = setup_test_server(HAPPY_AGENT).await;
        let other = TempDir::new().unwrap();

        let response = server
            .post("/api/workspaces/switch")
            .json(&json!({ "path": other.path() }))
            .await;

        response.assert_status_not_found();
        assert_eq!(response.json::<Value>()["error"], "workspace_not_open");
    }

    #[tokio::test]
    async fn test_open_missing_path_is_400() {
        let (server, temp_dir) = setup_test_server(HAPPY_AGENT).await;

        let response = server
            .post("/api/workspaces")
            .json(&json!({ "path": temp_dir.path().join("missing") }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }
}
