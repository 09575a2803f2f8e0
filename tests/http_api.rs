//! HTTP-only coverage for the routes that don't need a WebSocket: project
//! listing, git status, worktree lifecycle, and push registration.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{build_test_state, lock_env};
use serde_json::{json, Value};
use tower::ServiceExt;

fn git(dir: &std::path::Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn list_projects_finds_the_seeded_demo_project() {
    let _guard = lock_env();
    let server = build_test_state("true", &[]);
    let router = claude_remote::http::router(Arc::clone(&server.state));

    let response = router
        .oneshot(Request::builder().uri("/api/projects").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let projects = body["projects"].as_array().unwrap();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0]["id"], "demo");
}

#[tokio::test]
async fn project_conversation_404s_for_unknown_project() {
    let _guard = lock_env();
    let server = build_test_state("true", &[]);
    let router = claude_remote::http::router(Arc::clone(&server.state));

    let response = router
        .oneshot(Request::builder().uri("/api/projects/nope/conversation").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn vapid_and_push_subscribe_roundtrip() {
    let _guard = lock_env();
    let server = build_test_state("true", &[]);

    let router = claude_remote::http::router(Arc::clone(&server.state));
    let response = router
        .oneshot(Request::builder().uri("/api/push/vapid").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["publicKey"].as_str().unwrap().len() > 0);

    let router = claude_remote::http::router(Arc::clone(&server.state));
    let subscribe_body = json!({
        "endpoint": "https://push.example.com/abc",
        "keys": {"p256dh": "p256dh-key", "auth": "auth-secret"},
        "deviceId": "device-1",
    })
    .to_string();
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/push/subscribe")
                .header("content-type", "application/json")
                .body(Body::from(subscribe_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn worktree_create_list_remove_lifecycle() {
    let _guard = lock_env();
    let server = build_test_state("true", &[]);

    let demo = server.projects_dir.path().join("demo");
    git(&demo, &["init", "-q"]);
    git(&demo, &["add", "."]);
    git(&demo, &["commit", "-q", "-m", "initial"]);

    let router = claude_remote::http::router(Arc::clone(&server.state));
    let create_body = json!({ "branch": "feature-x" }).to_string();
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/projects/demo/worktrees")
                .header("content-type", "application/json")
                .body(Body::from(create_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["project"]["id"], "demo--feature-x");

    let router = claude_remote::http::router(Arc::clone(&server.state));
    let response = router
        .oneshot(Request::builder().uri("/api/projects/demo/worktrees").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let worktrees = body["worktrees"].as_array().unwrap();
    assert_eq!(worktrees.len(), 2, "main checkout plus the new linked worktree");

    let router = claude_remote::http::router(Arc::clone(&server.state));
    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/projects/demo--feature-x/worktrees")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert!(!server.projects_dir.path().join("demo--feature-x").exists());
}

#[tokio::test]
async fn project_git_reports_branch_and_dirty_state() {
    let _guard = lock_env();
    let server = build_test_state("true", &[]);

    let demo = server.projects_dir.path().join("demo");
    git(&demo, &["init", "-q", "-b", "main"]);
    git(&demo, &["add", "."]);
    git(&demo, &["commit", "-q", "-m", "initial"]);
    std::fs::write(demo.join("README.md"), "hi\n").unwrap();

    let router = claude_remote::http::router(Arc::clone(&server.state));
    let response = router
        .oneshot(Request::builder().uri("/api/projects/demo/git").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["branch"], "main");
    assert_eq!(body["isDirty"], true);
    assert_eq!(body["isWorktree"], false);
}
