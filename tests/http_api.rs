use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use kamehouse_lib::build_router;
use serde_json::{json, Value};
use tower::ServiceExt;
#[path = "util.rs"]
mod util;

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Result<(StatusCode, Value)> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?,
        None => builder.body(Body::empty())?,
    };
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, value))
}

#[tokio::test]
async fn health_reports_database_state() -> Result<()> {
    let state = util::test_state().await;
    let app = build_router(state);
    let (status, body) = send(&app, Method::GET, "/api/health", None, None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], true);
    Ok(())
}

#[tokio::test]
async fn protected_routes_need_a_bearer_token() -> Result<()> {
    let state = util::test_state().await;
    let app = build_router(state);

    let (status, body) = send(&app, Method::GET, "/api/households", None, None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH/UNAUTHORIZED");

    let (status, _) = send(&app, Method::GET, "/api/users/me", Some("not-a-jwt"), None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn register_create_household_and_complete_a_chore() -> Result<()> {
    let state = util::test_state().await;
    let app = build_router(state);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/auth/register",
        None,
        Some(json!({
            "email": "goten@example.com",
            "username": "goten",
            "password": "chores4ever",
        })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let token = body["accessToken"].as_str().expect("token issued").to_string();

    let (status, me) = send(&app, Method::GET, "/api/auth/me", Some(&token), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["username"], "goten");

    let (status, household) = send(
        &app,
        Method::POST,
        "/api/households",
        Some(&token),
        Some(json!({ "name": "Son house" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let household_id = household["id"].as_str().expect("id").to_string();

    let (status, room) = send(
        &app,
        Method::POST,
        "/api/rooms",
        Some(&token),
        Some(json!({ "householdId": household_id, "name": "Bedroom" })),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let room_id = room["id"].as_str().expect("id").to_string();

    // No body at all falls back to difficulty 1.
    let (status, result) = send(
        &app,
        Method::POST,
        &format!("/api/gamification/task-complete/{room_id}"),
        Some(&token),
        None,
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["rewards"]["baseXp"], 10);
    assert_eq!(result["achievements"][0]["key"], "first_chore");

    let (status, count) = send(&app, Method::GET, "/api/notifications/unread-count", Some(&token), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(count["count"], 1);
    Ok(())
}

#[tokio::test]
async fn outsiders_are_forbidden_and_bad_bodies_are_rejected() -> Result<()> {
    let state = util::test_state().await;
    let (owner, owner_token) = util::register_with_token(&state, "trunks").await;
    let (_, outsider_token) = util::register_with_token(&state, "babidi").await;
    let household = util::household_with(&state.pool, &owner, &[]).await;
    let app = build_router(state);

    let uri = format!("/api/households/{}", household.id);
    let (status, body) = send(&app, Method::GET, &uri, Some(&outsider_token), None).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "HOUSEHOLD/FORBIDDEN");

    let (status, _) = send(&app, Method::GET, "/api/categories/nope", Some(&owner_token), None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/categories",
        Some(&owner_token),
        Some(json!({ "householdId": household.id })),
    )
    .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["code"].as_str().unwrap_or_default().starts_with("JSON/"));
    Ok(())
}
