//! API cross-check client and the application health check

use httpmock::prelude::*;
use serde_json::json;
use std::time::Duration;

use canvas_e2e::api::{ApiClient, CreateSessionRequest};
use canvas_e2e::health::wait_for_app;
use canvas_e2e::E2eError;

fn session_request() -> CreateSessionRequest {
    CreateSessionRequest {
        host_friendly_token: "VNBPRVII".to_string(),
        selected_session: "212".to_string(),
        selected_category: "55".to_string(),
        selected_album: "18".to_string(),
        session_date: "2026-10-17".to_string(),
        session_time: "10:00".to_string(),
        session_duration: 60,
    }
}

#[tokio::test]
async fn participants_listing_matches_registered_names() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/participant/session/DPH42JR5/participants");
            then.status(200).json_body(json!({
                "participantCount": 2,
                "participants": [
                    { "userId": "a1", "displayName": "Spider-Man", "country": "US" },
                    { "name": "Wonder Woman" }
                ]
            }));
        })
        .await;

    let client = ApiClient::new(server.base_url(), false).unwrap();
    let list = client.participants("DPH42JR5").await.unwrap();
    assert_eq!(list.participant_count, 2);
    assert_eq!(list.names(), vec!["Spider-Man", "Wonder Woman"]);
}

#[tokio::test]
async fn create_session_returns_the_new_tokens() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/host/create-session")
                .header("content-type", "application/json");
            then.status(200).json_body(json!({
                "Success": true,
                "SessionId": 212,
                "UserToken": "DPH42JR5",
                "HostToken": "VNBPRVII",
                "JoinLink": "https://localhost:9091/user/landing/DPH42JR5"
            }));
        })
        .await;

    let client = ApiClient::new(server.base_url(), false).unwrap();
    let created = client.create_session(&session_request()).await.unwrap();
    mock.assert_async().await;
    assert_eq!(created.session_id, 212);
    assert_eq!(created.user_token, "DPH42JR5");
    assert!(created.join_link.unwrap().ends_with("/DPH42JR5"));
}

#[tokio::test]
async fn unsuccessful_session_creation_is_a_fixture_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/host/create-session");
            then.status(200).json_body(json!({
                "Success": false,
                "SessionId": 0,
                "UserToken": "",
                "HostToken": ""
            }));
        })
        .await;

    let client = ApiClient::new(server.base_url(), false).unwrap();
    let result = client.create_session(&session_request()).await;
    assert!(matches!(result, Err(E2eError::FixtureUnavailable(_))));
}

#[tokio::test]
async fn category_lookup_passes_the_host_token() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/host/categories/18")
                .query_param("guid", "VNBPRVII");
            then.status(200).json_body(json!([
                { "categoryId": 55, "categoryName": "Tafseer" },
                { "categoryId": 56, "categoryName": "Seerah" }
            ]));
        })
        .await;

    let client = ApiClient::new(format!("{}/", server.base_url()), false).unwrap();
    let categories = client.categories(18, "VNBPRVII").await.unwrap();
    assert_eq!(categories.len(), 2);
    assert_eq!(categories[0].id, 55);
    assert_eq!(categories[1].name, "Seerah");
}

#[tokio::test]
async fn lookup_server_error_surfaces_as_http_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/host/albums");
            then.status(500);
        })
        .await;

    let client = ApiClient::new(server.base_url(), false).unwrap();
    assert!(matches!(client.albums("VNBPRVII").await, Err(E2eError::Http(_))));
}

#[tokio::test]
async fn redirecting_landing_page_counts_as_up() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(302).header("location", "/home");
        })
        .await;

    wait_for_app(&server.base_url(), false, Duration::from_secs(5))
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn server_errors_until_timeout_mean_unavailable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(503);
        })
        .await;

    match wait_for_app(&server.base_url(), false, Duration::from_millis(1200)).await {
        Err(E2eError::AppUnavailable { attempts, .. }) => assert!(attempts >= 2),
        other => panic!("expected AppUnavailable, got {:?}", other),
    }
}
