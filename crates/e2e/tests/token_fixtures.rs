//! Token fixture provisioning against local generation and a mocked API

use httpmock::prelude::*;
use serde_json::json;
use std::collections::HashSet;
use test_case::test_case;

use canvas_e2e::api::ApiClient;
use canvas_e2e::token::{
    validate_token, ApiTokenSource, LocalTokenSource, StaticTokenSource, TokenFixtureProvider, TokenRequest,
};
use canvas_e2e::E2eError;

#[tokio::test]
async fn five_concurrent_pairs_are_mutually_unique() {
    let provider = TokenFixtureProvider::new(LocalTokenSource::offline());
    let pairs = provider.create_token_pairs(5, &TokenRequest::default()).await.unwrap();

    assert_eq!(pairs.len(), 5);
    let tokens: HashSet<&str> = pairs
        .iter()
        .flat_map(|p| [p.host_token.as_str(), p.user_token.as_str()])
        .collect();
    assert_eq!(tokens.len(), 10);
    assert_eq!(provider.issued_count(), 10);
    assert!(pairs.iter().all(|p| p.is_well_formed() && p.registered));
}

#[test_case("ABCDEFGH", true ; "uppercase letters")]
#[test_case("DPH42JR5", true ; "letters and digits")]
#[test_case("VNBPRVII", true ; "permanent host token")]
#[test_case("ABCDEFG0", false ; "zero")]
#[test_case("ABCDOFGH", false ; "letter o")]
#[test_case("ABCD1FGH", false ; "one")]
#[test_case("abcdefgh", false ; "lowercase")]
#[test_case("ABCDEFG", false ; "too short")]
#[test_case("ABCDEFGHJ", false ; "too long")]
fn token_format(token: &str, valid: bool) {
    assert_eq!(validate_token(token), valid);
}

#[tokio::test]
async fn api_source_uses_generate_token_endpoint() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/host/generate-token")
                .header("content-type", "application/json");
            then.status(200)
                .json_body(json!({ "hostToken": "HQ7KM2PX", "userToken": "U3ZR8NWA" }));
        })
        .await;

    let client = ApiClient::new(server.base_url(), false).unwrap();
    let provider = TokenFixtureProvider::new(ApiTokenSource::new(client));
    let request = TokenRequest {
        session_id: Some(212),
        ..Default::default()
    };

    let pair = provider.create_token_pair(&request).await.unwrap();
    mock.assert_async().await;
    assert_eq!(pair.host_token, "HQ7KM2PX");
    assert_eq!(pair.user_token, "U3ZR8NWA");
    assert_eq!(pair.session_id, 212);
    assert_eq!(pair.created_by, "Playwright Test Suite");
}

#[tokio::test]
async fn repeated_server_tokens_are_rejected() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/host/generate-token");
            then.status(200)
                .json_body(json!({ "hostToken": "HQ7KM2PX", "userToken": "U3ZR8NWA" }));
        })
        .await;

    let client = ApiClient::new(server.base_url(), false).unwrap();
    let provider = TokenFixtureProvider::new(ApiTokenSource::new(client));

    provider.create_token_pair(&TokenRequest::default()).await.unwrap();
    let second = provider.create_token_pair(&TokenRequest::default()).await;
    assert!(matches!(second, Err(E2eError::FixtureUnavailable(_))));
}

#[tokio::test]
async fn unreachable_api_is_fixture_unavailable() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/host/generate-token");
            then.status(503);
        })
        .await;

    let client = ApiClient::new(server.base_url(), false).unwrap();
    let provider = TokenFixtureProvider::new(ApiTokenSource::new(client));

    let result = provider.create_token_pair(&TokenRequest::default()).await;
    assert!(matches!(result, Err(E2eError::FixtureUnavailable(_))));
}

#[tokio::test]
async fn failed_registration_marks_pair_advisory() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/participant/test/create-token-pair");
            then.status(500);
        })
        .await;

    let client = ApiClient::new(server.base_url(), false).unwrap();
    let provider = TokenFixtureProvider::new(LocalTokenSource::registering(client));

    let pair = provider.create_token_pair(&TokenRequest::default()).await.unwrap();
    mock.assert_async().await;
    assert!(!pair.registered);
    assert!(pair.is_well_formed());
}

#[tokio::test]
async fn successful_registration_marks_pair_registered() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/participant/test/create-token-pair");
            then.status(200).json_body(json!({ "success": true }));
        })
        .await;

    let client = ApiClient::new(server.base_url(), false).unwrap();
    let provider = TokenFixtureProvider::new(LocalTokenSource::registering(client));

    let pair = provider.create_token_pair(&TokenRequest::default()).await.unwrap();
    assert!(pair.registered);
    assert!((200..1200).contains(&pair.session_id));
}

#[tokio::test]
async fn static_tokens_need_reuse() {
    let provider = TokenFixtureProvider::new(StaticTokenSource::permanent()).allow_reuse();
    let a = provider.create_token_pair(&TokenRequest::default()).await.unwrap();
    let b = provider.create_token_pair(&TokenRequest::default()).await.unwrap();
    assert_eq!(a.user_token, "DPH42JR5");
    assert_eq!(a, b);
}
