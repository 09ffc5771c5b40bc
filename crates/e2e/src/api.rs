//! Typed client for the application's host and participant endpoints
//!
//! Only the endpoints the harness needs for fixtures and API-side
//! cross-checks are covered.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};

/// Response of `POST /api/host/generate-token`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedTokens {
    pub host_token: String,
    pub user_token: String,
}

/// Response of `POST /api/host/create-session`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreatedSession {
    pub success: bool,
    pub session_id: i64,
    pub user_token: String,
    pub host_token: String,
    #[serde(default)]
    pub join_link: Option<String>,
}

/// Request body of `POST /api/host/create-session`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub host_friendly_token: String,
    pub selected_session: String,
    pub selected_category: String,
    pub selected_album: String,
    pub session_date: String,
    pub session_time: String,
    pub session_duration: u32,
}

/// One registered participant
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(alias = "displayName")]
    pub name: String,
    #[serde(default)]
    pub country: Option<String>,
}

/// Response of `GET /api/participant/session/{token}/participants`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantList {
    pub participant_count: usize,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

impl ParticipantList {
    pub fn names(&self) -> Vec<&str> {
        self.participants.iter().map(|p| p.name.as_str()).collect()
    }
}

/// An entry of the album/category/session lookups
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupItem {
    #[serde(alias = "albumId", alias = "categoryId", alias = "sessionId")]
    pub id: i64,
    #[serde(alias = "albumName", alias = "categoryName", alias = "sessionName")]
    pub name: String,
}

/// HTTP client bound to the application's base URL
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, ignore_https_errors: bool) -> E2eResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(ignore_https_errors)
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &HarnessConfig) -> E2eResult<Self> {
        Self::new(config.base_url.clone(), config.ignore_https_errors)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn generate_token(&self, session_id: i64, created_by: &str, title: &str) -> E2eResult<GeneratedTokens> {
        let body = serde_json::json!({
            "sessionId": session_id,
            "createdBy": created_by,
            "title": title,
        });
        debug!("POST /api/host/generate-token for session {}", session_id);
        let resp = self
            .http
            .post(self.url("/api/host/generate-token"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn register_token_pair(
        &self,
        session_id: i64,
        host_token: &str,
        user_token: &str,
        valid_hours: u32,
    ) -> E2eResult<()> {
        let body = serde_json::json!({
            "sessionId": session_id,
            "hostToken": host_token,
            "userToken": user_token,
            "validHours": valid_hours,
        });
        self.http
            .post(self.url("/api/participant/test/create-token-pair"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn create_session(&self, request: &CreateSessionRequest) -> E2eResult<CreatedSession> {
        let resp = self
            .http
            .post(self.url("/api/host/create-session"))
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        let created: CreatedSession = resp.json().await?;
        if !created.success {
            return Err(E2eError::FixtureUnavailable(format!(
                "create-session reported failure for session {}",
                created.session_id
            )));
        }
        Ok(created)
    }

    pub async fn participants(&self, user_token: &str) -> E2eResult<ParticipantList> {
        let path = format!("/api/participant/session/{}/participants", user_token);
        let resp = self.http.get(self.url(&path)).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn albums(&self, host_token: &str) -> E2eResult<Vec<LookupItem>> {
        self.lookup(&format!("/api/host/albums?guid={}", host_token)).await
    }

    pub async fn categories(&self, album_id: i64, host_token: &str) -> E2eResult<Vec<LookupItem>> {
        self.lookup(&format!("/api/host/categories/{}?guid={}", album_id, host_token))
            .await
    }

    pub async fn sessions(&self, category_id: i64, host_token: &str) -> E2eResult<Vec<LookupItem>> {
        self.lookup(&format!("/api/host/sessions/{}?guid={}", category_id, host_token))
            .await
    }

    async fn lookup(&self, path: &str) -> E2eResult<Vec<LookupItem>> {
        let resp = self.http.get(self.url(path)).send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_list_parse() {
        let json = r#"{
            "participantCount": 2,
            "participants": [
                { "userId": "u1", "name": "Spider-Man", "country": "US" },
                { "displayName": "Wonder Woman" }
            ]
        }"#;
        let list: ParticipantList = serde_json::from_str(json).unwrap();
        assert_eq!(list.participant_count, 2);
        assert_eq!(list.names(), vec!["Spider-Man", "Wonder Woman"]);
    }

    #[test]
    fn test_created_session_parse() {
        let json = r#"{
            "Success": true,
            "SessionId": 212,
            "UserToken": "DPH42JR5",
            "HostToken": "VNBPRVII",
            "JoinLink": "https://localhost:9091/user/landing/DPH42JR5"
        }"#;
        let created: CreatedSession = serde_json::from_str(json).unwrap();
        assert!(created.success);
        assert_eq!(created.session_id, 212);
        assert!(created.join_link.unwrap().ends_with("DPH42JR5"));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = ApiClient::new("https://localhost:9091/", true).unwrap();
        assert_eq!(client.url("/api/host/albums"), "https://localhost:9091/api/host/albums");
    }
}
