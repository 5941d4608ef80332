//! HTTP client for the remote attendance ledger.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ApiError, Ledger};
use crate::models::{
    CheckInAck, EventId, PartyCreated, PartyJoined, PartySnapshot, RankingEntry, Streak,
    TodayCheckin,
};
use crate::party::PartyCode;

/// Header carrying the event's idempotency key.
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Ledger client over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct LedgerClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl LedgerClient {
    /// Create a client for `base_url`. Retries are left to the sync
    /// coordinator; `timeout` bounds each individual request.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new client with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    /// Append `segments` to the base URL, percent-encoding each one so ids
    /// cannot add path components or a query.
    fn url(&self, segments: &[&str]) -> Result<String, ApiError> {
        let invalid = || ApiError::Validation(format!("Invalid ledger URL: {}", self.base_url));
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url.to_string())
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ApiError::Validation(format!("Invalid session token: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    fn send_error(e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::NetworkError(e)
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response, url: &str) -> Result<T, ApiError> {
        let text = response.text().await.map_err(Self::send_error)?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", url, e)))
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ApiError> {
        let url = self.url(segments)?;
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await
            .map_err(Self::send_error)?;

        let response = Self::check_response(response).await?;
        Self::parse(response, &url).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        segments: &[&str],
        key: EventId,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.url(segments)?;
        debug!(url = %url, key = %key, "POST");
        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .header(IDEMPOTENCY_HEADER, key.to_string())
            .json(body)
            .send()
            .await
            .map_err(Self::send_error)?;

        let response = Self::check_response(response).await?;
        Self::parse(response, &url).await
    }
}

#[async_trait]
impl Ledger for LedgerClient {
    async fn check_in(&self, user_id: &str, key: EventId) -> Result<CheckInAck, ApiError> {
        self.post(&["checkins"], key, &json!({ "userId": user_id })).await
    }

    async fn party_create(
        &self,
        user_id: &str,
        key: EventId,
        proposed_code: Option<&PartyCode>,
    ) -> Result<PartyCreated, ApiError> {
        let body = json!({
            "userId": user_id,
            "proposedCode": proposed_code.map(PartyCode::as_str),
        });
        self.post(&["parties"], key, &body).await
    }

    async fn party_join(
        &self,
        user_id: &str,
        code: &PartyCode,
        key: EventId,
    ) -> Result<PartyJoined, ApiError> {
        let body = json!({ "userId": user_id, "code": code.as_str() });
        self.post(&["parties", "join"], key, &body).await
    }

    async fn today_checkins(&self) -> Result<Vec<TodayCheckin>, ApiError> {
        self.get(&["checkins", "today"]).await
    }

    async fn weekly_ranking(&self) -> Result<Vec<RankingEntry>, ApiError> {
        self.get(&["rankings", "weekly"]).await
    }

    async fn streak(&self, user_id: &str) -> Result<Streak, ApiError> {
        self.get(&["users", user_id, "streak"]).await
    }

    async fn party(&self, party_id: &str) -> Result<PartySnapshot, ApiError> {
        self.get(&["parties", party_id]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_cleanly() {
        let client = LedgerClient::new("https://ledger.test/v1/", Duration::from_secs(10)).unwrap();
        assert_eq!(client.url(&["checkins"]).unwrap(), "https://ledger.test/v1/checkins");
        assert_eq!(
            client.url(&["parties", "p1"]).unwrap(),
            "https://ledger.test/v1/parties/p1"
        );

        let bare = LedgerClient::new("https://ledger.test", Duration::from_secs(10)).unwrap();
        assert_eq!(bare.url(&["rankings", "weekly"]).unwrap(), "https://ledger.test/rankings/weekly");
    }

    #[test]
    fn test_ids_cannot_escape_their_segment() {
        let client = LedgerClient::new("https://ledger.test/v1", Duration::from_secs(10)).unwrap();
        assert_eq!(
            client.url(&["users", "a/b?c", "streak"]).unwrap(),
            "https://ledger.test/v1/users/a%2Fb%3Fc/streak"
        );
        assert_eq!(
            client.url(&["parties", "../admin#x"]).unwrap(),
            "https://ledger.test/v1/parties/..%2Fadmin%23x"
        );
    }

    #[test]
    fn test_unparseable_base_url() {
        let client = LedgerClient::new("not a url", Duration::from_secs(10)).unwrap();
        assert!(matches!(client.url(&["checkins"]), Err(ApiError::Validation(_))));
    }

    #[test]
    fn test_token_sets_bearer_header() {
        let client = LedgerClient::new("https://ledger.test", Duration::from_secs(10)).unwrap();
        assert!(client.auth_headers().unwrap().is_empty());

        let authed = client.with_token("abc".to_string());
        let headers = authed.auth_headers().unwrap();
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer abc");
    }

    #[test]
    fn test_bad_token_is_rejected() {
        let client = LedgerClient::new("https://ledger.test", Duration::from_secs(10))
            .unwrap()
            .with_token("bad\ntoken".to_string());
        assert!(matches!(client.auth_headers(), Err(ApiError::Validation(_))));
    }
}
