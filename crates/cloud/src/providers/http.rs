//! Authenticated JSON client shared by the REST-backed providers.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::traits::ProviderError;

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Bearer-token JSON client rooted at a base URL.
#[derive(Clone)]
pub(crate) struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
    query: Vec<(String, String)>,
}

impl ApiClient {
    /// Client for `base_url` authenticating with `token`.
    pub(crate) fn new(base_url: &str, token: &str) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            query: Vec::new(),
        })
    }

    /// Append `key=value` to every request.
    #[must_use]
    pub(crate) fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        debug!(%method, url = %url, "API request");
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .query(&self.query)
    }

    /// Authenticated GET.
    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let response = self.request(Method::GET, path).send().await?;
        Self::handle_response(response).await
    }

    /// Authenticated GET returning the raw body.
    pub(crate) async fn get_text(&self, path: &str) -> Result<String, ProviderError> {
        let response = self.request(Method::GET, path).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(Self::error_for(status, text))
        }
    }

    /// Authenticated POST with a JSON body.
    pub(crate) async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.request(Method::POST, path).json(body).send().await?;
        Self::handle_response(response).await
    }

    /// Authenticated POST whose response body is ignored.
    pub(crate) async fn post_unit<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ProviderError> {
        let response = self.request(Method::POST, path).json(body).send().await?;
        Self::handle_empty(response).await
    }

    /// Authenticated PUT with a JSON body.
    pub(crate) async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.request(Method::PUT, path).json(body).send().await?;
        Self::handle_response(response).await
    }

    /// Authenticated PATCH with a JSON body.
    pub(crate) async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.request(Method::PATCH, path).json(body).send().await?;
        Self::handle_response(response).await
    }

    /// Authenticated DELETE. A 404 is reported as [`ProviderError::NotFound`].
    pub(crate) async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let response = self.request(Method::DELETE, path).send().await?;
        Self::handle_empty(response).await
    }

    async fn handle_empty(response: reqwest::Response) -> Result<(), ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(Self::error_for(status, text))
    }

    /// Map a response to a typed body or a provider error.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            })
        } else {
            Err(Self::error_for(status, text))
        }
    }

    fn error_for(status: StatusCode, text: String) -> ProviderError {
        match status {
            StatusCode::NOT_FOUND => ProviderError::NotFound(text),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(text),
            _ => ProviderError::Api {
                status: status.as_u16(),
                message: text,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/denied"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/boom"))
            .respond_with(ResponseTemplate::new(500).set_body_string("kaput"))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri(), "t").unwrap();
        let err = client.get::<serde_json::Value>("/missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = client.get::<serde_json::Value>("/denied").await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
        let err = client.delete("/boom").await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 500, ref message } if message == "kaput"));
    }

    #[tokio::test]
    async fn test_bearer_and_query_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/things"))
            .and(header("Authorization", "Bearer secret"))
            .and(query_param("region", "LON1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/", server.uri()), "secret")
            .unwrap()
            .with_query("region", "LON1");
        let body: serde_json::Value = client.get("/things").await.unwrap();
        assert_eq!(body["ok"], true);
    }
}
