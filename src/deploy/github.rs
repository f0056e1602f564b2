//! GitHub REST client for status comments, authenticated as a GitHub App.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::progress::{CommentPublisher, CommentTarget};

/// Tokens this close to expiry are refreshed before use.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iat: u64,
    exp: u64,
    iss: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Serialize)]
struct CommentRequest<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    id: i64,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct GitHubClient {
    client: reqwest::Client,
    app_id: u64,
    key: EncodingKey,
    api_url: String,
    token_cache: RwLock<HashMap<i64, CachedToken>>,
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key_pem: &str, api_url: &str) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .context("Failed to parse GitHub App private key")?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("prdeploy/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            app_id,
            key,
            api_url: api_url.trim_end_matches('/').to_string(),
            token_cache: RwLock::new(HashMap::new()),
        })
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();
        let claims = GitHubAppClaims {
            iat: now - 60,
            exp: now + 600,
            iss: self.app_id,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key).context("Failed to encode JWT")
    }

    async fn installation_token(&self, installation_id: i64) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.get(&installation_id)
                && (cached.expires_at - Utc::now()).num_seconds() > TOKEN_REFRESH_MARGIN_SECS
            {
                return Ok(cached.token.clone());
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );
        info!(installation_id, "requesting installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .context("Failed to send installation token request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(installation_id, %status, "installation token request failed");
            return Err(anyhow!("GitHub App token request failed: {} - {}", status, text));
        }

        let body: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;
        let expires_at = DateTime::parse_from_rfc3339(&body.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);

        self.token_cache.write().await.insert(
            installation_id,
            CachedToken {
                token: body.token.clone(),
                expires_at,
            },
        );
        Ok(body.token)
    }

    async fn send_comment(
        &self,
        request: reqwest::RequestBuilder,
        installation_id: i64,
        body: &str,
    ) -> Result<i64> {
        let token = self.installation_token(installation_id).await?;
        let response = request
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&CommentRequest { body })
            .send()
            .await
            .context("Failed to send comment request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("GitHub API error: {} - {}", status, text));
        }
        let comment: CommentResponse = response
            .json()
            .await
            .context("Failed to parse comment response")?;
        Ok(comment.id)
    }
}

#[async_trait]
impl CommentPublisher for GitHubClient {
    async fn create(&self, target: &CommentTarget, body: &str) -> Result<i64> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.api_url, target.owner, target.repo, target.pr_number
        );
        let id = self
            .send_comment(self.client.post(&url), target.installation_id, body)
            .await
            .with_context(|| {
                format!(
                    "Failed to comment on {}/{}#{}",
                    target.owner, target.repo, target.pr_number
                )
            })?;
        debug!(comment_id = id, "comment created");
        Ok(id)
    }

    async fn edit(&self, target: &CommentTarget, comment_id: i64, body: &str) -> Result<i64> {
        let url = format!(
            "{}/repos/{}/{}/issues/comments/{}",
            self.api_url, target.owner, target.repo, comment_id
        );
        self.send_comment(self.client.patch(&url), target.installation_id, body)
            .await
            .with_context(|| format!("Failed to edit comment {}", comment_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{patch, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};

    const TEST_KEY: &str = include_str!("../../tests/fixtures/test_app_key.pem");

    #[derive(Clone)]
    struct MockGitHub {
        token_requests: Arc<AtomicUsize>,
        token_ttl_secs: i64,
        bodies: Arc<std::sync::Mutex<Vec<String>>>,
    }

    async fn access_token(State(mock): State<MockGitHub>, headers: HeaderMap) -> Json<Value> {
        assert!(headers["authorization"].to_str().unwrap().starts_with("Bearer ey"));
        let n = mock.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
        let expires = Utc::now() + chrono::Duration::seconds(mock.token_ttl_secs);
        Json(json!({ "token": format!("tok-{}", n), "expires_at": expires.to_rfc3339() }))
    }

    async fn create_comment(
        State(mock): State<MockGitHub>,
        Path((owner, repo, number)): Path<(String, String, i64)>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        assert_eq!((owner.as_str(), repo.as_str(), number), ("acme", "web", 7));
        if !headers["authorization"].to_str().unwrap().starts_with("Bearer tok-") {
            return (StatusCode::UNAUTHORIZED, Json(json!({})));
        }
        mock.bodies.lock().unwrap().push(body["body"].as_str().unwrap().to_string());
        (StatusCode::CREATED, Json(json!({ "id": 555 })))
    }

    async fn edit_comment(
        State(mock): State<MockGitHub>,
        Path((_owner, _repo, id)): Path<(String, String, i64)>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        mock.bodies.lock().unwrap().push(body["body"].as_str().unwrap().to_string());
        Json(json!({ "id": id }))
    }

    async fn spawn_mock(token_ttl_secs: i64) -> (String, MockGitHub) {
        let mock = MockGitHub {
            token_requests: Arc::new(AtomicUsize::new(0)),
            token_ttl_secs,
            bodies: Arc::new(std::sync::Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/app/installations/{id}/access_tokens", post(access_token))
            .route("/repos/{owner}/{repo}/issues/{number}/comments", post(create_comment))
            .route("/repos/{owner}/{repo}/issues/comments/{id}", patch(edit_comment))
            .with_state(mock.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), mock)
    }

    fn target() -> CommentTarget {
        CommentTarget {
            installation_id: 1234,
            owner: "acme".into(),
            repo: "web".into(),
            pr_number: 7,
        }
    }

    #[test]
    fn test_invalid_private_key_is_rejected() {
        let err = GitHubClient::new(1, "not a pem", "https://api.github.com").err().unwrap();
        assert!(err.to_string().contains("private key"));
    }

    #[test]
    fn test_jwt_has_three_segments() {
        let client = GitHubClient::new(42, TEST_KEY, "https://api.github.com/").unwrap();
        assert_eq!(client.api_url, "https://api.github.com");
        let jwt = client.generate_jwt().unwrap();
        assert_eq!(jwt.split('.').count(), 3);
    }

    #[tokio::test]
    async fn test_create_then_edit_reuses_cached_token() {
        let (url, mock) = spawn_mock(3600).await;
        let client = GitHubClient::new(42, TEST_KEY, &url).unwrap();

        let id = client.create(&target(), "first").await.unwrap();
        assert_eq!(id, 555);
        let id = client.edit(&target(), id, "second").await.unwrap();
        assert_eq!(id, 555);

        assert_eq!(mock.token_requests.load(Ordering::SeqCst), 1);
        assert_eq!(*mock.bodies.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_token_near_expiry_is_refreshed() {
        let (url, mock) = spawn_mock(120).await;
        let client = GitHubClient::new(42, TEST_KEY, &url).unwrap();

        client.create(&target(), "a").await.unwrap();
        client.edit(&target(), 555, "b").await.unwrap();

        assert_eq!(mock.token_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_api_error_is_surfaced() {
        let (url, _mock) = spawn_mock(3600).await;
        let client = GitHubClient::new(42, TEST_KEY, &url).unwrap();
        let mut t = target();
        t.repo = "missing".into();
        // Unknown route on the mock: 404 for the comment call.
        t.owner = "acme/extra".into();
        let err = client.create(&t, "x").await.unwrap_err();
        assert!(format!("{:#}", err).contains("404"));
    }
}
