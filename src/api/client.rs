use std::path::Path;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use crate::api::models::{
    normalize_history, upload_mime, Conversation, Message, MeResponse, PresenceSnapshot, ProfileUpdate,
    TokenResponse, UploadedFile, UserSummary,
};
use crate::error::ApiError;

const DM_HISTORY_LIMIT: u32 = 50;
const GROUP_HISTORY_LIMIT: u32 = 100;

/// REST calls the engine depends on. `ApiClient` is the real implementation;
/// anything else (tests, offline modes) can stand in for it.
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    async fn conversations(&self) -> Result<Vec<Conversation>, ApiError>;
    async fn dm_history(&self, other_user_id: &str) -> Result<Vec<Message>, ApiError>;
    async fn group_history(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError>;
    async fn create_dm_conversation(&self, email: &str) -> Result<Conversation, ApiError>;
    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), ApiError>;
    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, ApiError>;
    /// Ids of users with a live connection.
    async fn presence(&self) -> Result<Vec<String>, ApiError>;
    async fn upload_file(&self, path: &Path) -> Result<UploadedFile, ApiError>;
}

#[derive(Clone)]
pub struct ApiClient {
    pub http: HttpClient,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.set_token(token);
        self
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token.filter(|t| !t.is_empty());
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.header("Authorization", format!("Bearer {}", t)),
            None => req,
        }
    }

    // 401s only invalidate the session when they come from identity endpoints.
    fn is_critical(path: &str) -> bool {
        path == "/me" || path.contains("/auth/")
    }

    async fn execute(&self, path: &str, req: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let resp = self.with_auth(req).send().await?;
        let status = resp.status();
        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        let body = if is_json {
            resp.json::<Value>().await?
        } else {
            Value::String(resp.text().await?)
        };

        if status.is_success() {
            return Ok(body);
        }
        if status.as_u16() == 401 {
            if Self::is_critical(path) {
                warn!("Critical auth endpoint {} returned 401", path);
                return Err(ApiError::Unauthorized { endpoint: path.to_string() });
            }
            warn!("{} returned 401; keeping session", path);
        }
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| body.as_str().filter(|s| !s.is_empty()).map(|s| s.trim().to_string()))
            .unwrap_or_else(|| format!("HTTP {}", status));
        Err(ApiError::Http { status: status.as_u16(), message })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
        let req = self.http.get(self.endpoint(path)).query(query);
        self.execute(path, req).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        let req = self.http.post(self.endpoint(path)).json(&body);
        self.execute(path, req).await
    }

    async fn put(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        let req = self.http.put(self.endpoint(path)).json(&body);
        self.execute(path, req).await
    }

    /// Whether the server answers at all.
    pub async fn health_check(&self) -> Result<(), ApiError> {
        self.get("/", &[]).await?;
        Ok(())
    }

    pub async fn request_otp(&self, email: &str) -> Result<(), ApiError> {
        self.post("/auth/request-otp", json!({ "email": email })).await?;
        Ok(())
    }

    pub async fn verify_otp(
        &self,
        email: &str,
        code: &str,
        name: Option<&str>,
    ) -> Result<TokenResponse, ApiError> {
        let body = self
            .post("/auth/verify-otp", json!({ "email": email, "code": code, "name": name }))
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn me(&self) -> Result<MeResponse, ApiError> {
        if self.token.is_none() {
            return Err(ApiError::MissingToken);
        }
        let body = self.get("/me", &[]).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn update_me(&self, update: &ProfileUpdate) -> Result<MeResponse, ApiError> {
        if self.token.is_none() {
            return Err(ApiError::MissingToken);
        }
        let body = self.put("/me", serde_json::to_value(update)?).await?;
        Ok(serde_json::from_value(body)?)
    }
}

#[async_trait]
impl ChatDirectory for ApiClient {
    async fn conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        debug!("Fetching conversations");
        let body = self.get("/conversations", &[]).await?;
        if body.is_null() {
            return Ok(Vec::new());
        }
        let list: Vec<Conversation> = serde_json::from_value(body)?;
        debug!("Loaded {} conversations", list.len());
        Ok(list)
    }

    async fn dm_history(&self, other_user_id: &str) -> Result<Vec<Message>, ApiError> {
        let body = self
            .get(
                "/messages/dm",
                &[
                    ("user_id", other_user_id.to_string()),
                    ("limit", DM_HISTORY_LIMIT.to_string()),
                    ("offset", "0".to_string()),
                ],
            )
            .await?;
        Ok(normalize_history(body))
    }

    async fn group_history(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError> {
        let body = self
            .get(
                "/messages/group",
                &[
                    ("group_id", conversation_id.to_string()),
                    ("limit", GROUP_HISTORY_LIMIT.to_string()),
                ],
            )
            .await?;
        Ok(normalize_history(body))
    }

    async fn create_dm_conversation(&self, email: &str) -> Result<Conversation, ApiError> {
        debug!("Creating DM conversation with {}", email);
        let body = self.post("/conversations/dm", json!({ "userEmail": email })).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), ApiError> {
        let path = format!("/conversations/{}", conversation_id);
        let req = self.http.delete(self.endpoint(&path));
        self.execute(&path, req).await?;
        debug!("Deleted conversation {}", conversation_id);
        Ok(())
    }

    async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, ApiError> {
        let body = self.get("/users/search", &[("q", query.to_string())]).await?;
        if body.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(body)?)
    }

    async fn presence(&self) -> Result<Vec<String>, ApiError> {
        let body = self.get("/presence", &[]).await?;
        let snapshot: PresenceSnapshot = serde_json::from_value(body)?;
        Ok(snapshot.online)
    }

    async fn upload_file(&self, path: &Path) -> Result<UploadedFile, ApiError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ApiError::File {
            path: path.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        debug!("Uploading {} ({} bytes)", file_name, bytes.len());
        let part = Part::bytes(bytes)
            .mime_str(upload_mime(&file_name))?
            .file_name(file_name);
        let req = self.http.post(self.endpoint("/upload")).multipart(Form::new().part("file", part));
        let body = self.execute("/upload", req).await?;
        Ok(serde_json::from_value(body)?)
    }
}
