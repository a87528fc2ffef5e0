use chrono::{DateTime, Utc};
use log::debug;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::api::models::{Chat, ChatId, Message, MessageContent, MessagePayload, ServerId, TempId};
use crate::app::ClientConfig;
use crate::error::ApiError;

/// Server confirmation for one send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    #[serde(alias = "guid")]
    pub id: ServerId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

pub struct ApiClient {
    pub http: HttpClient,
    base_url: String,
    password: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, password: &str, timeout: Duration) -> Result<Self, ApiError> {
        let http = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: crate::utils::normalize_url(base_url),
            password: password.to_string(),
            token: None,
        })
    }

    pub fn from_config(cfg: &ClientConfig) -> Result<Self, ApiError> {
        let mut client = Self::new(&cfg.base_url, &cfg.password, cfg.request_timeout())?;
        client.token = cfg.token.clone();
        Ok(client)
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    fn base_api(base_url: &str) -> String {
        let trimmed = base_url.trim_end_matches('/');
        if trimmed.ends_with("/api") { trimmed.to_string() } else { format!("{}/api", trimmed) }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", Self::base_api(&self.base_url), path.trim_start_matches('/'))
    }

    fn with_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(t) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        if !self.password.is_empty() {
            req = req.header("password", &self.password);
        }
        req
    }

    /// Unwraps the `{status, message, data}` envelope; bare payloads pass through.
    fn unwrap_envelope(json: Value) -> Value {
        match json {
            Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or(Value::Null),
            other => other,
        }
    }

    async fn read(resp: reqwest::Response) -> Result<Value, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        let json: Value = resp.json().await?;
        Ok(Self::unwrap_envelope(json))
    }

    /// Try to reach the server using common ping endpoints.
    pub async fn ping(&self) -> Result<u16, ApiError> {
        let base_api = Self::base_api(&self.base_url);
        let candidates = [format!("{}/v1/ping", base_api), format!("{}/ping", base_api)];
        let mut last_err = None;
        for endpoint in candidates {
            match self.with_auth(self.http.get(&endpoint)).send().await {
                Ok(resp) => return Ok(resp.status().as_u16()),
                Err(e) => last_err = Some(ApiError::Http(e)),
            }
        }
        Err(last_err.unwrap_or(ApiError::MissingField("ping endpoint")))
    }

    pub async fn obtain_token(&self) -> Result<String, ApiError> {
        let base_api = Self::base_api(&self.base_url);
        let candidates = [
            format!("{}/v1/login", base_api),
            format!("{}/v1/auth", base_api),
        ];
        let mut last_err = ApiError::MissingField("token");
        for endpoint in candidates {
            let req = self.http.post(&endpoint).header("password", &self.password);
            let json = match req.send().await {
                Ok(resp) => match Self::read(resp).await {
                    Ok(json) => json,
                    Err(e) => {
                        last_err = e;
                        continue;
                    }
                },
                Err(e) => {
                    last_err = ApiError::Http(e);
                    continue;
                }
            };
            if let Some(tok) = json
                .get("token")
                .or_else(|| json.get("accessToken"))
                .and_then(|v| v.as_str())
            {
                return Ok(tok.to_string());
            }
            last_err = ApiError::MissingField("token");
        }
        Err(last_err)
    }

    /// Fetch the chat list. Returns the parsed chats and the raw JSON items for caching.
    pub async fn chats(&self, limit: usize) -> Result<(Vec<Chat>, Vec<Value>), ApiError> {
        let body = serde_json::json!({
            "limit": limit,
            "offset": 0,
            "with": ["lastMessage", "participants"],
            "sort": "lastmessage"
        });
        let resp = self
            .with_auth(self.http.post(self.endpoint("chat/query")))
            .json(&body)
            .send()
            .await?;
        let json = Self::read(resp).await?;
        let items = if let Some(arr) = json.as_array() {
            arr.clone()
        } else if let Some(arr) = json.get("chats").and_then(|v| v.as_array()) {
            arr.clone()
        } else {
            Vec::new()
        };
        let mut out = Vec::new();
        for item in &items {
            match serde_json::from_value::<Chat>(item.clone()) {
                Ok(chat) if !chat.id.0.is_empty() => out.push(chat),
                Ok(_) => {}
                Err(e) => debug!("skipping chat row: {}", e),
            }
        }
        Ok((out, items))
    }

    /// One page of history, newest last. `before` pages backwards from a known message.
    pub async fn history(
        &self,
        chat_id: &ChatId,
        before: Option<ServerId>,
        limit: usize,
    ) -> Result<Vec<Message>, ApiError> {
        let mut req = self
            .with_auth(self.http.get(self.endpoint(&format!("chat/{}/messages", chat_id))))
            .query(&[("limit", limit.to_string())]);
        if let Some(before) = before {
            req = req.query(&[("before", before.to_string())]);
        }
        let json = Self::read(req.send().await?).await?;
        let payloads: Vec<MessagePayload> = serde_json::from_value(json)?;
        let mut messages: Vec<Message> = payloads.into_iter().map(|p| p.into_message().0).collect();
        messages.sort_by_key(|m| (m.created_at, m.server_id()));
        Ok(messages)
    }

    pub async fn send_message(
        &self,
        chat_id: &ChatId,
        temp_id: TempId,
        content: &MessageContent,
        reply_to: Option<ServerId>,
    ) -> Result<SendReceipt, ApiError> {
        let body = serde_json::json!({
            "chatGuid": chat_id,
            "tempGuid": temp_id,
            "content": content,
            "replyTo": reply_to,
        });
        let resp = self
            .with_auth(self.http.post(self.endpoint("message/text")))
            .json(&body)
            .send()
            .await?;
        let json = Self::read(resp).await?;
        Ok(serde_json::from_value(json)?)
    }

    pub async fn edit_message(&self, id: ServerId, content: &MessageContent) -> Result<(), ApiError> {
        let body = serde_json::json!({ "content": content });
        let resp = self
            .with_auth(self.http.put(self.endpoint(&format!("message/{}", id))))
            .json(&body)
            .send()
            .await?;
        Self::read(resp).await.map(|_| ())
    }

    pub async fn delete_message(&self, id: ServerId) -> Result<(), ApiError> {
        let resp = self
            .with_auth(self.http.delete(self.endpoint(&format!("message/{}", id))))
            .send()
            .await?;
        Self::read(resp).await.map(|_| ())
    }

    /// Sets or clears (`None`) the caller's reaction.
    pub async fn react(&self, id: ServerId, emoji: Option<&str>) -> Result<(), ApiError> {
        let body = serde_json::json!({ "emoji": emoji });
        let resp = self
            .with_auth(self.http.post(self.endpoint(&format!("message/{}/react", id))))
            .json(&body)
            .send()
            .await?;
        Self::read(resp).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_api_appends_once() {
        assert_eq!(ApiClient::base_api("https://s.example/"), "https://s.example/api");
        assert_eq!(ApiClient::base_api("https://s.example/api"), "https://s.example/api");
    }

    #[test]
    fn endpoint_joins_paths() {
        let client = ApiClient::new("s.example", "pw", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint("/chat/query"), "https://s.example/api/v1/chat/query");
    }

    #[test]
    fn envelope_is_unwrapped() {
        let wrapped = serde_json::json!({"status": 200, "message": "ok", "data": {"id": 1}});
        assert_eq!(ApiClient::unwrap_envelope(wrapped), serde_json::json!({"id": 1}));
        let bare = serde_json::json!([1, 2]);
        assert_eq!(ApiClient::unwrap_envelope(bare.clone()), bare);
    }

    #[test]
    fn receipt_parses() {
        let r: SendReceipt =
            serde_json::from_value(serde_json::json!({"id": 1001, "createdAt": 1_700_000_000_000i64}))
                .unwrap();
        assert_eq!(r.id, ServerId(1001));
    }
}
