use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{LazyLock, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

static FINAL_CHANNEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<\|channel\|>\s*final\s*<\|message\|>(.*?)(?:<\|return\|>|<\|end\|>|$)")
        .expect("valid channel regex")
});

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<\|(?:start|channel|message|return|end|constrain|call)\|>").expect("valid marker regex")
});

const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Maps a user-facing alias to the id the service assigned to the loaded model.
#[async_trait]
pub trait RuntimeResolver: Send + Sync {
    async fn resolve_runtime_id(&self, alias: &str, cancel: &CancellationToken) -> Option<String>;
}

/// The HTTP side of the inference service, as the supervisor needs it.
#[async_trait]
pub trait ServiceApi: Send + Sync {
    fn set_base_url(&self, url: Option<String>);

    fn base_url(&self) -> Option<String>;

    /// `GET <base>/v1/models`, returning the listed ids.
    async fn list_model_ids(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RelayError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: String,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

pub struct ChatRelay {
    client: reqwest::Client,
    base_url: RwLock<Option<String>>,
    chat_timeout: Duration,
    max_tokens: u32,
}

impl ChatRelay {
    pub fn new(chat_timeout: Duration, max_tokens: u32) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("[chat] falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            base_url: RwLock::new(None),
            chat_timeout,
            max_tokens,
        }
    }

    /// Send the whole history and return the sanitized reply text.
    pub async fn send_chat(
        &self,
        resolver: &dyn RuntimeResolver,
        alias: &str,
        history: &[ChatMessage],
        temperature: f32,
        cancel: &CancellationToken,
    ) -> Result<String, RelayError> {
        let base = self.base_url().ok_or(RelayError::NoEndpoint)?;

        // Some backends accept the alias directly, so an unresolved alias is still worth sending.
        let model = match resolver.resolve_runtime_id(alias, cancel).await {
            Some(id) => id,
            None => {
                log::info!("[chat] no runtime id for '{}', sending the alias", alias);
                alias.to_string()
            }
        };
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let url = format!("{}/v1/chat/completions", base);
        let body = ChatRequest {
            model,
            messages: history,
            temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };
        log::debug!(
            "[chat] POST {} model={} messages={}",
            url,
            body.model,
            history.len()
        );

        let request = async {
            let resp = self
                .client
                .post(&url)
                .timeout(self.chat_timeout)
                .json(&body)
                .send()
                .await
                .map_err(classify_send_error)?;
            let status = resp.status();
            let text = resp.text().await.map_err(classify_body_error)?;
            if !status.is_success() {
                return Err(RelayError::Http {
                    status: status.as_u16(),
                    body: truncate(&text, MAX_ERROR_BODY),
                });
            }
            let value: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
            let raw = extract_reply(&value).ok_or(RelayError::EmptyReply)?;
            let reply = sanitize_reply(&raw);
            if reply.is_empty() {
                return Err(RelayError::EmptyReply);
            }
            Ok(reply)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            r = request => r,
        }
    }
}

#[async_trait]
impl ServiceApi for ChatRelay {
    fn set_base_url(&self, url: Option<String>) {
        let url = url.map(|u| u.trim_end_matches('/').to_string());
        *self.base_url.write().unwrap_or_else(|p| p.into_inner()) = url;
    }

    fn base_url(&self) -> Option<String> {
        self.base_url
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn list_model_ids(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, RelayError> {
        let base = self.base_url().ok_or(RelayError::NoEndpoint)?;
        let url = format!("{}/v1/models", base);

        let request = async {
            let resp = self
                .client
                .get(&url)
                .timeout(timeout)
                .send()
                .await
                .map_err(classify_send_error)?;
            let status = resp.status();
            let text = resp.text().await.map_err(classify_body_error)?;
            if !status.is_success() {
                return Err(RelayError::Http {
                    status: status.as_u16(),
                    body: truncate(&text, MAX_ERROR_BODY),
                });
            }
            let value: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
            Ok(model_ids(&value))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            r = request => r,
        }
    }
}

fn model_ids(value: &serde_json::Value) -> Vec<String> {
    value
        .get("data")
        .and_then(|d| d.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn truncate(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

/// Errors raised before any response body arrived.
fn classify_send_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout
    } else if e.is_body() || e.is_decode() {
        RelayError::Interrupted(e.to_string())
    } else {
        RelayError::Connection(e.to_string())
    }
}

/// Errors raised while the body was being read: the connection was up, so
/// anything but a timeout is an interruption.
fn classify_body_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Timeout
    } else {
        RelayError::Interrupted(e.to_string())
    }
}

/// Reply text of the first choice, falling back to the streaming-style
/// `delta.content` some providers fill even when streaming is off.
pub fn extract_reply(value: &serde_json::Value) -> Option<String> {
    let choice = value.get("choices")?.get(0)?;
    let non_empty = |v: Option<&serde_json::Value>| {
        v.and_then(|c| c.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    };
    non_empty(choice.get("message").and_then(|m| m.get("content")))
        .or_else(|| non_empty(choice.get("delta").and_then(|d| d.get("content"))))
}

/// Keep only the `final` channel of channel-delimited replies.
pub fn sanitize_reply(raw: &str) -> String {
    if !raw.contains("<|") {
        return raw.trim().to_string();
    }
    if let Some(caps) = FINAL_CHANNEL_RE.captures(raw) {
        return caps[1].trim().to_string();
    }
    MARKER_RE.replace_all(raw, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct FixedResolver(Option<String>);

    #[async_trait]
    impl RuntimeResolver for FixedResolver {
        async fn resolve_runtime_id(&self, _alias: &str, _cancel: &CancellationToken) -> Option<String> {
            self.0.clone()
        }
    }

    /// Accept one connection, capture the request, answer with `response` verbatim.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let len = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let l = l.to_ascii_lowercase();
                            l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + len {
                        break;
                    }
                }
            }
            sock.write_all(response.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
            String::from_utf8_lossy(&buf).to_string()
        });
        (base, handle)
    }

    fn http_ok(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    fn history() -> Vec<ChatMessage> {
        vec![
            ChatMessage::new("system", "Be brief."),
            ChatMessage::new("user", "What is 2+2?"),
        ]
    }

    // ── sanitize ──

    #[test]
    fn test_sanitize_final_channel() {
        let raw = "<|channel|>analysis<|message|>thinking...<|channel|>final<|message|>The answer is 4.<|return|>";
        assert_eq!(sanitize_reply(raw), "The answer is 4.");
        let raw = "<|channel|>final<|message|> Paris <|end|><|start|>assistant";
        assert_eq!(sanitize_reply(raw), "Paris");
        let raw = "<|channel|>final<|message|>unterminated answer";
        assert_eq!(sanitize_reply(raw), "unterminated answer");
    }

    #[test]
    fn test_sanitize_strips_markers_without_final() {
        let raw = "<|start|>assistant<|message|>Hello there<|end|>";
        assert_eq!(sanitize_reply(raw), "assistantHello there");
    }

    #[test]
    fn test_sanitize_plain_text_is_trimmed() {
        assert_eq!(sanitize_reply("  plain answer \n"), "plain answer");
        assert_eq!(sanitize_reply("a <| b"), "a <| b");
    }

    // ── response parsing ──

    #[test]
    fn test_extract_reply_message_then_delta() {
        let v = json!({ "choices": [{ "message": { "role": "assistant", "content": "hi" } }] });
        assert_eq!(extract_reply(&v).as_deref(), Some("hi"));
        let v = json!({ "choices": [{ "message": { "content": "" }, "delta": { "content": "from delta" } }] });
        assert_eq!(extract_reply(&v).as_deref(), Some("from delta"));
        let v = json!({ "choices": [] });
        assert_eq!(extract_reply(&v), None);
        assert_eq!(extract_reply(&json!({ "error": "x" })), None);
    }

    #[test]
    fn test_model_ids() {
        let v = json!({ "object": "list", "data": [{ "id": "Phi-4-mini-instruct-generic-cpu" }, { "name": "x" }] });
        assert_eq!(model_ids(&v), vec!["Phi-4-mini-instruct-generic-cpu"]);
        assert!(model_ids(&json!({})).is_empty());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let relay = ChatRelay::new(Duration::from_secs(5), 64);
        relay.set_base_url(Some("http://127.0.0.1:5273/".into()));
        assert_eq!(relay.base_url().as_deref(), Some("http://127.0.0.1:5273"));
        relay.set_base_url(None);
        assert_eq!(relay.base_url(), None);
    }

    // ── requests ──

    #[tokio::test]
    async fn test_send_chat_without_endpoint() {
        let relay = ChatRelay::new(Duration::from_secs(5), 64);
        let err = relay
            .send_chat(&FixedResolver(None), "phi-4", &history(), 0.2, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::NoEndpoint);
    }

    #[tokio::test]
    async fn test_send_chat_uses_runtime_id_and_sanitizes() {
        let reply = json!({ "choices": [{ "message": { "content": "<|channel|>final<|message|>4<|return|>" } }] });
        let (base, server) = serve_once(http_ok(&reply.to_string())).await;
        let relay = ChatRelay::new(Duration::from_secs(10), 128);
        relay.set_base_url(Some(base));

        let resolver = FixedResolver(Some("Phi-4-mini-instruct-generic-cpu".into()));
        let text = relay
            .send_chat(&resolver, "phi-4-mini", &history(), 0.2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "4");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        let body: serde_json::Value = serde_json::from_str(&request[request.find("\r\n\r\n").unwrap() + 4..]).unwrap();
        assert_eq!(body["model"], "Phi-4-mini-instruct-generic-cpu");
        assert_eq!(body["stream"], false);
        assert_eq!(body["max_tokens"], 128);
        assert_eq!(body["messages"][1]["content"], "What is 2+2?");
    }

    #[tokio::test]
    async fn test_send_chat_falls_back_to_alias() {
        let reply = json!({ "choices": [{ "delta": { "content": "ok" } }] });
        let (base, server) = serve_once(http_ok(&reply.to_string())).await;
        let relay = ChatRelay::new(Duration::from_secs(10), 128);
        relay.set_base_url(Some(base));

        let text = relay
            .send_chat(&FixedResolver(None), "qwen2.5-0.5b", &history(), 0.7, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "ok");
        let request = server.await.unwrap();
        assert!(request.contains("\"model\":\"qwen2.5-0.5b\""));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let response = "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom".to_string();
        let (base, _server) = serve_once(response).await;
        let relay = ChatRelay::new(Duration::from_secs(10), 128);
        relay.set_base_url(Some(base));
        let err = relay
            .send_chat(&FixedResolver(None), "phi-4", &history(), 0.7, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Http { status: 500, body: "boom".into() });
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let relay = ChatRelay::new(Duration::from_secs(10), 128);
        relay.set_base_url(Some(format!("http://127.0.0.1:{}", port)));
        let err = relay
            .send_chat(&FixedResolver(None), "phi-4", &history(), 0.7, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_truncated_body_is_interruption() {
        let response = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 500\r\nConnection: close\r\n\r\n{\"choices\":".to_string();
        let (base, _server) = serve_once(response).await;
        let relay = ChatRelay::new(Duration::from_secs(10), 128);
        relay.set_base_url(Some(base));
        let err = relay
            .send_chat(&FixedResolver(None), "phi-4", &history(), 0.7, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Interrupted(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let relay = ChatRelay::new(Duration::from_millis(300), 128);
        relay.set_base_url(Some(base));
        let err = relay
            .send_chat(&FixedResolver(None), "phi-4", &history(), 0.7, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Timeout);
    }

    #[tokio::test]
    async fn test_cancel_aborts_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        let relay = ChatRelay::new(Duration::from_secs(60), 128);
        relay.set_base_url(Some(base));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = relay
            .send_chat(&FixedResolver(None), "phi-4", &history(), 0.7, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_list_model_ids() {
        let body = json!({ "data": [{ "id": "qwen2.5-0.5b-instruct-generic-gpu" }] }).to_string();
        let (base, server) = serve_once(http_ok(&body)).await;
        let relay = ChatRelay::new(Duration::from_secs(10), 128);
        relay.set_base_url(Some(base));
        let ids = relay
            .list_model_ids(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids, vec!["qwen2.5-0.5b-instruct-generic-gpu"]);
        assert!(server.await.unwrap().starts_with("GET /v1/models"));
    }
}
