//! OpenAI-compatible chat client with concurrency control, rate limiting,
//! backoff retry and cost tracking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::concurrency::{
    AdaptivePermit, ConcurrencyRegistry, CostLedger, CostRecord, CostSummary, Price, PriceTable,
    RetryPolicy, SemaphoreClosed, retry_with_backoff,
};

const GLOBAL_SEMAPHORE_KEY: &str = "__global__";
const DEFAULT_MODEL_CONCURRENCY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error(transparent)]
    Semaphore(#[from] SemaphoreClosed),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },
}

/// Catalog entry for one model key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Provider name -> model name as the provider's API spells it.
    #[serde(default)]
    pub api_models: HashMap<String, String>,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalog {
    #[serde(flatten)]
    entries: HashMap<String, ModelEntry>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, key: impl Into<String>, entry: ModelEntry) -> Self {
        self.entries.insert(key.into(), entry);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Resolve the provider-specific model name, falling back to the key.
    pub fn api_model(&self, key: &str, provider: &str) -> String {
        if let Some(entry) = self.entries.get(key) {
            if let Some(name) = entry.api_models.get(provider) {
                return name.clone();
            }
            warn!(model = key, provider, "model has no mapping for provider");
        }
        key.to_string()
    }

    pub fn concurrency(&self, key: &str) -> Option<usize> {
        self.entries
            .get(key)
            .map(|e| e.concurrency.unwrap_or(DEFAULT_MODEL_CONCURRENCY))
    }

    pub fn price_table(&self) -> PriceTable {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.price.map(|p| (k.clone(), p)))
            .fold(PriceTable::new(), |t, (k, p)| t.with_price(k, p))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub provider: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Bound shared by every call through the registry, regardless of model.
    pub global_concurrency: Option<usize>,
    pub use_model_concurrency: bool,
    /// Registry key of a sliding-window limiter to pass before each call.
    pub rate_limit_key: Option<String>,
    pub track_costs: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            provider: "openai".to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            global_concurrency: None,
            use_model_concurrency: true,
            rate_limit_key: None,
            track_costs: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<Value>,
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<Value>,
    pub cost: Option<CostRecord>,
    pub duration: Duration,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

pub struct ChatClient {
    http: reqwest::Client,
    config: ClientConfig,
    catalog: Arc<ModelCatalog>,
    prices: PriceTable,
    registry: Arc<ConcurrencyRegistry>,
    ledger: Arc<CostLedger>,
}

impl ChatClient {
    pub fn new(
        config: ClientConfig,
        catalog: Arc<ModelCatalog>,
        registry: Arc<ConcurrencyRegistry>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("task-harness/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let prices = catalog.price_table();
        Ok(Self {
            http,
            config,
            catalog,
            prices,
            registry,
            ledger: Arc::new(CostLedger::new()),
        })
    }

    pub fn ledger(&self) -> Arc<CostLedger> {
        self.ledger.clone()
    }

    pub fn cost_summary(&self) -> CostSummary {
        self.ledger.summary()
    }

    /// Send one chat completion, retrying with backoff on any failure.
    pub async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatCompletion, ClientError> {
        let label = format!("chat:{}", request.model);
        let attempts = self.config.retry.max_attempts.max(1);
        retry_with_backoff(&self.config.retry, &label, |_| self.attempt(request))
            .await
            .map_err(|last| {
                error!(model = %request.model, error = %last, "chat completion failed");
                ClientError::Exhausted {
                    attempts,
                    last: Box::new(last),
                }
            })
    }

    async fn attempt(&self, request: &ChatRequest) -> Result<ChatCompletion, ClientError> {
        // Held for the duration of the attempt, released in reverse order.
        let _permits = self.acquire_permits(&request.model).await?;
        if let Some(limiter) = self
            .config
            .rate_limit_key
            .as_deref()
            .and_then(|k| self.registry.limiter(k))
        {
            limiter.acquire().await;
        }

        let started = Instant::now();
        let body = self.build_body(request);
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        debug!(%url, model = %request.model, "sending chat completion");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let wire: WireResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Decode("response has no choices".into()))?;

        let cost = match (self.config.track_costs, wire.usage) {
            (true, Some(usage)) => {
                let record = self.prices.record(
                    &request.model,
                    &self.config.provider,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                );
                self.ledger.append(record.clone());
                Some(record)
            }
            _ => None,
        };

        Ok(ChatCompletion {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            cost,
            duration: started.elapsed(),
        })
    }

    async fn acquire_permits(&self, model: &str) -> Result<PermitStack, ClientError> {
        let mut stack = PermitStack::default();
        if let Some(limit) = self.config.global_concurrency {
            let sem = self.registry.semaphore(GLOBAL_SEMAPHORE_KEY, Some(limit));
            stack.push(sem.acquire().await?);
        }
        if self.config.use_model_concurrency {
            if let Some(limit) = self.catalog.concurrency(model) {
                let sem = self.registry.semaphore(model, Some(limit));
                stack.push(sem.acquire().await?);
            }
        }
        Ok(stack)
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let api_model = self.catalog.api_model(&request.model, &self.config.provider);
        let mut body = json!({
            "model": api_model,
            "messages": request.messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            // Newer reasoning models reject `max_tokens`.
            let key = if api_model.contains("gpt-5") {
                "max_completion_tokens"
            } else {
                "max_tokens"
            };
            body[key] = json!(max);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
        }
        if let Some(choice) = &request.tool_choice {
            body["tool_choice"] = choice.clone();
        }
        body
    }
}

/// Permits released last-acquired first.
#[derive(Default)]
struct PermitStack(Vec<AdaptivePermit>);

impl PermitStack {
    fn push(&mut self, permit: AdaptivePermit) {
        self.0.push(permit);
    }
}

impl Drop for PermitStack {
    fn drop(&mut self) {
        while let Some(p) = self.0.pop() {
            drop(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn catalog() -> ModelCatalog {
        ModelCatalog::new().with_model(
            "small",
            ModelEntry {
                api_models: [("openai".to_string(), "gpt-small-2025".to_string())].into(),
                price: Some(Price {
                    input_per_1k: 1.0,
                    output_per_1k: 2.0,
                }),
                concurrency: Some(2),
            },
        )
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(idx) = text.find("\r\n\r\n") {
                let len = text[..idx]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if buf.len() >= idx + 4 + len {
                    return text[idx + 4..].to_string();
                }
            }
        }
        String::new()
    }

    /// Serves `failures` 500s, then successful completions.
    async fn spawn_server(failures: usize) -> (String, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (hits2, bodies2) = (hits.clone(), bodies.clone());

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let body = read_request(&mut stream).await;
                bodies2.lock().unwrap().push(body);
                let n = hits2.fetch_add(1, Ordering::SeqCst);
                let (status, payload) = if n < failures {
                    ("500 Internal Server Error", r#"{"error":"overloaded"}"#.to_string())
                } else {
                    (
                        "200 OK",
                        r#"{"choices":[{"message":{"content":"hello"}}],"usage":{"prompt_tokens":1000,"completion_tokens":500}}"#
                            .to_string(),
                    )
                };
                let resp = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (format!("http://{addr}/v1"), hits, bodies)
    }

    fn client(base_url: String, attempts: u32) -> ChatClient {
        let config = ClientConfig {
            base_url,
            api_key: "sk-test".into(),
            retry: RetryPolicy::new(attempts, Duration::from_millis(10), Duration::from_millis(50)),
            global_concurrency: Some(4),
            ..Default::default()
        };
        ChatClient::new(config, Arc::new(catalog()), Arc::new(ConcurrencyRegistry::default())).unwrap()
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "small".into(),
            messages: vec![ChatMessage::new("user", "hi")],
            max_tokens: Some(64),
            ..Default::default()
        }
    }

    #[test]
    fn test_api_model_mapping() {
        let c = catalog();
        assert_eq!(c.api_model("small", "openai"), "gpt-small-2025");
        assert_eq!(c.api_model("small", "other"), "small");
        assert_eq!(c.api_model("unknown", "openai"), "unknown");
        assert_eq!(c.concurrency("small"), Some(2));
        assert_eq!(c.concurrency("unknown"), None);
    }

    #[tokio::test]
    async fn test_retries_then_records_cost() {
        let (url, hits, bodies) = spawn_server(1).await;
        let client = client(url, 3);

        let completion = client.chat_completion(&request()).await.unwrap();
        assert_eq!(completion.content.as_deref(), Some("hello"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let cost = completion.cost.unwrap();
        assert!((cost.total_cost - 2.0).abs() < 1e-9);
        assert_eq!(client.cost_summary().request_count, 1);

        let sent: Value = serde_json::from_str(&bodies.lock().unwrap()[0]).unwrap();
        assert_eq!(sent["model"], "gpt-small-2025");
        assert_eq!(sent["max_tokens"], 64);
    }

    #[tokio::test]
    async fn test_exhaustion_is_typed() {
        let (url, hits, _) = spawn_server(usize::MAX).await;
        let client = client(url, 2);

        let err = client.chat_completion(&request()).await.unwrap_err();
        match err {
            ClientError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, ClientError::Status { status: 500, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(client.cost_summary().request_count, 0);
    }

    #[tokio::test]
    async fn test_zero_attempt_policy_reports_one_attempt() {
        let (url, hits, _) = spawn_server(usize::MAX).await;
        let mut client = client(url, 1);
        client.config.retry = RetryPolicy {
            max_attempts: 0,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };

        match client.chat_completion(&request()).await.unwrap_err() {
            ClientError::Exhausted { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
