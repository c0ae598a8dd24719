#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use open_notebook::app::App;
use open_notebook::config::Config;
use open_notebook::error::ProviderError;
use open_notebook::models::MessageRole;
use open_notebook::providers::{
    Backend, Capability, ChatMessage, ChatResponse, ModelTarget, ProviderRegistry,
    ProviderRequest, ProviderResponse, RetryPolicy, Role, RoleBinding,
};
use open_notebook::store::SqliteStore;

/// Words the keyword embedder knows about, one vector dimension each.
pub const VOCAB: &[&str] = &["alpha", "bravo", "charlie", "zebra", "moon", "soil"];

/// Deterministic embedding: 1.0 for each vocabulary word present, plus a
/// small constant so no vector is all zeros.
pub fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v: Vec<f32> = VOCAB
        .iter()
        .map(|w| if lower.contains(w) { 1.0 } else { 0.0 })
        .collect();
    v.push(0.05);
    v
}

/// Embedding backend that records every batch it is sent. A gate can hold
/// calls until the test releases them.
pub struct KeywordEmbedder {
    name: String,
    pub batches: Mutex<Vec<Vec<String>>>,
    gate: Option<Arc<Notify>>,
    pub entered: Arc<Notify>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            batches: Mutex::new(Vec::new()),
            gate: None,
            entered: Arc::new(Notify::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn gated(name: &str, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(name)
        }
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for KeywordEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Embed]
    }

    async fn invoke(
        &self,
        _model: &str,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let ProviderRequest::Embed(req) = request else {
            panic!("unexpected request {:?}", request.capability());
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            // Queries (single input) are never held.
            if req.inputs.len() > 1 {
                self.entered.notify_one();
                gate.notified().await;
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(req.inputs.clone());
        Ok(ProviderResponse::Embed(
            req.inputs.iter().map(|t| keyword_vector(t)).collect(),
        ))
    }
}

type ChatScript = dyn Fn(&[ChatMessage]) -> Result<String, ProviderError> + Send + Sync;

/// Chat backend whose replies come from a closure over the request.
pub struct ScriptedChat {
    name: String,
    script: Box<ChatScript>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
    gate: Option<Arc<Notify>>,
    pub entered: Arc<Notify>,
}

impl ScriptedChat {
    pub fn new(
        name: &str,
        script: impl Fn(&[ChatMessage]) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            gate: None,
            entered: Arc::new(Notify::new()),
        }
    }

    /// Every call waits for `gate` after it is counted.
    pub fn gated(
        name: &str,
        gate: Arc<Notify>,
        script: impl Fn(&[ChatMessage]) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(name, script)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedChat {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Chat]
    }

    async fn invoke(
        &self,
        _model: &str,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let ProviderRequest::Chat(req) = request else {
            panic!("unexpected request {:?}", request.capability());
        };
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(req.messages.clone());
        if let Some(gate) = &self.gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        let text = (self.script)(&req.messages)?;
        Ok(ProviderResponse::Chat(ChatResponse {
            text,
            truncated: false,
        }))
    }
}

/// The last user message of a chat request.
pub fn last_user(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// Answer by citing the first passage that mentions `word`.
pub fn cite_passage_with(word: &'static str) -> impl Fn(&[ChatMessage]) -> Result<String, ProviderError> {
    move |messages| {
        let prompt = last_user(messages);
        let mut current = None;
        for line in prompt.lines() {
            if let Some(rest) = line.strip_prefix('[') {
                if let Some((n, _)) = rest.split_once(']') {
                    if let Ok(n) = n.parse::<usize>() {
                        current = Some(n);
                    }
                }
            }
            if line.to_lowercase().contains(word) {
                if let Some(n) = current {
                    return Ok(format!("According to the notebook, {} [{}].", word, n));
                }
            }
        }
        Ok("The notebook does not cover this.".to_string())
    }
}

pub struct TestApp {
    pub _tmp: TempDir,
    pub app: App,
    pub embedder: Arc<KeywordEmbedder>,
    pub chat: Arc<ScriptedChat>,
}

/// Default configuration pointed at a temporary database.
pub fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.db.path = tmp.path().join("notebook.sqlite");
    config
}

/// An app with a keyword embedder on `embed:kw-1` and `chat` on
/// `chat:scripted`.
pub async fn test_app(config: Config, tmp: TempDir, embedder: KeywordEmbedder, chat: ScriptedChat) -> TestApp {
    test_app_with(config, tmp, embedder, chat, Vec::new()).await
}

/// Like [`test_app`], with more backends registered alongside.
pub async fn test_app_with(
    config: Config,
    tmp: TempDir,
    embedder: KeywordEmbedder,
    chat: ScriptedChat,
    extra: Vec<Arc<dyn Backend>>,
) -> TestApp {
    let embedder = Arc::new(embedder);
    let chat = Arc::new(chat);
    let mut registry = ProviderRegistry::new(RetryPolicy::immediate(0));
    registry.register_backend(embedder.clone());
    registry.register_backend(chat.clone());
    for backend in extra {
        registry.register_backend(backend);
    }
    registry
        .set_role(
            Role::Embedding,
            RoleBinding::new(ModelTarget::new("embed", "kw-1")),
        )
        .unwrap();
    registry
        .set_role(Role::Chat, RoleBinding::new(ModelTarget::new("chat", "scripted")))
        .unwrap();

    let store = SqliteStore::open(&config).await.unwrap();
    let app = App::assemble(config, store, registry).await.unwrap();
    TestApp {
        _tmp: tmp,
        app,
        embedder,
        chat,
    }
}

/// Three paragraphs; only the second mentions zebras. With 1000/100
/// chunking each paragraph lands in its own chunk.
pub fn three_paragraphs() -> String {
    let first = "alpha ".repeat(150);
    let second = format!("{}zebras graze at dawn. {}", "bravo ".repeat(70), "bravo ".repeat(70));
    let third = "charlie ".repeat(110);
    format!("{}\n\n{}\n\n{}", first.trim_end(), second.trim_end(), third.trim_end())
}
