use serde_json::Value;
use std::time::Duration;

/// Default Ollama endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434";

/// Default chat model.
pub const DEFAULT_MODEL: &str = "llama3.2";

/// Configuration for the Ollama chat backend.
///
/// [`OllamaConfig::default()`] targets a local server; [`OllamaConfig::from_env()`]
/// lets `OLLAMA_HOST` and `OLLAMA_MODEL` override the defaults.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Ollama API endpoint (e.g., "http://localhost:11434").
    pub endpoint: String,

    /// Chat model name.
    pub model: String,

    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f64,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Request JSON format output from the model.
    pub json_mode: bool,

    /// Timeout for each HTTP request, on top of the client's own settings.
    pub timeout: Duration,

    /// Custom options merged into the Ollama options object.
    pub options: Option<Value>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            json_mode: false,
            timeout: Duration::from_secs(120),
            options: None,
        }
    }
}

impl OllamaConfig {
    /// Defaults, overridden by `OLLAMA_HOST` and `OLLAMA_MODEL` when set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = lookup("OLLAMA_HOST").filter(|h| !h.trim().is_empty()) {
            config.endpoint = normalize_host(&host);
        }
        if let Some(model) = lookup("OLLAMA_MODEL").filter(|m| !m.trim().is_empty()) {
            config.model = model;
        }
        config
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Extra Ollama options, e.g. `{"top_p": 0.9}`.
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }
}

/// `OLLAMA_HOST` is often given without a scheme (`127.0.0.1:11434`).
fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}
