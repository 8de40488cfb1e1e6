use crate::{
    backend::ChatBackend,
    config::OllamaConfig,
    types::{Message, Role},
};
use anyhow::Context;
use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    FutureExt, Stream, StreamExt, TryFutureExt,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;

/// Chat backend for an Ollama-compatible `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    pub fn new(client: Client, config: OllamaConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    fn url(&self) -> String {
        format!("{}/api/chat", self.config.endpoint.trim_end_matches('/'))
    }

    /// Send a chat request, failing on non-2xx statuses.
    async fn send(&self, messages: &[Message], stream: bool) -> anyhow::Result<reqwest::Response> {
        let body = request_body(&self.config, messages, stream);
        let url = self.url();
        tracing::debug!(url = %url, model = %self.config.model, stream, "sending chat request");

        let resp = self
            .client
            .post(&url)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to connect to LLM at {}", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("LLM returned error {}: {}", status, text);
        }
        Ok(resp)
    }
}

impl ChatBackend for OllamaBackend {
    fn complete(&self, messages: Vec<Message>) -> BoxFuture<'_, anyhow::Result<String>> {
        async move {
            let resp = self.send(&messages, false).await?;
            let reply: ChatChunk = resp.json().await.context("Malformed chat response")?;
            reply.into_fragment().map(Option::unwrap_or_default)
        }
        .boxed()
    }

    fn complete_stream(&self, messages: Vec<Message>) -> BoxStream<'_, anyhow::Result<String>> {
        async move {
            let resp = self.send(&messages, true).await?;
            Ok::<_, anyhow::Error>(decode_stream(resp.bytes_stream().boxed()))
        }
        .try_flatten_stream()
        .boxed()
    }
}

/// Build the `/api/chat` request body.
fn request_body(config: &OllamaConfig, messages: &[Message], stream: bool) -> Value {
    let messages: Vec<Value> = messages
        .iter()
        .map(|m| json!({"role": wire_role(m.role), "content": m.content}))
        .collect();

    let mut body = json!({
        "model": config.model,
        "messages": messages,
        "stream": stream,
        "options": {
            "temperature": config.temperature,
            "num_predict": config.max_tokens,
        },
    });

    if config.json_mode {
        body["format"] = json!("json");
    }

    merge_custom_options(&mut body, config);
    body
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::Human => "user",
        Role::Ai => "assistant",
    }
}

/// Merge custom options into the body's options object.
fn merge_custom_options(body: &mut Value, config: &OllamaConfig) {
    if let Some(ref opts) = config.options {
        if let Some(options) = body["options"].as_object_mut() {
            if let Some(custom) = opts.as_object() {
                for (k, v) in custom {
                    options.insert(k.clone(), v.clone());
                }
            }
        }
    }
}

/// One chat response object; streaming sends one per line.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

impl ChatChunk {
    /// Text carried by this chunk, if any.
    fn into_fragment(self) -> anyhow::Result<Option<String>> {
        if let Some(error) = self.error {
            anyhow::bail!("LLM reported an error: {}", error);
        }
        Ok(self.message.map(|m| m.content))
    }
}

/// Splits a byte stream into newline-delimited JSON chunks.
///
/// Bytes are buffered until a full line arrives, so chunks split across
/// network reads (or inside a UTF-8 sequence) decode correctly.
#[derive(Debug, Default)]
struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<anyhow::Result<String>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            out.extend(decode_line(&line));
        }
        out
    }

    fn finish(&mut self) -> Vec<anyhow::Result<String>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest).into_iter().collect()
    }
}

fn decode_line(line: &[u8]) -> Option<anyhow::Result<String>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    let chunk = match serde_json::from_slice::<ChatChunk>(line) {
        Ok(chunk) => chunk,
        Err(err) => return Some(Err(anyhow::Error::new(err).context("Malformed stream line"))),
    };
    match chunk.into_fragment() {
        Ok(Some(text)) if !text.is_empty() => Some(Ok(text)),
        Ok(_) => None,
        Err(err) => Some(Err(err)),
    }
}

struct DecodeState<S> {
    bytes: S,
    decoder: NdjsonDecoder,
    pending: VecDeque<anyhow::Result<String>>,
    done: bool,
}

/// Turn a streamed response body into text fragments.
fn decode_stream<'a, S, B, E>(bytes: S) -> BoxStream<'a, anyhow::Result<String>>
where
    S: Stream<Item = Result<B, E>> + Unpin + Send + 'a,
    B: AsRef<[u8]> + Send + 'a,
    E: Into<anyhow::Error> + Send + 'a,
{
    let state = DecodeState {
        bytes,
        decoder: NdjsonDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let decoded = state.decoder.push(chunk.as_ref());
                    state.pending.extend(decoded);
                }
                Some(Err(err)) => {
                    state.done = true;
                    state.pending.push_back(Err(err.into()));
                }
                None => {
                    state.done = true;
                    let rest = state.decoder.finish();
                    state.pending.extend(rest);
                }
            }
        }
    })
    .boxed()
}
