//! Ask a local Ollama server a question and stream the reply.
//!
//! Uses `OLLAMA_HOST` / `OLLAMA_MODEL` when set.

use futures::StreamExt;
use llm_runnable::{
    ChatModel, ChatPrompt, OllamaBackend, OllamaConfig, Pipeline, StrOutputParser,
};
use serde_json::json;
use std::io::Write;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = OllamaConfig::from_env().with_temperature(0.2);
    println!("Using {} at {}", config.model, config.endpoint);

    let cancel = Arc::new(AtomicBool::new(false));
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.store(true, Ordering::Relaxed);
        }
    });

    let pipeline = Pipeline::builder()
        .add_stage(ChatPrompt::from_template(
            "Answer in two sentences: {question}",
        )?)
        .add_stage(ChatModel::new(OllamaBackend::new(reqwest::Client::new(), config)))
        .add_stage(StrOutputParser)
        .with_cancellation(cancel)
        .build()?;

    let mut fragments = pipeline.stream(json!({"question": "Why is the sky blue?"}));
    while let Some(fragment) = fragments.next().await {
        if let Some(text) = fragment?.as_str() {
            print!("{}", text);
            std::io::stdout().flush()?;
        }
    }
    println!();
    Ok(())
}
