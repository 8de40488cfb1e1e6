//! Stream an answer through `prompt | model | parser` using the mock backend.
//!
//! Run with `RUST_LOG=llm_runnable=debug` to see per-stage logs.

use futures::StreamExt;
use llm_runnable::{ChatModel, ChatPrompt, MockBackend, StageExt, StrOutputParser};
use serde_json::json;
use std::io::Write;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let prompt = ChatPrompt::new()
        .system("You are a {tone} historian.")?
        .human("{question}")?
        .with_partial("tone", "concise");

    let pipeline = prompt.pipe(ChatModel::new(MockBackend::echo())) | StrOutputParser;
    let input = json!({"question": "How did the printing press change Europe?"});

    println!("invoke: {}", pipeline.invoke(input.clone()).await?);

    print!("stream: ");
    let mut fragments = pipeline.stream(input);
    while let Some(fragment) = fragments.next().await {
        if let Some(text) = fragment?.as_str() {
            print!("{}|", text);
            std::io::stdout().flush()?;
        }
    }
    println!();

    match pipeline.invoke(json!({"question": ""})).await {
        Ok(_) => println!("unexpected success"),
        Err(err) => println!("empty question: {}", err),
    }

    Ok(())
}
