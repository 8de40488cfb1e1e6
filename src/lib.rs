//! # LLM Runnable
//!
//! Composable LLM pipelines with single-shot and streaming execution.
//!
//! A pipeline is an ordered list of [`Stage`]s. Each stage turns one JSON
//! value into another, and the pipeline pipes each stage's output into the
//! next. Pipelines are built declaratively, `prompt | model | parser`, and run
//! in two modes that always agree on the final result:
//!
//! - [`Pipeline::invoke`] runs every stage once and returns the last output.
//! - [`Pipeline::stream`] pulls fragments through the stages as they become
//!   available, so the first tokens reach the caller before the model is done.
//!
//! ## Features
//!
//! - **Associative composition**: nested pipelines flatten into one stage
//!   list, so grouping never changes behavior
//! - **Pull-based streaming**: incremental stages pass fragments straight
//!   through; non-incremental stages join their input first
//! - **Positional errors**: failures name the stage and its index; upstream
//!   errors pass through downstream stages unchanged
//! - **Prompt templates** with partial variables, **chat models** over a
//!   pluggable backend (Ollama or an in-process mock), and **output parsers**
//!   for text and defensively extracted JSON
//! - **Cancellation**: abort between stages or fragments via `AtomicBool`
//!
//! ## Quick Start
//!
//! ```
//! use llm_runnable::{ChatModel, ChatPrompt, MockBackend, StageExt, StrOutputParser};
//! use futures::TryStreamExt;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let pipeline = ChatPrompt::from_template("{question}")?
//!     .pipe(ChatModel::new(MockBackend::echo()))
//!     | StrOutputParser;
//!
//! let answer = pipeline.invoke(json!({"question": "How did X happen?"})).await?;
//! assert_eq!(answer, json!("How did X happen?"));
//!
//! let fragments: Vec<_> = pipeline
//!     .stream(json!({"question": "How did X happen?"}))
//!     .try_collect()
//!     .await?;
//! assert_eq!(fragments.len(), 4);
//! # Ok::<(), llm_runnable::PipelineError>(())
//! # }).unwrap();
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod fragment;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod prompt;
pub mod stage;
pub mod types;

pub use backend::{ChatBackend, MockBackend};
pub use client::OllamaBackend;
pub use config::OllamaConfig;
pub use error::{PipelineError, Result, StageFault, StageResult};
pub use model::ChatModel;
pub use parser::{JsonOutputParser, StrOutputParser};
pub use pipeline::{compose, FragmentStream, Pipeline, PipelineBuilder};
pub use prompt::{ChatPrompt, Template};
pub use stage::{FnStage, Passthrough, Stage, StageExt, StageStream};
pub use types::{Message, Role};
