use crate::{
    error::{StageFault, StageResult},
    fragment,
    pipeline::{compose, Pipeline},
};
use futures::{
    future::{self, BoxFuture},
    stream::{self, BoxStream},
    FutureExt, StreamExt, TryFutureExt,
};
use serde_json::Value;
use std::sync::Arc;

/// Lazy sequence of fragments produced by a single stage.
pub type StageStream<'a> = BoxStream<'a, StageResult<Value>>;

/// A unit of transformation in a pipeline.
///
/// Only [`invoke`](Stage::invoke) is required. The streaming capabilities
/// have defaults that treat the stage as non-incremental:
///
/// - [`stream`](Stage::stream) emits a single fragment equal to `invoke`'s output.
/// - [`transform`](Stage::transform) waits for every input fragment,
///   joins them with [`fragment::concat_all`], and streams the result.
///
/// Stages that can map fragment by fragment override `transform`; stages
/// that produce output incrementally override `stream`. In every case the
/// joined output of `stream(x)` must equal `invoke(x)`.
pub trait Stage: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// Produce the full output for one input.
    fn invoke(&self, input: Value) -> BoxFuture<'_, StageResult<Value>>;

    /// Produce the output for one input as a sequence of fragments.
    fn stream(&self, input: Value) -> StageStream<'_> {
        self.invoke(input).into_stream().boxed()
    }

    /// Consume a sequence of input fragments and produce output fragments.
    fn transform<'a>(&'a self, input: BoxStream<'a, Value>) -> StageStream<'a> {
        input
            .collect::<Vec<_>>()
            .map(move |fragments| fragment::concat_all(fragments).map(|joined| self.stream(joined)))
            .try_flatten_stream()
            .boxed()
    }

    /// Composition hook: a pipeline exposes itself so it can be flattened.
    #[doc(hidden)]
    fn as_pipeline(&self) -> Option<&Pipeline> {
        None
    }
}

impl<S: Stage + ?Sized> Stage for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, StageResult<Value>> {
        (**self).invoke(input)
    }

    fn stream(&self, input: Value) -> StageStream<'_> {
        (**self).stream(input)
    }

    fn transform<'a>(&'a self, input: BoxStream<'a, Value>) -> StageStream<'a> {
        (**self).transform(input)
    }

    fn as_pipeline(&self) -> Option<&Pipeline> {
        (**self).as_pipeline()
    }
}

/// Chaining helpers available on every stage.
pub trait StageExt: Stage + Sized + 'static {
    /// Compose `self` followed by `next` into a pipeline.
    fn pipe<S: Stage + 'static>(self, next: S) -> Pipeline {
        compose(self, next)
    }
}

impl<T: Stage + Sized + 'static> StageExt for T {}

type StageFn = dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync;

/// Stage backed by a synchronous closure.
///
/// Non-incremental unless built with [`FnStage::per_fragment`], in which case
/// the closure is applied to each streamed fragment independently.
pub struct FnStage {
    name: String,
    func: Box<StageFn>,
    per_fragment: bool,
}

impl FnStage {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
            per_fragment: false,
        }
    }

    /// Apply the closure to every fragment instead of the joined input.
    pub fn per_fragment(mut self) -> Self {
        self.per_fragment = true;
        self
    }

    fn apply(&self, input: Value) -> StageResult<Value> {
        (self.func)(input).map_err(StageFault::from)
    }
}

impl std::fmt::Debug for FnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("per_fragment", &self.per_fragment)
            .finish()
    }
}

impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, StageResult<Value>> {
        future::ready(self.apply(input)).boxed()
    }

    fn transform<'a>(&'a self, input: BoxStream<'a, Value>) -> StageStream<'a> {
        if !self.per_fragment {
            return input
                .collect::<Vec<_>>()
                .map(move |fragments| fragment::concat_all(fragments).and_then(|v| self.apply(v)))
                .into_stream()
                .boxed();
        }
        input.map(move |fragment| self.apply(fragment)).boxed()
    }
}

/// Stage that returns its input unchanged, fragment by fragment.
#[derive(Debug, Clone, Default)]
pub struct Passthrough;

impl Stage for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, StageResult<Value>> {
        future::ready(Ok(input)).boxed()
    }

    fn transform<'a>(&'a self, input: BoxStream<'a, Value>) -> StageStream<'a> {
        input.map(Ok).boxed()
    }
}

/// Stream that fails immediately with `fault`.
pub(crate) fn fail<'a>(fault: StageFault) -> StageStream<'a> {
    stream::once(future::ready(Err(fault))).boxed()
}
