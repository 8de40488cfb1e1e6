use crate::{
    error::{Result, StageFault},
    stage::{Stage, StageStream},
    PipelineError,
};
use futures::{
    future::{self, BoxFuture},
    stream::{self, BoxStream},
    FutureExt, Stream, StreamExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    ops::BitOr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    task::{Context, Poll},
};

/// Fragments produced by a whole pipeline.
pub type FragmentStream<'a> = BoxStream<'a, Result<Value>>;

/// An ordered, immutable sequence of stages.
///
/// Each stage's output becomes the next stage's input. A pipeline is itself
/// a [`Stage`], and composing pipelines flattens them, so grouping never
/// changes behavior or stage indices.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    name: String,
    cancellation: Vec<Arc<AtomicBool>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("cancellation_flags", &self.cancellation.len())
            .finish()
    }
}

/// Compose two stages into a pipeline running `first` then `second`.
///
/// Cancellation flags of composed pipelines are all kept; setting any of
/// them stops the result.
pub fn compose<A, B>(first: A, second: B) -> Pipeline
where
    A: Stage + 'static,
    B: Stage + 'static,
{
    let mut stages = Vec::new();
    let mut cancellation = Vec::new();
    append(&mut stages, &mut cancellation, Arc::new(first));
    append(&mut stages, &mut cancellation, Arc::new(second));
    Pipeline::from_parts(stages, cancellation)
}

fn append(
    stages: &mut Vec<Arc<dyn Stage>>,
    cancellation: &mut Vec<Arc<AtomicBool>>,
    stage: Arc<dyn Stage>,
) {
    match stage.as_pipeline() {
        Some(pipeline) => {
            stages.extend(pipeline.stages.iter().cloned());
            for flag in &pipeline.cancellation {
                add_flag(cancellation, flag.clone());
            }
        }
        None => stages.push(stage),
    }
}

fn add_flag(cancellation: &mut Vec<Arc<AtomicBool>>, flag: Arc<AtomicBool>) {
    if !cancellation.iter().any(|known| Arc::ptr_eq(known, &flag)) {
        cancellation.push(flag);
    }
}

impl Pipeline {
    /// Create a new pipeline builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    fn from_parts(stages: Vec<Arc<dyn Stage>>, cancellation: Vec<Arc<AtomicBool>>) -> Self {
        let name = stages
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(" | ");
        Self {
            stages,
            name,
            cancellation,
        }
    }

    /// Get a reference to the pipeline's stages.
    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Names of the stages, in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Check whether cancellation has been requested.
    fn check_cancelled(&self) -> Result<()> {
        if is_cancelled(&self.cancellation) {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Run every stage in order and return the last stage's output.
    ///
    /// The first failing stage aborts the run; its error carries the stage's
    /// zero-based index and name.
    pub async fn invoke(&self, input: Value) -> Result<Value> {
        let mut current = input;

        for (index, stage) in self.stages.iter().enumerate() {
            self.check_cancelled()?;
            tracing::debug!(index, stage = stage.name(), "invoking stage");

            current = stage.invoke(current).await.map_err(|fault| {
                let err = PipelineError::from_fault(index, stage.name(), fault);
                tracing::warn!(index, stage = stage.name(), error = %err, "stage failed");
                err
            })?;
        }

        Ok(current)
    }

    /// Invoke with typed edges: `input` is serialized to JSON and the final
    /// output deserialized into `O`.
    pub async fn invoke_as<I, O>(&self, input: &I) -> Result<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let value = serde_json::to_value(input)?;
        let output = self.invoke(value).await?;
        Ok(serde_json::from_value(output)?)
    }

    /// Invoke once per input, sequentially. Each run is independent, so one
    /// failure does not stop the others.
    pub async fn batch(&self, inputs: Vec<Value>) -> Vec<Result<Value>> {
        stream::iter(inputs)
            .then(|input| self.invoke(input))
            .collect()
            .await
    }

    /// Run the pipeline incrementally.
    ///
    /// Fragments are pulled from the last stage; each stage pulls from the
    /// one before it, so output can appear before upstream stages finish. On
    /// failure the stream yields the error after any fragments already
    /// delivered, then ends.
    pub fn stream(&self, input: Value) -> FragmentStream<'_> {
        self.run_stream(stream::once(future::ready(Ok(input))).boxed())
    }

    /// Stack one cursor per stage on top of `source`.
    fn run_stream<'a>(&'a self, source: FragmentStream<'a>) -> FragmentStream<'a> {
        let mut upstream = source;

        for (index, stage) in self.stages.iter().enumerate() {
            let slot = ErrorSlot::default();
            let input = Upstream {
                inner: upstream,
                slot: slot.clone(),
                tripped: false,
            };
            tracing::debug!(index, stage = stage.name(), "streaming stage");
            upstream = Layer {
                output: stage.transform(input.boxed()),
                slot,
                index,
                stage: stage.name(),
                cancellation: &self.cancellation,
                emitted: 0,
                finished: false,
            }
            .boxed();
        }

        upstream
    }
}

impl Stage for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, crate::error::StageResult<Value>> {
        Pipeline::invoke(self, input)
            .map(|result| result.map_err(|err| StageFault::Failed(err.into())))
            .boxed()
    }

    fn stream(&self, input: Value) -> StageStream<'_> {
        Pipeline::stream(self, input)
            .map(|item| item.map_err(|err| StageFault::Failed(err.into())))
            .boxed()
    }

    fn transform<'a>(&'a self, input: BoxStream<'a, Value>) -> StageStream<'a> {
        self.run_stream(input.map(Ok).boxed())
            .map(|item| item.map_err(|err| StageFault::Failed(err.into())))
            .boxed()
    }

    fn as_pipeline(&self) -> Option<&Pipeline> {
        Some(self)
    }
}

impl<S: Stage + 'static> BitOr<S> for Pipeline {
    type Output = Pipeline;

    fn bitor(self, next: S) -> Pipeline {
        compose(self, next)
    }
}

fn is_cancelled(flags: &[Arc<AtomicBool>]) -> bool {
    flags.iter().any(|cancel| cancel.load(Ordering::Relaxed))
}

/// Holds an upstream error until the stage above has stopped pulling.
#[derive(Clone, Default)]
struct ErrorSlot(Arc<Mutex<Option<PipelineError>>>);

impl ErrorSlot {
    fn put(&self, err: PipelineError) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    fn take(&self) -> Option<PipelineError> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Input side of a stage: upstream values only.
///
/// An upstream error is parked in the slot and the input stalls, so the
/// stage never sees a truncated input it could mistake for a complete one.
struct Upstream<'a> {
    inner: FragmentStream<'a>,
    slot: ErrorSlot,
    tripped: bool,
}

impl Stream for Upstream<'_> {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        if self.tripped {
            return Poll::Pending;
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(value)),
            Poll::Ready(Some(Err(err))) => {
                self.tripped = true;
                self.slot.put(err);
                Poll::Pending
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Output side of a stage: wraps its faults with position and forwards
/// upstream errors unchanged.
struct Layer<'a> {
    output: StageStream<'a>,
    slot: ErrorSlot,
    index: usize,
    stage: &'a str,
    cancellation: &'a [Arc<AtomicBool>],
    emitted: usize,
    finished: bool,
}

impl Layer<'_> {
    fn finish(&mut self, item: Option<Result<Value>>) -> Poll<Option<Result<Value>>> {
        self.finished = true;
        Poll::Ready(item)
    }
}

impl Stream for Layer<'_> {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if is_cancelled(self.cancellation) {
            return self.finish(Some(Err(PipelineError::Cancelled)));
        }

        match self.output.poll_next_unpin(cx) {
            // Output the stage already produced is delivered; a parked
            // upstream error surfaces on a later poll.
            Poll::Ready(Some(Ok(value))) => {
                self.emitted += 1;
                Poll::Ready(Some(Ok(value)))
            }
            Poll::Ready(Some(Err(fault))) => {
                if let Some(err) = self.slot.take() {
                    return self.finish(Some(Err(err)));
                }
                let err = PipelineError::from_fault(self.index, self.stage, fault);
                tracing::warn!(index = self.index, stage = self.stage, error = %err, "stage failed");
                self.finish(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if let Some(err) = self.slot.take() {
                    return self.finish(Some(Err(err)));
                }
                tracing::debug!(
                    index = self.index,
                    stage = self.stage,
                    fragments = self.emitted,
                    "stage finished"
                );
                self.finish(None)
            }
            Poll::Pending => match self.slot.take() {
                Some(err) => self.finish(Some(Err(err))),
                None => Poll::Pending,
            },
        }
    }
}

/// Builder for creating pipelines from a list of stages.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    cancellation: Vec<Arc<AtomicBool>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage to the pipeline. Pipelines are flattened into their stages.
    pub fn add_stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        append(&mut self.stages, &mut self.cancellation, Arc::new(stage));
        self
    }

    /// Add a cancellation flag that can be used to abort execution.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        add_flag(&mut self.cancellation, cancel);
        self
    }

    /// Build the pipeline, validating configuration.
    pub fn build(self) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Pipeline must have at least one stage".to_string(),
            ));
        }
        Ok(Pipeline::from_parts(self.stages, self.cancellation))
    }
}
