use crate::{
    backend::ChatBackend,
    error::{StageFault, StageResult},
    stage::{self, Stage, StageStream},
    types::{messages_from_value, Message},
};
use futures::{future::BoxFuture, stream, FutureExt, StreamExt};
use serde_json::Value;

/// Model-call stage: turns a conversation into an `ai` message.
///
/// Streaming yields one `ai` message fragment per backend fragment, or a
/// single empty `ai` message when the backend produces none, so the joined
/// stream always matches `invoke`. Incoming fragments are joined before the
/// backend is called.
#[derive(Debug)]
pub struct ChatModel<B> {
    name: String,
    backend: B,
}

impl<B: ChatBackend> ChatModel<B> {
    pub fn new(backend: B) -> Self {
        Self {
            name: "chat_model".to_string(),
            backend,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: ChatBackend> Stage for ChatModel<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, StageResult<Value>> {
        async move {
            let messages = messages_from_value(&input)?;
            let reply = self.backend.complete(messages).await?;
            Ok(Message::ai(reply).to_value())
        }
        .boxed()
    }

    fn stream(&self, input: Value) -> StageStream<'_> {
        let messages = match messages_from_value(&input) {
            Ok(messages) => messages,
            Err(fault) => return stage::fail(fault),
        };
        let fragments = self
            .backend
            .complete_stream(messages)
            .map(|fragment| {
                fragment
                    .map(|text| Message::ai(text).to_value())
                    .map_err(StageFault::from)
            })
            .fuse();

        stream::unfold((fragments, false), |(mut fragments, produced)| async move {
            match fragments.next().await {
                Some(item) => Some((item, (fragments, true))),
                None if !produced => Some((Ok(Message::ai("").to_value()), (fragments, true))),
                None => None,
            }
        })
        .boxed()
    }
}
