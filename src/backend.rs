use crate::types::Message;
use futures::{
    future::{self, BoxFuture},
    stream::{self, BoxStream},
    FutureExt, StreamExt,
};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of chat completions for a [`ChatModel`](crate::model::ChatModel).
///
/// Joining every fragment of `complete_stream` must give the same text as
/// `complete` for the same conversation.
pub trait ChatBackend: Send + Sync {
    /// Complete the conversation in one response.
    fn complete(&self, messages: Vec<Message>) -> BoxFuture<'_, anyhow::Result<String>>;

    /// Complete the conversation as a sequence of text fragments.
    fn complete_stream(&self, messages: Vec<Message>) -> BoxStream<'_, anyhow::Result<String>>;
}

#[derive(Debug, Clone)]
enum Reply {
    Echo,
    Scripted(Vec<String>),
}

/// In-process backend for tests and demos.
///
/// Rejects an empty conversation or an empty last message with
/// "empty prompt".
#[derive(Debug)]
pub struct MockBackend {
    reply: Reply,
    fail_after: Option<usize>,
    calls: AtomicUsize,
}

impl MockBackend {
    /// Reply with the content of the last message.
    ///
    /// Streams the reply as word pieces that keep their trailing whitespace.
    pub fn echo() -> Self {
        Self::with_reply(Reply::Echo)
    }

    /// Reply with `fragments`, streamed one per fragment.
    pub fn scripted<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_reply(Reply::Scripted(
            fragments.into_iter().map(Into::into).collect(),
        ))
    }

    fn with_reply(reply: Reply) -> Self {
        Self {
            reply,
            fail_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail once `n` fragments have been produced.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Number of completion requests received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fragments(&self, messages: &[Message]) -> anyhow::Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let last = match messages.last() {
            Some(msg) if !msg.content.is_empty() => msg,
            _ => anyhow::bail!("empty prompt"),
        };
        Ok(match &self.reply {
            Reply::Echo => last.content.split_inclusive(' ').map(String::from).collect(),
            Reply::Scripted(fragments) => fragments.clone(),
        })
    }

    fn failure(&self, produced: usize) -> anyhow::Error {
        anyhow::anyhow!("mock backend failed after {} fragments", produced)
    }
}

impl ChatBackend for MockBackend {
    fn complete(&self, messages: Vec<Message>) -> BoxFuture<'_, anyhow::Result<String>> {
        let result = self.fragments(&messages).and_then(|fragments| match self.fail_after {
            Some(n) if n < fragments.len() => Err(self.failure(n)),
            _ => Ok(fragments.concat()),
        });
        future::ready(result).boxed()
    }

    fn complete_stream(&self, messages: Vec<Message>) -> BoxStream<'_, anyhow::Result<String>> {
        let fragments = match self.fragments(&messages) {
            Ok(fragments) => fragments,
            Err(err) => return stream::once(future::ready(Err(err))).boxed(),
        };
        match self.fail_after {
            Some(n) if n < fragments.len() => {
                let head: Vec<_> = fragments.into_iter().take(n).map(Ok).collect();
                stream::iter(head)
                    .chain(stream::once(future::ready(Err(self.failure(n)))))
                    .boxed()
            }
            _ => stream::iter(fragments.into_iter().map(Ok)).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_echo_complete() {
        let backend = MockBackend::echo();
        let out = backend
            .complete(vec![Message::system("sys"), Message::human("How did X happen?")])
            .await
            .unwrap();
        assert_eq!(out, "How did X happen?");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_echo_stream_splits_words() {
        let backend = MockBackend::echo();
        let pieces: Vec<String> = backend
            .complete_stream(vec![Message::human("a b c")])
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pieces, vec!["a ", "b ", "c"]);
    }

    #[tokio::test]
    async fn test_scripted_stream() {
        let backend = MockBackend::scripted(["A", "B", "C"]);
        let pieces: Vec<String> = backend
            .complete_stream(vec![Message::human("go")])
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pieces, vec!["A", "B", "C"]);
        let whole = backend.complete(vec![Message::human("go")]).await.unwrap();
        assert_eq!(whole, "ABC");
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let backend = MockBackend::echo();
        let err = backend.complete(vec![Message::human("")]).await.unwrap_err();
        assert_eq!(err.to_string(), "empty prompt");
        assert!(backend.complete(Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_after_yields_prefix_then_error() {
        let backend = MockBackend::scripted(["A", "B", "C"]).fail_after(2);
        let items: Vec<anyhow::Result<String>> = backend
            .complete_stream(vec![Message::human("go")])
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), "A");
        assert_eq!(items[1].as_ref().unwrap(), "B");
        assert!(items[2].is_err());
        assert!(backend.complete(vec![Message::human("go")]).await.is_err());
    }
}
