use futures::{StreamExt, TryStreamExt};
use llm_runnable::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn qa_pipeline(backend: MockBackend) -> Pipeline {
    ChatPrompt::from_template("{question}")
        .unwrap()
        .with_name("prompt")
        .pipe(ChatModel::new(backend).with_name("model"))
        | StrOutputParser
}

async fn collect(pipeline: &Pipeline, input: Value) -> Vec<Result<Value>> {
    pipeline.stream(input).collect().await
}

fn joined(fragments: &[Result<Value>]) -> Value {
    let values: Vec<Value> = fragments
        .iter()
        .map(|f| f.as_ref().unwrap().clone())
        .collect();
    llm_runnable::fragment::concat_all(values).unwrap()
}

// --- Concrete scenarios ---

#[tokio::test]
async fn test_echo_question_round_trip() {
    let pipeline = qa_pipeline(MockBackend::echo());
    let out = pipeline
        .invoke(json!({"question": "How did X happen?"}))
        .await
        .unwrap();
    assert_eq!(out, json!("How did X happen?"));
}

#[tokio::test]
async fn test_prompt_output_shape() {
    let prompt = ChatPrompt::from_template("{question}").unwrap();
    let out = Stage::invoke(&prompt, json!({"question": "Q"})).await.unwrap();
    assert_eq!(out, json!([{"role": "human", "content": "Q"}]));
}

#[tokio::test]
async fn test_scripted_fragments_stream_in_order() {
    let pipeline = qa_pipeline(MockBackend::scripted(["A", "B", "C"]));
    let fragments: Vec<Value> = pipeline
        .stream(json!({"question": "anything"}))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(fragments, vec![json!("A"), json!("B"), json!("C")]);
}

#[tokio::test]
async fn test_empty_question_fails_at_model() {
    let pipeline = qa_pipeline(MockBackend::echo());

    let err = pipeline.invoke(json!({"question": ""})).await.unwrap_err();
    match &err {
        PipelineError::Stage { index, stage, source } => {
            assert_eq!(*index, 1);
            assert_eq!(stage, "model");
            assert_eq!(source.to_string(), "empty prompt");
        }
        other => panic!("Expected Stage error, got {other:?}"),
    }

    let items = collect(&pipeline, json!({"question": ""})).await;
    assert_eq!(items.len(), 1);
    let stream_err = items[0].as_ref().unwrap_err();
    assert_eq!(stream_err.stage_index(), Some(1));
    assert_eq!(stream_err.stage_name(), Some("model"));
    assert_eq!(stream_err.to_string(), err.to_string());
}

// --- Properties ---

#[tokio::test]
async fn test_invoke_equals_joined_stream() {
    for backend in [
        MockBackend::echo(),
        MockBackend::scripted(["The ", "answer ", "is ", "42"]),
    ] {
        let pipeline = qa_pipeline(backend);
        let input = json!({"question": "what is the answer to everything"});
        let invoked = pipeline.invoke(input.clone()).await.unwrap();
        let streamed = collect(&pipeline, input).await;
        assert_eq!(invoked, joined(&streamed));
    }
}

#[tokio::test]
async fn test_invoke_equals_joined_stream_without_parser() {
    let pipeline = ChatPrompt::from_template("{q}")
        .unwrap()
        .pipe(ChatModel::new(MockBackend::scripted(["x", "y"])));
    let invoked = pipeline.invoke(json!({"q": "go"})).await.unwrap();
    let streamed = collect(&pipeline, json!({"q": "go"})).await;
    assert_eq!(streamed.len(), 2);
    assert_eq!(invoked, joined(&streamed));
    assert_eq!(invoked, json!({"role": "ai", "content": "xy"}));
}

#[tokio::test]
async fn test_silent_model_agrees_across_modes() {
    let pipeline = qa_pipeline(MockBackend::scripted(Vec::<String>::new()));
    let input = json!({"question": "anything"});
    let invoked = pipeline.invoke(input.clone()).await.unwrap();
    let streamed = collect(&pipeline, input.clone()).await;
    assert_eq!(invoked, json!(""));
    assert_eq!(invoked, joined(&streamed));

    let strict = FnStage::new("strict", |v: Value| {
        let text = v
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("got {}", v))?;
        Ok(json!(text.len()))
    });
    let pipeline = pipeline | strict;
    let invoked = pipeline.invoke(input.clone()).await.unwrap();
    let fragments: Vec<Value> = pipeline.stream(input).try_collect().await.unwrap();
    assert_eq!(invoked, json!(0));
    assert_eq!(fragments, vec![json!(0)]);
}

#[tokio::test]
async fn test_composition_is_associative() {
    let backend = Arc::new(ChatModel::new(MockBackend::scripted(["1", "2"])));
    let prompt = Arc::new(ChatPrompt::from_template("{question}").unwrap());
    let parser = Arc::new(StrOutputParser);

    let left = compose(compose(prompt.clone(), backend.clone()), parser.clone());
    let right = compose(prompt, compose(backend, parser));
    assert_eq!(left.stage_names(), right.stage_names());

    let input = json!({"question": "q"});
    assert_eq!(
        left.invoke(input.clone()).await.unwrap(),
        right.invoke(input.clone()).await.unwrap()
    );
    let l: Vec<Value> = left.stream(input.clone()).try_collect().await.unwrap();
    let r: Vec<Value> = right.stream(input).try_collect().await.unwrap();
    assert_eq!(l, r);
}

#[tokio::test]
async fn test_non_incremental_stage_yields_single_fragment() {
    let shout = FnStage::new("shout", |v: Value| {
        Ok(Value::String(v.as_str().unwrap_or_default().to_uppercase()))
    });
    let pipeline = qa_pipeline(MockBackend::scripted(["a", "b", "c"])) | shout;

    let fragments: Vec<Value> = pipeline
        .stream(json!({"question": "q"}))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(fragments, vec![json!("ABC")]);
    assert_eq!(
        pipeline.invoke(json!({"question": "q"})).await.unwrap(),
        json!("ABC")
    );
}

#[tokio::test]
async fn test_downstream_resumes_streaming_after_non_incremental_stage() {
    // prompt and model both wait for their whole input; the parser streams again
    let pipeline = qa_pipeline(MockBackend::echo());
    let fragments: Vec<Value> = pipeline
        .stream(json!({"question": "one two three"}))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(fragments, vec![json!("one "), json!("two "), json!("three")]);
}

#[tokio::test]
async fn test_mid_stream_failure_keeps_delivered_fragments() {
    let pipeline = qa_pipeline(MockBackend::scripted(["A", "B", "C"]).fail_after(2));

    let items = collect(&pipeline, json!({"question": "q"})).await;
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_ref().unwrap(), &json!("A"));
    assert_eq!(items[1].as_ref().unwrap(), &json!("B"));
    let err = items[2].as_ref().unwrap_err();
    assert_eq!(err.stage_index(), Some(1));

    let invoke_err = pipeline.invoke(json!({"question": "q"})).await.unwrap_err();
    assert_eq!(invoke_err.stage_index(), Some(1));
}

#[tokio::test]
async fn test_failure_aborts_remaining_stages() {
    let model = Arc::new(ChatModel::new(MockBackend::echo()));
    let failing = FnStage::new("reject", |_| Err(anyhow::anyhow!("rejected")));
    let pipeline = failing.pipe(model.clone()) | StrOutputParser;

    let err = pipeline.invoke(json!("hi")).await.unwrap_err();
    assert_eq!(err.stage_index(), Some(0));
    let items = collect(&pipeline, json!("hi")).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap_err().stage_index(), Some(0));
    assert_eq!(model.backend().calls(), 0);
}

#[tokio::test]
async fn test_stream_ends_after_error() {
    let pipeline = qa_pipeline(MockBackend::echo());
    let mut stream = pipeline.stream(json!({"question": ""}));
    assert!(stream.next().await.unwrap().is_err());
    assert!(stream.next().await.is_none());
}

// --- Lazy composition checks ---

#[tokio::test]
async fn test_incompatible_stages_detected_on_first_run() {
    // Composing never inspects shapes.
    let pipeline = StrOutputParser.pipe(ChatPrompt::from_template("{question}").unwrap());
    assert_eq!(pipeline.stages().len(), 2);

    let err = pipeline.invoke(json!([1, 2])).await.unwrap_err();
    match err {
        PipelineError::Composition { index, found, .. } => {
            assert_eq!(index, 0);
            assert_eq!(found, "array of 2");
        }
        other => panic!("Expected Composition error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_prompt_variable_is_composition_error() {
    let pipeline = qa_pipeline(MockBackend::echo());
    let err = pipeline.invoke(json!({"query": "Q"})).await.unwrap_err();
    assert!(matches!(err, PipelineError::Composition { index: 0, .. }));

    let items = collect(&pipeline, json!({"query": "Q"})).await;
    assert!(matches!(
        items[0],
        Err(PipelineError::Composition { index: 0, .. })
    ));
}

// --- Typed edges, batch, JSON parsing ---

#[tokio::test]
async fn test_typed_json_pipeline() {
    #[derive(serde::Serialize)]
    struct Question<'a> {
        question: &'a str,
    }
    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct Answer {
        answer: String,
        confidence: f64,
    }

    let pipeline = ChatPrompt::from_template("{question}")
        .unwrap()
        .pipe(ChatModel::new(MockBackend::scripted([
            "<think>easy</think>",
            "```json\n{\"answer\": \"yes\",",
            " \"confidence\": 0.5}\n```",
        ])))
        | JsonOutputParser;

    let answer: Answer = pipeline
        .invoke_as(&Question { question: "ok?" })
        .await
        .unwrap();
    assert_eq!(
        answer,
        Answer {
            answer: "yes".to_string(),
            confidence: 0.5,
        }
    );

    let fragments: Vec<Value> = pipeline
        .stream(json!({"question": "ok?"}))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(fragments, vec![json!({"answer": "yes", "confidence": 0.5})]);
}

#[tokio::test]
async fn test_batch_isolates_failures() {
    let pipeline = qa_pipeline(MockBackend::echo());
    let results = pipeline
        .batch(vec![
            json!({"question": "first"}),
            json!({"question": ""}),
            json!({"question": "third"}),
        ])
        .await;
    assert_eq!(results[0].as_ref().unwrap(), &json!("first"));
    assert!(results[1].is_err());
    assert_eq!(results[2].as_ref().unwrap(), &json!("third"));
}

#[tokio::test]
async fn test_pipeline_is_reusable_and_clonable() {
    let pipeline = qa_pipeline(MockBackend::echo());
    let copy = pipeline.clone();
    let a = pipeline.invoke(json!({"question": "a"})).await.unwrap();
    let b = copy.invoke(json!({"question": "b"})).await.unwrap();
    assert_eq!(a, json!("a"));
    assert_eq!(b, json!("b"));
}

#[tokio::test]
async fn test_builder_flattens_pipelines() {
    let inner = ChatPrompt::from_template("{question}")
        .unwrap()
        .pipe(ChatModel::new(MockBackend::echo()));
    let pipeline = Pipeline::builder()
        .add_stage(inner)
        .add_stage(StrOutputParser)
        .build()
        .unwrap();
    assert_eq!(
        pipeline.stage_names(),
        vec!["chat_prompt", "chat_model", "str_output_parser"]
    );
    assert_eq!(
        pipeline.invoke(json!({"question": "q"})).await.unwrap(),
        json!("q")
    );
}

// --- Error type tests ---

#[test]
fn test_error_display() {
    let err = PipelineError::Composition {
        index: 2,
        stage: "parser".to_string(),
        expected: "a message or a string".to_string(),
        found: "number".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "Stage 2 ('parser') cannot accept its input: expected a message or a string, found number"
    );

    let err = PipelineError::Cancelled;
    assert_eq!(err.to_string(), "Pipeline was cancelled");

    let err = PipelineError::InvalidConfig("bad config".to_string());
    assert_eq!(err.to_string(), "Invalid configuration: bad config");
}
