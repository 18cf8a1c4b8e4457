//! Integration tests for the message pipeline with in-memory collaborators

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatgate::{
    ChannelError, CompletionMetadata, CompletionProvider, Config, HistoryMessage, IncomingMessage,
    MessagePipeline, MessageTransport, PipelineError, PipelineOutcome, ProviderError, SendOptions,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingTransport {
    history: Mutex<Vec<HistoryMessage>>,
    sent: Mutex<Vec<(String, String, Option<String>)>>,
    fail_fetch: bool,
}

impl RecordingTransport {
    fn with_history(messages: Vec<HistoryMessage>) -> Self {
        Self {
            history: Mutex::new(messages),
            ..Default::default()
        }
    }

    fn push(&self, message: &IncomingMessage) {
        self.history.lock().unwrap().push(HistoryMessage {
            id: message.id.clone(),
            text: message.text.clone(),
            author_id: message.author_id.clone(),
            from_bot: false,
            timestamp: message.timestamp,
        });
    }

    fn sent(&self) -> Vec<(String, String, Option<String>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, channel_id: &str, text: &str, options: SendOptions) -> Result<String, ChannelError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((channel_id.to_string(), text.to_string(), options.reply_to));
        Ok(format!("reply-{}", sent.len()))
    }

    async fn fetch_history(&self, _channel_id: &str, limit: usize) -> Result<Vec<HistoryMessage>, ChannelError> {
        if self.fail_fetch {
            return Err(ChannelError::FetchFailed("boom".to_string()));
        }
        let history = self.history.lock().unwrap();
        let skip = history.len().saturating_sub(limit);
        Ok(history[skip..].to_vec())
    }

    async fn send_typing(&self, _channel_id: &str) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedProvider {
    reply: String,
    latency: Duration,
    calls: Mutex<Vec<(String, usize, usize)>>,
}

impl ScriptedProvider {
    fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            ..Default::default()
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn calls(&self) -> Vec<(String, usize, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_chat_completion(
        &self,
        prompt: &str,
        history: &[HistoryMessage],
        metadata: &CompletionMetadata,
    ) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), history.len(), metadata.max_tokens));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.reply.clone())
    }
}

fn incoming(id: &str, author: &str, text: &str) -> IncomingMessage {
    IncomingMessage {
        id: id.to_string(),
        channel_id: "general".to_string(),
        author_id: author.to_string(),
        text: text.to_string(),
        timestamp: Utc::now(),
    }
}

fn history_message(i: usize, text: &str) -> HistoryMessage {
    HistoryMessage {
        id: format!("h{}", i),
        text: text.to_string(),
        author_id: "someone".to_string(),
        from_bot: i % 2 == 1,
        timestamp: Utc::now(),
    }
}

fn pipeline(config: Config, transport: &Arc<RecordingTransport>, provider: &Arc<ScriptedProvider>) -> MessagePipeline {
    MessagePipeline::new(config, transport.clone(), provider.clone())
}

#[tokio::test(start_paused = true)]
async fn test_single_message_gets_direct_reply() {
    let transport = Arc::new(RecordingTransport::default());
    let provider = Arc::new(ScriptedProvider::replying("12345678"));
    let pipeline = pipeline(Config::default(), &transport, &provider);

    let message = incoming("m1", "alice", "hello bot");
    transport.push(&message);

    let outcome = pipeline.handle(message, &CancellationToken::new()).await.unwrap();

    match outcome {
        PipelineOutcome::Replied { reply_to, .. } => assert_eq!(reply_to, None),
        other => panic!("expected reply, got {:?}", other),
    }

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "12345678");

    // reply tokens feed the velocity window
    assert_eq!(pipeline.velocity().tokens_in_window("general"), 2);
    // leader cleared its window
    assert!(pipeline.coalescer().state("general:chatgate").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_burst_gets_one_threaded_reply() {
    let transport = Arc::new(RecordingTransport::default());
    let provider = Arc::new(ScriptedProvider::replying("ok"));
    let pipeline = pipeline(Config::default(), &transport, &provider);
    let cancel = CancellationToken::new();

    let messages = [
        incoming("m1", "alice", "first"),
        incoming("m2", "bob", "second"),
        incoming("m3", "alice", "third"),
    ];
    for m in &messages {
        transport.push(m);
    }
    let [m1, m2, m3] = messages;

    let (r1, r2, r3) = tokio::join!(
        pipeline.handle(m1, &cancel),
        pipeline.handle(m2, &cancel),
        pipeline.handle(m3, &cancel),
    );

    assert!(matches!(r1.unwrap(), PipelineOutcome::Replied { .. }));
    assert_eq!(r2.unwrap(), PipelineOutcome::Coalesced);
    assert_eq!(r3.unwrap(), PipelineOutcome::Coalesced);

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2.as_deref(), Some("m3"));

    // the whole burst is the prompt, not context
    let calls = provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "first\nsecond\nthird");
    assert_eq!(calls[0].1, 0);
}

#[tokio::test(start_paused = true)]
async fn test_burst_waits_for_extended_window() {
    let transport = Arc::new(RecordingTransport::default());
    let provider = Arc::new(ScriptedProvider::replying("ok"));
    let pipeline = Arc::new(pipeline(Config::default(), &transport, &provider));
    let cancel = CancellationToken::new();

    let leader = {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let outcome = pipeline.handle(incoming("m1", "alice", "hi"), &cancel).await;
            (outcome, start.elapsed())
        })
    };

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let follower = pipeline.handle(incoming("m2", "alice", "you there?"), &cancel).await;
    assert_eq!(follower.unwrap(), PipelineOutcome::Coalesced);

    let (outcome, elapsed) = leader.await.unwrap();
    assert!(matches!(outcome.unwrap(), PipelineOutcome::Replied { .. }));
    // 1500ms base, extended by another 1500ms at t=1000
    assert!(elapsed >= Duration::from_millis(3000));
}

#[tokio::test(start_paused = true)]
async fn test_velocity_hard_block_throttles() {
    let transport = Arc::new(RecordingTransport::default());
    let provider = Arc::new(ScriptedProvider::replying("ok"));
    let pipeline = pipeline(Config::default(), &transport, &provider);

    pipeline.velocity().record_tokens("general", 3000);

    let outcome = pipeline
        .handle(incoming("m1", "alice", "hello"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, PipelineOutcome::Throttled);
    assert!(transport.sent().is_empty());
    assert!(provider.calls().is_empty());
    assert!(pipeline.coalescer().state("general:chatgate").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_velocity_shapes_max_tokens() {
    let transport = Arc::new(RecordingTransport::default());
    let provider = Arc::new(ScriptedProvider::replying("ok"));
    let mut config = Config::default();
    config.default_max_tokens = 400;
    let pipeline = pipeline(config, &transport, &provider).with_draw(|| 0.0);

    pipeline.velocity().record_tokens("general", 1500);

    let outcome = pipeline
        .handle(incoming("m1", "alice", "hello"), &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        PipelineOutcome::Replied { max_tokens, .. } => assert_eq!(max_tokens, 260),
        other => panic!("expected reply, got {:?}", other),
    }
    assert_eq!(provider.calls()[0].2, 260);
}

#[tokio::test(start_paused = true)]
async fn test_probability_draw_above_modifier_skips() {
    let transport = Arc::new(RecordingTransport::default());
    let provider = Arc::new(ScriptedProvider::replying("ok"));
    let pipeline = pipeline(Config::default(), &transport, &provider).with_draw(|| 0.7);

    // 1500 tokens: 1 - (500 / 100) * 0.1 = 0.5
    pipeline.velocity().record_tokens("general", 1500);

    let outcome = pipeline
        .handle(incoming("m1", "alice", "hello"), &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        PipelineOutcome::Skipped { probability } => assert!((probability - 0.5).abs() < 1e-9),
        other => panic!("expected skip, got {:?}", other),
    }
    assert!(transport.sent().is_empty());
    assert!(provider.calls().is_empty());
    assert!(pipeline.coalescer().state("general:chatgate").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_probability_draw_below_modifier_replies() {
    let transport = Arc::new(RecordingTransport::default());
    let provider = Arc::new(ScriptedProvider::replying("ok"));
    let pipeline = pipeline(Config::default(), &transport, &provider).with_draw(|| 0.3);

    pipeline.velocity().record_tokens("general", 1500);

    let outcome = pipeline
        .handle(incoming("m1", "alice", "hello"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(outcome, PipelineOutcome::Replied { .. }));
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_leader_keeps_its_own_burst() {
    let transport = Arc::new(RecordingTransport::default());
    let provider = Arc::new(ScriptedProvider::replying("ok").with_latency(Duration::from_secs(5)));
    let pipeline = Arc::new(pipeline(Config::default(), &transport, &provider));
    let cancel = CancellationToken::new();

    // m1 leads alone; its window closes at 1.5s and the provider takes 5s
    let m1 = incoming("m1", "alice", "first");
    transport.push(&m1);
    let first = {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.handle(m1, &cancel).await })
    };

    // a new burst opens while m1 is still waiting on the provider
    tokio::time::sleep(Duration::from_millis(2000)).await;
    let m2 = incoming("m2", "bob", "second");
    let m3 = incoming("m3", "bob", "third");
    transport.push(&m2);
    transport.push(&m3);
    let (r2, r3) = tokio::join!(pipeline.handle(m2, &cancel), pipeline.handle(m3, &cancel));

    match first.await.unwrap().unwrap() {
        PipelineOutcome::Replied { reply_to, .. } => assert_eq!(reply_to, None),
        other => panic!("expected reply, got {:?}", other),
    }
    match r2.unwrap() {
        PipelineOutcome::Replied { reply_to, .. } => assert_eq!(reply_to.as_deref(), Some("m3")),
        other => panic!("expected reply, got {:?}", other),
    }
    assert_eq!(r3.unwrap(), PipelineOutcome::Coalesced);

    let mut targets: Vec<_> = transport.sent().into_iter().map(|(_, _, reply_to)| reply_to).collect();
    targets.sort();
    assert_eq!(targets, vec![None, Some("m3".to_string())]);

    let prompts: Vec<_> = provider.calls().into_iter().map(|(prompt, _, _)| prompt).collect();
    assert_eq!(prompts, vec!["first".to_string(), "second\nthird".to_string()]);

    // the newer burst cleared its own window
    assert!(pipeline.coalescer().state("general:chatgate").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_wait_leaves_state() {
    let transport = Arc::new(RecordingTransport::default());
    let provider = Arc::new(ScriptedProvider::replying("ok"));
    let pipeline = pipeline(Config::default(), &transport, &provider);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = pipeline.handle(incoming("m1", "alice", "hello"), &cancel).await.unwrap();

    assert_eq!(outcome, PipelineOutcome::Cancelled);
    assert!(pipeline.coalescer().state("general:chatgate").is_some());
    assert!(transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_over_budget_history_is_trimmed_and_tuner_backs_off() {
    // 400 chars = 100 tokens + 6 overhead each
    let long_text = "y".repeat(400);
    let history: Vec<_> = (0..30).map(|i| history_message(i, &long_text)).collect();
    let transport = Arc::new(RecordingTransport::with_history(history));
    let provider = Arc::new(ScriptedProvider::replying("ok"));

    let mut config = Config::default();
    config.history.input_budget_tokens = 1000;
    config.history.base_limit = 20;
    let pipeline = pipeline(config, &transport, &provider);

    let outcome = pipeline
        .handle(incoming("m1", "alice", "hey"), &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        PipelineOutcome::Replied { kept, trimmed, .. } => {
            assert_eq!(kept, 9);
            assert_eq!(trimmed, 11);
        }
        other => panic!("expected reply, got {:?}", other),
    }

    let state = pipeline.tuner().snapshot("general").unwrap();
    assert!(state.desired_limit < 20);
    assert_eq!(state.last_seen_count, 20);
}

#[tokio::test(start_paused = true)]
async fn test_min_keep_raises_fetch_limit() {
    let history: Vec<_> = (0..30).map(|i| history_message(i, "short")).collect();
    let transport = Arc::new(RecordingTransport::with_history(history));
    let provider = Arc::new(ScriptedProvider::replying("ok"));

    let mut config = Config::default();
    config.history.base_limit = 6;
    config.history.min_keep_messages = 10;
    let pipeline = pipeline(config, &transport, &provider);

    pipeline
        .handle(incoming("m1", "alice", "hey"), &CancellationToken::new())
        .await
        .unwrap();

    // tuner alone would have fetched 6
    assert_eq!(provider.calls()[0].1, 10);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_propagates_and_clears_window() {
    let transport = Arc::new(RecordingTransport {
        fail_fetch: true,
        ..Default::default()
    });
    let provider = Arc::new(ScriptedProvider::replying("ok"));
    let pipeline = pipeline(Config::default(), &transport, &provider);

    let result = pipeline
        .handle(incoming("m1", "alice", "hello"), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(PipelineError::Transport(ChannelError::FetchFailed(_)))));
    assert!(pipeline.coalescer().state("general:chatgate").is_none());
}
