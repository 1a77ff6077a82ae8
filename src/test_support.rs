//! Shared fixtures for unit tests: a scripted `MessageSender` and episode and
//! story builders.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::anthropic::{
    AnthropicError, ContentBlock, MessageSender, MessagesRequest, MessagesResponse, Usage,
};
use crate::assigner::Strategy;
use crate::state_machine::{Episode, EpisodeInput};
use crate::story::{Story, StorySource, parse_story_collection};

type Responder = Box<dyn Fn(usize, &MessagesRequest) -> Result<String, AnthropicError> + Send + Sync>;

/// Answers each request through a closure that sees the call index and the
/// request, optionally after a (virtual-time) delay.
pub struct ScriptedSender {
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
    responder: Responder,
}

impl ScriptedSender {
    pub fn new(
        responder: impl Fn(usize, &MessagesRequest) -> Result<String, AnthropicError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            delay: None,
            responder: Box::new(responder),
        }
    }

    /// Every call returns `text`.
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_, _| Ok(text.clone()))
    }

    /// Every call fails with a 500.
    pub fn failing() -> Self {
        Self::new(|_, _| Err(server_error()))
    }

    /// Valid collections for both strategies; quality depends on `body_len`.
    pub fn healthy(body_len: usize) -> Self {
        Self::always(stories_json(2, body_len))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// System prompts in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl MessageSender for ScriptedSender {
    async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, AnthropicError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap()
            .push(req.system.clone().unwrap_or_default());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(index, req).map(|text| response(&text))
    }
}

pub fn is_primary(req: &MessagesRequest) -> bool {
    req.system
        .as_deref()
        .is_some_and(|s| s.starts_with("## Single-pass"))
}

pub fn server_error() -> AnthropicError {
    AnthropicError::ApiError {
        status: 500,
        message: "mock failure".into(),
    }
}

pub fn response(text: &str) -> MessagesResponse {
    MessagesResponse {
        id: "msg_mock".into(),
        content: vec![ContentBlock {
            content_type: "text".into(),
            text: text.to_string(),
        }],
        model: "mock".into(),
        stop_reason: Some("end_turn".into()),
        usage: Usage::default(),
    }
}

/// A well-formed collection of `count` stories. Distinct `body_len` values
/// give distinct fingerprints.
pub fn stories_json(count: usize, body_len: usize) -> String {
    let stories: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            serde_json::json!({
                "id": format!("story-{i}"),
                "title": format!("Lesson {i}"),
                "summary": "What the episode teaches",
                "full_content": format!("{i} {}", "x".repeat(body_len)),
                "content_type": "risk-lesson"
            })
        })
        .collect();
    serde_json::json!({ "investing-dojo-stories": stories }).to_string()
}

/// Parsed primary stories for episode `guid`.
pub fn stories(guid: &str, count: usize, body_len: usize) -> Vec<Story> {
    let (ep, _) = episode(guid);
    let source = StorySource {
        episode_id: ep.id,
        episode_title: ep.title,
        strategy: Strategy::Primary,
        generated_at: Utc::now(),
    };
    parse_story_collection(&stories_json(count, body_len), &source).unwrap()
}

/// An episode ready for generation, plus its transcript.
pub fn episode(guid: &str) -> (Episode, String) {
    EpisodeInput {
        feed_id: "feed".into(),
        guid: guid.into(),
        title: format!("Episode {guid}"),
        audio_ref: format!("{guid}.mp3"),
        discovered_at: Utc::now(),
        transcript: format!("transcript of {guid}"),
    }
    .into_episode()
}
