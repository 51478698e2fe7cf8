//! Collaborator model interfaces and the chat relay.
//!
//! The SDK never talks to a model vendor itself; hosts plug their own
//! clients in behind [`ChatModel`] and [`VideoModel`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::stream::events::ChatMessage;

/// Chat messages starting with this prefix are questions for the model.
pub const QUESTION_PREFIX: char = '@';

/// Relay events buffered for the host before new ones are dropped.
pub const RELAY_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("model request failed: {0}")]
    Request(String),

    #[error("model returned an empty reply")]
    EmptyReply,

    #[error("video job {job_id} still {status} after {polls} polls")]
    StillPending {
        job_id: String,
        status: String,
        polls: u32,
    },
}

/// Text-in, text-out language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, text: &str) -> Result<String, CollabError>;
}

/// Video generation request. Unset optional fields are omitted on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_audio: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Accepted generation job.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VideoJob {
    pub id: String,
    pub request_id: String,
    pub model: String,
    pub task_status: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratedVideo {
    pub url: String,
    pub cover_image_url: String,
}

/// State of a generation job, with its videos once finished.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VideoResult {
    pub model: String,
    pub request_id: String,
    pub task_status: String,
    pub video_result: Vec<GeneratedVideo>,
}

impl VideoResult {
    pub const PROCESSING: &'static str = "PROCESSING";

    pub fn is_finished(&self) -> bool {
        self.task_status != Self::PROCESSING
    }
}

/// Asynchronous video generation service.
#[async_trait]
pub trait VideoModel: Send + Sync {
    async fn generate(&self, request: &VideoRequest) -> Result<VideoJob, CollabError>;

    async fn retrieve(&self, job_id: &str) -> Result<VideoResult, CollabError>;
}

/// Retrieves `job_id` until it leaves `PROCESSING`, at most `max_polls` times.
pub async fn poll_video(
    model: &dyn VideoModel,
    job_id: &str,
    interval: Duration,
    max_polls: u32,
) -> Result<VideoResult, CollabError> {
    let mut status = String::new();
    for poll in 1..=max_polls {
        let result = model.retrieve(job_id).await?;
        if result.is_finished() {
            debug!(event = "video_job_finished", job_id, status = %result.task_status, poll);
            return Ok(result);
        }
        status = result.task_status;
        if poll < max_polls {
            tokio::time::sleep(interval).await;
        }
    }
    Err(CollabError::StillPending {
        job_id: job_id.to_string(),
        status,
        polls: max_polls,
    })
}

/// Viewer question extracted from a chat message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub uname: String,
    pub uface: String,
    pub text: String,
}

impl Question {
    /// Returns the question carried by `chat`, if it is addressed to the model.
    pub fn from_chat(chat: &ChatMessage) -> Option<Self> {
        let text = chat.msg.strip_prefix(QUESTION_PREFIX)?.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            uname: chat.uname.clone(),
            uface: chat.uface.clone(),
            text: text.to_string(),
        })
    }
}

/// Output of the relay, question first and then its answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    Question(Question),
    Answer { question: Question, reply: String },
}

/// Forwards viewer questions to a [`ChatModel`].
///
/// Model calls run on their own tasks so a slow model never holds up event
/// dispatch. Events that do not fit in the host's queue are logged and
/// dropped.
pub struct ChatRelay {
    model: Arc<dyn ChatModel>,
    events: mpsc::Sender<RelayEvent>,
}

impl ChatRelay {
    pub fn new(model: Arc<dyn ChatModel>) -> (Self, mpsc::Receiver<RelayEvent>) {
        Self::with_capacity(model, RELAY_QUEUE_CAPACITY)
    }

    pub fn with_capacity(
        model: Arc<dyn ChatModel>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        (Self { model, events }, rx)
    }

    /// Handles one chat message. Must be called from within a Tokio runtime.
    ///
    /// Returns `true` when the message was a question and a model call was
    /// started.
    pub fn handle(&self, chat: &ChatMessage) -> bool {
        let Some(question) = Question::from_chat(chat) else {
            return false;
        };
        debug!(event = "relay_question", uname = %question.uname);
        if !emit(&self.events, RelayEvent::Question(question.clone())) {
            return false;
        }

        let model = self.model.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match model.chat(&question.text).await {
                Ok(reply) if reply.trim().is_empty() => {
                    warn!(event = "relay_model_failed", error = %CollabError::EmptyReply);
                }
                Ok(reply) => {
                    emit(&events, RelayEvent::Answer { question, reply });
                }
                Err(err) => warn!(event = "relay_model_failed", error = %err),
            }
        });
        true
    }
}

/// Returns `false` once the host has dropped its receiver.
fn emit(events: &mpsc::Sender<RelayEvent>, event: RelayEvent) -> bool {
    match events.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            warn!(event = "relay_event_dropped", dropped = ?dropped);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
