//! LanguageModel trait: the abstraction over token-streaming LLM backends.
//!
//! The engine never talks to a vendor protocol directly. A model receives a
//! rendered prompt and hands back a [`ModelStream`] of text chunks; the
//! engine drains it through the stream projector.

use crate::context::ContextRef;
use crate::error::ModelError;
use crate::memory::MemoryId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// A single step's request to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub run_id: MemoryId,

    /// The root context driving the run.
    pub context: ContextRef,

    /// 1-based step number within the run.
    pub step: u32,

    /// The rendered prompt.
    pub prompt: String,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// A stream of text chunks from the model.
///
/// Chunks are accumulated as they are read, so the full text response is
/// available once the stream is exhausted. A stream error ends the stream
/// and is kept for [`ModelStream::error`].
#[derive(Debug)]
pub struct ModelStream {
    receiver: mpsc::Receiver<Result<String, ModelError>>,
    text: String,
    error: Option<ModelError>,
    finished: bool,
}

impl ModelStream {
    pub fn new(receiver: mpsc::Receiver<Result<String, ModelError>>) -> Self {
        Self {
            receiver,
            text: String::new(),
            error: None,
            finished: false,
        }
    }

    /// Create a stream and the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Result<String, ModelError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx))
    }

    /// A stream that yields the given chunks and then ends.
    pub fn from_chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks: Vec<String> = chunks.into_iter().map(Into::into).collect();
        let (tx, stream) = Self::channel(chunks.len());
        for chunk in chunks {
            // Capacity matches the chunk count, so this never fails
            let _ = tx.try_send(Ok(chunk));
        }
        stream
    }

    /// Next text chunk, or `None` when the stream ends or fails.
    pub async fn next(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        match self.receiver.recv().await {
            Some(Ok(chunk)) => {
                self.text.push_str(&chunk);
                Some(chunk)
            }
            Some(Err(e)) => {
                self.error = Some(e);
                self.finished = true;
                None
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// The error that ended the stream, if any.
    pub fn error(&self) -> Option<&ModelError> {
        self.error.as_ref()
    }

    /// Text received so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Drain the rest of the stream and return the full text response.
    pub async fn text_response(&mut self) -> Result<String, ModelError> {
        while self.next().await.is_some() {}
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(self.text.clone()),
        }
    }
}

/// The core LanguageModel trait.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// A human-readable name for this model (e.g., "scripted").
    fn name(&self) -> &str;

    /// Start a streamed completion. Implementations stop producing chunks
    /// once `cancel` fires.
    async fn stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError>;
}

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Stream the text, split into chunks.
    Text(String),
    /// Stream the partial text, then fail with the error.
    Interrupted { partial: String, error: ModelError },
    /// Fail the request before streaming anything.
    Fail(ModelError),
}

/// A model that replays canned responses in order.
///
/// Used by tests and by `ravel replay`. Each response is split into chunks of
/// `chunk_size` characters so the parser sees realistic partial input.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_script(responses.into_iter().map(|r| ScriptedResponse::Text(r.into())))
    }

    pub fn from_script(script: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            chunk_size: 7,
            chunk_delay: None,
        }
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Requests received so far.
    pub async fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }
}

fn split_chunks(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError> {
        self.requests.lock().await.push(request);
        let response = self
            .responses
            .lock()
            .await
            .pop_front()
            .ok_or(ModelError::Exhausted)?;

        let (text, failure) = match response {
            ScriptedResponse::Fail(e) => return Err(e),
            ScriptedResponse::Text(text) => (text, None),
            ScriptedResponse::Interrupted { partial, error } => (partial, Some(error)),
        };

        let chunks = split_chunks(&text, self.chunk_size);
        let (tx, stream) = ModelStream::channel(chunks.len() + 1);
        let delay = self.chunk_delay;

        tokio::spawn(async move {
            for chunk in chunks {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(ModelError::Aborted)).await;
                    return;
                }
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = tx.send(Err(ModelError::Aborted)).await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            if let Some(error) = failure {
                let _ = tx.send(Err(error)).await;
            }
        });

        Ok(stream)
    }
}
