use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use tokio_util::sync::CancellationToken;

use orrery_types::LlmError;

use crate::{Request, Response, StreamEvent};

/// A pinned, boxed stream of [`StreamEvent`]s.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// The interface every LLM provider must implement.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The provider identifier (e.g. "anthropic").
    fn name(&self) -> &str;

    /// Send a request and block until the response is ready.
    async fn complete(
        &self,
        token: &CancellationToken,
        request: &Request,
    ) -> Result<Response, LlmError>;

    /// Send a request and return a stream of events. Errors after the stream
    /// starts are delivered in-band as [`StreamEvent::Error`].
    fn stream(&self, token: &CancellationToken, request: &Request) -> EventStream;

    /// Release resources.
    async fn close(&self) {}
}

/// Replay a completed response as a minimal Start / Delta / End stream.
/// Used by adapters whose wire protocol is driven in blocking mode.
pub fn replay_as_stream(
    result: Result<Response, LlmError>,
) -> EventStream {
    let events = match result {
        Ok(resp) => {
            let mut events = vec![StreamEvent::Start {
                id: resp.id.clone(),
                model: resp.model.clone(),
            }];
            if !resp.content.is_empty() {
                events.push(StreamEvent::Delta {
                    text: resp.content.clone(),
                });
            }
            if let Some(reasoning) = &resp.reasoning {
                events.push(StreamEvent::ReasoningDelta {
                    text: reasoning.clone(),
                });
            }
            for tc in &resp.tool_calls {
                events.push(StreamEvent::ToolCallStart {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                });
                events.push(StreamEvent::ToolCallDelta {
                    id: tc.id.clone(),
                    arguments: tc.arguments.to_string(),
                });
                events.push(StreamEvent::ToolCallEnd { id: tc.id.clone() });
            }
            events.push(StreamEvent::End {
                finish_reason: resp.finish_reason,
                usage: resp.usage,
            });
            events
        }
        Err(err) => vec![StreamEvent::Error(std::sync::Arc::new(err))],
    };
    Box::pin(tokio_stream::iter(events))
}

/// Drive a blocking completion future and deliver its outcome as a stream.
/// The future runs on a spawned task so the stream is lazy for the caller.
pub fn stream_via_complete<F>(fut: F) -> EventStream
where
    F: std::future::Future<Output = Result<Response, LlmError>> + Send + 'static,
{
    use tokio_stream::StreamExt;
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        let mut replay = replay_as_stream(fut.await);
        while let Some(event) = replay.next().await {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
}

/// Object-safe wrapper around a boxed provider adapter.
pub struct DynProvider(Box<dyn ProviderAdapter>);

impl DynProvider {
    pub fn new(provider: impl ProviderAdapter + 'static) -> Self {
        Self(Box::new(provider))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub async fn complete(
        &self,
        token: &CancellationToken,
        request: &Request,
    ) -> Result<Response, LlmError> {
        self.0.complete(token, request).await
    }

    pub fn stream(&self, token: &CancellationToken, request: &Request) -> EventStream {
        self.0.stream(token, request)
    }

    pub async fn close(&self) {
        self.0.close().await
    }
}
