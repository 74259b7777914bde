//! Seams to the external speech and language services and to the outbound audio path.
//!
//! Every streaming call returns an `mpsc::Receiver`; dropping the receiver (or, for the
//! transcriber, the audio sender) is how a caller stops the stream.

use crate::config::SamplingParams;
use crate::context::ContextSnapshot;
use crate::error::{ProviderError, TransportError};
use crate::functions::FunctionSpec;
use crate::types::{AudioFrame, TranscriptEvent, VadEvent};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub type ProviderStream<T> = mpsc::Receiver<Result<T, ProviderError>>;

/// Handles for one open transcription stream.
pub struct TranscriberSession {
    /// Caller audio in the transport's native encoding. Dropping it stops the stream.
    pub audio: mpsc::Sender<Vec<u8>>,
    pub events: ProviderStream<TranscriptEvent>,
    /// Present when the service reports voice activity itself.
    pub voice_activity: Option<mpsc::Receiver<VadEvent>>,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<TranscriberSession, ProviderError>;
}

#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub snapshot: ContextSnapshot,
    pub functions: Vec<FunctionSpec>,
    pub sampling: SamplingParams,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GenerationItem {
    Token(String),
    /// A provider that segments its own output may hand over whole sentences.
    Sentence(String),
    FunctionCallProposal {
        tool_call_id: String,
        name: String,
        arguments: String,
    },
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    async fn start(
        &self,
        request: &GenerationRequest,
    ) -> Result<ProviderStream<GenerationItem>, ProviderError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;
    async fn start(
        &self,
        text: &str,
        voice_id: &str,
    ) -> Result<ProviderStream<AudioFrame>, ProviderError>;
}

/// Where synthesized audio leaves the engine.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Resolves once the frame has been handed to the far end; awaits backpressure.
    async fn send(&self, frame: &AudioFrame) -> Result<(), TransportError>;
    /// Discard any audio buffered downstream.
    async fn clear(&self) -> Result<(), TransportError>;
}

/// Next item of a provider stream, or a retriable `Timeout` if the stream stays silent for `idle`.
pub async fn next_or_idle<T>(
    stream: &mut ProviderStream<T>,
    idle: Duration,
    provider: &str,
) -> Option<Result<T, ProviderError>> {
    match timeout(idle, stream.recv()).await {
        Ok(item) => item,
        Err(_) => Some(Err(ProviderError::Timeout {
            provider: provider.to_string(),
            after_ms: idle.as_millis() as u64,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out() {
        let (_tx, mut rx) = mpsc::channel::<Result<u8, ProviderError>>(1);
        let item = next_or_idle(&mut rx, Duration::from_millis(500), "fake").await;
        assert_eq!(
            item,
            Some(Err(ProviderError::Timeout {
                provider: "fake".into(),
                after_ms: 500
            }))
        );
    }

    #[tokio::test]
    async fn closed_stream_ends() {
        let (tx, mut rx) = mpsc::channel::<Result<u8, ProviderError>>(1);
        tx.send(Ok(7)).await.unwrap();
        drop(tx);
        assert_eq!(
            next_or_idle(&mut rx, Duration::from_secs(1), "fake").await,
            Some(Ok(7))
        );
        assert_eq!(next_or_idle(&mut rx, Duration::from_secs(1), "fake").await, None);
    }
}
