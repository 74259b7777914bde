//! Barge-in: stop generation and synthesis together, within a fixed budget, and report what the
//! caller actually heard.

use crate::events::EventEmitter;
use crate::generation::GenerationHandle;
use crate::synthesis::SynthesisHandle;
use crate::types::{DeliveredWord, TurnId};

use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug)]
pub struct InterruptionReport {
    pub turn_id: TurnId,
    /// Text of the generation round in flight when the cancel landed.
    pub generated_text: String,
    pub delivered_words: Vec<DeliveredWord>,
    /// Both pipelines stopped inside the budget.
    pub acknowledged: bool,
    pub elapsed: Duration,
}

impl InterruptionReport {
    pub fn delivered_text(&self) -> String {
        self.delivered_words
            .iter()
            .map(|w| w.word.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub struct InterruptionCoordinator {
    budget: Duration,
    emitter: EventEmitter,
}

impl InterruptionCoordinator {
    pub fn new(budget: Duration, emitter: EventEmitter) -> Self {
        Self { budget, emitter }
    }

    pub async fn interrupt(
        &self,
        turn_id: TurnId,
        generation: Option<&mut GenerationHandle>,
        synthesis: Option<&mut SynthesisHandle>,
    ) -> InterruptionReport {
        let started = Instant::now();
        let budget = self.budget;
        let (generation, synthesis) = tokio::join!(
            async {
                match generation {
                    Some(g) => Some(g.cancel(budget).await),
                    None => None,
                }
            },
            async {
                match synthesis {
                    Some(s) => Some(s.cancel(budget).await),
                    None => None,
                }
            },
        );
        let elapsed = started.elapsed();
        let acknowledged = generation.as_ref().map(|g| g.acknowledged).unwrap_or(true)
            && synthesis.as_ref().map(|s| s.acknowledged).unwrap_or(true);
        let report = InterruptionReport {
            turn_id,
            generated_text: generation.map(|g| g.generated_text).unwrap_or_default(),
            delivered_words: synthesis.map(|s| s.delivered_words).unwrap_or_default(),
            acknowledged,
            elapsed,
        };
        if !acknowledged || elapsed > budget {
            warn!(turn_id=%turn_id, elapsed_ms=%elapsed.as_millis(), "interruption exceeded its budget");
        }
        info!(turn_id=%turn_id, delivered_words=%report.delivered_words.len(), "agent turn interrupted");
        self.emitter.emit(
            "turn.interrupted",
            json!({
                "turn_id": turn_id,
                "delivered_words": report.delivered_words.len(),
                "elapsed_ms": elapsed.as_millis() as u64,
                "acknowledged": acknowledged,
            }),
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn nothing_in_flight_is_trivially_acknowledged() {
        let coordinator =
            InterruptionCoordinator::new(Duration::from_millis(150), EventEmitter::disabled(Uuid::new_v4()));
        let report = coordinator.interrupt(TurnId(4), None, None).await;
        assert!(report.acknowledged);
        assert_eq!(report.delivered_text(), "");
        assert_eq!(report.generated_text, "");
    }

    #[test]
    fn delivered_text_joins_words() {
        let word = |w: &str| DeliveredWord {
            word: w.into(),
            chunk_index: 0,
            offset_ms: 0,
            delivered_at_ms: 0,
        };
        let report = InterruptionReport {
            turn_id: TurnId(2),
            generated_text: String::new(),
            delivered_words: vec![word("Your"), word("order")],
            acknowledged: true,
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.delivered_text(), "Your order");
    }
}
