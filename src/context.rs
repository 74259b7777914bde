//! Authoritative conversation history for one call.
//!
//! The store holds the system instruction, named slots and an ordered list of entries (turns and
//! function-call records). It is owned by the call task; nothing else mutates it.

use crate::config::ContextConfig;
use crate::consts::{SUMMARY_SLOT, USER_GOAL_SLOT};
use crate::error::ContextError;
use crate::types::{ContextSlot, FunctionCall, Speaker, Turn, TurnId};
use crate::utils::{count_words, estimate_tokens, word_prefix};

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A function call request and, once known, its response. Stored and evicted as one unit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FunctionRecord {
    pub call: FunctionCall,
    pub result: Option<serde_json::Value>,
    /// Set once an agent turn follows the response.
    pub resolved: bool,
}

impl FunctionRecord {
    pub fn new(call: FunctionCall, result: Option<serde_json::Value>) -> Self {
        Self {
            call,
            result,
            resolved: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextEntry {
    Turn(Turn),
    Function(FunctionRecord),
}

impl ContextEntry {
    pub fn tokens(&self) -> usize {
        let n = match self {
            ContextEntry::Turn(t) => estimate_tokens(&t.delivered_content),
            ContextEntry::Function(r) => {
                estimate_tokens(&r.call.name)
                    + estimate_tokens(&r.call.arguments)
                    + r.result
                        .as_ref()
                        .map(|v| estimate_tokens(&v.to_string()))
                        .unwrap_or(0)
            }
        };
        n.max(1)
    }

    /// Unresolved function records may never be dropped or folded.
    pub fn is_protected(&self) -> bool {
        matches!(self, ContextEntry::Function(r) if !r.resolved)
    }
}

/// Immutable view handed to generation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextSnapshot {
    pub system_instruction: String,
    pub slots: Vec<ContextSlot>,
    pub entries: Vec<ContextEntry>,
    pub estimated_tokens: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotUpdate {
    pub name: String,
    pub value: String,
}

/// Decides which entries to fold away and what slot values replace them.
pub trait CompressionStrategy: Send + Sync {
    /// Indices into `entries` to fold, aiming to free at least `tokens_to_free`.
    fn select(&self, entries: &[ContextEntry], tokens_to_free: usize) -> Vec<usize>;

    fn fold(&self, folded: &[ContextEntry], slots: &BTreeMap<String, ContextSlot>) -> Vec<SlotUpdate>;
}

/// Folds the oldest resolved entries into an extractive running summary slot. The newest entry is
/// never folded: it is the turn about to be answered.
#[derive(Clone, Debug)]
pub struct SlotSummaryStrategy {
    pub max_words: usize,
}

impl CompressionStrategy for SlotSummaryStrategy {
    fn select(&self, entries: &[ContextEntry], tokens_to_free: usize) -> Vec<usize> {
        let mut freed = 0;
        let mut picked = vec![];
        let foldable = entries.len().saturating_sub(1);
        for (idx, entry) in entries.iter().enumerate().take(foldable) {
            if freed >= tokens_to_free {
                break;
            }
            if entry.is_protected() {
                continue;
            }
            freed += entry.tokens();
            picked.push(idx);
        }
        picked
    }

    fn fold(&self, folded: &[ContextEntry], slots: &BTreeMap<String, ContextSlot>) -> Vec<SlotUpdate> {
        let mut summary = slots
            .get(SUMMARY_SLOT)
            .map(|s| s.value.clone())
            .unwrap_or_default();
        for entry in folded {
            let line = match entry {
                ContextEntry::Turn(t) if t.delivered_content.is_empty() => continue,
                ContextEntry::Turn(t) => match t.speaker {
                    Speaker::User => format!("User: {}", t.delivered_content),
                    Speaker::Agent => format!("Agent: {}", t.delivered_content),
                },
                ContextEntry::Function(r) => format!(
                    "Called {} -> {}",
                    r.call.name,
                    r.result
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "no result".to_string())
                ),
            };
            if !summary.is_empty() {
                summary.push(' ');
            }
            summary.push_str(&line);
        }
        // keep the most recent words
        let words: Vec<&str> = summary.split_whitespace().collect();
        let start = words.len().saturating_sub(self.max_words);
        let mut updates = vec![SlotUpdate {
            name: SUMMARY_SLOT.to_string(),
            value: words[start..].join(" "),
        }];

        let has_goal = slots
            .get(USER_GOAL_SLOT)
            .map(|s| !s.stale && !s.value.is_empty())
            .unwrap_or(false);
        if !has_goal {
            let first_user = folded.iter().find_map(|e| match e {
                ContextEntry::Turn(t) if t.speaker == Speaker::User && !t.content.is_empty() => {
                    Some(t.content.clone())
                }
                _ => None,
            });
            if let Some(goal) = first_user {
                updates.push(SlotUpdate {
                    name: USER_GOAL_SLOT.to_string(),
                    value: goal,
                });
            }
        }
        updates
    }
}

pub struct ContextStore {
    system_instruction: String,
    slots: BTreeMap<String, ContextSlot>,
    entries: Vec<ContextEntry>,
    budget_tokens: usize,
    compress_threshold: f32,
    compress_target: f32,
    strategy: Arc<dyn CompressionStrategy>,
}

impl ContextStore {
    pub fn new(system_instruction: impl Into<String>, config: &ContextConfig) -> Self {
        Self::with_strategy(
            system_instruction,
            config,
            Arc::new(SlotSummaryStrategy {
                max_words: config.summary_max_words,
            }),
        )
    }

    pub fn with_strategy(
        system_instruction: impl Into<String>,
        config: &ContextConfig,
        strategy: Arc<dyn CompressionStrategy>,
    ) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            slots: BTreeMap::new(),
            entries: vec![],
            budget_tokens: config.budget_tokens,
            compress_threshold: config.compress_threshold,
            compress_target: config.compress_target,
            strategy,
        }
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.entries.iter().filter_map(|e| match e {
            ContextEntry::Turn(t) => Some(t),
            ContextEntry::Function(_) => None,
        })
    }

    pub fn slot(&self, name: &str) -> Option<&ContextSlot> {
        self.slots.get(name)
    }

    pub fn slots(&self) -> Vec<ContextSlot> {
        self.slots.values().cloned().collect()
    }

    fn fixed_tokens(&self) -> usize {
        estimate_tokens(&self.system_instruction)
            + self
                .slots
                .values()
                .map(|s| estimate_tokens(&s.name) + estimate_tokens(&s.value))
                .sum::<usize>()
    }

    pub fn total_tokens(&self) -> usize {
        self.fixed_tokens() + self.entries.iter().map(ContextEntry::tokens).sum::<usize>()
    }

    pub fn occupancy(&self) -> f32 {
        self.total_tokens() as f32 / self.budget_tokens.max(1) as f32
    }

    /// Append a closed turn. An agent turn resolves every answered function record before it.
    pub fn append(&mut self, turn: Turn) -> Result<(), ContextError> {
        if turn.is_open() {
            return Err(ContextError::OpenTurn(turn.turn_id));
        }
        if turn.speaker == Speaker::Agent {
            for entry in self.entries.iter_mut() {
                if let ContextEntry::Function(r) = entry {
                    if r.result.is_some() {
                        r.resolved = true;
                    }
                }
            }
        }
        debug!(turn_id=%turn.turn_id, speaker=?turn.speaker, "context append");
        self.entries.push(ContextEntry::Turn(turn));
        self.maybe_compress()
    }

    /// Insert a function record, or update the one with the same tool call id.
    pub fn record_function_call(&mut self, record: FunctionRecord) -> Result<(), ContextError> {
        let existing = self.entries.iter_mut().find_map(|e| match e {
            ContextEntry::Function(r) if r.call.tool_call_id == record.call.tool_call_id => Some(r),
            _ => None,
        });
        match existing {
            Some(r) => *r = record,
            None => self.entries.push(ContextEntry::Function(record)),
        }
        self.maybe_compress()
    }

    /// Cut an agent turn down to the words the caller actually heard.
    pub fn reconcile_after_interruption(
        &mut self,
        turn_id: TurnId,
        delivered_content: &str,
    ) -> Result<(), ContextError> {
        let turn = self
            .entries
            .iter_mut()
            .find_map(|e| match e {
                ContextEntry::Turn(t) if t.turn_id == turn_id => Some(t),
                _ => None,
            })
            .ok_or(ContextError::UnknownTurn(turn_id))?;
        if turn.speaker != Speaker::Agent {
            return Err(ContextError::NotAgentTurn(turn_id));
        }
        let matched = turn
            .content
            .split_whitespace()
            .zip(delivered_content.split_whitespace())
            .take_while(|(a, b)| a == b)
            .count();
        if matched < count_words(delivered_content) {
            warn!(turn_id=%turn_id, "delivered content diverges from generated content; keeping common prefix");
        }
        let delivered = word_prefix(&turn.content, matched);
        turn.interrupted = matched < count_words(&turn.content);
        turn.content = delivered.clone();
        turn.delivered_content = delivered;
        debug!(turn_id=%turn_id, words=%matched, "agent turn reconciled");
        Ok(())
    }

    pub fn set_slot(&mut self, name: &str, value: impl Into<String>, turn: Option<TurnId>) {
        let slot = self.slots.entry(name.to_string()).or_insert_with(|| ContextSlot {
            name: name.to_string(),
            value: String::new(),
            updated_at_turn: None,
            stale: false,
        });
        slot.value = value.into();
        slot.updated_at_turn = turn;
        slot.stale = false;
    }

    /// Returns false if no such slot exists.
    pub fn mark_slot_stale(&mut self, name: &str) -> bool {
        match self.slots.get_mut(name) {
            Some(slot) => {
                slot.stale = true;
                true
            }
            None => false,
        }
    }

    /// Budget-fitting view: system instruction, slots, every unresolved record and as many of
    /// the most recent entries as fit.
    pub fn snapshot(&self) -> ContextSnapshot {
        let fixed = self.fixed_tokens();
        let mut remaining = self.budget_tokens.saturating_sub(fixed);
        let mut keep = vec![false; self.entries.len()];
        let mut window_open = true;
        for (idx, entry) in self.entries.iter().enumerate().rev() {
            let cost = entry.tokens();
            if entry.is_protected() {
                keep[idx] = true;
                remaining = remaining.saturating_sub(cost);
            } else if window_open && cost <= remaining {
                keep[idx] = true;
                remaining -= cost;
            } else {
                window_open = false;
            }
        }
        let entries: Vec<ContextEntry> = self
            .entries
            .iter()
            .zip(keep)
            .filter_map(|(e, k)| k.then(|| e.clone()))
            .collect();
        let estimated_tokens = fixed + entries.iter().map(ContextEntry::tokens).sum::<usize>();
        ContextSnapshot {
            system_instruction: self.system_instruction.clone(),
            slots: self.slots(),
            entries,
            estimated_tokens,
        }
    }

    fn maybe_compress(&mut self) -> Result<(), ContextError> {
        if self.occupancy() <= self.compress_threshold {
            return Ok(());
        }
        let target = (self.budget_tokens as f32 * self.compress_target) as usize;
        debug!(occupancy=%self.occupancy(), "compressing context");
        while self.total_tokens() > target {
            let to_free = self.total_tokens() - target;
            let mut picked = self.strategy.select(&self.entries, to_free);
            picked.sort_unstable();
            picked.dedup();
            if picked.is_empty() {
                warn!(occupancy=%self.occupancy(), "nothing left to compress");
                break;
            }
            for &idx in &picked {
                match self.entries.get(idx) {
                    None => {
                        return Err(ContextError::InvariantViolation(format!(
                            "compression selected missing entry {idx}"
                        )))
                    }
                    Some(e) if e.is_protected() => {
                        return Err(ContextError::InvariantViolation(
                            "compression selected an unresolved function call".to_string(),
                        ))
                    }
                    Some(_) => {}
                }
            }
            let folded: Vec<ContextEntry> =
                picked.iter().map(|&idx| self.entries[idx].clone()).collect();
            let latest_turn = self.turns().last().map(|t| t.turn_id);
            for update in self.strategy.fold(&folded, &self.slots) {
                self.set_slot(&update.name, update.value, latest_turn);
            }
            for &idx in picked.iter().rev() {
                self.entries.remove(idx);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FunctionCallStatus;
    use uuid::Uuid;

    fn config(budget_tokens: usize) -> ContextConfig {
        ContextConfig {
            budget_tokens,
            ..Default::default()
        }
    }

    fn turn(id: u64, speaker: Speaker, content: &str) -> Turn {
        Turn::open(TurnId(id), speaker, id * 1_000).close(id * 1_000 + 500, content)
    }

    fn record(tool_call_id: &str, result: Option<serde_json::Value>) -> FunctionRecord {
        let mut call = FunctionCall::proposed(
            Uuid::new_v4(),
            tool_call_id,
            "get_order_status",
            r#"{"order_id":"123"}"#,
        );
        call.status = FunctionCallStatus::Executed;
        FunctionRecord::new(call, result)
    }

    #[test]
    fn reconcile_keeps_delivered_prefix() {
        let mut store = ContextStore::new("system", &config(4_096));
        store.append(turn(1, Speaker::User, "Where is my order?")).unwrap();
        store
            .append(turn(2, Speaker::Agent, "Your order will arrive on Tuesday."))
            .unwrap();
        store
            .reconcile_after_interruption(TurnId(2), "Your order will arrive on")
            .unwrap();
        let agent = store.turns().last().unwrap();
        assert_eq!(agent.content, "Your order will arrive on");
        assert_eq!(agent.delivered_content, "Your order will arrive on");
        assert!(agent.interrupted);
    }

    #[test]
    fn reconcile_rejects_user_and_unknown_turns() {
        let mut store = ContextStore::new("system", &config(4_096));
        store.append(turn(1, Speaker::User, "hello")).unwrap();
        assert_eq!(
            store.reconcile_after_interruption(TurnId(1), "hel"),
            Err(ContextError::NotAgentTurn(TurnId(1)))
        );
        assert_eq!(
            store.reconcile_after_interruption(TurnId(9), ""),
            Err(ContextError::UnknownTurn(TurnId(9)))
        );
    }

    #[test]
    fn reconcile_with_divergent_text_uses_common_prefix() {
        let mut store = ContextStore::new("system", &config(4_096));
        store.append(turn(2, Speaker::Agent, "one two three four")).unwrap();
        store.reconcile_after_interruption(TurnId(2), "one two five").unwrap();
        assert_eq!(store.turns().next().unwrap().content, "one two");
    }

    #[test]
    fn open_turns_are_refused() {
        let mut store = ContextStore::new("system", &config(4_096));
        let open = Turn::open(TurnId(1), Speaker::User, 0);
        assert_eq!(store.append(open), Err(ContextError::OpenTurn(TurnId(1))));
    }

    #[test]
    fn snapshot_is_side_effect_free() {
        let mut store = ContextStore::new("system", &config(4_096));
        store.append(turn(1, Speaker::User, "hello")).unwrap();
        let a = store.snapshot();
        let b = store.snapshot();
        assert_eq!(a, b);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn snapshot_fits_budget_but_keeps_unresolved_records() {
        let mut store = ContextStore::new("sys", &ContextConfig {
            budget_tokens: 60,
            compress_threshold: 10.0,
            compress_target: 9.0,
            summary_max_words: 10,
        });
        store
            .record_function_call(record("call_0", Some(serde_json::json!({"status": "shipped"}))))
            .unwrap();
        for i in 1..=10 {
            store
                .append(turn(i, Speaker::User, "a fairly long sentence of text"))
                .unwrap();
        }
        let snap = store.snapshot();
        assert!(snap
            .entries
            .iter()
            .any(|e| matches!(e, ContextEntry::Function(r) if r.call.tool_call_id == "call_0")));
        assert!(snap.entries.len() < store.entries().len());
        // most recent entry always wins over older ones
        assert_eq!(snap.entries.last(), store.entries().last());
    }

    #[test]
    fn agent_turn_resolves_answered_records() {
        let mut store = ContextStore::new("system", &config(4_096));
        store.record_function_call(record("call_1", None)).unwrap();
        store
            .record_function_call(record("call_2", Some(serde_json::json!({"ok": true}))))
            .unwrap();
        store.append(turn(3, Speaker::Agent, "Done.")).unwrap();
        let resolved: Vec<bool> = store
            .entries()
            .iter()
            .filter_map(|e| match e {
                ContextEntry::Function(r) => Some(r.resolved),
                _ => None,
            })
            .collect();
        assert_eq!(resolved, vec![false, true]);
    }

    #[test]
    fn compression_folds_oldest_resolved_turns() {
        let system = "You are a helpful assistant for Acme orders.";
        let text = |i: u64| {
            format!(
                "turn number {i} {}",
                "says something moderately long here. ".repeat(3).trim_end()
            )
        };
        let mut store = ContextStore::new(system, &config(1_000));
        for i in 1..=40 {
            let speaker = if i % 2 == 1 { Speaker::User } else { Speaker::Agent };
            store.append(turn(i, speaker, &text(i))).unwrap();
        }
        store
            .record_function_call(record("call_9", Some(serde_json::json!({"status": "shipped"}))))
            .unwrap();
        store.append(turn(41, Speaker::User, "and then?")).unwrap();

        assert!(store.occupancy() <= 0.8);
        assert_eq!(store.system_instruction(), system);
        assert!(store.slot(SUMMARY_SLOT).is_some());
        assert_eq!(
            store.slot(USER_GOAL_SLOT).map(|s| s.value.as_str()),
            Some(text(1).as_str())
        );
        assert!(store
            .entries()
            .iter()
            .any(|e| matches!(e, ContextEntry::Function(r) if r.call.tool_call_id == "call_9")));
        // the oldest turns are the ones folded away
        assert!(store.turns().all(|t| t.turn_id != TurnId(1)));
        assert!(store.turns().any(|t| t.turn_id == TurnId(41)));
    }

    #[test]
    fn newest_turn_is_never_folded() {
        let mut store = ContextStore::new("system", &config(200));
        for i in 1..=4 {
            let speaker = if i % 2 == 1 { Speaker::User } else { Speaker::Agent };
            store.append(turn(i, speaker, "short and sweet")).unwrap();
        }
        let long = "word ".repeat(200);
        store.append(turn(5, Speaker::User, long.trim_end())).unwrap();

        let kept: Vec<TurnId> = store.turns().map(|t| t.turn_id).collect();
        assert_eq!(kept, vec![TurnId(5)]);
        assert_eq!(store.turns().last().unwrap().content, long.trim_end());
        let summary = store.slot(SUMMARY_SLOT).unwrap();
        assert!(!summary.value.contains("word word"));
    }

    struct Greedy;

    impl CompressionStrategy for Greedy {
        fn select(&self, entries: &[ContextEntry], _: usize) -> Vec<usize> {
            (0..entries.len()).collect()
        }

        fn fold(&self, _: &[ContextEntry], _: &BTreeMap<String, ContextSlot>) -> Vec<SlotUpdate> {
            vec![]
        }
    }

    #[test]
    fn folding_an_unresolved_record_is_an_invariant_violation() {
        let mut store = ContextStore::with_strategy("sys", &config(40), Arc::new(Greedy));
        store
            .record_function_call(record("call_1", Some(serde_json::json!({"ok": true}))))
            .unwrap();
        let err = store
            .append(turn(2, Speaker::User, &"word ".repeat(60)))
            .unwrap_err();
        assert!(matches!(err, ContextError::InvariantViolation(_)));
    }

    #[test]
    fn slots_are_overwritten_or_marked_stale() {
        let mut store = ContextStore::new("system", &config(4_096));
        store.set_slot("pending_action", "cancel_order", Some(TurnId(2)));
        store.set_slot("pending_action", "refund", Some(TurnId(4)));
        assert!(store.mark_slot_stale("pending_action"));
        assert!(!store.mark_slot_stale("missing"));
        let slot = store.slot("pending_action").unwrap();
        assert_eq!(slot.value, "refund");
        assert!(slot.stale);
        assert_eq!(slot.updated_at_turn, Some(TurnId(4)));
    }
}
