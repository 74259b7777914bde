//! Turn-taking state machine.
//!
//! The controller is pure: it never performs I/O and never reads a clock. Every entry point takes
//! the current engine time and returns the new state plus the commands the owner must carry out.

use crate::config::EngineConfig;
use crate::types::{Speaker, TranscriptEvent, Turn, TurnId};
use crate::utils::count_words;

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    Idle,
    UserSpeaking,
    UserEndpointing,
    AgentGenerating,
    AgentSpeaking,
}

impl TurnState {
    pub fn is_agent(&self) -> bool {
        matches!(self, TurnState::AgentGenerating | TurnState::AgentSpeaking)
    }

    pub fn is_user(&self) -> bool {
        matches!(self, TurnState::UserSpeaking | TurnState::UserEndpointing)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcription,
    Generation,
    Synthesis,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Append the closed user turn to context, then generate into `agent_turn_id`.
    StartGeneration { user_turn: Turn, agent_turn_id: TurnId },
    /// Append a closed user turn that does not get an answer.
    CommitUserTurn { turn: Turn },
    CancelPipelines { agent_turn_id: TurnId },
    /// Store the agent turn cut down to what was actually heard.
    ReconcileContext { agent_turn_id: TurnId },
    /// Store the agent turn in full.
    CommitAgentTurn { agent_turn_id: TurnId },
    /// Call `on_tick` no earlier than `at_ms`.
    ScheduleEndpointCheck { at_ms: u64 },
    ReportError { stage: Stage, message: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub state: TurnState,
    pub commands: Vec<Command>,
}

#[derive(Clone, Debug)]
pub struct TurnControllerConfig {
    pub silence_threshold_ms: u64,
    pub min_words: usize,
    pub min_speech_ms: Option<u64>,
}

impl From<&EngineConfig> for TurnControllerConfig {
    fn from(c: &EngineConfig) -> Self {
        Self {
            silence_threshold_ms: c.endpointing.silence_threshold_ms(),
            min_words: c.interruption.min_words,
            min_speech_ms: c.interruption.min_speech_ms,
        }
    }
}

#[derive(Debug, Default)]
struct Utterance {
    id: u64,
    last_seq: u64,
    finals: Vec<String>,
    partial: Option<String>,
}

/// Transcript text accumulated for one stretch of caller speech, keyed by utterance id.
#[derive(Debug)]
struct SpeechBuffer {
    started_at_ms: u64,
    utterances: Vec<Utterance>,
    latest_partial: Option<String>,
}

impl SpeechBuffer {
    fn new(started_at_ms: u64) -> Self {
        Self {
            started_at_ms,
            utterances: vec![],
            latest_partial: None,
        }
    }

    /// Returns false for an event older than one already seen for its utterance.
    fn accept(&mut self, ev: &TranscriptEvent) -> bool {
        let idx = match self.utterances.iter().position(|u| u.id == ev.turn_id) {
            Some(idx) => {
                if ev.sequence_no < self.utterances[idx].last_seq {
                    return false;
                }
                idx
            }
            None => {
                self.utterances.push(Utterance {
                    id: ev.turn_id,
                    ..Default::default()
                });
                self.utterances.len() - 1
            }
        };
        let u = &mut self.utterances[idx];
        u.last_seq = ev.sequence_no;
        let text = ev.text.trim();
        if ev.is_final {
            if !text.is_empty() {
                u.finals.push(text.to_string());
            }
            u.partial = None;
        } else if !text.is_empty() {
            u.partial = Some(text.to_string());
            self.latest_partial = Some(text.to_string());
        }
        true
    }

    fn word_count(&self) -> usize {
        self.utterances
            .iter()
            .map(|u| {
                u.finals.iter().map(|f| count_words(f)).sum::<usize>()
                    + u.partial.as_deref().map(count_words).unwrap_or(0)
            })
            .sum()
    }

    /// Finals joined in arrival order; the latest partial when nothing was finalized.
    fn text(&self) -> String {
        let finals: Vec<&str> = self
            .utterances
            .iter()
            .flat_map(|u| u.finals.iter().map(String::as_str))
            .collect();
        if finals.is_empty() {
            self.latest_partial.clone().unwrap_or_default()
        } else {
            finals.join(" ")
        }
    }

    fn utterance_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.utterances.iter().map(|u| u.id)
    }
}

#[derive(Debug)]
struct OpenUserTurn {
    turn_id: TurnId,
    speech: SpeechBuffer,
}

#[derive(Debug)]
pub struct TurnController {
    config: TurnControllerConfig,
    state: TurnState,
    next_turn_id: u64,
    user: Option<OpenUserTurn>,
    agent: Option<TurnId>,
    /// Caller speech during an agent turn that has not yet earned an interruption.
    candidate: Option<SpeechBuffer>,
    silence_since_ms: Option<u64>,
    /// VAD says the caller is talking; false when only the transcriber signals speech.
    vad_active: bool,
    /// Highest utterance id folded into a closed turn or a discarded blip. Ids only grow within one
    /// transcription stream, so any event at or below it is late.
    closed_through: Option<u64>,
}

impl TurnController {
    pub fn new(config: TurnControllerConfig) -> Self {
        Self {
            config,
            state: TurnState::Idle,
            next_turn_id: 1,
            user: None,
            agent: None,
            candidate: None,
            silence_since_ms: None,
            vad_active: false,
            closed_through: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Currently open (user, agent) turns.
    pub fn open_turns(&self) -> (Option<TurnId>, Option<TurnId>) {
        (self.user.as_ref().map(|u| u.turn_id), self.agent)
    }

    pub fn agent_turn(&self) -> Option<TurnId> {
        self.agent
    }

    fn alloc_turn_id(&mut self) -> TurnId {
        let id = TurnId(self.next_turn_id);
        self.next_turn_id += 1;
        id
    }

    fn transition(&self, commands: Vec<Command>) -> Transition {
        Transition {
            state: self.state,
            commands,
        }
    }

    fn open_user_turn(&mut self, speech: SpeechBuffer) {
        let turn_id = self.alloc_turn_id();
        debug!(turn_id=%turn_id, "user turn opened");
        self.user = Some(OpenUserTurn { turn_id, speech });
        self.silence_since_ms = None;
        self.state = TurnState::UserSpeaking;
    }

    /// Without VAD, every transcript counts as speech followed by presumed silence.
    fn start_endpointing(&mut self, now_ms: u64, commands: &mut Vec<Command>) {
        self.state = TurnState::UserEndpointing;
        self.silence_since_ms = Some(now_ms);
        commands.push(Command::ScheduleEndpointCheck {
            at_ms: now_ms + self.config.silence_threshold_ms,
        });
    }

    pub fn on_vad_speech_start(&mut self, now_ms: u64) -> Transition {
        self.vad_active = true;
        let mut commands = vec![];
        match self.state {
            TurnState::Idle => self.open_user_turn(SpeechBuffer::new(now_ms)),
            TurnState::UserSpeaking => {}
            TurnState::UserEndpointing => {
                debug!("speech resumed before endpoint");
                self.silence_since_ms = None;
                self.state = TurnState::UserSpeaking;
            }
            TurnState::AgentGenerating | TurnState::AgentSpeaking => {
                if self.candidate.is_none() {
                    self.candidate = Some(SpeechBuffer::new(now_ms));
                    if let Some(ms) = self.config.min_speech_ms {
                        commands.push(Command::ScheduleEndpointCheck { at_ms: now_ms + ms });
                    }
                }
                if self.candidate_qualifies(now_ms) {
                    return self.barge_in(now_ms);
                }
            }
        }
        self.transition(commands)
    }

    pub fn on_vad_speech_end(&mut self, now_ms: u64) -> Transition {
        self.vad_active = false;
        let mut commands = vec![];
        match self.state {
            TurnState::UserSpeaking => self.start_endpointing(now_ms, &mut commands),
            TurnState::AgentGenerating | TurnState::AgentSpeaking => self.discard_candidate(),
            TurnState::Idle | TurnState::UserEndpointing => {}
        }
        self.transition(commands)
    }

    pub fn on_transcript(&mut self, ev: &TranscriptEvent, now_ms: u64) -> Transition {
        if matches!(self.closed_through, Some(closed) if ev.turn_id <= closed) {
            warn!(utterance=%ev.turn_id, seq=%ev.sequence_no, "transcript for closed utterance discarded");
            return self.transition(vec![]);
        }
        let mut commands = vec![];
        match self.state {
            TurnState::Idle => {
                if ev.is_empty() {
                    return self.transition(commands);
                }
                debug!("transcript without speech start; opening user turn");
                self.open_user_turn(SpeechBuffer::new(now_ms));
                self.accept_user_transcript(ev, now_ms, &mut commands);
            }
            TurnState::UserSpeaking | TurnState::UserEndpointing => {
                self.accept_user_transcript(ev, now_ms, &mut commands);
            }
            TurnState::AgentGenerating | TurnState::AgentSpeaking => {
                if self.candidate.is_none() {
                    if ev.is_empty() {
                        return self.transition(commands);
                    }
                    self.candidate = Some(SpeechBuffer::new(now_ms));
                }
                let accepted = self
                    .candidate
                    .as_mut()
                    .map(|c| c.accept(ev))
                    .unwrap_or(false);
                if !accepted {
                    warn!(utterance=%ev.turn_id, seq=%ev.sequence_no, "out-of-order transcript discarded");
                } else if self.candidate_qualifies(now_ms) {
                    return self.barge_in(now_ms);
                }
            }
        }
        self.transition(commands)
    }

    fn accept_user_transcript(
        &mut self,
        ev: &TranscriptEvent,
        now_ms: u64,
        commands: &mut Vec<Command>,
    ) {
        let Some(user) = self.user.as_mut() else {
            return;
        };
        if !user.speech.accept(ev) {
            warn!(utterance=%ev.turn_id, seq=%ev.sequence_no, "out-of-order transcript discarded");
            return;
        }
        if !self.vad_active && !ev.is_empty() {
            self.start_endpointing(now_ms, commands);
        }
    }

    /// Timer callback for endpointing and duration-based barge-in.
    pub fn on_tick(&mut self, now_ms: u64) -> Transition {
        match self.state {
            TurnState::UserEndpointing => match self.silence_since_ms {
                Some(since) if now_ms >= since + self.config.silence_threshold_ms => {
                    self.end_user_turn(now_ms)
                }
                _ => self.transition(vec![]),
            },
            TurnState::AgentGenerating | TurnState::AgentSpeaking
                if self.vad_active && self.candidate_qualifies(now_ms) =>
            {
                self.barge_in(now_ms)
            }
            _ => self.transition(vec![]),
        }
    }

    pub fn on_first_audio(&mut self, turn_id: TurnId, _now_ms: u64) -> Transition {
        if self.state == TurnState::AgentGenerating && self.agent == Some(turn_id) {
            self.state = TurnState::AgentSpeaking;
        }
        self.transition(vec![])
    }

    /// Generation finished all its rounds; the turn stays open until synthesis drains.
    pub fn on_generation_complete(&mut self, turn_id: TurnId, _now_ms: u64) -> Transition {
        if self.agent != Some(turn_id) {
            debug!(turn_id=%turn_id, "stale generation completion ignored");
        }
        self.transition(vec![])
    }

    pub fn on_synthesis_complete(&mut self, turn_id: TurnId, now_ms: u64) -> Transition {
        if self.agent != Some(turn_id) {
            debug!(turn_id=%turn_id, "stale synthesis completion ignored");
            return self.transition(vec![]);
        }
        self.agent = None;
        self.state = TurnState::Idle;
        let mut commands = vec![Command::CommitAgentTurn {
            agent_turn_id: turn_id,
        }];
        self.promote_candidate(now_ms, &mut commands);
        self.transition(commands)
    }

    pub fn on_transcriber_error(&mut self, message: &str, now_ms: u64) -> Transition {
        let mut commands = vec![];
        if self.state.is_user() {
            if let Some(turn) = self.close_user_turn(now_ms) {
                if !turn.content.is_empty() {
                    commands.push(Command::CommitUserTurn { turn });
                }
            }
            self.state = TurnState::Idle;
        } else {
            self.discard_candidate();
        }
        // the restarted stream numbers its utterances from 1 again
        self.closed_through = None;
        self.vad_active = false;
        commands.push(Command::ReportError {
            stage: Stage::Transcription,
            message: message.to_string(),
        });
        self.transition(commands)
    }

    pub fn on_generation_error(&mut self, turn_id: TurnId, message: &str, now_ms: u64) -> Transition {
        self.abort_agent_turn(turn_id, Stage::Generation, message, now_ms)
    }

    pub fn on_synthesis_error(&mut self, turn_id: TurnId, message: &str, now_ms: u64) -> Transition {
        self.abort_agent_turn(turn_id, Stage::Synthesis, message, now_ms)
    }

    fn abort_agent_turn(
        &mut self,
        turn_id: TurnId,
        stage: Stage,
        message: &str,
        now_ms: u64,
    ) -> Transition {
        if self.agent != Some(turn_id) {
            debug!(turn_id=%turn_id, ?stage, "stale pipeline error ignored");
            return self.transition(vec![]);
        }
        self.agent = None;
        self.state = TurnState::Idle;
        let mut commands = vec![
            Command::CancelPipelines {
                agent_turn_id: turn_id,
            },
            Command::ReconcileContext {
                agent_turn_id: turn_id,
            },
            Command::ReportError {
                stage,
                message: message.to_string(),
            },
        ];
        self.promote_candidate(now_ms, &mut commands);
        self.transition(commands)
    }

    fn candidate_qualifies(&self, now_ms: u64) -> bool {
        let Some(c) = self.candidate.as_ref() else {
            return false;
        };
        if self.config.min_words > 0 && c.word_count() >= self.config.min_words {
            return true;
        }
        match self.config.min_speech_ms {
            Some(ms) => self.vad_active && now_ms >= c.started_at_ms + ms,
            None => false,
        }
    }

    fn close_utterances(&mut self, ids: impl Iterator<Item = u64>) {
        if let Some(last) = ids.max() {
            self.closed_through = Some(self.closed_through.map_or(last, |c| c.max(last)));
        }
    }

    fn discard_candidate(&mut self) {
        if let Some(c) = self.candidate.take() {
            debug!(words=%c.word_count(), "speech during agent turn did not qualify");
            self.close_utterances(c.utterance_ids());
        }
    }

    fn barge_in(&mut self, now_ms: u64) -> Transition {
        let mut commands = vec![];
        if let Some(agent_turn_id) = self.agent.take() {
            debug!(turn_id=%agent_turn_id, "barge-in");
            commands.push(Command::CancelPipelines { agent_turn_id });
            commands.push(Command::ReconcileContext { agent_turn_id });
        }
        self.state = TurnState::Idle;
        self.promote_candidate(now_ms, &mut commands);
        self.transition(commands)
    }

    /// The candidate's speech seeds a new user turn.
    fn promote_candidate(&mut self, now_ms: u64, commands: &mut Vec<Command>) {
        let Some(speech) = self.candidate.take() else {
            return;
        };
        self.open_user_turn(speech);
        if !self.vad_active {
            self.start_endpointing(now_ms, commands);
        }
    }

    fn close_user_turn(&mut self, now_ms: u64) -> Option<Turn> {
        let user = self.user.take()?;
        self.silence_since_ms = None;
        self.close_utterances(user.speech.utterance_ids());
        let text = user.speech.text();
        Some(
            Turn::open(user.turn_id, Speaker::User, user.speech.started_at_ms).close(now_ms, text),
        )
    }

    fn end_user_turn(&mut self, now_ms: u64) -> Transition {
        let Some(user_turn) = self.close_user_turn(now_ms) else {
            self.state = TurnState::Idle;
            return self.transition(vec![]);
        };
        if user_turn.content.is_empty() {
            debug!(turn_id=%user_turn.turn_id, "empty user turn closed without generation");
            self.state = TurnState::Idle;
            return self.transition(vec![]);
        }
        let agent_turn_id = self.alloc_turn_id();
        self.agent = Some(agent_turn_id);
        self.state = TurnState::AgentGenerating;
        debug!(user_turn=%user_turn.turn_id, agent_turn=%agent_turn_id, "end of user turn");
        self.transition(vec![Command::StartGeneration {
            user_turn,
            agent_turn_id,
        }])
    }
}
