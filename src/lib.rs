//! Real-time spoken-dialogue turn engine.
//!
//! A [`session::CallSession`] owns one call: it feeds caller audio to a streaming transcriber,
//! lets the [`turn::TurnController`] decide when the caller has finished, streams generation into
//! sentence-sized chunks, synthesizes those chunks into outbound audio, and reconciles the
//! conversation context when the caller barges in.

pub mod config;
pub mod context;
pub mod deepgram;
pub mod deepgram_types;
pub mod error;
pub mod events;
pub mod functions;
pub mod generation;
pub mod handlers;
pub mod interruption;
pub mod openai;
pub mod openai_types;
pub mod providers;
pub mod resilience;
pub mod scripted;
pub mod sentence;
pub mod session;
pub mod synthesis;
pub mod tasks;
pub mod turn;
pub mod twilio_types;
pub mod types;
pub mod utils;

pub mod consts {
    pub const APP_GREETING: &str = "Hi.  How may I help you?";
    pub const ASCII_CLAUSE_ENDINGS: &[char] = &['.', '?', '!', ';'];
    pub const DEFAULT_CONFIG_PATH: &str = "turn-engine.toml";
    pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a friendly and helpful assistant \
        speaking with a caller on the phone. Keep answers short and conversational.";
    pub const SUMMARY_SLOT: &str = "conversation_summary";
    pub const USER_GOAL_SLOT: &str = "user_goal";
    pub const PENDING_ACTION_SLOT: &str = "pending_action";
}
