//! Streaming chat completions with tool calling.

use crate::config::OpenAIConfig;
use crate::context::{ContextEntry, ContextSnapshot};
use crate::error::ProviderError;
use crate::openai_types::{
    OpenAIFunctionCall, OpenAIFunctionDef, OpenAIMessage, OpenAIPayload, OpenAIStreamResponse,
    OpenAITool, OpenAIToolCall,
};
use crate::providers::{GenerationItem, GenerationRequest, Generator, ProviderStream};
use crate::types::Speaker;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const OPENAI: &str = "openai";

/// Conversation as chat messages: the system instruction with any slots, then every turn and
/// answered function call in order.
pub fn build_messages(snapshot: &ContextSnapshot) -> Vec<OpenAIMessage> {
    let mut system = snapshot.system_instruction.clone();
    for slot in snapshot.slots.iter().filter(|s| !s.value.is_empty()) {
        let note = if slot.stale { " (may be out of date)" } else { "" };
        system.push_str(&format!("\n\n{}{note}: {}", slot.name, slot.value));
    }
    let mut messages = vec![OpenAIMessage::system(system)];
    for entry in &snapshot.entries {
        match entry {
            ContextEntry::Turn(turn) if turn.delivered_content.is_empty() => {}
            ContextEntry::Turn(turn) => messages.push(match turn.speaker {
                Speaker::User => OpenAIMessage::user(turn.delivered_content.clone()),
                Speaker::Agent => OpenAIMessage::assistant(turn.delivered_content.clone()),
            }),
            ContextEntry::Function(record) => {
                let Some(result) = &record.result else {
                    continue;
                };
                messages.push(OpenAIMessage::tool_calls(vec![OpenAIToolCall {
                    id: record.call.tool_call_id.clone(),
                    call_type: "function".to_string(),
                    function: OpenAIFunctionCall {
                        name: record.call.name.clone(),
                        arguments: record.call.arguments.clone(),
                    },
                }]));
                messages.push(OpenAIMessage::tool_result(
                    record.call.tool_call_id.clone(),
                    result.to_string(),
                ));
            }
        }
    }
    messages
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns the `data: ` lines of a chat completion event stream into generation items.
#[derive(Debug, Default)]
struct StreamDecoder {
    buf: Vec<u8>,
    calls: BTreeMap<usize, PartialToolCall>,
    done: bool,
}

impl StreamDecoder {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<GenerationItem>, ProviderError> {
        self.buf.extend_from_slice(bytes);
        let mut items = vec![];
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            items.extend(self.data(data.trim())?);
            if self.done {
                break;
            }
        }
        Ok(items)
    }

    fn data(&mut self, data: &str) -> Result<Vec<GenerationItem>, ProviderError> {
        if data == "[DONE]" {
            self.done = true;
            return Ok(self.flush_calls());
        }
        let response: OpenAIStreamResponse =
            serde_json::from_str(data).map_err(|e| ProviderError::Protocol {
                provider: OPENAI.to_string(),
                message: e.to_string(),
            })?;
        let mut items = vec![];
        for choice in response.choices {
            if let Some(role) = &choice.delta.role {
                if role != "assistant" {
                    warn!(role=%role, "got openai delta with unexpected role");
                }
            }
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                items.push(GenerationItem::Token(content));
            }
            for delta in choice.delta.tool_calls {
                let call = self.calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    call.id = id;
                }
                if let Some(f) = delta.function {
                    if let Some(name) = f.name {
                        call.name.push_str(&name);
                    }
                    if let Some(arguments) = f.arguments {
                        call.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                items.extend(self.flush_calls());
            }
        }
        Ok(items)
    }

    fn flush_calls(&mut self) -> Vec<GenerationItem> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|c| GenerationItem::FunctionCallProposal {
                tool_call_id: c.id,
                name: c.name,
                arguments: c.arguments,
            })
            .collect()
    }
}

pub struct OpenAIGenerator {
    http_client: reqwest::Client,
    api_key: String,
    config: OpenAIConfig,
}

impl OpenAIGenerator {
    pub fn new(http_client: reqwest::Client, api_key: impl Into<String>, config: OpenAIConfig) -> Self {
        Self {
            http_client,
            api_key: api_key.into(),
            config,
        }
    }

    pub fn payload(&self, request: &GenerationRequest) -> OpenAIPayload {
        OpenAIPayload {
            model: self.config.model.clone(),
            messages: build_messages(&request.snapshot),
            stream: Some(true),
            max_tokens: Some(request.sampling.max_output_tokens),
            temperature: Some(request.sampling.temperature),
            top_p: Some(request.sampling.top_p),
            tools: request
                .functions
                .iter()
                .map(|f| OpenAITool {
                    tool_type: "function",
                    function: OpenAIFunctionDef {
                        name: f.name.clone(),
                        description: f.description.clone(),
                        parameters: f.json_schema(),
                    },
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn name(&self) -> &str {
        OPENAI
    }

    async fn start(
        &self,
        request: &GenerationRequest,
    ) -> Result<ProviderStream<GenerationItem>, ProviderError> {
        let payload = self.payload(request);
        let resp = self
            .http_client
            .post(&self.config.url)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to OpenAI");
                ProviderError::from_reqwest(OPENAI, &e)
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(OPENAI, status.as_u16(), &body));
        }

        let (tx, rx) = mpsc::channel(64);
        let mut body = resp.bytes_stream();
        tokio::spawn(async move {
            let mut decoder = StreamDecoder::default();
            while let Some(chunk) = body.next().await {
                let items = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(e) => Err(ProviderError::from_reqwest(OPENAI, &e)),
                };
                let items = match items {
                    Ok(items) => items,
                    Err(e) => {
                        error!(error=%e, "failed to decode OpenAI stream");
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                for item in items {
                    if tx.send(Ok(item)).await.is_err() {
                        debug!("generation receiver dropped; abandoning OpenAI stream");
                        return;
                    }
                }
                if decoder.done {
                    return;
                }
            }
            for item in decoder.flush_calls() {
                let _ = tx.send(Ok(item)).await;
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextConfig, SamplingConfig};
    use crate::context::{ContextStore, FunctionRecord};
    use crate::functions::FunctionSpec;
    use crate::types::{FunctionCall, Turn, TurnId};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn tokens_and_split_tool_calls_decode() {
        let mut d = StreamDecoder::default();
        let stream = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"},\"index\":0}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Let me check.\"},\"index\":0}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"get_order_status\",\"arguments\":\"{\\\"order\"}}]},\"index\":0}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"_id\\\": \\\"42\\\"}\"}}]},\"index\":0}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\",\"index\":0}]}\n\n",
            "data: [DONE]\n\n",
        );
        // split mid-line to exercise buffering
        let (a, b) = stream.as_bytes().split_at(100);
        let mut items = d.push(a).unwrap();
        items.extend(d.push(b).unwrap());
        assert_eq!(
            items,
            vec![
                GenerationItem::Token("Let me check.".into()),
                GenerationItem::FunctionCallProposal {
                    tool_call_id: "call_1".into(),
                    name: "get_order_status".into(),
                    arguments: r#"{"order_id": "42"}"#.into(),
                },
            ]
        );
        assert!(d.done);
    }

    #[test]
    fn malformed_event_is_a_protocol_error() {
        let mut d = StreamDecoder::default();
        assert!(matches!(
            d.push(b"data: {not json\n"),
            Err(ProviderError::Protocol { .. })
        ));
    }

    #[test]
    fn messages_carry_slots_turns_and_answered_calls() {
        let mut store = ContextStore::new("Be brief.", &ContextConfig::default());
        store.set_slot("user_goal", "track an order", None);
        store
            .append(Turn::open(TurnId(1), Speaker::User, 0).close(500, "where is my order"))
            .unwrap();
        let mut call = FunctionCall::proposed(Uuid::new_v4(), "call_1", "get_order_status", "{}");
        call.status = crate::types::FunctionCallStatus::Rejected;
        store
            .record_function_call(FunctionRecord::new(call, Some(json!({"error": {"kind": "missing_parameter"}}))))
            .unwrap();
        let messages = build_messages(&store.snapshot());

        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.as_deref().unwrap().contains("user_goal: track an order"));
        assert_eq!(messages[1].content.as_deref(), Some("where is my order"));
        assert_eq!(messages[2].tool_calls[0].function.name, "get_order_status");
        assert_eq!(messages[3].role, "tool");
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn payload_advertises_functions_and_sampling() {
        let generator = OpenAIGenerator::new(reqwest::Client::new(), "key", OpenAIConfig::default());
        let request = GenerationRequest {
            snapshot: ContextStore::new("sys", &ContextConfig::default()).snapshot(),
            functions: vec![FunctionSpec {
                name: "get_order_status".into(),
                description: "Look up an order".into(),
                endpoint: None,
                parameters: vec![],
            }],
            sampling: SamplingConfig::default().selected(),
        };
        let payload = serde_json::to_value(generator.payload(&request)).unwrap();
        assert_eq!(payload["tools"][0]["function"]["name"], "get_order_status");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["max_tokens"], 200);
    }
}
