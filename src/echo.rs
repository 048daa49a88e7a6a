//! Echoプロバイダの実装
//!
//! 実際のバックエンドは呼ばず、固定のイベント列を返すだけのプロバイダ。
//! デバッグや配線確認用。

use crate::error::Error;
use crate::events::{FinishReason, LlmEvent};
use crate::message::ChatMessage;
use crate::provider::LlmProvider;
use crate::tool::ToolDef;
use serde_json::{json, Value};
use std::io::BufRead;
use tracing::debug;

const ECHO_RESPONSE: &str = "[Echo Provider] Query received (no actual LLM call made)";

/// Echoプロバイダ
pub struct EchoProvider;

impl EchoProvider {
    /// 新しいEchoプロバイダを作成
    pub fn new() -> Self {
        Self
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    fn supports_tool_calls(&self) -> bool {
        false
    }

    fn endpoint(&self, _streaming: bool) -> String {
        "echo://local".to_string()
    }

    fn make_request_payload(
        &self,
        query: &str,
        system_instruction: Option<&str>,
        history: &[ChatMessage],
        _tools: Option<&[ToolDef]>,
        streaming: bool,
    ) -> Result<Value, Error> {
        debug!(query, streaming, history_len = history.len(), "echo payload");

        let mut payload = json!({ "query": query });
        if let Some(system) = system_instruction {
            payload["system_instruction"] = json!(system);
        }
        if !history.is_empty() {
            let history_json: Vec<Value> = history
                .iter()
                .map(|msg| {
                    json!({
                        "role": msg.role.as_str(),
                        "content": msg.content_str()
                    })
                })
                .collect();
            payload["history"] = json!(history_json);
        }
        Ok(payload)
    }

    fn parse_response(&self, _body: &str) -> Result<Vec<LlmEvent>, Error> {
        Ok(vec![
            LlmEvent::TextDelta(ECHO_RESPONSE.to_string()),
            LlmEvent::Completed {
                finish: FinishReason::Stop,
                usage: None,
            },
        ])
    }

    fn stream_events(
        &self,
        _body: &mut dyn BufRead,
        callback: &mut dyn FnMut(LlmEvent) -> Result<(), Error>,
    ) -> Result<(), Error> {
        // 単語ごとに分割して流し、ストリーミング経路の配線を確認できるようにする
        for word in ECHO_RESPONSE.split_whitespace() {
            callback(LlmEvent::TextDelta(format!("{} ", word)))?;
        }
        callback(LlmEvent::Completed {
            finish: FinishReason::Stop,
            usage: None,
        })?;
        Ok(())
    }
}
