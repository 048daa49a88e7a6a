//! LLMドライバーの実装
//!
//! プロバイダに依存しない共通処理を提供します。リクエストの準備（手動ツール
//! 呼び出しプロトコルへの切り替えを含む）、イベントの集約、本文からの
//! ツール呼び出し抽出、統一結果の組み立てをここで行う。

use crate::aggregate::StreamAggregator;
use crate::error::Error;
use crate::message::ChatMessage;
use crate::protocol;
use crate::provider::LlmProvider;
use crate::result::{build_result, ChatResult};
use crate::tool::ToolDef;
use serde_json::Value;
use std::io::BufRead;
use tracing::debug;

/// LLMドライバー
pub struct LlmDriver<P: LlmProvider> {
    provider: P,
}

impl<P: LlmProvider> LlmDriver<P> {
    /// 新しいドライバーを作成
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// プロバイダを取得
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// リクエストペイロードを準備する
    ///
    /// プロバイダがネイティブの function calling を持たない場合、ツール定義は
    /// ワイヤに流さず、テキストプロトコルの説明をシステム指示へ連結する。
    /// レスポンス側の抽出は `complete` / `complete_stream` が行う。
    pub fn prepare_request(
        &self,
        query: &str,
        system_instruction: Option<&str>,
        history: &[ChatMessage],
        tools: Option<&[ToolDef]>,
        streaming: bool,
    ) -> Result<Value, Error> {
        let manual = tools.map_or(false, |t| !t.is_empty())
            && !self.provider.supports_tool_calls();
        if manual {
            debug!(
                provider = self.provider.name(),
                "no native tool support, switching to text protocol"
            );
            let instructions = protocol::tool_instructions(tools.unwrap_or(&[]));
            let combined = match system_instruction {
                Some(s) if !s.is_empty() => format!("{}\n\n{}", s, instructions),
                _ => instructions,
            };
            self.provider.make_request_payload(
                query,
                Some(&combined),
                history,
                None,
                streaming,
            )
        } else {
            self.provider
                .make_request_payload(query, system_instruction, history, tools, streaming)
        }
    }

    /// 非ストリーミングの生レスポンスボディを統一結果へ変換する
    pub fn complete(&self, body: &str, history: &[ChatMessage]) -> Result<ChatResult, Error> {
        let mut aggregator = StreamAggregator::new();
        for event in self.provider.parse_response(body)? {
            aggregator.apply(&event)?;
        }
        self.finish(aggregator, history)
    }

    /// ストリーミングボディを統一結果へ変換する
    ///
    /// イベントが届くたびに `on_delta` へ集約途中のスナップショットを渡す。
    /// ストリームが Completed なしで尽きた場合は `Error::TruncatedStream`。
    pub fn complete_stream(
        &self,
        body: &mut dyn BufRead,
        history: &[ChatMessage],
        on_delta: &mut dyn FnMut(&ChatMessage) -> Result<(), Error>,
    ) -> Result<ChatResult, Error> {
        let mut aggregator = StreamAggregator::new();
        self.provider.stream_events(body, &mut |event| {
            aggregator.apply(&event)?;
            on_delta(&aggregator.snapshot())
        })?;
        self.finish(aggregator, history)
    }

    /// 集約結果を確定し、手動プロトコルの抽出と統一結果の組み立てを行う
    fn finish(
        &self,
        aggregator: StreamAggregator,
        history: &[ChatMessage],
    ) -> Result<ChatResult, Error> {
        let (mut message, backend_finish, usage) = aggregator.into_message()?;

        // ネイティブの function calling がないプロバイダでは、ツール呼び出しが
        // 本文にテキストプロトコルで埋まっている。抽出して構造化する
        if !self.provider.supports_tool_calls() {
            if let Some(content) = message.content.take() {
                let extracted = protocol::extract_tool_calls(&content);
                message.content = Some(extracted.content);
                if !extracted.calls.is_empty() {
                    message.tool_calls = Some(extracted.calls);
                }
            }
        }

        Ok(build_result(history, message, backend_finish, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FinishReason, LlmEvent, Usage};
    use std::io::Cursor;

    // モックプロバイダ: parse_response / stream_events は固定イベントを返す
    struct MockProvider {
        native_tools: bool,
        events: Vec<LlmEvent>,
    }

    impl MockProvider {
        fn text(native_tools: bool, text: &str) -> Self {
            Self {
                native_tools,
                events: vec![
                    LlmEvent::TextDelta(text.to_string()),
                    LlmEvent::Completed {
                        finish: FinishReason::Stop,
                        usage: None,
                    },
                ],
            }
        }

        fn with_events(native_tools: bool, events: Vec<LlmEvent>) -> Self {
            Self {
                native_tools,
                events,
            }
        }
    }

    impl LlmProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn supports_tool_calls(&self) -> bool {
            self.native_tools
        }

        fn endpoint(&self, _streaming: bool) -> String {
            "mock://".to_string()
        }

        fn make_request_payload(
            &self,
            query: &str,
            system_instruction: Option<&str>,
            _history: &[ChatMessage],
            tools: Option<&[ToolDef]>,
            _streaming: bool,
        ) -> Result<Value, Error> {
            Ok(serde_json::json!({
                "query": query,
                "system": system_instruction,
                "has_tools": tools.is_some()
            }))
        }

        fn parse_response(&self, _body: &str) -> Result<Vec<LlmEvent>, Error> {
            Ok(self.events.clone())
        }

        fn stream_events(
            &self,
            _body: &mut dyn BufRead,
            callback: &mut dyn FnMut(LlmEvent) -> Result<(), Error>,
        ) -> Result<(), Error> {
            for event in &self.events {
                callback(event.clone())?;
            }
            Ok(())
        }
    }

    fn sample_tools() -> Vec<ToolDef> {
        vec![ToolDef::new(
            "run_shell",
            "Run a shell command",
            serde_json::json!({"type": "object"}),
        )]
    }

    #[test]
    fn test_driver_complete_text() {
        let driver = LlmDriver::new(MockProvider::text(true, "Hello, world!"));
        let result = driver.complete("{}", &[]).unwrap();
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(
            result.assistant_message().unwrap().content_str(),
            "Hello, world!"
        );
    }

    #[test]
    fn test_prepare_request_native_tools_pass_through() {
        let driver = LlmDriver::new(MockProvider::text(true, "ok"));
        let tools = sample_tools();
        let payload = driver
            .prepare_request("hi", Some("be brief"), &[], Some(&tools), false)
            .unwrap();
        assert_eq!(payload["has_tools"], true);
        assert_eq!(payload["system"], "be brief");
    }

    #[test]
    fn test_prepare_request_manual_protocol_injection() {
        let driver = LlmDriver::new(MockProvider::text(false, "ok"));
        let tools = sample_tools();
        let payload = driver
            .prepare_request("hi", Some("be brief"), &[], Some(&tools), false)
            .unwrap();
        // ツール定義はワイヤに流れず、説明がシステム指示へ連結される
        assert_eq!(payload["has_tools"], false);
        let system = payload["system"].as_str().unwrap();
        assert!(system.starts_with("be brief"));
        assert!(system.contains("TOOL_CALL:"));
        assert!(system.contains("run_shell"));
    }

    #[test]
    fn test_prepare_request_no_tools_no_injection() {
        let driver = LlmDriver::new(MockProvider::text(false, "ok"));
        let payload = driver
            .prepare_request("hi", Some("be brief"), &[], None, false)
            .unwrap();
        assert_eq!(payload["system"], "be brief");
    }

    #[test]
    fn test_complete_extracts_manual_tool_calls() {
        let driver = LlmDriver::new(MockProvider::text(
            false,
            "I'll list the files.\nTOOL_CALL: {\"name\": \"run_shell\", \"arguments\": {\"cmd\": \"ls\"}}\n",
        ));
        let result = driver.complete("{}", &[]).unwrap();
        assert_eq!(result.finish_reason, FinishReason::ToolCalls);
        let msg = result.assistant_message().unwrap();
        assert_eq!(msg.content_str(), "I'll list the files.");
        let calls = msg.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "run_shell");
        assert_eq!(calls[0].id, "manual_call_0");
    }

    #[test]
    fn test_complete_native_provider_skips_extraction() {
        // ネイティブ対応プロバイダでは本文の TOOL_CALL: 行は抽出されない
        let driver = LlmDriver::new(MockProvider::text(
            true,
            "TOOL_CALL: {\"name\": \"f\", \"arguments\": {}}",
        ));
        let result = driver.complete("{}", &[]).unwrap();
        assert!(result.assistant_message().unwrap().tool_calls.is_none());
        assert_eq!(result.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_complete_native_tool_call_events() {
        let driver = LlmDriver::new(MockProvider::with_events(
            true,
            vec![
                LlmEvent::ToolCallBegin {
                    call_id: "call_1".to_string(),
                    name: "run_shell".to_string(),
                },
                LlmEvent::ToolCallArgsDelta {
                    call_id: "call_1".to_string(),
                    json_fragment: "{\"cmd\": \"ls\"}".to_string(),
                },
                LlmEvent::ToolCallEnd {
                    call_id: "call_1".to_string(),
                },
                LlmEvent::Completed {
                    finish: FinishReason::Stop,
                    usage: Some(Usage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                    }),
                },
            ],
        ));
        let result = driver.complete("{}", &[]).unwrap();
        assert_eq!(result.finish_reason, FinishReason::ToolCalls);
        assert_eq!(result.usage.unwrap().total_tokens, 15);
        let calls = result
            .assistant_message()
            .unwrap()
            .tool_calls
            .as_ref()
            .unwrap();
        assert_eq!(calls[0].arguments, "{\"cmd\": \"ls\"}");
    }

    #[test]
    fn test_complete_stream_delivers_snapshots() {
        let driver = LlmDriver::new(MockProvider::with_events(
            true,
            vec![
                LlmEvent::TextDelta("Hel".to_string()),
                LlmEvent::TextDelta("lo".to_string()),
                LlmEvent::Completed {
                    finish: FinishReason::Stop,
                    usage: None,
                },
            ],
        ));
        let mut snapshots = Vec::new();
        let mut reader = Cursor::new(String::new());
        let result = driver
            .complete_stream(&mut reader, &[], &mut |msg| {
                snapshots.push(msg.content_str().to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(snapshots, vec!["Hel", "Hello", "Hello"]);
        assert_eq!(
            result.assistant_message().unwrap().content_str(),
            "Hello"
        );
    }

    #[test]
    fn test_complete_stream_truncation_is_error() {
        // Completed が来ないまま尽きるストリーム
        let driver = LlmDriver::new(MockProvider::with_events(
            true,
            vec![LlmEvent::TextDelta("partial".to_string())],
        ));
        let mut reader = Cursor::new(String::new());
        let err = driver
            .complete_stream(&mut reader, &[], &mut |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::TruncatedStream));
    }

    #[test]
    fn test_complete_preserves_history() {
        let driver = LlmDriver::new(MockProvider::text(true, "fine"));
        let history = vec![ChatMessage::user("how are you?")];
        let result = driver.complete("{}", &history).unwrap();
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[0].content_str(), "how are you?");
    }

    #[test]
    fn test_driver_with_echo_provider() {
        use crate::echo::EchoProvider;
        let driver = LlmDriver::new(EchoProvider::new());
        let result = driver.complete("{}", &[]).unwrap();
        assert!(result
            .assistant_message()
            .unwrap()
            .content_str()
            .contains("Echo Provider"));
    }
}
