//! ストリーミング断片の集約
//!
//! 進行中の1リクエストにつき1つの `StreamAggregator` を持ち、アダプタが正規化した
//! `LlmEvent` 列を到着順に適用して、テキスト本文と call_id ごとの引数バッファを
//! 組み立てる。断片の相関キーは call_id のみで、配列の位置（index）は一切使わない。
//! プロバイダは繰り返しフレームで順序を入れ替えたり id を省いたりするため、
//! index の解決はワイヤ方言を知るアダプタ側の責務になっている。
//!
//! 状態機械: Accumulating →（終端マーカー観測で）Finalizing → Done。
//! 終端マーカーが来ないままストリームが尽きた場合、結果は取り出せず
//! `Error::TruncatedStream` になる。「それらしく見える不完全な結果」は決して返さない。
//! 集約器を途中で drop すればバッファは捨てられ、ChatResult は生成されない。

use crate::error::Error;
use crate::events::{FinishReason, LlmEvent, Usage};
use crate::message::{ChatMessage, ToolCall};
use crate::repair::{normalize_arguments, Recovery};
use tracing::{debug, warn};

/// 集約器の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    /// 断片を受信中（初期状態）
    Accumulating,
    /// 終端マーカーを観測し、引数の正規化中
    Finalizing,
    /// 確定済み（以降は不変）
    Done,
}

/// 組み立て中のツール呼び出し（call_id ごとの引数バッファ）
#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    /// 最初に観測した名前で確定し、以降は変更しない
    name: Option<String>,
    arguments: String,
}

/// ストリーミング断片の集約器（リクエストごとに1つ、共有しない）
#[derive(Debug)]
pub struct StreamAggregator {
    state: AggregatorState,
    content: String,
    /// 到着順を保った call_id キーのバッファ列（1ターンの呼び出し数は少ないため線形探索）
    calls: Vec<PendingCall>,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self {
            state: AggregatorState::Accumulating,
            content: String::new(),
            calls: Vec::new(),
            finish: None,
            usage: None,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == AggregatorState::Done
    }

    /// イベントを1つ適用する
    ///
    /// テキストは到着順に追記、ツール断片は call_id のバッファへ追記（置換しない）。
    /// `Completed` で全バッファの引数を正規化して確定する。確定後の断片は
    /// プロトコル違反として拒否する。
    pub fn apply(&mut self, event: &LlmEvent) -> Result<(), Error> {
        if self.state == AggregatorState::Done {
            return Err(Error::protocol("fragment received after terminal marker"));
        }
        match event {
            LlmEvent::TextDelta(text) => {
                self.content.push_str(text);
            }
            LlmEvent::ToolCallBegin { call_id, name } => {
                let call = self.call_mut(call_id);
                if call.name.is_none() && !name.is_empty() {
                    call.name = Some(name.clone());
                } else if call.name.as_deref().is_some_and(|n| n != name.as_str()) && !name.is_empty() {
                    // 名前は最初の観測で確定する
                    debug!(call_id = %call_id, "ignoring name change on existing tool call");
                }
            }
            LlmEvent::ToolCallArgsDelta {
                call_id,
                json_fragment,
            } => {
                self.call_mut(call_id).arguments.push_str(json_fragment);
            }
            LlmEvent::ToolCallEnd { call_id } => {
                if !self.calls.iter().any(|c| c.id == *call_id) {
                    debug!(call_id = %call_id, "ToolCallEnd for unknown call id");
                }
            }
            LlmEvent::Completed { finish, usage } => {
                self.state = AggregatorState::Finalizing;
                self.finalize(*finish, *usage)?;
            }
            LlmEvent::Failed { message } => {
                return Err(Error::stream(message.clone()));
            }
        }
        Ok(())
    }

    /// call_id のバッファを参照する（初見なら作成。作成は冪等）
    fn call_mut(&mut self, call_id: &str) -> &mut PendingCall {
        if let Some(pos) = self.calls.iter().position(|c| c.id == call_id) {
            return &mut self.calls[pos];
        }
        self.calls.push(PendingCall {
            id: call_id.to_string(),
            name: None,
            arguments: String::new(),
        });
        self.calls.last_mut().expect("just pushed")
    }

    /// 終端マーカー到達時の確定処理: 全呼び出しの引数を正規化する
    fn finalize(&mut self, finish: FinishReason, usage: Option<Usage>) -> Result<(), Error> {
        for call in &mut self.calls {
            match normalize_arguments(&call.arguments) {
                Recovery::Recovered(fixed) => {
                    if fixed != call.arguments {
                        debug!(call_id = %call.id, "tool call arguments repaired at finalization");
                    }
                    call.arguments = fixed;
                }
                Recovery::Unrecoverable => {
                    warn!(call_id = %call.id, "tool call arguments unrecoverable");
                    return Err(Error::UnrecoverableArguments {
                        call_id: call.id.clone(),
                        raw: call.arguments.clone(),
                    });
                }
            }
        }
        self.finish = Some(if self.calls.is_empty() {
            finish
        } else {
            FinishReason::ToolCalls
        });
        self.usage = usage;
        self.state = AggregatorState::Done;
        Ok(())
    }

    /// ここまでに組み立てたメッセージ（delta観測用スナップショット）
    ///
    /// 確定前はツール引数が未正規化のまま返る点に注意。
    pub fn snapshot(&self) -> ChatMessage {
        let calls: Vec<ToolCall> = self
            .calls
            .iter()
            .map(|c| {
                ToolCall::new(
                    c.id.clone(),
                    c.name.clone().unwrap_or_default(),
                    c.arguments.clone(),
                )
            })
            .collect();
        if calls.is_empty() {
            ChatMessage::assistant(self.content.clone())
        } else {
            ChatMessage::assistant_with_tool_calls(self.content.clone(), calls)
        }
    }

    /// 確定済みメッセージを取り出す
    ///
    /// 終端マーカーを観測していなければ `Error::TruncatedStream`。
    pub fn into_message(self) -> Result<(ChatMessage, FinishReason, Option<Usage>), Error> {
        if self.state != AggregatorState::Done {
            return Err(Error::TruncatedStream);
        }
        let finish = self.finish.unwrap_or(FinishReason::Stop);
        let usage = self.usage;
        let message = self.snapshot();
        Ok((message, finish, usage))
    }
}

impl Default for StreamAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed() -> LlmEvent {
        LlmEvent::Completed {
            finish: FinishReason::Stop,
            usage: None,
        }
    }

    #[test]
    fn test_text_deltas_append_in_order() {
        let mut agg = StreamAggregator::new();
        for chunk in ["Hel", "lo", ", ", "world"] {
            agg.apply(&LlmEvent::TextDelta(chunk.to_string())).unwrap();
        }
        agg.apply(&completed()).unwrap();
        let (msg, finish, usage) = agg.into_message().unwrap();
        assert_eq!(msg.content_str(), "Hello, world");
        assert_eq!(finish, FinishReason::Stop);
        assert!(usage.is_none());
    }

    #[test]
    fn test_streaming_equivalence_per_character() {
        // 1文字ずつの断片でも一括でも、組み立て結果はバイト同一になる
        let full = "The quick brown fox jumps over the lazy dog. 改行も\n含む。";

        let mut whole = StreamAggregator::new();
        whole.apply(&LlmEvent::TextDelta(full.to_string())).unwrap();
        whole.apply(&completed()).unwrap();

        let mut chopped = StreamAggregator::new();
        for c in full.chars() {
            chopped.apply(&LlmEvent::TextDelta(c.to_string())).unwrap();
        }
        chopped.apply(&completed()).unwrap();

        assert_eq!(
            whole.into_message().unwrap(),
            chopped.into_message().unwrap()
        );
    }

    #[test]
    fn test_tool_call_args_split_into_fragments() {
        let args = r#"{"command": "ls -la", "cwd": "/tmp"}"#;
        let mut agg = StreamAggregator::new();
        agg.apply(&LlmEvent::ToolCallBegin {
            call_id: "call_1".to_string(),
            name: "run_shell".to_string(),
        })
        .unwrap();
        for c in args.chars() {
            agg.apply(&LlmEvent::ToolCallArgsDelta {
                call_id: "call_1".to_string(),
                json_fragment: c.to_string(),
            })
            .unwrap();
        }
        agg.apply(&LlmEvent::ToolCallEnd {
            call_id: "call_1".to_string(),
        })
        .unwrap();
        agg.apply(&completed()).unwrap();

        let (msg, finish, _) = agg.into_message().unwrap();
        assert_eq!(finish, FinishReason::ToolCalls);
        let calls = msg.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, args);
    }

    #[test]
    fn test_interleaved_call_ids_route_by_id() {
        // A,B,A,B の順で断片が届いても、各 call_id のバッファは混ざらない
        let mut agg = StreamAggregator::new();
        agg.apply(&LlmEvent::ToolCallBegin {
            call_id: "A".to_string(),
            name: "alpha".to_string(),
        })
        .unwrap();
        agg.apply(&LlmEvent::ToolCallBegin {
            call_id: "B".to_string(),
            name: "beta".to_string(),
        })
        .unwrap();
        for (id, frag) in [
            ("A", r#"{"x""#),
            ("B", r#"{"y""#),
            ("A", r#": 1}"#),
            ("B", r#": 2}"#),
        ] {
            agg.apply(&LlmEvent::ToolCallArgsDelta {
                call_id: id.to_string(),
                json_fragment: frag.to_string(),
            })
            .unwrap();
        }
        agg.apply(&completed()).unwrap();

        let (msg, _, _) = agg.into_message().unwrap();
        let calls = msg.tool_calls.unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "A");
        assert_eq!(calls[0].arguments, r#"{"x": 1}"#);
        assert_eq!(calls[1].id, "B");
        assert_eq!(calls[1].arguments, r#"{"y": 2}"#);
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let mut agg = StreamAggregator::new();
        agg.apply(&LlmEvent::TextDelta("partial".to_string()))
            .unwrap();
        // Completed が来ないまま取り出すと TruncatedStream
        assert_eq!(agg.into_message().unwrap_err(), Error::TruncatedStream);
    }

    #[test]
    fn test_name_is_fixed_at_first_sight() {
        let mut agg = StreamAggregator::new();
        agg.apply(&LlmEvent::ToolCallBegin {
            call_id: "c".to_string(),
            name: "".to_string(),
        })
        .unwrap();
        // 空文字の後から来た名前は採用される
        agg.apply(&LlmEvent::ToolCallBegin {
            call_id: "c".to_string(),
            name: "real_name".to_string(),
        })
        .unwrap();
        // 一度確定した名前は変わらない
        agg.apply(&LlmEvent::ToolCallBegin {
            call_id: "c".to_string(),
            name: "other".to_string(),
        })
        .unwrap();
        agg.apply(&LlmEvent::ToolCallArgsDelta {
            call_id: "c".to_string(),
            json_fragment: "{}".to_string(),
        })
        .unwrap();
        agg.apply(&completed()).unwrap();
        let (msg, _, _) = agg.into_message().unwrap();
        assert_eq!(msg.tool_calls.unwrap()[0].name, "real_name");
    }

    #[test]
    fn test_args_delta_creates_call_on_first_sight() {
        // Begin なしで引数断片が先行しても id でバッファが作られる
        let mut agg = StreamAggregator::new();
        agg.apply(&LlmEvent::ToolCallArgsDelta {
            call_id: "late".to_string(),
            json_fragment: r#"{"a": 1}"#.to_string(),
        })
        .unwrap();
        agg.apply(&LlmEvent::ToolCallBegin {
            call_id: "late".to_string(),
            name: "fn".to_string(),
        })
        .unwrap();
        agg.apply(&completed()).unwrap();
        let (msg, _, _) = agg.into_message().unwrap();
        let calls = msg.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "fn");
    }

    #[test]
    fn test_finalization_repairs_duplicated_arguments() {
        let mut agg = StreamAggregator::new();
        agg.apply(&LlmEvent::ToolCallBegin {
            call_id: "c".to_string(),
            name: "f".to_string(),
        })
        .unwrap();
        agg.apply(&LlmEvent::ToolCallArgsDelta {
            call_id: "c".to_string(),
            json_fragment: r#"{"a":1}{"a":1}"#.to_string(),
        })
        .unwrap();
        agg.apply(&completed()).unwrap();
        let (msg, _, _) = agg.into_message().unwrap();
        assert_eq!(msg.tool_calls.unwrap()[0].arguments, r#"{"a":1}"#);
    }

    #[test]
    fn test_unrecoverable_arguments_surface_raw_string() {
        let mut agg = StreamAggregator::new();
        agg.apply(&LlmEvent::ToolCallBegin {
            call_id: "bad".to_string(),
            name: "f".to_string(),
        })
        .unwrap();
        agg.apply(&LlmEvent::ToolCallArgsDelta {
            call_id: "bad".to_string(),
            json_fragment: "not json at all".to_string(),
        })
        .unwrap();
        let err = agg.apply(&completed()).unwrap_err();
        assert_eq!(
            err,
            Error::UnrecoverableArguments {
                call_id: "bad".to_string(),
                raw: "not json at all".to_string(),
            }
        );
    }

    #[test]
    fn test_fragment_after_done_is_rejected() {
        let mut agg = StreamAggregator::new();
        agg.apply(&completed()).unwrap();
        let err = agg
            .apply(&LlmEvent::TextDelta("late".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_failed_event_propagates() {
        let mut agg = StreamAggregator::new();
        let err = agg
            .apply(&LlmEvent::Failed {
                message: "upstream exploded".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, Error::Stream("upstream exploded".to_string()));
        // 失敗後も終端マーカーなしなので結果は取り出せない
        assert!(agg.into_message().is_err());
    }

    #[test]
    fn test_snapshot_shows_progress() {
        let mut agg = StreamAggregator::new();
        agg.apply(&LlmEvent::TextDelta("so far".to_string())).unwrap();
        let snap = agg.snapshot();
        assert_eq!(snap.content_str(), "so far");
        assert!(!snap.has_tool_calls());
    }

    #[test]
    fn test_usage_passthrough() {
        let mut agg = StreamAggregator::new();
        agg.apply(&LlmEvent::Completed {
            finish: FinishReason::Length,
            usage: Some(Usage {
                prompt_tokens: 7,
                completion_tokens: 3,
                total_tokens: 10,
            }),
        })
        .unwrap();
        let (_, finish, usage) = agg.into_message().unwrap();
        assert_eq!(finish, FinishReason::Length);
        assert_eq!(usage, Some(Usage {
            prompt_tokens: 7,
            completion_tokens: 3,
            total_tokens: 10,
        }));
    }
}
