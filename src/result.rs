//! 統一結果コントラクト
//!
//! すべてのバックエンドが同一に生成する唯一の外向き契約。上位のオーケストレーション・
//! リトライ・マルチエージェント層はこの形だけに依存し、バックエンド固有の
//! 生レスポンス形状には触れない。

use crate::events::{FinishReason, Usage};
use crate::message::ChatMessage;
use serde::{Deserialize, Serialize};

/// 1リクエスト分のチャット結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResult {
    /// 事前のメッセージ列 + 新しい assistant メッセージちょうど1件
    pub messages: Vec<ChatMessage>,
    pub finish_reason: FinishReason,
    /// バックエンドが供給したときのみ Some。None は「不明」であり「コストゼロ」ではない
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResult {
    /// このターンで新しく生成された assistant メッセージ
    pub fn assistant_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

/// 統一結果を組み立てる
///
/// finish_reason の正規化規則:
/// - 復元済みツール呼び出しが1件以上あれば、バックエンドの終端シグナルに
///   かかわらず `ToolCalls`
/// - バックエンドが長さ打ち切りを報告していれば `Length`
/// - それ以外は `Stop`
pub fn build_result(
    history: &[ChatMessage],
    message: ChatMessage,
    backend_finish: FinishReason,
    usage: Option<Usage>,
) -> ChatResult {
    let finish_reason = if message.has_tool_calls() {
        FinishReason::ToolCalls
    } else if backend_finish == FinishReason::Length {
        FinishReason::Length
    } else {
        FinishReason::Stop
    };
    let mut messages = history.to_vec();
    messages.push(message);
    ChatResult {
        messages,
        finish_reason,
        usage,
    }
}
