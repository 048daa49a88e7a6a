//! LLMストリームの共通イベント型
//!
//! プロバイダごとの差異（SSEフレーミング、tool_calls のindexキー、functionCall parts）は
//! アダプタ層で吸収し、ここで定義する共通のイベント列に正規化する。
//! イベントは必ず到着順で配送され、集約器（aggregate）がそのまま消費する。

use serde::{Deserialize, Serialize};

/// ストリーム終了理由（3値に正規化済み）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// 通常終了
    Stop,
    /// 長さ制限による打ち切り
    Length,
    /// ツール呼び出しあり
    ToolCalls,
}

/// トークン使用量
///
/// バックエンドが返さなかった場合は `Option<Usage>` のまま None にする。
/// ゼロ埋めはしない（「不明」と「コストゼロ」を区別するため）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// LLMストリームから来る正規化済みイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LlmEvent {
    /// アシスタントテキストの増分
    TextDelta(String),
    /// ツール呼び出し開始（name が空文字のときは後続フレームで確定する）
    ToolCallBegin { call_id: String, name: String },
    /// ツール引数（JSON断片）の増分。call_id のバッファへ必ず「追記」される
    ToolCallArgsDelta {
        call_id: String,
        json_fragment: String,
    },
    /// ツール呼び出し終了（これ以降この call_id への断片は来ない）
    ToolCallEnd { call_id: String },
    /// ストリーム完了（終端マーカーを観測したときのみ発行される）
    Completed {
        finish: FinishReason,
        usage: Option<Usage>,
    },
    /// ストリーム失敗
    Failed { message: String },
}
