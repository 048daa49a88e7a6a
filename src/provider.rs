//! LLMプロバイダ（ワイヤアダプタ）のトレイト定義
//!
//! 各バックエンドのワイヤ方言（ロール名、SSEフレーミング、tool_calls のindexキー、
//! モデル名の正規化）はこのトレイトの実装の内側に閉じ込め、外へは共通の
//! `LlmEvent` 列だけを出す。HTTP自体はこのレイヤーの責務ではない:
//! 呼び出し側が `endpoint()` へリクエストを送り、受け取った生のボディ
//! （文字列または BufRead）をアダプタへ渡す。

use crate::error::Error;
use crate::events::LlmEvent;
use crate::message::ChatMessage;
use crate::tool::ToolDef;
use serde_json::Value;
use std::io::BufRead;

/// LLMプロバイダのトレイト
///
/// 実装は状態を持たず、1リクエスト分の変換だけを担う。
pub trait LlmProvider {
    /// プロバイダ名を返す
    fn name(&self) -> &str;

    /// ネイティブの function calling をサポートするか
    ///
    /// false のとき、ドライバは手動ツール呼び出しプロトコル（protocol モジュール）で
    /// ツールを伝え、本文からの抽出で呼び出しを復元する。
    fn supports_tool_calls(&self) -> bool;

    /// トランスポート層がPOSTすべきURL
    ///
    /// 認証ヘッダやAPIキーの付与はトランスポート側の責務。
    fn endpoint(&self, streaming: bool) -> String;

    /// リクエストペイロードを生成する
    ///
    /// ロールのマッピングとツールスキーマのバックエンド方言への変換はここで行う。
    fn make_request_payload(
        &self,
        query: &str,
        system_instruction: Option<&str>,
        history: &[ChatMessage],
        tools: Option<&[ToolDef]>,
        streaming: bool,
    ) -> Result<Value, Error>;

    /// 非ストリーミングの生レスポンスボディを共通イベント列に変換する
    ///
    /// choices / candidates など期待するフィールドが欠けていれば
    /// `Error::Protocol` を返す（このレイヤーではリトライしない）。
    fn parse_response(&self, body: &str) -> Result<Vec<LlmEvent>, Error>;

    /// ストリーミングボディをデコードし、イベントを到着順にコールバックへ渡す
    ///
    /// 終端マーカー（`[DONE]` や finishReason）を観測したときだけ
    /// `LlmEvent::Completed` を発行する。観測しないままボディが尽きた場合は
    /// Completed を発行せずに戻り、集約側が切断として検出する。
    fn stream_events(
        &self,
        body: &mut dyn BufRead,
        callback: &mut dyn FnMut(LlmEvent) -> Result<(), Error>,
    ) -> Result<(), Error>;
}
