//! エラーハンドリング
//!
//! このレイヤーは決定論的な「成功 or 型付き失敗」を契約とする。
//! リトライや値の推測は行わず、オフライン診断に十分な文脈（元文字列・call_id）を
//! エラーに添付して呼び出し側へ返す。

/// エラー型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// JSONのパース・シリアライズ失敗
    #[error("JSON error: {0}")]
    Json(String),

    /// バックエンドのレスポンス形状が契約を満たしていない（choices / candidates 欠落など）
    #[error("Backend protocol violation: {0}")]
    Protocol(String),

    /// 全リカバリ戦略を試してもツール引数をJSONに復元できなかった
    /// 元の文字列を添付し、呼び出し側が診断できるようにする
    #[error("Unrecoverable tool call arguments (call_id: {call_id}): {raw}")]
    UnrecoverableArguments { call_id: String, raw: String },

    /// 終端マーカーが届かないままストリームが終了した（ネットワーク切断など）
    #[error("Stream ended without a terminal marker")]
    TruncatedStream,

    /// ストリーム読み取り中の失敗（バックエンドの Failed イベントや読み取りエラー）
    #[error("Stream failed: {0}")]
    Stream(String),
}

impl Error {
    /// JSONエラーを作成
    pub fn json(msg: impl Into<String>) -> Self {
        Self::Json(msg.into())
    }

    /// プロトコル違反エラーを作成
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// ストリームエラーを作成
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }
}
