//! LLMバックエンド仲介ライブラリ
//!
//! 複数のLLMバックエンド（ネイティブ function calling 対応・非対応の両方）を
//! 単一の会話コントラクトの背後に隠す。壊れたツール呼び出し引数のJSON修復、
//! テキストプロトコル（`TOOL_CALL:` 行）からの呼び出し抽出、ストリーミング
//! デルタの集約、バックエンドごとのワイヤ方言の正規化を提供する。
//!
//! HTTPトランスポートはこのクレートの責務ではない: 呼び出し側が
//! `LlmProvider::endpoint()` へリクエストを送り、受け取った生のボディを
//! `LlmDriver::complete` / `complete_stream` に渡す。

/// ストリーミングイベントの集約
pub mod aggregate;

/// LLMドライバー
pub mod driver;

/// Echoプロバイダ（デバッグ用）
pub mod echo;

/// エラーハンドリング
pub mod error;

/// 共通イベントと終端シグナル
pub mod events;

/// プロバイダファクトリー
pub mod factory;

/// Geminiワイヤアダプタ
pub mod gemini;

/// 会話メッセージとツール呼び出しの共通表現
pub mod message;

/// OpenAI Chat Completions 互換ワイヤアダプタ
pub mod openai_compat;

/// 手動ツール呼び出しのテキストプロトコル
pub mod protocol;

/// LLMプロバイダのトレイト定義
pub mod provider;

/// 壊れたJSON引数の修復
pub mod repair;

/// 統一結果コントラクト
pub mod result;

/// ツール定義
pub mod tool;

pub use aggregate::{AggregatorState, StreamAggregator};
pub use driver::LlmDriver;
pub use echo::EchoProvider;
pub use error::Error;
pub use events::{FinishReason, LlmEvent, Usage};
pub use factory::{create_provider, AnyProvider, ProviderType};
pub use gemini::GeminiProvider;
pub use message::{ChatMessage, Role, ToolCall};
pub use openai_compat::OpenAiCompatProvider;
pub use protocol::{extract_tool_calls, tool_instructions, ExtractedCalls, TOOL_CALL_PREFIX};
pub use provider::LlmProvider;
pub use repair::{normalize_arguments, Recovery};
pub use result::{build_result, ChatResult};
pub use tool::ToolDef;
