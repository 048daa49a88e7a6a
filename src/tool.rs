//! ツール定義
//!
//! 呼び出し側がリクエストごとに渡すツールスキーマ。このレイヤーからは読み取り専用で、
//! 各アダプタが name / description / parameters をバックエンド方言へマッピングする。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// ツール定義（関数名・説明・JSON Schema風のパラメータ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    /// ツール名（APIのnameと一致させる）
    pub name: String,
    /// ツールの説明
    pub description: String,
    /// パラメータ定義（JSON Schema風のオブジェクト）
    pub parameters: Value,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}
