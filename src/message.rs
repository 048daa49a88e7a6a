//! 会話メッセージの内部表現
//!
//! すべてのバックエンドをこの1つの表現に正規化する。ロール名の方言
//! （Geminiの "model" など）は各アダプタ側で吸収し、ここには持ち込まない。

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// メッセージのロール
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// ツール呼び出し1件
///
/// `arguments` はJSON文字列。ストリーミング中は断片の連結で伸びていき、
/// 終端マーカー到達時の正規化（repair）を経て初めて有効なJSONであることが保証される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// ターン内で一意な呼び出しID
    pub id: String,
    /// 関数名
    pub name: String,
    /// 引数のJSON文字列
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// 呼び出し種別（現状 "function" のみ）
    pub fn call_type(&self) -> &'static str {
        "function"
    }

    /// 引数をJSON値としてパース
    pub fn arguments_value(&self) -> Result<Value, Error> {
        serde_json::from_str(&self.arguments)
            .map_err(|e| Error::json(format!("Failed to parse tool call arguments: {}", e)))
    }
}

/// 正規化済みのメッセージ
///
/// 不変条件: assistant メッセージは content か tool_calls の少なくとも一方を持つ
/// （明示的な空文字 content は可）。tool_call_id / name は role = Tool のときのみ使う。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    /// テキスト本文（純粋なツール呼び出しメッセージでは None）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// assistant がツールを呼んだ場合の呼び出し列（順序保存）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// role = Tool のとき、どの call_id への返答か
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// role = Tool のとき、応答したツール名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// ツール呼び出し付き assistant（content は空でも可）
    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    /// ツール結果（role = Tool）
    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
        }
    }

    /// content を参照（Noneは空文字扱い）
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// ツール呼び出しを1件以上持つか
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content_str(), "Hello");
        assert!(!msg.has_tool_calls());

        let msg = ChatMessage::assistant("Hi there");
        assert_eq!(msg.role, Role::Assistant);

        let msg = ChatMessage::system("You are helpful");
        assert_eq!(msg.role, Role::System);
    }

    #[test]
    fn test_assistant_with_tool_calls() {
        let msg = ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call_1", "run_shell", r#"{"command":"ls"}"#)],
        );
        assert_eq!(msg.role, Role::Assistant);
        assert!(msg.has_tool_calls());
        let calls = msg.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].call_type(), "function");
    }

    #[test]
    fn test_tool_result_message() {
        let msg = ChatMessage::tool_result("call_1", "run_shell", r#"{"output":"ok"}"#);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("run_shell"));
    }

    #[test]
    fn test_tool_call_arguments_value() {
        let call = ToolCall::new("c1", "f", r#"{"x": 1}"#);
        assert_eq!(call.arguments_value().unwrap(), json!({"x": 1}));

        let broken = ToolCall::new("c2", "f", "{oops");
        assert!(broken.arguments_value().is_err());
    }

    #[test]
    fn test_role_serde_lowercase() {
        let s = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(s, r#""assistant""#);
        let r: Role = serde_json::from_str(r#""tool""#).unwrap();
        assert_eq!(r, Role::Tool);
    }

    #[test]
    fn test_message_skips_absent_fields() {
        let msg = ChatMessage::user("hi");
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("tool_calls").is_none());
        assert!(v.get("tool_call_id").is_none());
    }
}
