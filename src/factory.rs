//! プロバイダファクトリー
//!
//! プロバイダタイプに基づいて適切なプロバイダを作成します。

use crate::echo::EchoProvider;
use crate::error::Error;
use crate::events::LlmEvent;
use crate::gemini::GeminiProvider;
use crate::message::ChatMessage;
use crate::openai_compat::OpenAiCompatProvider;
use crate::provider::LlmProvider;
use crate::tool::ToolDef;
use serde_json::Value;
use std::io::BufRead;

/// プロバイダタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    /// Gemini (generateContent)
    Gemini,
    /// OpenAI Chat Completions 互換 (/chat/completions)
    OpenAiCompat,
    /// Echo（固定イベントを返すだけ）
    Echo,
}

impl ProviderType {
    /// 文字列からプロバイダタイプを解析
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gemini" => Some(Self::Gemini),
            "openai" | "openai_compat" => Some(Self::OpenAiCompat),
            "echo" => Some(Self::Echo),
            _ => None,
        }
    }

    /// プロバイダタイプを文字列に変換
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAiCompat => "openai_compat",
            Self::Echo => "echo",
        }
    }
}

/// プロバイダのenumラッパー
///
/// 異なるプロバイダタイプを型安全に扱うために使用します。
pub enum AnyProvider {
    Gemini(GeminiProvider),
    OpenAiCompat(OpenAiCompatProvider),
    Echo(EchoProvider),
}

impl LlmProvider for AnyProvider {
    fn name(&self) -> &str {
        match self {
            Self::Gemini(p) => p.name(),
            Self::OpenAiCompat(p) => p.name(),
            Self::Echo(p) => p.name(),
        }
    }

    fn supports_tool_calls(&self) -> bool {
        match self {
            Self::Gemini(p) => p.supports_tool_calls(),
            Self::OpenAiCompat(p) => p.supports_tool_calls(),
            Self::Echo(p) => p.supports_tool_calls(),
        }
    }

    fn endpoint(&self, streaming: bool) -> String {
        match self {
            Self::Gemini(p) => p.endpoint(streaming),
            Self::OpenAiCompat(p) => p.endpoint(streaming),
            Self::Echo(p) => p.endpoint(streaming),
        }
    }

    fn make_request_payload(
        &self,
        query: &str,
        system_instruction: Option<&str>,
        history: &[ChatMessage],
        tools: Option<&[ToolDef]>,
        streaming: bool,
    ) -> Result<Value, Error> {
        match self {
            Self::Gemini(p) => {
                p.make_request_payload(query, system_instruction, history, tools, streaming)
            }
            Self::OpenAiCompat(p) => {
                p.make_request_payload(query, system_instruction, history, tools, streaming)
            }
            Self::Echo(p) => {
                p.make_request_payload(query, system_instruction, history, tools, streaming)
            }
        }
    }

    fn parse_response(&self, body: &str) -> Result<Vec<LlmEvent>, Error> {
        match self {
            Self::Gemini(p) => p.parse_response(body),
            Self::OpenAiCompat(p) => p.parse_response(body),
            Self::Echo(p) => p.parse_response(body),
        }
    }

    fn stream_events(
        &self,
        body: &mut dyn BufRead,
        callback: &mut dyn FnMut(LlmEvent) -> Result<(), Error>,
    ) -> Result<(), Error> {
        match self {
            Self::Gemini(p) => p.stream_events(body, callback),
            Self::OpenAiCompat(p) => p.stream_events(body, callback),
            Self::Echo(p) => p.stream_events(body, callback),
        }
    }
}

/// プロバイダを作成する
///
/// # Arguments
/// * `provider_type` - プロバイダタイプ
/// * `model` - モデル名（None のとき各プロバイダのデフォルト）
/// * `base_url` - ベースURL（None のとき各プロバイダのデフォルト）
/// * `temperature` - 温度（OpenAiCompat 用）
/// * `native_tools` - function calling をネイティブサポートするか（OpenAiCompat 用。
///   互換エンドポイントの中にはサポートしないものがある）
pub fn create_provider(
    provider_type: ProviderType,
    model: Option<String>,
    base_url: Option<String>,
    temperature: Option<f32>,
    native_tools: bool,
) -> AnyProvider {
    match provider_type {
        ProviderType::Gemini => AnyProvider::Gemini(GeminiProvider::new(model, base_url)),
        ProviderType::OpenAiCompat => AnyProvider::OpenAiCompat(OpenAiCompatProvider::new(
            model,
            base_url,
            temperature,
            native_tools,
        )),
        ProviderType::Echo => AnyProvider::Echo(EchoProvider::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_from_str() {
        assert_eq!(ProviderType::from_str("gemini"), Some(ProviderType::Gemini));
        assert_eq!(ProviderType::from_str("Gemini"), Some(ProviderType::Gemini));
        assert_eq!(ProviderType::from_str("GEMINI"), Some(ProviderType::Gemini));
        assert_eq!(
            ProviderType::from_str("openai"),
            Some(ProviderType::OpenAiCompat)
        );
        assert_eq!(
            ProviderType::from_str("openai_compat"),
            Some(ProviderType::OpenAiCompat)
        );
        assert_eq!(ProviderType::from_str("echo"), Some(ProviderType::Echo));
        assert_eq!(ProviderType::from_str("ECHO"), Some(ProviderType::Echo));
        assert_eq!(ProviderType::from_str("unknown"), None);
    }

    #[test]
    fn test_provider_type_as_str() {
        assert_eq!(ProviderType::Gemini.as_str(), "gemini");
        assert_eq!(ProviderType::OpenAiCompat.as_str(), "openai_compat");
        assert_eq!(ProviderType::Echo.as_str(), "echo");
    }

    #[test]
    fn test_create_provider_delegates_name() {
        let p = create_provider(ProviderType::Echo, None, None, None, false);
        assert_eq!(p.name(), "echo");

        let p = create_provider(ProviderType::Gemini, None, None, None, true);
        assert_eq!(p.name(), "gemini");
        assert!(p.supports_tool_calls());

        let p = create_provider(
            ProviderType::OpenAiCompat,
            Some("gpt-4o".to_string()),
            None,
            Some(0.2),
            false,
        );
        assert_eq!(p.name(), "openai_compat");
        assert!(!p.supports_tool_calls());
    }
}
