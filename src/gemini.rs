//! Gemini (generateContent) ワイヤアダプタ
//!
//! Gemini API のワイヤ方言をこのモジュールに閉じ込める:
//! - role は "assistant" ではなく "model"
//! - ツール結果は user ターンの functionResponse part
//! - ストリーミングはSSEではなくJSON配列（`[ {..}, {..} ]`）で届くため、
//!   ブレースカウントでオブジェクト境界を切り出す

use crate::error::Error;
use crate::events::{FinishReason, LlmEvent, Usage};
use crate::message::{ChatMessage, Role};
use crate::provider::LlmProvider;
use crate::tool::ToolDef;
use serde_json::{json, Value};
use std::io::BufRead;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Gemini プロバイダ
pub struct GeminiProvider {
    model: String,
    base_url: String,
}

impl GeminiProvider {
    /// 新しいGeminiプロバイダを作成
    ///
    /// * `model` - モデル名（None のとき "gemini-2.0-flash"）。
    ///   "models/gemini-..." のようなリソース名はプレフィックスを剥がして正規化する。
    /// * `base_url` - ベースURL（None のとき Google の v1beta エンドポイント）
    pub fn new(model: Option<String>, base_url: Option<String>) -> Self {
        let model = model
            .map(|m| m.trim().trim_start_matches("models/").to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self { model, base_url }
    }

    fn error_message(v: &Value) -> Option<String> {
        v.get("error")
            .map(|err| err["message"].as_str().unwrap_or("Unknown error").to_string())
    }

    fn parse_usage(v: &Value) -> Option<Usage> {
        let meta = v.get("usageMetadata")?;
        let prompt_tokens = meta["promptTokenCount"].as_u64()?;
        let completion_tokens = meta["candidatesTokenCount"].as_u64().unwrap_or(0);
        let total_tokens = meta["totalTokenCount"]
            .as_u64()
            .unwrap_or(prompt_tokens + completion_tokens);
        Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        })
    }

    fn map_finish_reason(s: &str) -> FinishReason {
        match s {
            "MAX_TOKENS" => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }

    /// candidate の parts を共通イベントに変換する
    ///
    /// functionCall の args はワイヤ上ではJSONオブジェクトなので、共通表現の
    /// 引数文字列に直して1断片の ArgsDelta として流す。
    ///
    /// `seq` はレスポンス内で合成したidの通し番号。Gemini は呼び出しidを
    /// 付けないことがあり、同名ツールの複数呼び出しが同じidに潰れると
    /// 集約側で引数バッファが混ざるため、名前だけでなく序数でも区別する。
    fn emit_parts(
        v: &Value,
        seq: &mut usize,
        callback: &mut dyn FnMut(LlmEvent) -> Result<(), Error>,
    ) -> Result<bool, Error> {
        let mut had_tool_calls = false;
        if let Some(parts) = v["candidates"][0]["content"]["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str() {
                    if !text.is_empty() {
                        callback(LlmEvent::TextDelta(text.to_string()))?;
                    }
                }
                if let Some(fc) = part["functionCall"].as_object() {
                    had_tool_calls = true;
                    let name = fc
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("")
                        .to_string();
                    let call_id = match fc.get("id").and_then(|id| id.as_str()) {
                        Some(id) => id.to_string(),
                        None => {
                            let id = format!("call_{}_{}", name, *seq);
                            *seq += 1;
                            id
                        }
                    };
                    let args = fc.get("args").cloned().unwrap_or_else(|| json!({}));
                    let args_str =
                        serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string());
                    callback(LlmEvent::ToolCallBegin {
                        call_id: call_id.clone(),
                        name,
                    })?;
                    if args_str != "{}" {
                        callback(LlmEvent::ToolCallArgsDelta {
                            call_id: call_id.clone(),
                            json_fragment: args_str,
                        })?;
                    }
                    callback(LlmEvent::ToolCallEnd { call_id })?;
                }
            }
        }
        Ok(had_tool_calls)
    }
}

impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn supports_tool_calls(&self) -> bool {
        true
    }

    fn endpoint(&self, streaming: bool) -> String {
        let method = if streaming {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        format!("{}/models/{}:{}", self.base_url, self.model, method)
    }

    fn make_request_payload(
        &self,
        query: &str,
        system_instruction: Option<&str>,
        history: &[ChatMessage],
        tools: Option<&[ToolDef]>,
        _streaming: bool,
    ) -> Result<Value, Error> {
        let mut payload = json!({});

        if let Some(system) = system_instruction {
            payload["systemInstruction"] = json!({
                "parts": [{"text": system}]
            });
        }

        if let Some(defs) = tools {
            if !defs.is_empty() {
                let declarations: Vec<Value> = defs
                    .iter()
                    .map(|d| {
                        json!({
                            "name": d.name,
                            "description": d.description,
                            "parameters": d.parameters
                        })
                    })
                    .collect();
                payload["tools"] = json!([{ "functionDeclarations": declarations }]);
            }
        }

        let mut contents: Vec<Value> = Vec::new();

        for msg in history {
            if msg.role == Role::Tool {
                // ツール結果: user ターンで functionResponse を返す。name は必須
                let name = msg.name.as_deref().unwrap_or("unknown");
                let content = msg.content_str();
                // content がJSONならそのまま、素のテキストならオブジェクトに包む
                let response_json: Value = serde_json::from_str(content)
                    .unwrap_or_else(|_| json!({ "result": content }));
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": response_json
                        }
                    }]
                }));
                continue;
            }

            let role = if msg.role == Role::Assistant {
                "model"
            } else {
                msg.role.as_str()
            };
            let mut parts: Vec<Value> = Vec::new();
            if !msg.content_str().is_empty() {
                parts.push(json!({"text": msg.content_str()}));
            }
            if let Some(ref tool_calls) = msg.tool_calls {
                for tc in tool_calls {
                    // 共通表現の引数は文字列なので、ワイヤのオブジェクト形に戻す
                    let args = tc.arguments_value().unwrap_or_else(|_| json!({}));
                    parts.push(json!({
                        "functionCall": {
                            "name": tc.name,
                            "args": args
                        }
                    }));
                }
            }
            if parts.is_empty() {
                parts.push(json!({"text": ""}));
            }
            contents.push(json!({ "role": role, "parts": parts }));
        }

        // ツール実行直後の継続呼び出しでは query が空で、履歴の末尾に
        // functionResponse が入っている。空の user メッセージを重ねない。
        if !query.is_empty() || contents.is_empty() {
            contents.push(json!({
                "role": "user",
                "parts": [{"text": query}]
            }));
        }

        payload["contents"] = json!(contents);

        Ok(payload)
    }

    fn parse_response(&self, body: &str) -> Result<Vec<LlmEvent>, Error> {
        let v: Value = serde_json::from_str(body)
            .map_err(|e| Error::json(format!("Failed to parse response JSON: {}", e)))?;

        if let Some(msg) = Self::error_message(&v) {
            return Err(Error::protocol(format!("Gemini API error: {}", msg)));
        }

        if !v["candidates"].is_array() {
            return Err(Error::protocol("response has no candidates"));
        }

        let mut events = Vec::new();
        let mut seq = 0usize;
        let had_tool_calls = Self::emit_parts(&v, &mut seq, &mut |ev| {
            events.push(ev);
            Ok(())
        })?;

        let finish = if had_tool_calls {
            FinishReason::ToolCalls
        } else {
            v["candidates"][0]["finishReason"]
                .as_str()
                .map(Self::map_finish_reason)
                .unwrap_or(FinishReason::Stop)
        };
        events.push(LlmEvent::Completed {
            finish,
            usage: Self::parse_usage(&v),
        });

        Ok(events)
    }

    fn stream_events(
        &self,
        body: &mut dyn BufRead,
        callback: &mut dyn FnMut(LlmEvent) -> Result<(), Error>,
    ) -> Result<(), Error> {
        // JSON配列ストリーム: [ {チャンク1} , {チャンク2} , ... ]
        // ブレースカウントで完全なオブジェクトを切り出す。テキストデルタの
        // 文字列値に `}` が含まれることがあるため、文字列リテラル内の
        // ブレースはエスケープを追跡して数えない（repair::balanced_object_spans
        // と同じ走査規則）。
        let mut json_buffer = String::new();
        let mut brace_count = 0;
        let mut in_object = false;
        let mut in_string = false;
        let mut escaped = false;
        let mut had_tool_calls = false;
        let mut finish: Option<FinishReason> = None;
        let mut usage: Option<Usage> = None;
        let mut seq = 0usize;

        let mut handle_chunk = |json_str: &str,
                                callback: &mut dyn FnMut(LlmEvent) -> Result<(), Error>|
         -> Result<(), Error> {
            let v: Value = match serde_json::from_str(json_str) {
                Ok(v) => v,
                // パースできないチャンクは読み飛ばす
                Err(_) => return Ok(()),
            };
            if let Some(msg) = Self::error_message(&v) {
                callback(LlmEvent::Failed { message: msg })?;
                return Ok(());
            }
            if Self::emit_parts(&v, &mut seq, callback)? {
                had_tool_calls = true;
            }
            if let Some(reason) = v["candidates"][0]["finishReason"].as_str() {
                finish = Some(Self::map_finish_reason(reason));
            }
            if let Some(u) = Self::parse_usage(&v) {
                usage = Some(u);
            }
            Ok(())
        };

        for line_result in body.lines() {
            let line = line_result
                .map_err(|e| Error::stream(format!("Failed to read stream line: {}", e)))?;
            for c in line.chars() {
                if in_object && in_string {
                    json_buffer.push(c);
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '"' {
                        in_string = false;
                    }
                    continue;
                }
                match c {
                    '"' => {
                        if in_object {
                            in_string = true;
                            json_buffer.push(c);
                        }
                    }
                    '{' => {
                        if !in_object {
                            in_object = true;
                            json_buffer.clear();
                        }
                        brace_count += 1;
                        json_buffer.push(c);
                    }
                    '}' => {
                        if in_object {
                            brace_count -= 1;
                            json_buffer.push(c);
                            if brace_count == 0 {
                                handle_chunk(&json_buffer, &mut *callback)?;
                                json_buffer.clear();
                                in_object = false;
                            }
                        }
                    }
                    _ => {
                        if in_object {
                            json_buffer.push(c);
                        }
                    }
                }
            }
            if in_object {
                json_buffer.push('\n');
            }
        }

        // finishReason を観測したチャンクがあったときだけ確定。なければ切断扱い
        if let Some(reason) = finish {
            let finish = if had_tool_calls {
                FinishReason::ToolCalls
            } else {
                reason
            };
            callback(LlmEvent::Completed { finish, usage })?;
        }
        Ok(())
    }
}
