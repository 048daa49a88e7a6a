//! OpenAI Chat Completions 互換 (/chat/completions) ワイヤアダプタ
//!
//! base_url で任意の互換エンドポイントを指定できる。レスポンスとSSEストリームを
//! 共通の `LlmEvent` 列に正規化する。ストリーミングの tool_calls は2フレーム目
//! 以降 id を省いて index だけで届くため、index → call_id の解決はこのアダプタの
//! 内側で行い、外に出すイベントは常に call_id キーにする。

use crate::error::Error;
use crate::events::{FinishReason, LlmEvent, Usage};
use crate::message::{ChatMessage, Role};
use crate::provider::LlmProvider;
use crate::tool::ToolDef;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::BufRead;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TEMPERATURE: f64 = 0.7;

/// OpenAI Chat Completions 互換プロバイダ
pub struct OpenAiCompatProvider {
    model: String,
    base_url: String,
    temperature: f64,
    /// ネイティブの function calling を持つエンドポイントか。
    /// false のときドライバは手動ツール呼び出しプロトコルに切り替える。
    native_tools: bool,
}

impl OpenAiCompatProvider {
    /// 新しいプロバイダを作成
    ///
    /// * `model` - モデル名（None のとき "gpt-4o-mini"）
    /// * `base_url` - ベース URL（None のとき OpenAI 本家）
    /// * `temperature` - 温度（None のとき 0.7）
    /// * `native_tools` - function calling をネイティブサポートするか
    pub fn new(
        model: Option<String>,
        base_url: Option<String>,
        temperature: Option<f32>,
        native_tools: bool,
    ) -> Self {
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let temperature = temperature.map(f64::from).unwrap_or(DEFAULT_TEMPERATURE);
        Self {
            model,
            base_url,
            temperature,
            native_tools,
        }
    }

    fn error_message(v: &Value) -> Option<String> {
        v.get("error")
            .map(|err| err["message"].as_str().unwrap_or("Unknown error").to_string())
    }
}

/// バックエンドの finish_reason 文字列を3値へ正規化する
fn map_finish_reason(s: &str) -> FinishReason {
    match s {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let usage = v.get("usage")?;
    let prompt_tokens = usage["prompt_tokens"].as_u64()?;
    let completion_tokens = usage["completion_tokens"].as_u64()?;
    let total_tokens = usage["total_tokens"]
        .as_u64()
        .unwrap_or(prompt_tokens + completion_tokens);
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai_compat"
    }

    fn supports_tool_calls(&self) -> bool {
        self.native_tools
    }

    fn endpoint(&self, _streaming: bool) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn make_request_payload(
        &self,
        query: &str,
        system_instruction: Option<&str>,
        history: &[ChatMessage],
        tools: Option<&[ToolDef]>,
        streaming: bool,
    ) -> Result<Value, Error> {
        let mut messages: Vec<Value> = Vec::new();

        if let Some(s) = system_instruction {
            messages.push(json!({ "role": "system", "content": s }));
        }

        for msg in history {
            match msg.role {
                Role::System | Role::User => {
                    messages.push(json!({
                        "role": msg.role.as_str(),
                        "content": msg.content_str()
                    }));
                }
                Role::Tool => {
                    let call_id = msg.tool_call_id.as_deref().unwrap_or("");
                    messages.push(json!({
                        "role": "tool",
                        "content": msg.content_str(),
                        "tool_call_id": call_id
                    }));
                }
                Role::Assistant => {
                    if let Some(ref tool_calls) = msg.tool_calls {
                        let wire_calls: Vec<Value> = tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": tc.call_type(),
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments
                                    }
                                })
                            })
                            .collect();
                        messages.push(json!({
                            "role": "assistant",
                            "content": msg.content_str(),
                            "tool_calls": wire_calls
                        }));
                    } else {
                        messages.push(json!({
                            "role": "assistant",
                            "content": msg.content_str()
                        }));
                    }
                }
            }
        }

        // ツール実行後の継続呼び出しでは query が空になるため、空の user メッセージは送らない
        if !query.is_empty() || messages.is_empty() {
            messages.push(json!({ "role": "user", "content": query }));
        }

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": streaming
        });

        if self.native_tools {
            if let Some(defs) = tools {
                if !defs.is_empty() {
                    let tools_json: Vec<Value> = defs
                        .iter()
                        .map(|d| {
                            json!({
                                "type": "function",
                                "function": {
                                    "name": d.name,
                                    "description": d.description,
                                    "parameters": d.parameters
                                }
                            })
                        })
                        .collect();
                    payload["tools"] = json!(tools_json);
                    payload["tool_choice"] = json!("auto");
                }
            }
        }

        Ok(payload)
    }

    fn parse_response(&self, body: &str) -> Result<Vec<LlmEvent>, Error> {
        let v: Value = serde_json::from_str(body)
            .map_err(|e| Error::json(format!("Failed to parse response JSON: {}", e)))?;

        if let Some(msg) = Self::error_message(&v) {
            return Err(Error::protocol(format!("Chat completions error: {}", msg)));
        }

        let choices = v["choices"]
            .as_array()
            .ok_or_else(|| Error::protocol("response has no choices"))?;
        let choice = choices
            .first()
            .ok_or_else(|| Error::protocol("response has empty choices"))?;
        let message = choice
            .get("message")
            .filter(|m| m.is_object())
            .ok_or_else(|| Error::protocol("choice has no message"))?;

        let mut events = Vec::new();

        if let Some(text) = message["content"].as_str() {
            if !text.is_empty() {
                events.push(LlmEvent::TextDelta(text.to_string()));
            }
        }

        if let Some(tool_calls) = message["tool_calls"].as_array() {
            for (i, tc) in tool_calls.iter().enumerate() {
                let call_id = tc["id"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| format!("call_{}", i));
                let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                events.push(LlmEvent::ToolCallBegin {
                    call_id: call_id.clone(),
                    name,
                });
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    if !args.is_empty() {
                        events.push(LlmEvent::ToolCallArgsDelta {
                            call_id: call_id.clone(),
                            json_fragment: args.to_string(),
                        });
                    }
                }
                events.push(LlmEvent::ToolCallEnd { call_id });
            }
        }

        let finish = choice["finish_reason"]
            .as_str()
            .map(map_finish_reason)
            .unwrap_or(FinishReason::Stop);
        events.push(LlmEvent::Completed {
            finish,
            usage: parse_usage(&v),
        });

        Ok(events)
    }

    fn stream_events(
        &self,
        body: &mut dyn BufRead,
        callback: &mut dyn FnMut(LlmEvent) -> Result<(), Error>,
    ) -> Result<(), Error> {
        // ワイヤは2フレーム目以降 id を省き index だけを送る。ここで解決して
        // id キーのイベントに直す。
        let mut index_to_id: HashMap<u64, String> = HashMap::new();
        let mut call_order: Vec<String> = Vec::new();
        let mut pending_finish: Option<FinishReason> = None;
        let mut usage: Option<Usage> = None;
        let mut saw_terminal = false;

        for line_result in body.lines() {
            let line =
                line_result.map_err(|e| Error::stream(format!("Failed to read stream line: {}", e)))?;
            if !line.starts_with("data: ") {
                continue;
            }
            let data = line["data: ".len()..].trim();
            if data == "[DONE]" {
                saw_terminal = true;
                break;
            }

            let v: Value = match serde_json::from_str(data) {
                Ok(x) => x,
                // keepalive 等のパースできない行は読み飛ばす
                Err(_) => continue,
            };

            if let Some(msg) = Self::error_message(&v) {
                callback(LlmEvent::Failed { message: msg })?;
                continue;
            }

            if let Some(u) = parse_usage(&v) {
                usage = Some(u);
            }

            let choice = match v["choices"].get(0) {
                Some(c) => c,
                None => continue,
            };

            if let Some(reason) = choice["finish_reason"].as_str() {
                pending_finish = Some(map_finish_reason(reason));
                saw_terminal = true;
            }

            let delta = match choice.get("delta") {
                Some(d) => d,
                None => continue,
            };

            // content: 文字列のほか、互換実装の content parts 配列にも対応
            if let Some(s) = delta["content"].as_str() {
                if !s.is_empty() {
                    callback(LlmEvent::TextDelta(s.to_string()))?;
                }
            } else if let Some(parts) = delta["content"].as_array() {
                for part in parts {
                    if let Some(text) = part["text"].as_str() {
                        if !text.is_empty() {
                            callback(LlmEvent::TextDelta(text.to_string()))?;
                        }
                    }
                }
            }

            // reasoning_content: DeepSeek R1 系の推論モデルが使うフィールド
            if let Some(s) = delta["reasoning_content"].as_str() {
                if !s.is_empty() {
                    callback(LlmEvent::TextDelta(s.to_string()))?;
                }
            }

            if let Some(tool_calls) = delta["tool_calls"].as_array() {
                for tc in tool_calls {
                    let index = tc["index"].as_u64().unwrap_or(0);
                    let name = tc["function"]["name"].as_str().unwrap_or("");

                    let call_id = if let Some(id) = tc["id"].as_str() {
                        index_to_id.insert(index, id.to_string());
                        id.to_string()
                    } else if let Some(id) = index_to_id.get(&index) {
                        id.clone()
                    } else {
                        // id が一度も届かないまま断片が来た場合の合成id
                        let id = format!("call_index_{}", index);
                        debug!(index, "tool call fragment without id, synthesizing");
                        index_to_id.insert(index, id.clone());
                        id
                    };

                    let is_new = !call_order.contains(&call_id);
                    if is_new {
                        call_order.push(call_id.clone());
                    }
                    // 初見か、名前が後から確定したフレームでは Begin を流す
                    // （集約側の生成は冪等で、名前は最初の非空値で固定される）
                    if is_new || !name.is_empty() {
                        callback(LlmEvent::ToolCallBegin {
                            call_id: call_id.clone(),
                            name: name.to_string(),
                        })?;
                    }

                    if let Some(fragment) = tc["function"]["arguments"].as_str() {
                        if !fragment.is_empty() {
                            callback(LlmEvent::ToolCallArgsDelta {
                                call_id: call_id.clone(),
                                json_fragment: fragment.to_string(),
                            })?;
                        }
                    }
                }
            }
        }

        // 終端マーカー（[DONE] または finish_reason）を観測したときだけ確定させる。
        // 観測しないままここへ来たら Completed を流さず、集約側が切断として扱う。
        if saw_terminal {
            for call_id in &call_order {
                callback(LlmEvent::ToolCallEnd {
                    call_id: call_id.clone(),
                })?;
            }
            let finish = pending_finish.unwrap_or(if call_order.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            });
            callback(LlmEvent::Completed { finish, usage })?;
        }
        Ok(())
    }
}
