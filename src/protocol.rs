//! 手動ツール呼び出しプロトコル
//!
//! ネイティブの function calling を持たないバックエンド向けに、システム指示で
//! `TOOL_CALL: {"name": ..., "arguments": {...}}`（1行1呼び出し）という
//! テキスト規約をモデルに教え、アシスタント本文からその行を抽出する。
//!
//! 逐次実行ポリシー: 1ターンに複数の TOOL_CALL 行があっても、復元できた最初の
//! 1件だけを採用し、残りは破棄してログに残す。ツールを1つ実行して結果を
//! 再注入してから次の依存ステップへ進ませるための意図的な順序保証であり、
//! パース上の制限ではない。並列抽出に「修正」してはならない。

use crate::message::ToolCall;
use crate::repair::{balanced_object_spans, normalize_arguments};
use crate::tool::ToolDef;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// テキスト規約のプレフィックス
pub const TOOL_CALL_PREFIX: &str = "TOOL_CALL:";

/// 抽出結果: ツール呼び出し行を除去した本文と、抽出された呼び出し列
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCalls {
    /// TOOL_CALL 行をすべて取り除き、連続する空行を畳んだ本文
    pub content: String,
    /// 採用された呼び出し（逐次ポリシーにより高々1件）
    pub calls: Vec<ToolCall>,
}

/// ツール規約を説明するシステム指示ブロックを描画する
///
/// function calling 非対応バックエンドへのリクエスト時に、ドライバが
/// システム指示へ連結する。
pub fn tool_instructions(tools: &[ToolDef]) -> String {
    let mut out = String::new();
    out.push_str(
        "You have access to the following tools. To call a tool, output a line in exactly this format:\n\
         \n\
         TOOL_CALL: {\"name\": \"<tool name>\", \"arguments\": {<JSON arguments>}}\n\
         \n\
         Rules:\n\
         - Output the TOOL_CALL line on its own line, nothing else on it.\n\
         - Call at most one tool per turn, then wait for its result before planning the next step.\n\
         \n\
         Available tools:\n",
    );
    for tool in tools {
        let params =
            serde_json::to_string(&tool.parameters).unwrap_or_else(|_| "{}".to_string());
        out.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            tool.name, tool.description, params
        ));
    }
    out
}

/// アシスタント本文から TOOL_CALL 行を抽出する
///
/// TOOL_CALL を含む行は復元の成否にかかわらず行ごと本文から取り除く
/// （部分的に消費した残骸を本文に残さない）。
pub fn extract_tool_calls(text: &str) -> ExtractedCalls {
    let mut calls: Vec<ToolCall> = Vec::new();
    // 採用済み・破棄済みを問わず (name, 正規化済み引数) を記録して再走査の重複を防ぐ
    let mut seen: Vec<(String, String)> = Vec::new();
    let mut kept: Vec<&str> = Vec::new();

    for line in text.lines() {
        let Some(pos) = line.find(TOOL_CALL_PREFIX) else {
            kept.push(line);
            continue;
        };
        let after = &line[pos + TOOL_CALL_PREFIX.len()..];
        match parse_call_line(after) {
            Some((name, args)) => {
                if seen.iter().any(|(n, a)| *n == name && *a == args) {
                    debug!(name = %name, "duplicate TOOL_CALL line skipped");
                    continue;
                }
                if calls.is_empty() {
                    let id = format!("manual_call_{}", calls.len());
                    calls.push(ToolCall::new(id, name.clone(), args.clone()));
                } else {
                    // 逐次実行ポリシー: 2件目以降は破棄
                    warn!(
                        name = %name,
                        "additional TOOL_CALL discarded (sequential-only policy)"
                    );
                }
                seen.push((name, args));
            }
            None => {
                warn!(line, "unparseable TOOL_CALL line stripped");
            }
        }
    }

    ExtractedCalls {
        content: collapse_blank_lines(&kept),
        calls,
    }
}

/// プレフィックス以降の1行分から (name, 正規化済み引数JSON) を取り出す
fn parse_call_line(after: &str) -> Option<(String, String)> {
    let brace = after.find('{')?;
    let candidate = after[brace..].trim();
    let object = repair_incomplete(candidate)?;
    let v: Value = serde_json::from_str(&object).ok()?;
    let name = v.get("name")?.as_str()?.trim().to_string();
    if name.is_empty() {
        return None;
    }
    let args = match v.get("arguments") {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        // 引数がJSON文字列として二重に包まれているケース
        Some(Value::String(s)) => {
            serde_json::from_str::<Value>(s).ok().filter(Value::is_object)?
        }
        _ => json!({}),
    };
    // Value 経由で再シリアライズしてキー順を正規化（重複判定に使う）
    let args = serde_json::to_string(&args).ok()?;
    Some((name, args))
}

/// 不完全なJSONオブジェクトの修復を試みる
///
/// 素朴な単一レベルのブレースマッチはネストを追えないため、バランス追跡での
/// 抽出に加えて、閉じブレース付加 / 末尾カンマ除去 / 閉じ引用符付加を順に試し、
/// それでもだめなら repair のカスケードへフォールバックする。
fn repair_incomplete(candidate: &str) -> Option<String> {
    if let Some(&(s, e)) = balanced_object_spans(candidate).first() {
        let span = &candidate[s..e];
        if serde_json::from_str::<Value>(span).is_ok() {
            return Some(span.to_string());
        }
    }
    let trimmed = candidate.trim_end();
    let attempts = [
        format!("{}}}", trimmed),
        format!("{}}}", trimmed.trim_end_matches(',').trim_end()),
        format!("{}\"}}", trimmed),
    ];
    for attempt in &attempts {
        if serde_json::from_str::<Value>(attempt).is_ok() {
            debug!("repaired incomplete TOOL_CALL object");
            return Some(attempt.clone());
        }
    }
    normalize_arguments(candidate).into_option()
}

/// 連続する空行を1つに畳み、先頭・末尾の空行を落とす
fn collapse_blank_lines(lines: &[&str]) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut prev_blank = false;
    for line in lines {
        let blank = line.trim().is_empty();
        if blank && prev_blank {
            continue;
        }
        out.push(line);
        prev_blank = blank;
    }
    while out.first().is_some_and(|l| l.trim().is_empty()) {
        out.remove(0);
    }
    while out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }
    out.join("\n")
}
