//! ツール引数JSONのリカバリ戦略カスケード
//!
//! バックエンドが返すツール引数は、重複出力・途中切断・プレーンテキスト混入などで
//! 壊れていることが多い。ここでは「単一のJSONオブジェクトのはず」の文字列を、
//! 順序付きの純粋な戦略リストで段階的に復元する。最初に成功した戦略の結果を採用し、
//! 全戦略が失敗したら `Recovery::Unrecoverable` を返す。
//!
//! 戦略は状態を持たない `fn(&str) -> Option<String>` で、個別にユニットテストできる。
//! この関数は決してパニックせず、エラーも返さない（失敗の扱いは呼び出し側の責務）。

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// リカバリ結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// 有効なJSONとして復元できた文字列
    Recovered(String),
    /// 全戦略を試しても復元できなかった
    Unrecoverable,
}

impl Recovery {
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered(_))
    }

    pub fn into_option(self) -> Option<String> {
        match self {
            Self::Recovered(s) => Some(s),
            Self::Unrecoverable => None,
        }
    }
}

type Strategy = fn(&str) -> Option<String>;

/// 戦略の適用順序。上から順に試し、最初の成功で打ち切る。
const STRATEGIES: &[(&str, Strategy)] = &[
    ("direct_parse", direct_parse),
    ("collapse_duplicates", collapse_duplicates),
    ("first_valid_object", first_valid_object),
    ("pattern_objects", pattern_objects),
    ("rebuild_key_values", rebuild_key_values),
];

/// ツール引数文字列を正規のJSONに復元する
///
/// すでに有効なJSONなら無変更で返す（冪等）。各戦略の試行は診断用に
/// tracing イベントとして観測できる。
pub fn normalize_arguments(raw: &str) -> Recovery {
    for &(name, run) in STRATEGIES {
        if let Some(fixed) = run(raw) {
            if name != "direct_parse" {
                debug!(strategy = name, "recovered tool call arguments");
            }
            return Recovery::Recovered(fixed);
        }
        debug!(strategy = name, "argument recovery strategy failed");
    }
    warn!(raw, "all argument recovery strategies exhausted");
    Recovery::Unrecoverable
}

/// 戦略1: そのままパースできるなら無変更で返す
fn direct_parse(raw: &str) -> Option<String> {
    serde_json::from_str::<Value>(raw).ok()?;
    Some(raw.to_string())
}

/// 戦略2: 同一オブジェクトの連続重複（`{"a":1}{"a":1}`）を1つに畳む
///
/// 一部のバックエンドは同じオブジェクトを背中合わせに繰り返し出力する。
/// 全体が「同一のバランス済み `{...}` スパン + 空白」の繰り返しであるときだけ成功する。
fn collapse_duplicates(raw: &str) -> Option<String> {
    let spans = balanced_object_spans(raw);
    if spans.len() < 2 {
        return None;
    }
    let (first_start, first_end) = spans[0];
    if !raw[..first_start].trim().is_empty() {
        return None;
    }
    let first = &raw[first_start..first_end];
    let mut prev_end = first_end;
    for &(s, e) in &spans[1..] {
        if !raw[prev_end..s].trim().is_empty() || &raw[s..e] != first {
            return None;
        }
        prev_end = e;
    }
    if !raw[prev_end..].trim().is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(first).ok()?;
    Some(first.to_string())
}

/// 戦略3: 最初に単独でパースできるオブジェクトスパンを抽出する
///
/// まずブレースのバランスを追ったスパン（ネスト対応）、次に単一レベルの
/// `{...}` 断片（外側の構造が壊れている場合の内側オブジェクト）を試す。
fn first_valid_object(raw: &str) -> Option<String> {
    for (s, e) in balanced_object_spans(raw) {
        let candidate = &raw[s..e];
        if serde_json::from_str::<Value>(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    let re = Regex::new(r"\{[^{}]*\}").ok()?;
    for m in re.find_iter(raw) {
        if serde_json::from_str::<Value>(m.as_str()).is_ok() {
            return Some(m.as_str().to_string());
        }
    }
    None
}

/// JSON スカラーにマッチするパターン片（文字列・数値・真偽・null）
const SCALAR_PATTERN: &str = r#"(?:"[^"]*"|-?\d+(?:\.\d+)?|true|false|null)"#;

/// 戦略4: 徐々に緩いオブジェクト形パターンで抽出する
///
/// 文字列値のみのオブジェクト → 型付きスカラー値のオブジェクト、の順で試す。
/// 末尾カンマつきでマッチした場合はカンマを除去してからパースを試みる。
fn pattern_objects(raw: &str) -> Option<String> {
    let patterns = [
        r#"\{\s*"[^"]+"\s*:\s*"[^"]*"(?:\s*,\s*"[^"]+"\s*:\s*"[^"]*")*\s*,?\s*\}"#.to_string(),
        format!(
            r#"\{{\s*"[^"]+"\s*:\s*{v}(?:\s*,\s*"[^"]+"\s*:\s*{v})*\s*,?\s*\}}"#,
            v = SCALAR_PATTERN
        ),
    ];
    for pattern in &patterns {
        let re = Regex::new(pattern).ok()?;
        for m in re.find_iter(raw) {
            let candidate = m.as_str();
            if serde_json::from_str::<Value>(candidate).is_ok() {
                return Some(candidate.to_string());
            }
            // 末尾カンマを落として再試行
            let trimmed = strip_trailing_comma(candidate);
            if trimmed != candidate && serde_json::from_str::<Value>(&trimmed).is_ok() {
                return Some(trimmed);
            }
        }
    }
    None
}

/// 戦略5: ブレースの整合性を無視して `"key": value` ペアを拾い集め、
/// 1ペア以上あればオブジェクトとして組み立て直す
fn rebuild_key_values(raw: &str) -> Option<String> {
    let re = Regex::new(&format!(r#""([^"]+)"\s*:\s*({})"#, SCALAR_PATTERN)).ok()?;
    let mut map = Map::new();
    for cap in re.captures_iter(raw) {
        let key = cap[1].to_string();
        let value = parse_scalar_token(&cap[2]);
        // 同じキーが複数回現れたら最初の出現を優先
        map.entry(key).or_insert(value);
    }
    if map.is_empty() {
        return None;
    }
    serde_json::to_string(&Value::Object(map)).ok()
}

/// スカラートークンをJSON値に変換する
///
/// 小数点を含まない数値は整数としてパースし、失敗したら浮動小数へフォールバック。
/// 真偽値と null はリテラル一致でのみ認識する（truthiness 判定はしない）。
fn parse_scalar_token(token: &str) -> Value {
    if token.starts_with('"') {
        return serde_json::from_str::<Value>(token)
            .unwrap_or_else(|_| Value::String(token.trim_matches('"').to_string()));
    }
    match token {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ if !token.contains('.') => token
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| token.parse::<f64>().map(Value::from))
            .unwrap_or(Value::Null),
        _ => token.parse::<f64>().map(Value::from).unwrap_or(Value::Null),
    }
}

/// `}` 直前の末尾カンマを取り除く
fn strip_trailing_comma(s: &str) -> String {
    let inner = s.trim_end();
    if let Some(body) = inner.strip_suffix('}') {
        let body = body.trim_end();
        if let Some(body) = body.strip_suffix(',') {
            return format!("{}}}", body.trim_end());
        }
    }
    inner.to_string()
}

/// トップレベルでバランスした `{...}` スパンの位置を列挙する
///
/// 文字列リテラル内のブレース（`{"a": "}"}` など）はエスケープを追跡して無視する。
pub(crate) fn balanced_object_spans(raw: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in raw.bytes().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        spans.push((start, i + 1));
                    }
                }
            }
            _ => {}
        }
    }
    spans
}
