//! # プロパティ値とキースキーマ
//!
//! ACMIの `key=value` は文字列のまま解析され、変換直前に一度だけ
//! キースキーマ（標準Tacviewキー / CAMキー / 未知キー）に照らして
//! 型付きの `PropertyValue` に解決されます。
//!
//! 値の書式化とエスケープ（`\\`、`\,` と行継続）もここで扱います。

use std::collections::BTreeMap;

use crate::acmi::cam::keys;
use crate::acmi::error::{AcmiWarning, Outcome, WarningKind};

/// 標準Tacviewプロパティキー
pub mod standard {
    pub const TRANSFORM: &str = "T";
    pub const NAME: &str = "Name";
    pub const TYPE: &str = "Type";
    pub const PILOT: &str = "Pilot";
    pub const COALITION: &str = "Coalition";
    pub const COLOR: &str = "Color";
    pub const IAS: &str = "IAS";
    pub const TAS: &str = "TAS";
    pub const THROTTLE: &str = "Throttle";
    pub const AOA: &str = "AOA";
    pub const AOS: &str = "AOS";
    pub const HDG: &str = "HDG";
    pub const HEADING: &str = "Heading";
    pub const TURN_RATE: &str = "TurnRate";
    pub const EVENT: &str = "Event";
    pub const REFERENCE_TIME: &str = "ReferenceTime";
    pub const REFERENCE_LONGITUDE: &str = "ReferenceLongitude";
    pub const REFERENCE_LATITUDE: &str = "ReferenceLatitude";
    pub const TITLE: &str = "Title";
    pub const AUTHOR: &str = "Author";
    pub const COMMENTS: &str = "Comments";

    /// 数値として解釈する標準キー
    pub const NUMERIC: &[&str] = &[
        IAS,
        TAS,
        THROTTLE,
        AOA,
        AOS,
        HDG,
        HEADING,
        TURN_RATE,
        REFERENCE_LONGITUDE,
        REFERENCE_LATITUDE,
        "CAS",
        "Mach",
        "AGL",
        "HDM",
        "Afterburner",
        "AirBrakes",
        "Flaps",
        "LandingGear",
    ];

    /// 文字列として解釈する標準キー
    pub const TEXT: &[&str] = &[
        NAME,
        TYPE,
        PILOT,
        COALITION,
        COLOR,
        EVENT,
        REFERENCE_TIME,
        TITLE,
        AUTHOR,
        COMMENTS,
        "Group",
        "Country",
        "CallSign",
        "Registration",
        "Squawk",
        "ShortName",
        "LongName",
    ];
}

/// 型付きプロパティ値
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Integer(i64),
    Number(f64),
    Bool(bool),
    Text(String),
}

impl PropertyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Integer(v) => Some(*v as f64),
            PropertyValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            PropertyValue::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// 値を文字列として取得（数値・真偽値もACMI表記で文字列化）
    pub fn to_text(&self) -> String {
        match self {
            PropertyValue::Text(s) => s.clone(),
            other => format_value(other),
        }
    }

    /// JSON値に変換（`Agent.Config.*` の復元用）
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Integer(v) => serde_json::Value::from(*v),
            PropertyValue::Number(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            PropertyValue::Bool(v) => serde_json::Value::Bool(*v),
            PropertyValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

/// 型付きプロパティマップ
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// キーの解釈方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Numeric,
    Flag,
    Text,
    /// 未知キー・設定キー: 引用符、真偽値、数値の順に推定
    Inferred,
}

/// キースキーマに基づくキー種別の判定
pub fn key_kind(key: &str) -> KeyKind {
    if let Some(kind) = keys::kind_of(key) {
        return kind;
    }
    if standard::NUMERIC.contains(&key) {
        KeyKind::Numeric
    } else if standard::TEXT.contains(&key) {
        KeyKind::Text
    } else {
        KeyKind::Inferred
    }
}

/// 生の文字列マップを型付きマップに解決
///
/// 空値（`Key=`）は「値なし」としてマップから除外されます。
/// 型付きキーの値が解釈できない場合は警告を出し、そのキーを除外します。
pub fn resolve_properties(raw: &BTreeMap<String, String>) -> Outcome<PropertyMap> {
    let mut resolved = PropertyMap::new();
    let mut warnings = Vec::new();

    for (key, value) in raw {
        if value.is_empty() {
            continue;
        }
        match resolve_value(key, value) {
            Some(v) => {
                resolved.insert(key.clone(), v);
            }
            None => warnings.push(AcmiWarning::new(WarningKind::MalformedValue {
                key: key.clone(),
                raw: value.clone(),
            })),
        }
    }

    Outcome::new(resolved, warnings)
}

/// 単一値の解決
pub fn resolve_value(key: &str, raw: &str) -> Option<PropertyValue> {
    let trimmed = raw.trim();
    match key_kind(key) {
        KeyKind::Numeric => parse_number(unquote(trimmed).as_str()),
        KeyKind::Flag => parse_flag(unquote(trimmed).as_str()).map(PropertyValue::Bool),
        KeyKind::Text => Some(PropertyValue::Text(unquote(trimmed))),
        KeyKind::Inferred => Some(infer_value(trimmed)),
    }
}

fn parse_number(text: &str) -> Option<PropertyValue> {
    if let Ok(v) = text.parse::<i64>() {
        return Some(PropertyValue::Integer(v));
    }
    text.parse::<f64>().ok().map(PropertyValue::Number)
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn is_quoted(text: &str) -> bool {
    text.len() >= 2 && text.starts_with('"') && text.ends_with('"')
}

fn unquote(text: &str) -> String {
    if is_quoted(text) {
        text[1..text.len() - 1].replace("\\\"", "\"")
    } else {
        text.to_string()
    }
}

fn infer_value(text: &str) -> PropertyValue {
    if is_quoted(text) {
        return PropertyValue::Text(unquote(text));
    }
    if let Some(flag) = match text {
        "true" | "True" | "TRUE" => Some(true),
        "false" | "False" | "FALSE" => Some(false),
        _ => None,
    } {
        return PropertyValue::Bool(flag);
    }
    parse_number(text).unwrap_or_else(|| PropertyValue::Text(text.to_string()))
}

/// 値をACMI表記に書式化
///
/// 浮動小数点は最短の往復表現で出力し、整数値でも `.0` を付けて
/// `Integer` と区別できるようにします。文字列は推定で別の型に
/// 読まれる場合のみ引用符で囲みます。
pub fn format_value(value: &PropertyValue) -> String {
    match value {
        PropertyValue::Integer(v) => v.to_string(),
        PropertyValue::Number(v) => format_number(*v),
        PropertyValue::Bool(v) => v.to_string(),
        PropertyValue::Text(s) => {
            let escaped = escape_text(s);
            let ambiguous = s.is_empty()
                || s.trim() != s
                || s.contains('"')
                || !matches!(infer_value(s), PropertyValue::Text(ref t) if t == s);
            if ambiguous {
                format!("\"{}\"", escaped.replace('"', "\\\""))
            } else {
                escaped
            }
        }
    }
}

/// 浮動小数点を往復可能な最短表現で書式化
pub fn format_number(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

/// テキスト値のエスケープ（`\` → `\\`、`,` → `\,`、改行 → `\` + 改行）
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// エスケープの解除（`\\` → `\`、`\,` → `,`、`\` + 改行 → 改行）
///
/// それ以外の `\` はそのまま残します（`C:\path` など）。
pub fn unescape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('\\') | Some(',') | Some('\n') => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

/// エスケープされていない、引用符外のカンマで分割
pub fn split_unescaped_commas(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in text.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_resolution_against_key_schema() {
        let outcome = resolve_properties(&raw(&[
            ("IAS", "250.5"),
            ("Name", "42"),
            ("Agent.Success", "true"),
            ("Agent.EpisodeID", "7"),
            ("Agent.Config.lr", "0.0003"),
            ("Agent.Config.policy", "PPO"),
            ("Custom", "\"12\""),
            ("Agent.Value", ""),
        ]));

        let props = &outcome.value;
        assert!(outcome.warnings.is_empty());
        assert_eq!(props["IAS"], PropertyValue::Number(250.5));
        assert_eq!(props["Name"], PropertyValue::Text("42".into()));
        assert_eq!(props["Agent.Success"], PropertyValue::Bool(true));
        assert_eq!(props["Agent.EpisodeID"], PropertyValue::Text("7".into()));
        assert_eq!(props["Agent.Config.lr"], PropertyValue::Number(0.0003));
        assert_eq!(props["Agent.Config.policy"], PropertyValue::Text("PPO".into()));
        assert_eq!(props["Custom"], PropertyValue::Text("12".into()));
        assert!(!props.contains_key("Agent.Value"));
    }

    #[test]
    fn test_malformed_numeric_value_is_warned_and_dropped() {
        let outcome = resolve_properties(&raw(&[("IAS", "fast"), ("Throttle", "0.5")]));
        assert!(!outcome.value.contains_key("IAS"));
        assert_eq!(outcome.value["Throttle"], PropertyValue::Number(0.5));
        assert_eq!(
            outcome.warnings[0].kind,
            WarningKind::MalformedValue { key: "IAS".into(), raw: "fast".into() }
        );
    }

    #[test]
    fn test_number_formatting_preserves_kind() {
        assert_eq!(format_value(&PropertyValue::Number(3.0)), "3.0");
        assert_eq!(format_value(&PropertyValue::Number(-0.125)), "-0.125");
        assert_eq!(format_value(&PropertyValue::Integer(3)), "3");
        assert_eq!(infer_value("3.0"), PropertyValue::Number(3.0));
        assert_eq!(infer_value("3"), PropertyValue::Integer(3));
    }

    #[test]
    fn test_text_quoting_only_when_ambiguous() {
        assert_eq!(format_value(&PropertyValue::Text("agent_01".into())), "agent_01");
        assert_eq!(format_value(&PropertyValue::Text("42".into())), "\"42\"");
        assert_eq!(format_value(&PropertyValue::Text("true".into())), "\"true\"");
        assert_eq!(format_value(&PropertyValue::Text(String::new())), "\"\"");
        assert_eq!(format_value(&PropertyValue::Text("a,b".into())), "a\\,b");
    }

    #[test]
    fn test_split_and_unescape() {
        let parts = split_unescaped_commas("T=1|2|3,Name=a\\,b,Title=\"x,y\"");
        assert_eq!(parts, vec!["T=1|2|3", "Name=a\\,b", "Title=\"x,y\""]);
        assert_eq!(unescape_text("a\\,b"), "a,b");
        assert_eq!(unescape_text("line1\\\nline2"), "line1\nline2");
        assert_eq!(unescape_text("C:\\path"), "C:\\path");
        assert_eq!(escape_text("x,y\nz"), "x\\,y\\\nz");
    }

    #[test]
    fn test_backslash_escaping_is_reversible() {
        for text in ["agent\\", "a\\,b", "C:\\runs\\", "\\\\", "end\\\nnext"] {
            let escaped = escape_text(text);
            let parts = split_unescaped_commas(&format!("Name={},IAS=1", escaped));
            assert_eq!(parts.len(), 2, "{}", escaped);
            let value = parts[0].strip_prefix("Name=").unwrap();
            assert_eq!(unescape_text(value), text);
        }
        assert_eq!(escape_text("agent\\"), "agent\\\\");
        assert_eq!(unescape_text("agent\\\\"), "agent\\");
    }
}
