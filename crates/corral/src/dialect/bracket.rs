//! Square-bracket function-call dialect: `[lookup(q='rust', limit=3)]`.
//! Several calls share one bracket pair, comma-separated. Results go back as
//! plain sentences. Used by Llama-family instruction models.

use indoc::formatdoc;
use serde_json::{Map, Value};

use super::{stringify_result, ToolCall, ToolDialect};
use crate::tools::ToolSpec;

pub struct BracketDialect;

/// A recognized call list plus the span of text it occupied.
struct Scan {
    calls: Vec<ToolCall>,
    spans: Vec<(usize, usize)>,
}

impl BracketDialect {
    /// Walk `text` and collect every `[name(...), ...]` block that parses as
    /// a call list. Anything else (including bare `[text]`) is left alone.
    fn scan(text: &str) -> Scan {
        let chars: Vec<char> = text.chars().collect();
        let mut calls = Vec::new();
        let mut spans = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '[' {
                if let Some((block, end)) = Self::parse_call_list(&chars, i + 1) {
                    if !block.is_empty() {
                        calls.extend(block);
                        spans.push((i, end));
                        i = end;
                        continue;
                    }
                }
            }
            i += 1;
        }
        Scan { calls, spans }
    }

    fn parse_call_list(chars: &[char], mut i: usize) -> Option<(Vec<ToolCall>, usize)> {
        let mut calls = Vec::new();
        loop {
            i = skip_ws(chars, i);
            let (name, after_name) = parse_ident(chars, i)?;
            i = skip_ws(chars, after_name);
            if chars.get(i) != Some(&'(') {
                return None;
            }
            let (args_src, after_args) = scan_parens(chars, i + 1)?;
            i = skip_ws(chars, after_args);
            calls.push(ToolCall::new(name, parse_args(&args_src)));
            match chars.get(i) {
                Some(',') => i += 1,
                Some(']') => return Some((calls, i + 1)),
                _ => return None,
            }
        }
    }
}

fn skip_ws(chars: &[char], mut i: usize) -> usize {
    while chars.get(i).is_some_and(|c| c.is_whitespace()) {
        i += 1;
    }
    i
}

fn parse_ident(chars: &[char], start: usize) -> Option<(String, usize)> {
    let first = *chars.get(start)?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let mut i = start + 1;
    while chars
        .get(i)
        .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        i += 1;
    }
    Some((chars[start..i].iter().collect(), i))
}

/// Collect the argument source between balanced parentheses, honoring
/// quoted strings. Returns the inner text and the index past `)`.
fn scan_parens(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut inner = String::new();
    let mut i = start;
    while let Some(&c) = chars.get(i) {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
        } else {
            match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((inner, i + 1));
                    }
                }
                _ => {}
            }
        }
        inner.push(c);
        i += 1;
    }
    None
}

/// Split `src` on top-level commas and parse each `key=value` pair.
fn parse_args(src: &str) -> Map<String, Value> {
    let mut args = Map::new();
    for part in split_top_level(src) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some(eq) = find_top_level_eq(part) else {
            continue;
        };
        let key = part[..eq].trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        args.insert(key.to_string(), parse_value(part[eq + 1..].trim()));
    }
    args
}

fn split_top_level(src: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth = 0usize;
    for c in src.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            current.push(c);
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

fn find_top_level_eq(part: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, c) in part.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '=' => return Some(idx),
            _ => {}
        }
    }
    None
}

/// Value discriminator: quoted → string, decimal numeral → number,
/// `True`/`False`/`None` → bool/null, any other bare word → string.
fn parse_value(raw: &str) -> Value {
    if raw.len() >= 2 {
        let first = raw.chars().next().unwrap_or_default();
        if (first == '\'' || first == '"') && raw.ends_with(first) {
            return Value::String(unescape(&raw[1..raw.len() - 1], first));
        }
    }
    if is_decimal(raw) {
        if raw.contains('.') {
            if let Ok(f) = raw.parse::<f64>() {
                if let Some(n) = serde_json::Number::from_f64(f) {
                    return Value::Number(n);
                }
            }
        } else if let Ok(n) = raw.parse::<i64>() {
            return Value::Number(n.into());
        }
    }
    match raw {
        "True" => Value::Bool(true),
        "False" => Value::Bool(false),
        "None" => Value::Null,
        other => Value::String(other.to_string()),
    }
}

fn is_decimal(raw: &str) -> bool {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() {
        return false;
    }
    let mut dots = 0;
    for c in digits.chars() {
        match c {
            '0'..='9' => {}
            '.' => dots += 1,
            _ => return false,
        }
    }
    dots <= 1 && !digits.starts_with('.') && !digits.ends_with('.')
}

fn unescape(inner: &str, quote: char) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            if c != quote && c != '\\' {
                out.push('\\');
            }
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    if escaped {
        out.push('\\');
    }
    out
}

impl ToolDialect for BracketDialect {
    fn format_tools_for_prompt(&self, tools: &[ToolSpec]) -> String {
        if tools.is_empty() {
            return String::new();
        }
        let mut listing = String::new();
        for tool in tools {
            listing.push_str(&format!("- {}: {}\n", tool.name, tool.description));
            for line in tool.parameter_lines() {
                listing.push_str(&format!("    {line}\n"));
            }
        }
        let listing = listing.trim_end();
        formatdoc! {r#"

            You have access to the following functions:

            {listing}

            To call a function, respond with the call in square brackets:
            [function_name(param='value', other=3)]

            Several calls may share one bracket pair, comma-separated. String
            values take quotes; numbers, True, False and None go bare. Function
            output will be returned to you as plain text. When you have what you
            need, answer the user without brackets."#
        }
    }

    fn has_tool_calls(&self, text: &str) -> bool {
        !Self::scan(text).calls.is_empty()
    }

    fn parse_tool_calls(&self, text: &str) -> Vec<ToolCall> {
        Self::scan(text).calls
    }

    fn format_tool_result(&self, name: &str, result: &Value) -> String {
        format!("Function {name} returned: {}", stringify_result(result))
    }

    fn get_text_content(&self, text: &str) -> String {
        let scan = Self::scan(text);
        if scan.spans.is_empty() {
            return text.trim().to_string();
        }
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end) in scan.spans {
            out.extend(&chars[cursor..start]);
            cursor = end;
        }
        out.extend(&chars[cursor..]);
        out.trim().to_string()
    }
}
