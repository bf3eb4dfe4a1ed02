//! Tokenizer for the postfix rule language.
//!
//! An expression is a whitespace-separated sequence of tokens in
//! reverse-Polish order. Double-quoted string literals are atomic (spaces
//! inside quotes do not split) and decode the `\"` and `\\` escapes. Tokens
//! opening with `[` or `{` are parsed as JSON, which is how configurations
//! embed option lists and variant weight maps. Bare identifiers that are not
//! in the operator table are pushed as string values; they serve as property
//! names and enum-like labels.

use crate::model::DynamicValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Operand(DynamicValue),
    Operator(String),
}

pub fn tokenize<F>(expression: &str, is_operator: F) -> Vec<Token>
where
    F: Fn(&str) -> bool,
{
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            tokens.push(Token::Operand(DynamicValue::String(read_quoted(&mut chars))));
            continue;
        }
        let mut raw = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            raw.push(c);
            chars.next();
        }
        tokens.push(classify(&raw, &is_operator));
    }

    tokens
}

/// Quotes a string so that [`tokenize`] reads it back verbatim.
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

fn read_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut value = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('"') => value.push('"'),
                Some('\\') => value.push('\\'),
                Some(other) => {
                    // Unsupported escape: kept verbatim.
                    value.push('\\');
                    value.push(other);
                }
                None => value.push('\\'),
            },
            '"' => break,
            other => value.push(other),
        }
    }
    value
}

fn classify<F>(raw: &str, is_operator: &F) -> Token
where
    F: Fn(&str) -> bool,
{
    match raw {
        "true" => return Token::Operand(DynamicValue::Boolean(true)),
        "false" => return Token::Operand(DynamicValue::Boolean(false)),
        "undefined" => return Token::Operand(DynamicValue::Undefined),
        _ => {}
    }
    if raw.starts_with('[') || raw.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(raw) {
            return Token::Operand(DynamicValue::from_json(&json));
        }
        return Token::Operand(DynamicValue::String(raw.to_string()));
    }
    if is_number(raw) {
        if let Ok(int) = raw.parse::<i64>() {
            return Token::Operand(DynamicValue::Int(int));
        }
        if let Ok(double) = raw.parse::<f64>() {
            return Token::Operand(DynamicValue::Double(double));
        }
    }
    if is_operator(raw) {
        return Token::Operator(raw.to_string());
    }
    Token::Operand(DynamicValue::String(raw.to_string()))
}

// Decimal with optional sign and optional fractional part.
fn is_number(raw: &str) -> bool {
    let digits = raw.strip_prefix(['-', '+']).unwrap_or(raw);
    if digits.is_empty() {
        return false;
    }
    let mut seen_dot = false;
    let mut seen_digit = false;
    for c in digits.chars() {
        match c {
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }
    seen_digit
}
