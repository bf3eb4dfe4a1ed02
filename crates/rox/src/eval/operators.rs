//! Built-in operator catalogue.
//!
//! Operands pop in documentation order (first pop = first operand), so an
//! expression lists them in reverse: `ifThen(cond, a, b)` is written
//! `b a cond ifThen`. Every handler pops its full arity and pushes exactly
//! one value; a missing or mistyped operand degrades the result to
//! `Undefined` without aborting the evaluation.

use std::panic::{catch_unwind, AssertUnwindSafe};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset, Utc};
use tracing::warn;

use crate::eval::bucket;
use crate::eval::{EvalContext, Parser, ValueStack};
use crate::model::DynamicValue;

pub(super) fn install(parser: &mut Parser) {
    install_logic(parser);
    install_arithmetic(parser);
    install_strings(parser);
    install_semver(parser);
    install_datetime(parser);
    install_properties(parser);
    install_targeting(parser);
}

fn push_bool(stack: &mut ValueStack, value: Option<bool>) {
    match value {
        Some(value) => stack.push(DynamicValue::Boolean(value)),
        None => stack.push(DynamicValue::Undefined),
    }
}

//
// Stack / control
//

fn install_logic(parser: &mut Parser) {
    parser.add_operator(
        "eq",
        Box::new(|_, stack, _| {
            let (a, b) = (stack.pop(), stack.pop());
            stack.push(DynamicValue::Boolean(a == b));
        }),
    );
    parser.add_operator(
        "ne",
        Box::new(|_, stack, _| {
            let (a, b) = (stack.pop(), stack.pop());
            stack.push(DynamicValue::Boolean(a != b));
        }),
    );
    parser.add_operator(
        "and",
        Box::new(|_, stack, _| {
            let (a, b) = (stack.pop_boolean(), stack.pop_boolean());
            push_bool(stack, a.zip(b).map(|(a, b)| a && b));
        }),
    );
    parser.add_operator(
        "or",
        Box::new(|_, stack, _| {
            let (a, b) = (stack.pop_boolean(), stack.pop_boolean());
            push_bool(stack, a.zip(b).map(|(a, b)| a || b));
        }),
    );
    parser.add_operator(
        "not",
        Box::new(|_, stack, _| {
            let value = stack.pop_boolean();
            push_bool(stack, value.map(|value| !value));
        }),
    );
    parser.add_operator(
        "ifThen",
        Box::new(|_, stack, _| {
            let condition = stack.pop_boolean();
            let then_value = stack.pop();
            let else_value = stack.pop();
            match condition {
                Some(true) => stack.push(then_value),
                Some(false) => stack.push(else_value),
                None => stack.push(DynamicValue::Undefined),
            }
        }),
    );
    parser.add_operator(
        "in",
        Box::new(|_, stack, _| {
            let needle = stack.pop();
            let haystack = stack.pop();
            match haystack.as_list() {
                Some(items) => {
                    let found = items.iter().any(|item| *item == needle);
                    stack.push(DynamicValue::Boolean(found));
                }
                None => stack.push(DynamicValue::Undefined),
            }
        }),
    );
    parser.add_operator(
        "undefined",
        Box::new(|_, stack, _| stack.push(DynamicValue::Undefined)),
    );
}

//
// Arithmetic / comparison
//

fn numeric_compare(stack: &mut ValueStack, compare: fn(f64, f64) -> bool) {
    let (a, b) = (stack.pop_number(), stack.pop_number());
    push_bool(stack, a.zip(b).map(|(a, b)| compare(a, b)));
}

fn install_arithmetic(parser: &mut Parser) {
    parser.add_operator("lt", Box::new(|_, s, _| numeric_compare(s, |a, b| a < b)));
    parser.add_operator("lte", Box::new(|_, s, _| numeric_compare(s, |a, b| a <= b)));
    parser.add_operator("gt", Box::new(|_, s, _| numeric_compare(s, |a, b| a > b)));
    parser.add_operator("gte", Box::new(|_, s, _| numeric_compare(s, |a, b| a >= b)));
    parser.add_operator("plus", Box::new(|_, s, _| arithmetic(s, i64::checked_add, |a, b| a + b)));
    parser.add_operator("minus", Box::new(|_, s, _| arithmetic(s, i64::checked_sub, |a, b| a - b)));
    parser.add_operator("mult", Box::new(|_, s, _| arithmetic(s, i64::checked_mul, |a, b| a * b)));
    parser.add_operator(
        "div",
        Box::new(|_, stack, _| {
            let (a, b) = (stack.pop_number(), stack.pop_number());
            match a.zip(b) {
                Some((_, b)) if b == 0.0 => stack.push(DynamicValue::Undefined),
                Some((a, b)) => stack.push(DynamicValue::Double(a / b)),
                None => stack.push(DynamicValue::Undefined),
            }
        }),
    );
}

// Int stays int when both operands are ints and the result fits.
fn arithmetic(
    stack: &mut ValueStack,
    int_op: fn(i64, i64) -> Option<i64>,
    double_op: fn(f64, f64) -> f64,
) {
    let (a, b) = (stack.pop(), stack.pop());
    let result = match (&a, &b) {
        (DynamicValue::Int(a), DynamicValue::Int(b)) => match int_op(*a, *b) {
            Some(value) => DynamicValue::Int(value),
            None => DynamicValue::Double(double_op(*a as f64, *b as f64)),
        },
        _ => match a.as_number().zip(b.as_number()) {
            Some((a, b)) => DynamicValue::Double(double_op(a, b)),
            None => DynamicValue::Undefined,
        },
    };
    stack.push(result);
}

//
// Strings
//

fn string_pair(stack: &mut ValueStack, test: fn(&str, &str) -> bool) {
    let (a, b) = (stack.pop_string(), stack.pop_string());
    push_bool(stack, a.zip(b).map(|(a, b)| test(&a, &b)));
}

fn install_strings(parser: &mut Parser) {
    parser.add_operator(
        "concat",
        Box::new(|_, stack, _| {
            let (a, b) = (stack.pop_string(), stack.pop_string());
            match a.zip(b) {
                Some((a, b)) => stack.push(DynamicValue::String(format!("{a}{b}"))),
                None => stack.push(DynamicValue::Undefined),
            }
        }),
    );
    parser.add_operator(
        "b64d",
        Box::new(|_, stack, _| {
            let decoded = stack
                .pop_string()
                .and_then(|encoded| BASE64.decode(encoded).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match decoded {
                Some(value) => stack.push(DynamicValue::String(value)),
                None => stack.push(DynamicValue::Undefined),
            }
        }),
    );
    parser.add_operator(
        "match",
        Box::new(|_, stack, _| {
            let input = stack.pop_string();
            let pattern = stack.pop_string();
            let flags = stack.pop_string();
            let result = match (input, pattern, flags) {
                (Some(input), Some(pattern), Some(flags)) => {
                    regex_match(&input, &pattern, &flags)
                }
                _ => None,
            };
            push_bool(stack, result);
        }),
    );
    parser.add_operator(
        "containsString",
        Box::new(|_, s, _| string_pair(s, |a, b| a.contains(b))),
    );
    parser.add_operator(
        "startsWith",
        Box::new(|_, s, _| string_pair(s, |a, b| a.starts_with(b))),
    );
    parser.add_operator(
        "endsWith",
        Box::new(|_, s, _| string_pair(s, |a, b| a.ends_with(b))),
    );
}

fn regex_match(input: &str, pattern: &str, flags: &str) -> Option<bool> {
    // Only flags the regex engine understands; JS-isms like `g` are dropped.
    let flags: String = flags.chars().filter(|c| "imsxU".contains(*c)).collect();
    let pattern = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    };
    regex::Regex::new(&pattern)
        .ok()
        .map(|regex| regex.is_match(input))
}

//
// Semver
//

fn install_semver(parser: &mut Parser) {
    let comparisons: [(&str, fn(std::cmp::Ordering) -> bool); 6] = [
        ("semverEq", std::cmp::Ordering::is_eq),
        ("semverNe", std::cmp::Ordering::is_ne),
        ("semverLt", std::cmp::Ordering::is_lt),
        ("semverLte", std::cmp::Ordering::is_le),
        ("semverGt", std::cmp::Ordering::is_gt),
        ("semverGte", std::cmp::Ordering::is_ge),
    ];
    for (name, test) in comparisons {
        parser.add_operator(
            name,
            Box::new(move |_, stack, _| {
                let (a, b) = (stack.pop_string(), stack.pop_string());
                let ordering = a
                    .zip(b)
                    .and_then(|(a, b)| parse_semver(&a).zip(parse_semver(&b)))
                    .map(|(a, b)| a.cmp(&b));
                push_bool(stack, ordering.map(test));
            }),
        );
    }
}

// Accepts short versions ("1.2") by padding to three components.
fn parse_semver(value: &str) -> Option<semver::Version> {
    if let Ok(version) = semver::Version::parse(value) {
        return Some(version);
    }
    let padded = match value.matches('.').count() {
        0 => format!("{value}.0.0"),
        1 => format!("{value}.0"),
        _ => return None,
    };
    semver::Version::parse(&padded).ok()
}

//
// Time
//

fn install_datetime(parser: &mut Parser) {
    parser.add_operator(
        "now",
        Box::new(|_, stack, _| {
            let seconds = Utc::now().timestamp_millis() as f64 / 1000.0;
            stack.push(DynamicValue::Double(seconds));
        }),
    );
    let comparisons: [(&str, fn(std::cmp::Ordering) -> bool); 6] = [
        ("dateTimeStringEq", std::cmp::Ordering::is_eq),
        ("dateTimeStringNe", std::cmp::Ordering::is_ne),
        ("dateTimeStringLt", std::cmp::Ordering::is_lt),
        ("dateTimeStringLte", std::cmp::Ordering::is_le),
        ("dateTimeStringGt", std::cmp::Ordering::is_gt),
        ("dateTimeStringGte", std::cmp::Ordering::is_ge),
    ];
    for (name, test) in comparisons {
        parser.add_operator(
            name,
            Box::new(move |_, stack, _| {
                let (a, b) = (stack.pop_string(), stack.pop_string());
                let ordering = a
                    .zip(b)
                    .and_then(|(a, b)| parse_datetime(&a).zip(parse_datetime(&b)))
                    .map(|(a, b)| a.cmp(&b));
                push_bool(stack, ordering.map(test));
            }),
        );
    }
}

fn parse_datetime(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value).ok()
}

//
// Property access
//

fn install_properties(parser: &mut Parser) {
    parser.add_operator(
        "property",
        Box::new(|_, stack, eval_context| {
            let name = match stack.pop_string() {
                Some(name) => name,
                None => {
                    stack.push(DynamicValue::Undefined);
                    return;
                }
            };
            stack.push(resolve_property(&name, eval_context));
        }),
    );
}

fn resolve_property(name: &str, eval_context: &EvalContext<'_>) -> DynamicValue {
    if let Some(repository) = eval_context.properties {
        if let Some(property) = repository.get(name) {
            let context = eval_context.context;
            match catch_unwind(AssertUnwindSafe(|| property.value(context))) {
                Ok(value) => return value,
                Err(_) => {
                    warn!(property = name, "custom property generator panicked");
                    return DynamicValue::Undefined;
                }
            }
        }
    }
    if let Some(context) = eval_context.context {
        if let Some(value) = context.get(name) {
            return value;
        }
    }
    if let Some(rule) = eval_context.dynamic_rule {
        if let Some(value) = rule(name, eval_context.context) {
            return value;
        }
    }
    DynamicValue::Undefined
}

//
// Targeting
//

fn install_targeting(parser: &mut Parser) {
    parser.add_operator(
        "isInTargetGroup",
        Box::new(|parser, stack, eval_context| {
            let id = stack.pop_string();
            let group = id.and_then(|id| {
                eval_context
                    .target_groups
                    .and_then(|groups| groups.get(&id))
            });
            let matched = match group {
                Some(group) => parser
                    .evaluate_expression(&group.condition, eval_context)
                    .bool_value()
                    .unwrap_or(false),
                None => false,
            };
            stack.push(DynamicValue::Boolean(matched));
        }),
    );
    parser.add_operator(
        "getBucket",
        Box::new(|_, stack, eval_context| {
            let key = stack.pop_string();
            let variants = weighted_variants(stack.pop());
            let experiment_id = eval_context
                .experiment
                .map(|experiment| experiment.id.as_str())
                .unwrap_or("");
            let label = key
                .zip(variants)
                .and_then(|(key, variants)| bucket::get_bucket(experiment_id, &key, &variants));
            match label {
                Some(label) => stack.push(DynamicValue::String(label)),
                None => stack.push(DynamicValue::Undefined),
            }
        }),
    );
}

// `{label: weight}` map in configuration order, or `[[label, weight], ...]`.
fn weighted_variants(value: DynamicValue) -> Option<Vec<(String, f64)>> {
    match value {
        DynamicValue::Map(map) => map
            .iter()
            .map(|(label, weight)| weight.as_number().map(|weight| (label.clone(), weight)))
            .collect(),
        DynamicValue::List(items) => items
            .iter()
            .map(|pair| {
                let pair = pair.as_list()?;
                let label = pair.first()?.as_str()?.to_string();
                let weight = pair.get(1)?.as_number()?;
                Some((label, weight))
            })
            .collect(),
        _ => None,
    }
}
