//! Rule-expression evaluator.
//!
//! Expressions arrive as text in reverse-Polish order and are executed on a
//! per-call value stack. Operators are looked up in a pluggable table; the
//! built-in catalogue lives in [`operators`]. Evaluation is infallible from
//! the caller's perspective: malformed input degrades to `Undefined`, never
//! to an error or a panic.

pub mod bucket;
mod operators;
mod tokenizer;

use std::collections::HashMap;

use crate::core::properties::{CustomPropertyRepository, DynamicRuleFn};
use crate::core::repositories::TargetGroupRepository;
use crate::model::{Context, DynamicValue, ExperimentModel};
use tokenizer::Token;

pub use tokenizer::quote;

/// Handler invoked when its operator token is executed. Pops operands from
/// the stack and pushes exactly one result.
pub type OperatorFn = Box<dyn Fn(&Parser, &mut ValueStack, &EvalContext<'_>) + Send + Sync>;

/// Read-only surroundings of a single evaluation. Nothing here is mutated by
/// the evaluator.
#[derive(Default, Clone, Copy)]
pub struct EvalContext<'a> {
    /// Name of the flag being evaluated, when any.
    pub flag_name: Option<&'a str>,
    /// The experiment whose condition is being evaluated; seeds `getBucket`.
    pub experiment: Option<&'a ExperimentModel>,
    /// The (merged) user context.
    pub context: Option<&'a Context>,
    pub properties: Option<&'a CustomPropertyRepository>,
    pub dynamic_rule: Option<&'a DynamicRuleFn>,
    pub target_groups: Option<&'a TargetGroupRepository>,
}

/// The value stack of one evaluation. A pop from an empty stack yields
/// `Undefined`, which keeps operator handlers total.
#[derive(Debug, Default)]
pub struct ValueStack {
    items: Vec<DynamicValue>,
}

impl ValueStack {
    pub fn push(&mut self, value: DynamicValue) {
        self.items.push(value);
    }

    pub fn pop(&mut self) -> DynamicValue {
        self.items.pop().unwrap_or(DynamicValue::Undefined)
    }

    pub fn pop_string(&mut self) -> Option<String> {
        match self.pop() {
            DynamicValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn pop_boolean(&mut self) -> Option<bool> {
        self.pop().as_boolean()
    }

    pub fn pop_number(&mut self) -> Option<f64> {
        self.pop().as_number()
    }

    fn finish(mut self) -> DynamicValue {
        self.items.pop().unwrap_or(DynamicValue::Undefined)
    }
}

/// Expression evaluator with a named operator table.
pub struct Parser {
    operators: HashMap<String, OperatorFn>,
}

impl Parser {
    /// A parser with the built-in operator catalogue installed.
    pub fn new() -> Parser {
        let mut parser = Parser {
            operators: HashMap::new(),
        };
        operators::install(&mut parser);
        parser
    }

    /// Registers (or replaces) an operator by name.
    pub fn add_operator(&mut self, name: impl Into<String>, handler: OperatorFn) {
        self.operators.insert(name.into(), handler);
    }

    pub fn has_operator(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    /// Executes `expression` against `eval_context` and returns whatever is
    /// left on top of the stack, coerced lazily through
    /// [`EvaluationResult`].
    pub fn evaluate_expression(
        &self,
        expression: &str,
        eval_context: &EvalContext<'_>,
    ) -> EvaluationResult {
        let tokens = tokenizer::tokenize(expression, |name| self.has_operator(name));
        let mut stack = ValueStack::default();
        for token in tokens {
            match token {
                Token::Operand(value) => stack.push(value),
                Token::Operator(name) => match self.operators.get(&name) {
                    Some(handler) => handler(self, &mut stack, eval_context),
                    None => stack.push(DynamicValue::Undefined),
                },
            }
        }
        EvaluationResult {
            value: stack.finish(),
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

/// The top-of-stack value of a finished evaluation, with the result-type
/// coercions of the flag pipeline: booleans stringify to `"true"`/`"false"`,
/// numeric strings parse, null and undefined coerce to `None` everywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    value: DynamicValue,
}

impl EvaluationResult {
    pub fn is_undefined(&self) -> bool {
        self.value.is_undefined()
    }

    pub fn value(&self) -> &DynamicValue {
        &self.value
    }

    pub fn bool_value(&self) -> Option<bool> {
        self.value.as_boolean()
    }

    pub fn int_value(&self) -> Option<i64> {
        match &self.value {
            DynamicValue::Int(value) => Some(*value),
            DynamicValue::Double(value) => Some(*value as i64),
            DynamicValue::String(value) => value.parse().ok(),
            _ => None,
        }
    }

    pub fn double_value(&self) -> Option<f64> {
        match &self.value {
            DynamicValue::Int(value) => Some(*value as f64),
            DynamicValue::Double(value) => Some(*value),
            DynamicValue::String(value) => value.parse().ok(),
            _ => None,
        }
    }

    pub fn string_value(&self) -> Option<String> {
        match &self.value {
            DynamicValue::String(value) => Some(value.clone()),
            DynamicValue::Boolean(value) => Some(value.to_string()),
            DynamicValue::Int(value) => Some(value.to_string()),
            DynamicValue::Double(value) => Some(value.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expression: &str) -> EvaluationResult {
        Parser::new().evaluate_expression(expression, &EvalContext::default())
    }

    #[test]
    fn empty_expression_is_undefined() {
        assert!(eval("").is_undefined());
        assert!(eval("   ").is_undefined());
    }

    #[test]
    fn literal_expression_returns_literal() {
        assert_eq!(eval("true").bool_value(), Some(true));
        assert_eq!(eval(r#""red""#).string_value().as_deref(), Some("red"));
        assert_eq!(eval("42").int_value(), Some(42));
    }

    #[test]
    fn result_coercions() {
        let result = eval(r#""17""#);
        assert_eq!(result.int_value(), Some(17));
        assert_eq!(result.double_value(), Some(17.0));

        let result = eval("true");
        assert_eq!(result.string_value().as_deref(), Some("true"));
        assert_eq!(result.int_value(), None);

        let result = eval("undefined");
        assert!(result.is_undefined());
        assert_eq!(result.string_value(), None);
        assert_eq!(result.bool_value(), None);
    }

    #[test]
    fn repeated_evaluation_is_pure() {
        let parser = Parser::new();
        let ctx = EvalContext::default();
        let expr = r#""b" "a" concat "ab" eq"#;
        let first = parser.evaluate_expression(expr, &ctx);
        for _ in 0..10 {
            assert_eq!(parser.evaluate_expression(expr, &ctx), first);
        }
    }

    #[test]
    fn custom_operator_is_invoked() {
        let mut parser = Parser::new();
        parser.add_operator(
            "shout",
            Box::new(|_, stack, _| {
                let result = match stack.pop_string() {
                    Some(s) => DynamicValue::String(s.to_uppercase()),
                    None => DynamicValue::Undefined,
                };
                stack.push(result);
            }),
        );
        let result = parser.evaluate_expression(r#""loud" shout"#, &EvalContext::default());
        assert_eq!(result.string_value().as_deref(), Some("LOUD"));
    }
}
