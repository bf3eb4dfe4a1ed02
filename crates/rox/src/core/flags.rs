//! Flags and the evaluation pipeline.
//!
//! A read resolves through the layers in fixed precedence: override, then
//! frozen value, then the bound experiment's expression, then the flag
//! default. Peek operations bypass the upper layers and are invisible to the
//! impression channel.

use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwapOption;
use tracing::debug;

use crate::core::impression::{ExperimentInfo, ImpressionInvoker, ReportingValue};
use crate::core::overrides::FlagOverrides;
use crate::core::properties::{default_dynamic_rule, CustomPropertyRepository, DynamicRuleFn};
use crate::core::repositories::TargetGroupRepository;
use crate::error::RoxError;
use crate::eval::{EvalContext, Parser};
use crate::model::{Context, ExperimentModel};

pub const FLAG_TRUE_VALUE: &str = "true";
pub const FLAG_FALSE_VALUE: &str = "false";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    Boolean,
    Int,
    Double,
    String,
}

/// How long an observed flag value stays pinned.
///
/// `UntilForeground` has no meaning without a UI lifecycle and behaves like
/// `UntilLaunch` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoxFreeze {
    #[default]
    None,
    UntilLaunch,
    UntilForeground,
}

#[derive(Debug, Clone)]
pub(crate) struct FrozenValue {
    pub value: String,
    pub targeting: bool,
    pub experiment: Option<ExperimentInfo>,
}

#[derive(Debug, Default)]
struct FreezeState {
    scope: RoxFreeze,
    frozen: Option<FrozenValue>,
}

/// The registered state of one flag. Values are represented as decimal
/// strings throughout the pipeline; conversion to the host type happens at
/// the typed handle.
pub struct FlagValue {
    name: String,
    default_value: String,
    options: Vec<String>,
    kind: FlagKind,
    experiment: ArcSwapOption<ExperimentModel>,
    freeze: Mutex<FreezeState>,
}

impl FlagValue {
    pub fn new(
        name: impl Into<String>,
        default_value: impl Into<String>,
        options: Vec<String>,
        kind: FlagKind,
        freeze: RoxFreeze,
    ) -> Result<FlagValue, RoxError> {
        let name = name.into();
        let default_value = default_value.into();
        if name.is_empty() {
            return Err(RoxError::EmptyFlagName);
        }
        if !options.is_empty() && !options.iter().any(|option| *option == default_value) {
            return Err(RoxError::DefaultNotInOptions {
                name,
                default: default_value,
            });
        }
        Ok(FlagValue {
            name,
            default_value,
            options,
            kind,
            experiment: ArcSwapOption::empty(),
            freeze: Mutex::new(FreezeState {
                scope: freeze,
                frozen: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> &str {
        &self.default_value
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn kind(&self) -> FlagKind {
        self.kind
    }

    /// Dot-separated namespace prefix of the fully qualified name, empty for
    /// top-level flags.
    pub fn namespace(&self) -> &str {
        self.name.rsplit_once('.').map(|(ns, _)| ns).unwrap_or("")
    }

    pub(crate) fn bind_experiment(&self, experiment: Option<Arc<ExperimentModel>>) {
        self.experiment.store(experiment);
    }

    pub(crate) fn experiment(&self) -> Option<Arc<ExperimentModel>> {
        self.experiment.load_full()
    }

    /// Whether an experiment result may be returned for this flag.
    fn accepts(&self, value: &str) -> bool {
        self.options.is_empty()
            || self.default_value == value
            || self.options.iter().any(|option| option == value)
    }

    pub fn freeze(&self, scope: RoxFreeze) {
        self.freeze.lock().unwrap().scope = scope;
    }

    pub fn freeze_scope(&self) -> RoxFreeze {
        self.freeze.lock().unwrap().scope
    }

    /// Releases the pinned value; the next read re-evaluates (and re-pins if
    /// a freeze scope is still configured).
    pub fn unfreeze(&self) {
        self.freeze.lock().unwrap().frozen = None;
    }

    fn frozen(&self) -> Option<FrozenValue> {
        let state = self.freeze.lock().unwrap();
        match state.scope {
            RoxFreeze::None => None,
            _ => state.frozen.clone(),
        }
    }

    fn try_freeze(&self, decision: &Decision) {
        let mut state = self.freeze.lock().unwrap();
        if state.scope != RoxFreeze::None && state.frozen.is_none() {
            state.frozen = Some(FrozenValue {
                value: decision.value.clone(),
                targeting: decision.targeting,
                experiment: decision
                    .experiment
                    .as_deref()
                    .map(ExperimentInfo::from_model),
            });
        }
    }
}

impl std::fmt::Debug for FlagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagValue")
            .field("name", &self.name)
            .field("default_value", &self.default_value)
            .field("kind", &self.kind)
            .finish()
    }
}

struct Decision {
    value: String,
    targeting: bool,
    experiment: Option<Arc<ExperimentModel>>,
}

/// Orchestrates single flag reads against the shared engine state.
pub struct FlagEvaluator {
    parser: Arc<Parser>,
    properties: Arc<CustomPropertyRepository>,
    target_groups: Arc<TargetGroupRepository>,
    overrides: Arc<FlagOverrides>,
    impressions: Arc<ImpressionInvoker>,
    global_context: RwLock<Option<Context>>,
    dynamic_rule: RwLock<DynamicRuleFn>,
}

impl FlagEvaluator {
    pub fn new(
        parser: Arc<Parser>,
        properties: Arc<CustomPropertyRepository>,
        target_groups: Arc<TargetGroupRepository>,
        overrides: Arc<FlagOverrides>,
        impressions: Arc<ImpressionInvoker>,
    ) -> FlagEvaluator {
        FlagEvaluator {
            parser,
            properties,
            target_groups,
            overrides,
            impressions,
            global_context: RwLock::new(None),
            dynamic_rule: RwLock::new(default_dynamic_rule()),
        }
    }

    pub fn set_global_context(&self, context: Option<Context>) {
        *self.global_context.write().unwrap() = context;
    }

    pub fn set_dynamic_rule(&self, rule: DynamicRuleFn) {
        *self.dynamic_rule.write().unwrap() = rule;
    }

    /// The full read path: override, freeze, experiment, default; emits an
    /// impression for everything but overridden reads.
    pub fn evaluate(&self, flag: &FlagValue, context: Option<&Context>) -> String {
        if let Some(value) = self.overrides.get(flag.name()) {
            return value;
        }

        let global = self.global_context.read().unwrap().clone();
        let merged = Context::merged(global.as_ref(), context);

        if let Some(frozen) = flag.frozen() {
            self.impressions.invoke(
                ReportingValue {
                    name: flag.name().to_string(),
                    value: frozen.value.clone(),
                    targeting: frozen.targeting,
                    experiment: frozen.experiment,
                },
                Some(&merged),
            );
            return frozen.value;
        }

        let decision = self.decide(flag, &merged);
        flag.try_freeze(&decision);
        self.impressions.invoke(
            ReportingValue {
                name: flag.name().to_string(),
                value: decision.value.clone(),
                targeting: decision.targeting,
                experiment: decision
                    .experiment
                    .as_deref()
                    .map(ExperimentInfo::from_model),
            },
            Some(&merged),
        );
        decision.value
    }

    /// The would-be decision right now, bypassing override and freeze and
    /// without touching the impression channel or the freeze state.
    pub fn peek_current_value(&self, flag: &FlagValue) -> String {
        let global = self.global_context.read().unwrap().clone();
        let merged = Context::merged(global.as_ref(), None);
        self.decide(flag, &merged).value
    }

    /// Like [`Self::peek_current_value`], ignoring every persisted layer.
    pub fn peek_original_value(&self, flag: &FlagValue) -> String {
        self.peek_current_value(flag)
    }

    fn decide(&self, flag: &FlagValue, context: &Context) -> Decision {
        if let Some(experiment) = flag.experiment() {
            let rule = self.dynamic_rule.read().unwrap().clone();
            let eval_context = EvalContext {
                flag_name: Some(flag.name()),
                experiment: Some(&experiment),
                context: Some(context),
                properties: Some(&self.properties),
                dynamic_rule: Some(&rule),
                target_groups: Some(&self.target_groups),
            };
            let result = self
                .parser
                .evaluate_expression(&experiment.condition, &eval_context);
            if let Some(value) = result.string_value() {
                if flag.accepts(&value) {
                    return Decision {
                        value,
                        targeting: true,
                        experiment: Some(experiment),
                    };
                }
                debug!(
                    flag = flag.name(),
                    value, "experiment result outside the allowed set, using default"
                );
            }
        }
        Decision {
            value: flag.default_value().to_string(),
            targeting: false,
            experiment: None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct FlagHandle {
    pub(crate) value: Arc<FlagValue>,
    pub(crate) evaluator: Arc<FlagEvaluator>,
}

impl FlagHandle {
    fn raw(&self, context: Option<&Context>) -> String {
        self.evaluator.evaluate(&self.value, context)
    }
}

macro_rules! handle_surface {
    () => {
        pub fn name(&self) -> &str {
            self.handle.value.name()
        }

        /// Computes the current decision without impressions, override or
        /// freeze.
        pub fn peek_current_value(&self) -> String {
            self.handle.evaluator.peek_current_value(&self.handle.value)
        }

        /// Computes the pre-override, pre-freeze decision.
        pub fn peek_original_value(&self) -> String {
            self.handle.evaluator.peek_original_value(&self.handle.value)
        }

        pub fn freeze(&self, scope: RoxFreeze) {
            self.handle.value.freeze(scope);
        }

        pub fn unfreeze(&self) {
            self.handle.value.unfreeze();
        }
    };
}

/// A boolean flag.
#[derive(Clone)]
pub struct Flag {
    pub(crate) handle: FlagHandle,
}

impl Flag {
    handle_surface!();

    pub fn is_enabled(&self, context: Option<&Context>) -> bool {
        let raw = self.handle.raw(context);
        to_bool(&raw, self.handle.value.default_value())
    }
}

/// A string flag with an optional discrete value set.
#[derive(Clone)]
pub struct StringFlag {
    pub(crate) handle: FlagHandle,
}

impl StringFlag {
    handle_surface!();

    pub fn value(&self, context: Option<&Context>) -> String {
        self.handle.raw(context)
    }
}

/// An integer flag. Values are decimal strings on the wire; unparsable
/// decisions fall back to the default.
#[derive(Clone)]
pub struct IntFlag {
    pub(crate) handle: FlagHandle,
}

impl IntFlag {
    handle_surface!();

    pub fn value(&self, context: Option<&Context>) -> i64 {
        let raw = self.handle.raw(context);
        to_int(&raw, self.handle.value.default_value())
    }
}

/// A double flag.
#[derive(Clone)]
pub struct DoubleFlag {
    pub(crate) handle: FlagHandle,
}

impl DoubleFlag {
    handle_surface!();

    pub fn value(&self, context: Option<&Context>) -> f64 {
        let raw = self.handle.raw(context);
        to_double(&raw, self.handle.value.default_value())
    }
}

pub(crate) fn to_bool(raw: &str, default_value: &str) -> bool {
    match raw {
        FLAG_TRUE_VALUE => true,
        FLAG_FALSE_VALUE => false,
        _ => default_value == FLAG_TRUE_VALUE,
    }
}

pub(crate) fn to_int(raw: &str, default_value: &str) -> i64 {
    raw.parse()
        .or_else(|_| default_value.parse())
        .unwrap_or_default()
}

pub(crate) fn to_double(raw: &str, default_value: &str) -> f64 {
    raw.parse()
        .or_else(|_| default_value.parse())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TargetGroupModel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        evaluator: Arc<FlagEvaluator>,
        overrides: Arc<FlagOverrides>,
        target_groups: Arc<TargetGroupRepository>,
        impression_count: Arc<AtomicUsize>,
        last_impression: Arc<Mutex<Option<ReportingValue>>>,
    }

    fn fixture() -> Fixture {
        let overrides = Arc::new(FlagOverrides::new());
        let target_groups = Arc::new(TargetGroupRepository::new());
        let impressions = Arc::new(ImpressionInvoker::new());
        let impression_count = Arc::new(AtomicUsize::new(0));
        let last_impression = Arc::new(Mutex::new(None));
        let count = Arc::clone(&impression_count);
        let last = Arc::clone(&last_impression);
        impressions.set_handler(Some(Arc::new(
            move |value: &ReportingValue, _: Option<&Context>| {
                count.fetch_add(1, Ordering::SeqCst);
                *last.lock().unwrap() = Some(value.clone());
            },
        )));
        let evaluator = Arc::new(FlagEvaluator::new(
            Arc::new(Parser::new()),
            Arc::new(CustomPropertyRepository::new()),
            Arc::clone(&target_groups),
            Arc::clone(&overrides),
            impressions,
        ));
        Fixture {
            evaluator,
            overrides,
            target_groups,
            impression_count,
            last_impression,
        }
    }

    fn bool_flag(name: &str, default: bool, freeze: RoxFreeze) -> FlagValue {
        FlagValue::new(
            name,
            if default { FLAG_TRUE_VALUE } else { FLAG_FALSE_VALUE },
            vec![FLAG_FALSE_VALUE.to_string(), FLAG_TRUE_VALUE.to_string()],
            FlagKind::Boolean,
            freeze,
        )
        .unwrap()
    }

    fn experiment(id: &str, condition: &str, flags: &[&str]) -> Arc<ExperimentModel> {
        Arc::new(ExperimentModel {
            id: id.to_string(),
            name: format!("experiment {id}"),
            archived: false,
            condition: condition.to_string(),
            stickiness_property: None,
            labels: vec![],
            flags: flags.iter().map(|f| f.to_string()).collect(),
        })
    }

    #[test]
    fn registration_guards_the_default() {
        assert!(matches!(
            FlagValue::new("f", "purple", vec!["red".into(), "green".into()],
                FlagKind::String, RoxFreeze::None),
            Err(RoxError::DefaultNotInOptions { .. })
        ));
        assert!(matches!(
            FlagValue::new("", "x", vec![], FlagKind::String, RoxFreeze::None),
            Err(RoxError::EmptyFlagName)
        ));
    }

    #[test]
    fn default_fallback_reports_non_targeting() {
        let fx = fixture();
        let flag = bool_flag("demo.flag", false, RoxFreeze::None);
        assert_eq!(fx.evaluator.evaluate(&flag, None), "false");
        let impression = fx.last_impression.lock().unwrap().clone().unwrap();
        assert_eq!(impression.name, "demo.flag");
        assert_eq!(impression.value, "false");
        assert!(!impression.targeting);
        assert!(impression.experiment.is_none());
    }

    #[test]
    fn experiment_decision_reports_targeting() {
        let fx = fixture();
        let flag = bool_flag("demo.flag", false, RoxFreeze::None);
        flag.bind_experiment(Some(experiment("e1", "true", &["demo.flag"])));
        assert_eq!(fx.evaluator.evaluate(&flag, None), "true");
        let impression = fx.last_impression.lock().unwrap().clone().unwrap();
        assert!(impression.targeting);
        assert_eq!(impression.experiment.as_ref().unwrap().id, "e1");
    }

    #[test]
    fn out_of_set_result_falls_back_to_default() {
        let fx = fixture();
        let flag = FlagValue::new(
            "demo.color",
            "red",
            vec!["red".into(), "green".into(), "blue".into()],
            FlagKind::String,
            RoxFreeze::None,
        )
        .unwrap();
        flag.bind_experiment(Some(experiment("e1", r#""purple""#, &["demo.color"])));
        assert_eq!(fx.evaluator.evaluate(&flag, None), "red");
        let impression = fx.last_impression.lock().unwrap().clone().unwrap();
        assert!(!impression.targeting);
    }

    #[test]
    fn unconstrained_flag_accepts_any_experiment_value() {
        let fx = fixture();
        let flag =
            FlagValue::new("demo.title", "hello", vec![], FlagKind::String, RoxFreeze::None)
                .unwrap();
        flag.bind_experiment(Some(experiment("e1", r#""anything""#, &["demo.title"])));
        assert_eq!(fx.evaluator.evaluate(&flag, None), "anything");
    }

    #[test]
    fn override_beats_everything_and_is_silent() {
        let fx = fixture();
        let flag = FlagValue::new("demo.int", "1", vec![], FlagKind::Int, RoxFreeze::UntilLaunch)
            .unwrap();
        flag.bind_experiment(Some(experiment("e1", r#""2""#, &["demo.int"])));
        fx.overrides.set("demo.int", "7");

        assert_eq!(fx.evaluator.evaluate(&flag, None), "7");
        assert_eq!(fx.impression_count.load(Ordering::SeqCst), 0);

        fx.overrides.clear("demo.int");
        assert_eq!(fx.evaluator.evaluate(&flag, None), "2");
        assert_eq!(fx.impression_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn freeze_pins_the_first_decision() {
        let fx = fixture();
        let flag = bool_flag("demo.frozen", false, RoxFreeze::UntilLaunch);
        flag.bind_experiment(Some(experiment("e1", "true", &["demo.frozen"])));
        assert_eq!(fx.evaluator.evaluate(&flag, None), "true");

        // The configuration changes; the frozen value keeps serving.
        flag.bind_experiment(Some(experiment("e2", "false", &["demo.frozen"])));
        assert_eq!(fx.evaluator.evaluate(&flag, None), "true");
        let impression = fx.last_impression.lock().unwrap().clone().unwrap();
        assert!(impression.targeting);

        flag.unfreeze();
        assert_eq!(fx.evaluator.evaluate(&flag, None), "false");
    }

    #[test]
    fn freeze_scope_none_never_pins() {
        let fx = fixture();
        let flag = bool_flag("demo.loose", false, RoxFreeze::None);
        flag.bind_experiment(Some(experiment("e1", "true", &["demo.loose"])));
        fx.evaluator.evaluate(&flag, None);
        flag.bind_experiment(Some(experiment("e2", "false", &["demo.loose"])));
        assert_eq!(fx.evaluator.evaluate(&flag, None), "false");
    }

    #[test]
    fn peeks_emit_no_impression_and_set_no_freeze() {
        let fx = fixture();
        let flag = bool_flag("demo.peek", false, RoxFreeze::UntilLaunch);
        flag.bind_experiment(Some(experiment("e1", "true", &["demo.peek"])));

        assert_eq!(fx.evaluator.peek_current_value(&flag), "true");
        assert_eq!(fx.evaluator.peek_original_value(&flag), "true");
        assert_eq!(fx.impression_count.load(Ordering::SeqCst), 0);

        // Peeking did not pin the value.
        flag.bind_experiment(Some(experiment("e2", "false", &["demo.peek"])));
        assert_eq!(fx.evaluator.evaluate(&flag, None), "false");
    }

    #[test]
    fn peek_bypasses_the_override() {
        let fx = fixture();
        let flag = bool_flag("demo.over", false, RoxFreeze::None);
        fx.overrides.set("demo.over", "true");
        assert_eq!(fx.evaluator.peek_current_value(&flag), "false");
        assert_eq!(fx.evaluator.evaluate(&flag, None), "true");
    }

    #[test]
    fn expression_can_reference_target_groups() {
        let fx = fixture();
        fx.target_groups.set_target_groups(vec![TargetGroupModel {
            id: "tg1".to_string(),
            condition: r#""eu" region property eq"#.to_string(),
        }]);
        let flag = bool_flag("demo.tg", false, RoxFreeze::None);
        flag.bind_experiment(Some(experiment(
            "e1",
            "tg1 isInTargetGroup",
            &["demo.tg"],
        )));
        let context = Context::builder().with_value("region", "eu").build();
        assert_eq!(fx.evaluator.evaluate(&flag, Some(&context)), "true");
        let context = Context::builder().with_value("region", "us").build();
        assert_eq!(fx.evaluator.evaluate(&flag, Some(&context)), "false");
    }

    #[test]
    fn global_and_local_context_merge() {
        let fx = fixture();
        fx.evaluator
            .set_global_context(Some(Context::builder().with_value("tier", "gold").build()));
        let flag = bool_flag("demo.ctx", false, RoxFreeze::None);
        flag.bind_experiment(Some(experiment(
            "e1",
            r#""gold" tier property eq"#,
            &["demo.ctx"],
        )));
        assert_eq!(fx.evaluator.evaluate(&flag, None), "true");

        // A local context entry shadows the global one.
        let local = Context::builder().with_value("tier", "bronze").build();
        assert_eq!(fx.evaluator.evaluate(&flag, Some(&local)), "false");
    }

    #[test]
    fn value_conversions_fall_back_to_default() {
        assert!(to_bool("true", "false"));
        assert!(!to_bool("junk", "false"));
        assert!(to_bool("junk", "true"));
        assert_eq!(to_int("17", "1"), 17);
        assert_eq!(to_int("junk", "1"), 1);
        assert_eq!(to_double("2.5", "1"), 2.5);
        assert_eq!(to_double("junk", "1.5"), 1.5);
    }

    #[test]
    fn namespace_is_the_dot_prefix() {
        let flag = bool_flag("billing.checkout.fast", false, RoxFreeze::None);
        assert_eq!(flag.namespace(), "billing.checkout");
        let flag = bool_flag("toplevel", false, RoxFreeze::None);
        assert_eq!(flag.namespace(), "");
    }
}
