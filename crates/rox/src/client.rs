//! The engine object: lifecycle state machine, background workers, and the
//! host-facing surface.
//!
//! A [`Rox`] instance is created once and lives for the process. Flags may be
//! registered before or after [`Rox::setup`]; setup wires the configuration
//! fetcher, the push notification client and the analytics shipper, performs
//! one synchronous initial fetch, and publishes the result. No ambient
//! singleton exists; hosts that want one wrap the engine themselves.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::fetcher::{ConfigurationFetcher, FetcherConfig};
use crate::config::{ConfigurationFetchedHandler, FetchStatus};
use crate::core::flags::{
    DoubleFlag, Flag, FlagEvaluator, FlagHandle, FlagKind, FlagValue, IntFlag, RoxFreeze,
    StringFlag, FLAG_FALSE_VALUE, FLAG_TRUE_VALUE,
};
use crate::core::impression::{run_shipper, ImpressionHandler, ImpressionInvoker};
use crate::core::overrides::FlagOverrides;
use crate::core::properties::{
    register_device_properties, CustomProperty, CustomPropertyRepository, DynamicRuleFn,
    PropertyKind,
};
use crate::core::repositories::{ExperimentRepository, FlagRepository, TargetGroupRepository};
use crate::error::RoxError;
use crate::eval::Parser;
use crate::model::{Context, DynamicValue};
use crate::network::sse::{NotificationListener, PushEvent};
use crate::storage::{FileStorage, Storage};

const MIN_FETCH_INTERVAL: Duration = Duration::from_secs(30);
const CONFIGURATION_UPDATED_CHANNEL: &str = "configuration-updated";

const DEFAULT_CONFIGURATION_URL: &str = "https://conf.rollout.io";
const DEFAULT_NOTIFICATIONS_URL: &str = "https://push.rollout.io/sse";
const DEFAULT_ANALYTICS_URL: &str = "https://analytic.rollout.io/impression";

/// Result of [`Rox::setup`] and [`Rox::state_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCode {
    Uninitialized,
    SettingUp,
    Initialized,
    ShuttingDown,
    EmptyApiKey,
    InvalidApiKey,
    GenericSetupFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupState {
    Uninitialized,
    SettingUp,
    Initialized,
    ShuttingDown,
}

/// Engine options. Plain struct with defaults; unset handlers are simply not
/// called.
#[derive(Clone)]
pub struct RoxOptions {
    /// Secondary key accepted in place of the api key for development setups.
    pub dev_mode_key: Option<String>,
    /// Host application release, surfaced as `rox.app_release`.
    pub version: Option<String>,
    /// Period of the background configuration fetch; values below 30 s are
    /// raised to 30 s.
    pub fetch_interval: Duration,
    pub configuration_url: String,
    pub notifications_url: String,
    pub analytics_url: String,
    /// When set, all configuration comes from this local proxy: no signature
    /// or api-key checks, no fallback sources, no push notifications.
    pub roxy_url: Option<String>,
    /// Freeze scope applied to flags registered without an explicit one.
    pub default_freeze: RoxFreeze,
    /// Development only; logs a warning when used.
    pub disable_signature_verification: bool,
    pub network_timeout: Duration,
    /// Configuration payload baked into the host, used when every other
    /// source fails at setup.
    pub embedded_configuration: Option<String>,
    /// Storage collaborator; a JSON-file backend in the system temp
    /// directory is used when unset.
    pub storage: Option<Arc<dyn Storage>>,
    pub impression_handler: Option<ImpressionHandler>,
    pub configuration_fetched_handler: Option<ConfigurationFetchedHandler>,
    pub dynamic_properties_rule: Option<DynamicRuleFn>,
}

impl Default for RoxOptions {
    fn default() -> Self {
        RoxOptions {
            dev_mode_key: None,
            version: None,
            fetch_interval: Duration::from_secs(60),
            configuration_url: DEFAULT_CONFIGURATION_URL.to_string(),
            notifications_url: DEFAULT_NOTIFICATIONS_URL.to_string(),
            analytics_url: DEFAULT_ANALYTICS_URL.to_string(),
            roxy_url: None,
            default_freeze: RoxFreeze::None,
            disable_signature_verification: false,
            network_timeout: Duration::from_secs(30),
            embedded_configuration: None,
            storage: None,
            impression_handler: None,
            configuration_fetched_handler: None,
            dynamic_properties_rule: None,
        }
    }
}

impl std::fmt::Debug for RoxOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoxOptions")
            .field("version", &self.version)
            .field("fetch_interval", &self.fetch_interval)
            .field("configuration_url", &self.configuration_url)
            .field("roxy_url", &self.roxy_url)
            .field("default_freeze", &self.default_freeze)
            .field(
                "disable_signature_verification",
                &self.disable_signature_verification,
            )
            .finish()
    }
}

/// Fetches, verifies, applies, and reports one configuration round.
struct FetchDriver {
    fetcher: ConfigurationFetcher,
    target_groups: Arc<TargetGroupRepository>,
    experiments: Arc<ExperimentRepository>,
    flags: Arc<FlagRepository>,
    handler: Option<ConfigurationFetchedHandler>,
}

impl FetchDriver {
    async fn fetch_and_apply(&self) -> FetchStatus {
        let outcome = self.fetcher.fetch().await;
        if let Some(configuration) = outcome.configuration {
            self.target_groups
                .set_target_groups(configuration.target_groups);
            self.experiments.set_experiments(configuration.experiments);
            for flag in self.flags.all() {
                flag.bind_experiment(self.experiments.experiment_for_flag(flag.name()));
            }
            debug!(status = ?outcome.args.fetcher_status, "configuration applied");
        }
        if let Some(handler) = &self.handler {
            handler(&outcome.args);
        }
        outcome.args.fetcher_status
    }
}

struct Workers {
    fetch_task: JoinHandle<()>,
    fetch_shutdown: mpsc::Sender<()>,
    // Keeps the trigger channel open for the lifetime of the fetch loop.
    _fetch_trigger: mpsc::Sender<()>,
    sse: Option<NotificationListener>,
    shipper_task: JoinHandle<()>,
    shipper_shutdown: mpsc::Sender<()>,
}

struct EngineState {
    state: SetupState,
    driver: Option<Arc<FetchDriver>>,
    workers: Option<Workers>,
}

impl Default for EngineState {
    fn default() -> Self {
        EngineState {
            state: SetupState::Uninitialized,
            driver: None,
            workers: None,
        }
    }
}

/// The feature-flag engine.
pub struct Rox {
    properties: Arc<CustomPropertyRepository>,
    flags: Arc<FlagRepository>,
    experiments: Arc<ExperimentRepository>,
    target_groups: Arc<TargetGroupRepository>,
    overrides: Arc<FlagOverrides>,
    impressions: Arc<ImpressionInvoker>,
    evaluator: Arc<FlagEvaluator>,
    default_freeze: RwLock<RoxFreeze>,
    state: Mutex<EngineState>,
}

impl Rox {
    pub fn new() -> Rox {
        let parser = Arc::new(Parser::new());
        let properties = Arc::new(CustomPropertyRepository::new());
        let flags = Arc::new(FlagRepository::new());
        let experiments = Arc::new(ExperimentRepository::new());
        let target_groups = Arc::new(TargetGroupRepository::new());
        let overrides = Arc::new(FlagOverrides::new());
        let impressions = Arc::new(ImpressionInvoker::new());
        let evaluator = Arc::new(FlagEvaluator::new(
            parser,
            Arc::clone(&properties),
            Arc::clone(&target_groups),
            Arc::clone(&overrides),
            Arc::clone(&impressions),
        ));

        // Flags registered after a configuration load bind immediately.
        let binding_experiments = Arc::clone(&experiments);
        flags.on_flag_added(move |flag: &Arc<FlagValue>| {
            flag.bind_experiment(binding_experiments.experiment_for_flag(flag.name()));
        });

        Rox {
            properties,
            flags,
            experiments,
            target_groups,
            overrides,
            impressions,
            evaluator,
            default_freeze: RwLock::new(RoxFreeze::None),
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn state_code(&self) -> StateCode {
        match self.state.lock().unwrap().state {
            SetupState::Uninitialized => StateCode::Uninitialized,
            SetupState::SettingUp => StateCode::SettingUp,
            SetupState::Initialized => StateCode::Initialized,
            SetupState::ShuttingDown => StateCode::ShuttingDown,
        }
    }

    /// Brings the engine up: installs options, registers the reserved
    /// `rox.*` properties, loads persisted overrides, performs one
    /// synchronous initial fetch, and starts the background workers.
    pub async fn setup(&self, api_key: &str, options: RoxOptions) -> StateCode {
        if api_key.is_empty() {
            warn!("setup called with an empty api key");
            return StateCode::EmptyApiKey;
        }
        let dev_key_matches = options
            .dev_mode_key
            .as_deref()
            .is_some_and(|key| key == api_key);
        if !is_valid_api_key(api_key) && !dev_key_matches {
            warn!("setup called with a malformed api key");
            return StateCode::InvalidApiKey;
        }

        {
            let mut state = self.state.lock().unwrap();
            match state.state {
                SetupState::Uninitialized => state.state = SetupState::SettingUp,
                SetupState::SettingUp | SetupState::Initialized => {
                    info!("setup called more than once, ignoring");
                    return self.state_code();
                }
                SetupState::ShuttingDown => {
                    warn!("setup called while shutting down");
                    return StateCode::GenericSetupFailure;
                }
            }
        }

        let storage = options
            .storage
            .clone()
            .unwrap_or_else(|| Arc::new(FileStorage::default()));
        let distinct_id = device_distinct_id(storage.as_ref());

        register_device_properties(&self.properties, options.version.as_deref(), &distinct_id);
        self.overrides.attach_storage(storage.entry("overrides"));
        self.impressions.set_handler(options.impression_handler.clone());
        self.impressions.set_distinct_id(distinct_id.clone());
        if let Some(rule) = options.dynamic_properties_rule.clone() {
            self.evaluator.set_dynamic_rule(rule);
        }
        *self.default_freeze.write().unwrap() = options.default_freeze;

        let fetcher = ConfigurationFetcher::new(
            FetcherConfig {
                api_key: api_key.to_string(),
                configuration_url: options.configuration_url.clone(),
                roxy_url: options.roxy_url.clone(),
                distinct_id,
                app_version: options.version.clone().unwrap_or_default(),
                embedded: options.embedded_configuration.clone(),
                verify_signature: !options.disable_signature_verification
                    && options.roxy_url.is_none(),
                network_timeout: options.network_timeout,
            },
            storage.entry(&format!("configuration.{api_key}")),
        );
        let driver = Arc::new(FetchDriver {
            fetcher,
            target_groups: Arc::clone(&self.target_groups),
            experiments: Arc::clone(&self.experiments),
            flags: Arc::clone(&self.flags),
            handler: options.configuration_fetched_handler.clone(),
        });

        driver.fetch_and_apply().await;

        let (trigger_tx, trigger_rx) = mpsc::channel(4);
        let (fetch_shutdown_tx, fetch_shutdown_rx) = mpsc::channel(1);
        let fetch_interval = options.fetch_interval.max(MIN_FETCH_INTERVAL);
        let fetch_task = tokio::spawn(run_fetch_loop(
            Arc::clone(&driver),
            fetch_interval,
            trigger_rx,
            fetch_shutdown_rx,
        ));

        let sse = if options.roxy_url.is_none() {
            let trigger = trigger_tx.clone();
            Some(NotificationListener::start(
                &options.notifications_url,
                api_key,
                Arc::new(move |event: &PushEvent| {
                    if event.event_name == CONFIGURATION_UPDATED_CHANNEL {
                        debug!("configuration update pushed, scheduling fetch");
                        let _ = trigger.try_send(());
                    }
                }),
            ))
        } else {
            None
        };

        let (shipper_shutdown_tx, shipper_shutdown_rx) = mpsc::channel(1);
        let shipper_task = tokio::spawn(run_shipper(
            self.impressions.queue(),
            reqwest::Client::new(),
            options.analytics_url.clone(),
            shipper_shutdown_rx,
        ));

        {
            let mut state = self.state.lock().unwrap();
            state.state = SetupState::Initialized;
            state.driver = Some(driver);
            state.workers = Some(Workers {
                fetch_task,
                fetch_shutdown: fetch_shutdown_tx,
                _fetch_trigger: trigger_tx,
                sse,
                shipper_task,
                shipper_shutdown: shipper_shutdown_tx,
            });
        }
        info!("engine initialized");
        StateCode::Initialized
    }

    /// Stops the workers, flushes the analytics queue, releases values
    /// frozen `UntilLaunch`, and returns to `Uninitialized`.
    pub async fn shutdown(&self) {
        let workers = {
            let mut state = self.state.lock().unwrap();
            if state.state != SetupState::Initialized {
                info!("shutdown called while not initialized, ignoring");
                return;
            }
            state.state = SetupState::ShuttingDown;
            state.driver = None;
            state.workers.take()
        };

        if let Some(workers) = workers {
            let _ = workers.fetch_shutdown.send(()).await;
            // An in-flight fetch round-trip is not worth waiting for.
            workers.fetch_task.abort();
            let _ = workers.fetch_task.await;
            if let Some(sse) = workers.sse {
                sse.stop().await;
            }
            let _ = workers.shipper_shutdown.send(()).await;
            let _ = workers.shipper_task.await;
        }

        for flag in self.flags.all() {
            flag.unfreeze();
        }

        self.state.lock().unwrap().state = SetupState::Uninitialized;
        info!("engine shut down");
    }

    /// Triggers an immediate out-of-band fetch.
    pub async fn fetch(&self) {
        let driver = self.state.lock().unwrap().driver.clone();
        match driver {
            Some(driver) => {
                driver.fetch_and_apply().await;
            }
            None => warn!("fetch called before setup"),
        }
    }

    /// Installs (or clears) the process-wide default context merged under
    /// every per-read context.
    pub fn set_context(&self, context: Option<Context>) {
        self.evaluator.set_global_context(context);
    }

    //
    // Flag registration
    //

    pub fn add_flag(&self, name: &str, default_value: bool) -> Flag {
        let freeze = *self.default_freeze.read().unwrap();
        self.add_flag_with_freeze(name, default_value, freeze)
    }

    pub fn add_flag_with_freeze(&self, name: &str, default_value: bool, freeze: RoxFreeze) -> Flag {
        let value = FlagValue::new(
            name,
            if default_value {
                FLAG_TRUE_VALUE
            } else {
                FLAG_FALSE_VALUE
            },
            vec![FLAG_FALSE_VALUE.to_string(), FLAG_TRUE_VALUE.to_string()],
            FlagKind::Boolean,
            freeze,
        )
        .expect("boolean flag defaults are always in the option set");
        Flag {
            handle: self.register(value),
        }
    }

    pub fn add_string(&self, name: &str, default_value: &str) -> StringFlag {
        let freeze = *self.default_freeze.read().unwrap();
        self.add_string_with_freeze(name, default_value, freeze)
    }

    pub fn add_string_with_freeze(
        &self,
        name: &str,
        default_value: &str,
        freeze: RoxFreeze,
    ) -> StringFlag {
        let value = FlagValue::new(name, default_value, vec![], FlagKind::String, freeze)
            .expect("string flag without options cannot be rejected");
        StringFlag {
            handle: self.register(value),
        }
    }

    pub fn add_string_with_options(
        &self,
        name: &str,
        default_value: &str,
        options: Vec<String>,
    ) -> Result<StringFlag, RoxError> {
        let freeze = *self.default_freeze.read().unwrap();
        self.add_string_with_freeze_and_options(name, default_value, options, freeze)
    }

    pub fn add_string_with_freeze_and_options(
        &self,
        name: &str,
        default_value: &str,
        options: Vec<String>,
        freeze: RoxFreeze,
    ) -> Result<StringFlag, RoxError> {
        let value = FlagValue::new(name, default_value, options, FlagKind::String, freeze)?;
        Ok(StringFlag {
            handle: self.register(value),
        })
    }

    pub fn add_int(&self, name: &str, default_value: i64) -> IntFlag {
        let freeze = *self.default_freeze.read().unwrap();
        self.add_int_with_freeze(name, default_value, freeze)
    }

    pub fn add_int_with_freeze(&self, name: &str, default_value: i64, freeze: RoxFreeze) -> IntFlag {
        let value = FlagValue::new(
            name,
            default_value.to_string(),
            vec![],
            FlagKind::Int,
            freeze,
        )
        .expect("int flag without options cannot be rejected");
        IntFlag {
            handle: self.register(value),
        }
    }

    pub fn add_int_with_options(
        &self,
        name: &str,
        default_value: i64,
        options: Vec<i64>,
    ) -> Result<IntFlag, RoxError> {
        let freeze = *self.default_freeze.read().unwrap();
        self.add_int_with_freeze_and_options(name, default_value, options, freeze)
    }

    pub fn add_int_with_freeze_and_options(
        &self,
        name: &str,
        default_value: i64,
        options: Vec<i64>,
        freeze: RoxFreeze,
    ) -> Result<IntFlag, RoxError> {
        let value = FlagValue::new(
            name,
            default_value.to_string(),
            options.into_iter().map(|option| option.to_string()).collect(),
            FlagKind::Int,
            freeze,
        )?;
        Ok(IntFlag {
            handle: self.register(value),
        })
    }

    pub fn add_double(&self, name: &str, default_value: f64) -> DoubleFlag {
        let freeze = *self.default_freeze.read().unwrap();
        self.add_double_with_freeze(name, default_value, freeze)
    }

    pub fn add_double_with_freeze(
        &self,
        name: &str,
        default_value: f64,
        freeze: RoxFreeze,
    ) -> DoubleFlag {
        let value = FlagValue::new(
            name,
            default_value.to_string(),
            vec![],
            FlagKind::Double,
            freeze,
        )
        .expect("double flag without options cannot be rejected");
        DoubleFlag {
            handle: self.register(value),
        }
    }

    pub fn add_double_with_options(
        &self,
        name: &str,
        default_value: f64,
        options: Vec<f64>,
    ) -> Result<DoubleFlag, RoxError> {
        let freeze = *self.default_freeze.read().unwrap();
        self.add_double_with_freeze_and_options(name, default_value, options, freeze)
    }

    pub fn add_double_with_freeze_and_options(
        &self,
        name: &str,
        default_value: f64,
        options: Vec<f64>,
        freeze: RoxFreeze,
    ) -> Result<DoubleFlag, RoxError> {
        let value = FlagValue::new(
            name,
            default_value.to_string(),
            options.into_iter().map(|option| option.to_string()).collect(),
            FlagKind::Double,
            freeze,
        )?;
        Ok(DoubleFlag {
            handle: self.register(value),
        })
    }

    fn register(&self, value: FlagValue) -> FlagHandle {
        FlagHandle {
            value: self.flags.register(value),
            evaluator: Arc::clone(&self.evaluator),
        }
    }

    /// Runtime flag access by string name without prior declaration.
    pub fn dynamic(&self) -> DynamicApi {
        DynamicApi {
            flags: Arc::clone(&self.flags),
            evaluator: Arc::clone(&self.evaluator),
            default_freeze: *self.default_freeze.read().unwrap(),
        }
    }

    //
    // Custom properties
    //

    pub fn set_custom_property(&self, property: CustomProperty) {
        self.properties.add(property);
    }

    pub fn set_custom_string_property(&self, name: &str, value: &str) {
        self.properties
            .add(CustomProperty::literal(name, PropertyKind::String, value));
    }

    pub fn set_custom_bool_property(&self, name: &str, value: bool) {
        self.properties
            .add(CustomProperty::literal(name, PropertyKind::Bool, value));
    }

    pub fn set_custom_int_property(&self, name: &str, value: i64) {
        self.properties
            .add(CustomProperty::literal(name, PropertyKind::Int, value));
    }

    pub fn set_custom_double_property(&self, name: &str, value: f64) {
        self.properties
            .add(CustomProperty::literal(name, PropertyKind::Double, value));
    }

    pub fn set_custom_semver_property(&self, name: &str, value: &str) {
        self.properties
            .add(CustomProperty::literal(name, PropertyKind::Semver, value));
    }

    pub fn set_custom_computed_string_property<F>(&self, name: &str, generator: F)
    where
        F: Fn(Option<&Context>) -> String + Send + Sync + 'static,
    {
        self.properties.add(CustomProperty::generated(
            name,
            PropertyKind::String,
            move |context| DynamicValue::String(generator(context)),
        ));
    }

    pub fn set_custom_computed_bool_property<F>(&self, name: &str, generator: F)
    where
        F: Fn(Option<&Context>) -> bool + Send + Sync + 'static,
    {
        self.properties.add(CustomProperty::generated(
            name,
            PropertyKind::Bool,
            move |context| DynamicValue::Boolean(generator(context)),
        ));
    }

    pub fn set_custom_computed_int_property<F>(&self, name: &str, generator: F)
    where
        F: Fn(Option<&Context>) -> i64 + Send + Sync + 'static,
    {
        self.properties.add(CustomProperty::generated(
            name,
            PropertyKind::Int,
            move |context| DynamicValue::Int(generator(context)),
        ));
    }

    pub fn set_custom_computed_double_property<F>(&self, name: &str, generator: F)
    where
        F: Fn(Option<&Context>) -> f64 + Send + Sync + 'static,
    {
        self.properties.add(CustomProperty::generated(
            name,
            PropertyKind::Double,
            move |context| DynamicValue::Double(generator(context)),
        ));
    }

    pub fn set_custom_computed_semver_property<F>(&self, name: &str, generator: F)
    where
        F: Fn(Option<&Context>) -> String + Send + Sync + 'static,
    {
        self.properties.add(CustomProperty::generated(
            name,
            PropertyKind::Semver,
            move |context| DynamicValue::String(generator(context)),
        ));
    }

    /// Replaces the rule consulted when neither a custom property nor a
    /// context entry matches a `property` lookup.
    pub fn set_dynamic_properties_rule(&self, rule: DynamicRuleFn) {
        self.evaluator.set_dynamic_rule(rule);
    }

    //
    // Overrides
    //

    pub fn has_override(&self, name: &str) -> bool {
        self.overrides.has(name)
    }

    pub fn get_override(&self, name: &str) -> Option<String> {
        self.overrides.get(name)
    }

    pub fn set_override(&self, name: &str, value: &str) {
        self.overrides.set(name, value);
    }

    pub fn clear_override(&self, name: &str) {
        self.overrides.clear(name);
    }

    pub fn clear_overrides(&self) {
        self.overrides.clear_all();
    }

    //
    // Freeze
    //

    /// Releases the frozen value of every flag.
    pub fn unfreeze(&self) {
        for flag in self.flags.all() {
            flag.unfreeze();
        }
    }

    /// Releases the frozen values of all flags under the dot-separated
    /// namespace `ns`.
    pub fn unfreeze_ns(&self, ns: &str) {
        let prefix = format!("{ns}.");
        for flag in self.flags.all() {
            if flag.name().starts_with(&prefix) {
                flag.unfreeze();
            }
        }
    }
}

impl Default for Rox {
    fn default() -> Self {
        Rox::new()
    }
}

impl std::fmt::Debug for Rox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rox")
            .field("state", &self.state_code())
            .finish()
    }
}

/// Flag access by name without prior registration. The first access
/// materializes a flag of the requested kind; later accesses reuse it.
pub struct DynamicApi {
    flags: Arc<FlagRepository>,
    evaluator: Arc<FlagEvaluator>,
    default_freeze: RoxFreeze,
}

impl DynamicApi {
    pub fn is_enabled(&self, name: &str, default_value: bool, context: Option<&Context>) -> bool {
        let default_raw = if default_value {
            FLAG_TRUE_VALUE
        } else {
            FLAG_FALSE_VALUE
        };
        let options = vec![FLAG_FALSE_VALUE.to_string(), FLAG_TRUE_VALUE.to_string()];
        match self.materialize(name, default_raw, options, FlagKind::Boolean) {
            Some(flag) => {
                let raw = self.evaluator.evaluate(&flag, context);
                crate::core::flags::to_bool(&raw, flag.default_value())
            }
            None => default_value,
        }
    }

    pub fn get_string(
        &self,
        name: &str,
        default_value: &str,
        options: Vec<String>,
        context: Option<&Context>,
    ) -> String {
        match self.materialize(name, default_value, options, FlagKind::String) {
            Some(flag) => self.evaluator.evaluate(&flag, context),
            None => default_value.to_string(),
        }
    }

    pub fn get_int(
        &self,
        name: &str,
        default_value: i64,
        options: Vec<i64>,
        context: Option<&Context>,
    ) -> i64 {
        let options = options.into_iter().map(|option| option.to_string()).collect();
        match self.materialize(name, &default_value.to_string(), options, FlagKind::Int) {
            Some(flag) => {
                let raw = self.evaluator.evaluate(&flag, context);
                crate::core::flags::to_int(&raw, flag.default_value())
            }
            None => default_value,
        }
    }

    pub fn get_double(
        &self,
        name: &str,
        default_value: f64,
        options: Vec<f64>,
        context: Option<&Context>,
    ) -> f64 {
        let options = options.into_iter().map(|option| option.to_string()).collect();
        match self.materialize(name, &default_value.to_string(), options, FlagKind::Double) {
            Some(flag) => {
                let raw = self.evaluator.evaluate(&flag, context);
                crate::core::flags::to_double(&raw, flag.default_value())
            }
            None => default_value,
        }
    }

    fn materialize(
        &self,
        name: &str,
        default_value: &str,
        options: Vec<String>,
        kind: FlagKind,
    ) -> Option<Arc<FlagValue>> {
        if let Some(existing) = self.flags.get(name) {
            return Some(existing);
        }
        match FlagValue::new(name, default_value, options, kind, self.default_freeze) {
            Ok(value) => Some(self.flags.register(value)),
            Err(e) => {
                warn!(flag = name, error = %e, "dynamic flag rejected");
                None
            }
        }
    }
}

// Rollout application keys are 24 hex characters.
fn is_valid_api_key(api_key: &str) -> bool {
    api_key.len() == 24 && api_key.chars().all(|c| c.is_ascii_hexdigit())
}

/// Stable per-installation identity, persisted in the `device` entry.
fn device_distinct_id(storage: &dyn Storage) -> String {
    let entry = storage.entry("device");
    if let Some(data) = entry.read() {
        if let Ok(document) = serde_json::from_str::<serde_json::Value>(&data) {
            if let Some(id) = document.get("distinct_id").and_then(|v| v.as_str()) {
                return id.to_string();
            }
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    entry.write(&serde_json::json!({ "distinct_id": id }).to_string());
    id
}

async fn run_fetch_loop(
    driver: Arc<FetchDriver>,
    interval: Duration,
    mut trigger_rx: mpsc::Receiver<()>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Setup already did the first fetch; consume the immediate tick.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                driver.fetch_and_apply().await;
            }
            received = trigger_rx.recv() => match received {
                Some(()) => {
                    driver.fetch_and_apply().await;
                }
                None => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
    debug!("fetch loop stopped");
}
