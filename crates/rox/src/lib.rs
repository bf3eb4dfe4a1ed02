//! # rox
//!
//! A client-side feature-flag and remote-configuration engine.
//!
//! A host application declares named flags (boolean, integer, double,
//! string) with default values and optional discrete value sets. The engine
//! decides, at each read, which value to return based on a centrally
//! authored configuration of *experiments* (targeting rules) and *custom
//! properties* (user/device/request facts). The configuration is pulled
//! periodically from the service, verified against an embedded certificate,
//! and refreshed out-of-band when the push channel announces a change.
//!
//! ## Core pieces
//!
//! - **Rule evaluation**: every flag decision runs a postfix rule
//!   expression on a value stack against the read's context
//!   ([`eval::Parser`]). Operators cover comparison, arithmetic, logic,
//!   strings and regexes, semver and datetime ordering, list/map membership,
//!   and deterministic weighted bucketing.
//! - **Flag pipeline**: override, then frozen value, then the bound
//!   experiment, then the default; every non-override read emits an
//!   impression ([`ReportingValue`]).
//! - **Configuration lifecycle**: periodic fetch with signature and api-key
//!   verification, deterministic source precedence (roxy / network /
//!   persisted / embedded), and an SSE listener that triggers refetches.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rox::{Context, Rox, RoxOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let rox = Rox::new();
//!     let welcome = rox.add_flag("onboarding.welcome", false);
//!     let title = rox.add_string("onboarding.title", "hello");
//!
//!     rox.setup("0123456789abcdef01234567", RoxOptions::default()).await;
//!
//!     let context = Context::builder().with_value("tier", "gold").build();
//!     if welcome.is_enabled(Some(&context)) {
//!         println!("{}", title.value(Some(&context)));
//!     }
//! }
//! ```
//!
//! Evaluation is synchronous and reentrant; only `setup`, `shutdown` and
//! `fetch` are async. Logging goes through [`tracing`]; install a subscriber
//! to choose sink and level.

mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod eval;
pub mod model;
pub mod network;
pub mod storage;

pub use client::{DynamicApi, Rox, RoxOptions, StateCode};
pub use config::{
    ConfigurationFetchedArgs, ConfigurationFetchedHandler, FetchStatus, FetcherError,
};
pub use self::core::flags::{DoubleFlag, Flag, FlagKind, IntFlag, RoxFreeze, StringFlag};
pub use self::core::impression::{ExperimentInfo, ImpressionHandler, ReportingValue};
pub use self::core::properties::{CustomProperty, DynamicRuleFn, PropertyKind};
pub use error::RoxError;
pub use model::context::ContextBuilder;
pub use model::{Context, DynamicValue};
