//! Trellis Runtime - bundle lifecycle orchestration.
//!
//! This crate provides:
//! - An engine that loads app bundles for a context and keeps them in step
//!   with context changes
//! - A bundle pool reusing apps across context changes
//! - A command registry with collision prefixing
//! - A bridge running closures on a designated main thread
//!
//! # Architecture
//!
//! A [`Runtime`] holds the services engines are built from and at most one
//! running [`Engine`]. Descriptors and environments come from a
//! [`DescriptorResolver`]; bundle behavior comes from a [`BundleLoader`]
//! producing an [`EngineBackend`] and one [`App`] per declared instance.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_config::Config;
//! use trellis_runtime::{
//!     App, AppContext, CommandAction, CommandProperties, Context, Entity, EngineBackend,
//!     FactoryLoader, RuntimeBuilder,
//! };
//!
//! struct Shell;
//! impl EngineBackend for Shell {}
//!
//! struct About;
//! impl App for About {
//!     fn init_app(&self, ctx: &AppContext<'_>) -> anyhow::Result<()> {
//!         ctx.register_command(
//!             "About...",
//!             CommandAction::standard(|| Ok(serde_json::json!("trellis"))),
//!             CommandProperties::new().with_kind("context_menu"),
//!         )?;
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(std::path::Path::new("trellis.toml"))?;
//! let loader = FactoryLoader::new()
//!     .with_engine("tk-shell", |_, _| Ok(Box::new(Shell)))
//!     .with_app("tk-multi-about", |_, _| Ok(Box::new(About)));
//!
//! let runtime = RuntimeBuilder::from_config(&config, Arc::new(loader)).build();
//! let context = Context::empty().with_project(Entity::new("Project", 65));
//! let engine = runtime.start_engine("tk-shell", context)?;
//! for (name, command) in engine.commands() {
//!     println!("{name}: {:?}", command.properties().description);
//! }
//! engine.destroy()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

mod app;
mod backend;
mod bridge;
mod command;
mod context;
mod descriptor;
mod engine;
mod environment;
mod error;
mod framework;
mod hooks;
mod metrics;
mod panel;
mod pool;
mod resolver;
mod runtime;
mod validation;

pub use app::{App, AppContext, AppInstance};
pub use backend::{BundleLoader, EngineBackend, FactoryLoader};
pub use bridge::{MainThreadBridge, MainThreadPump};
pub use command::{
    Command, CommandAction, CommandMatch, CommandProperties, CommandRegistry, CommandSelector, MultiSelectFn,
    StandardFn,
};
pub use context::{Context, ContextField, Entity};
pub use descriptor::{Descriptor, SettingKind, SettingSpec, Settings, SettingsSchema};
pub use engine::{Engine, EngineState};
pub use environment::{AppEntry, EngineEntry, Environment, FrameworkEntry};
pub use error::{DescriptorError, RuntimeError, RuntimeResult};
pub use framework::{
    Framework, FrameworkFactory, FrameworkInstance, InertFramework, InertFrameworkFactory, SharedFrameworks,
};
pub use hooks::{CoreHooks, NoopHooks};
pub use metrics::{MetricEvent, MetricsDispatcher, MetricsQueue, MetricsSettings, MetricsTransport};
pub use panel::{Panel, PanelCallback, PanelProperties, PanelRegistry, panel_id};
pub use pool::{BundlePool, PoolKey};
pub use resolver::{ConfigResolver, DescriptorResolver};
pub use runtime::{AppSettingsMatch, Runtime, RuntimeBuilder};
pub use validation::{
    CurrentPlatform, HostPlatform, SchemaValidator, SettingsValidator, validate_context, validate_engine_support,
    validate_platform,
};

/// Version of the runtime, checked against bundles' minimum core version.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");
