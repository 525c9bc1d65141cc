//! Settings, context, platform and engine-compatibility checks.

use serde_json::Value;

use crate::context::Context;
use crate::descriptor::{Descriptor, SettingKind, Settings, SettingsSchema};
use crate::error::{RuntimeError, RuntimeResult};

/// Validates raw settings against a schema.
pub trait SettingsValidator: Send + Sync {
    /// Return the validated settings for `bundle`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] naming every offending key.
    fn validate(
        &self,
        bundle: &str,
        schema: &SettingsSchema,
        settings: &Settings,
        context: &Context,
    ) -> RuntimeResult<Settings>;
}

/// Default validator: type checks declared keys and fills in defaults.
///
/// Keys missing from the schema are passed through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

fn kind_matches(kind: SettingKind, value: &Value) -> bool {
    match kind {
        SettingKind::Str | SettingKind::Path => value.is_string(),
        SettingKind::Int => value.is_i64() || value.is_u64(),
        SettingKind::Float => value.is_number(),
        SettingKind::Bool => value.is_boolean(),
        SettingKind::List => value.is_array(),
        SettingKind::Dict => value.is_object(),
        SettingKind::Any => true,
    }
}

fn kind_name(kind: SettingKind) -> &'static str {
    match kind {
        SettingKind::Str => "string",
        SettingKind::Int => "int",
        SettingKind::Float => "float",
        SettingKind::Bool => "bool",
        SettingKind::List => "list",
        SettingKind::Dict => "dict",
        SettingKind::Path => "path",
        SettingKind::Any => "any",
    }
}

impl SettingsValidator for SchemaValidator {
    fn validate(
        &self,
        bundle: &str,
        schema: &SettingsSchema,
        settings: &Settings,
        _context: &Context,
    ) -> RuntimeResult<Settings> {
        let mut validated = settings.clone();
        let mut keys = Vec::new();
        let mut problems = Vec::new();

        for (key, spec) in schema.iter() {
            match settings.get(key) {
                Some(value) if kind_matches(spec.kind, value) => {},
                Some(value) => {
                    keys.push(key.clone());
                    problems.push(format!(
                        "'{key}' should be of type {} but is {value}",
                        kind_name(spec.kind)
                    ));
                },
                None => match &spec.default {
                    Some(default) => {
                        validated.insert(key.clone(), default.clone());
                    },
                    None => {
                        keys.push(key.clone());
                        problems.push(format!("required setting '{key}' is missing"));
                    },
                },
            }
        }

        if keys.is_empty() {
            Ok(validated)
        } else {
            Err(RuntimeError::Config {
                bundle: bundle.to_owned(),
                keys,
                message: problems.join("; "),
            })
        }
    }
}

/// Ensure the context carries every field the bundle requires.
///
/// # Errors
///
/// Returns [`RuntimeError::Config`] listing the missing fields.
pub fn validate_context(descriptor: &Descriptor, context: &Context) -> RuntimeResult<()> {
    let missing: Vec<String> = descriptor
        .required_context
        .iter()
        .filter(|f| !context.has(**f))
        .map(|f| f.name().to_owned())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(RuntimeError::Config {
        bundle: descriptor.name.clone(),
        message: format!(
            "the current context ({context}) does not contain {}",
            missing.join(", ")
        ),
        keys: missing,
    })
}

/// The host operating system as seen by bundle platform declarations.
pub trait HostPlatform: Send + Sync {
    /// Platform name: `linux`, `mac` or `windows`.
    fn name(&self) -> &str;

    /// Whether the bundle runs on this platform.
    fn supported(&self, descriptor: &Descriptor) -> bool {
        descriptor.supported_platforms.is_empty()
            || descriptor.supported_platforms.iter().any(|p| p == self.name())
    }
}

/// The platform this process runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentPlatform;

impl HostPlatform for CurrentPlatform {
    fn name(&self) -> &str {
        match std::env::consts::OS {
            "macos" => "mac",
            "windows" => "windows",
            other => other,
        }
    }
}

/// Ensure the bundle supports the host platform.
///
/// # Errors
///
/// Returns [`RuntimeError::Config`] if the platform is not listed.
pub fn validate_platform(platform: &dyn HostPlatform, descriptor: &Descriptor) -> RuntimeResult<()> {
    if platform.supported(descriptor) {
        return Ok(());
    }
    Err(RuntimeError::Config {
        bundle: descriptor.name.clone(),
        keys: Vec::new(),
        message: format!(
            "only supports {} but the current platform is {}",
            descriptor.supported_platforms.join(", "),
            platform.name()
        ),
    })
}

/// Ensure an app supports the engine it is being loaded into.
///
/// # Errors
///
/// Returns [`RuntimeError::Config`] if the app lists supported engines and
/// `engine` is not among them.
pub fn validate_engine_support(descriptor: &Descriptor, engine: &str) -> RuntimeResult<()> {
    if descriptor.supported_engines.is_empty() || descriptor.supported_engines.iter().any(|e| e == engine) {
        return Ok(());
    }
    Err(RuntimeError::Config {
        bundle: descriptor.name.clone(),
        keys: Vec::new(),
        message: format!(
            "only supports the following engines: {}. The current engine is '{engine}'",
            descriptor.supported_engines.join(", ")
        ),
    })
}
