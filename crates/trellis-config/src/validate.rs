//! Post-parse configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges and that cross references (environment → bundle,
//! selector → environment) resolve.

use std::collections::HashSet;

use crate::error::{ConfigError, ConfigResult};
use crate::types::{CONTEXT_FIELDS, Config, PLATFORMS};

/// Validate a fully deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_runtime(config)?;
    validate_logging(config)?;
    validate_bundles(config)?;
    validate_environments(config)?;
    validate_selectors(config)?;
    Ok(())
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

fn validate_runtime(config: &Config) -> ConfigResult<()> {
    let r = &config.runtime;
    if r.metrics_queue_capacity == 0 {
        return Err(invalid(
            "runtime.metrics_queue_capacity",
            "must be greater than zero",
        ));
    }
    if r.metrics_batch_size == 0 {
        return Err(invalid("runtime.metrics_batch_size", "must be greater than zero"));
    }
    if r.metrics_poll_interval_ms == 0 {
        return Err(invalid(
            "runtime.metrics_poll_interval_ms",
            "must be greater than zero",
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if l.level.trim().is_empty() {
        return Err(invalid("logging.level", "must not be empty"));
    }
    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        ));
    }
    Ok(())
}

fn validate_bundles(config: &Config) -> ConfigResult<()> {
    for (name, bundle) in &config.bundles {
        if bundle.path.as_os_str().is_empty() {
            return Err(invalid(format!("bundles.{name}.path"), "must not be empty"));
        }
        for platform in &bundle.platforms {
            if !PLATFORMS.contains(&platform.as_str()) {
                return Err(invalid(
                    format!("bundles.{name}.platforms"),
                    format!("unknown platform '{platform}'; expected one of: linux, mac, windows"),
                ));
            }
        }
        for field in &bundle.requires_context {
            if !CONTEXT_FIELDS.contains(&field.as_str()) {
                return Err(invalid(
                    format!("bundles.{name}.requires_context"),
                    format!("unknown context field '{field}'"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_environments(config: &Config) -> ConfigResult<()> {
    for (env_name, env) in &config.environments {
        for (fw_name, fw) in &env.frameworks {
            if !config.bundles.contains_key(&fw.bundle) {
                return Err(invalid(
                    format!("environments.{env_name}.frameworks.{fw_name}.bundle"),
                    format!("unknown bundle '{}'", fw.bundle),
                ));
            }
        }

        for (engine_name, engine) in &env.engines {
            let prefix = format!("environments.{env_name}.engines.{engine_name}");
            if !config.bundles.contains_key(&engine.bundle) {
                return Err(invalid(
                    format!("{prefix}.bundle"),
                    format!("unknown bundle '{}'", engine.bundle),
                ));
            }

            let mut seen = HashSet::new();
            for app in &engine.apps {
                if app.instance.is_empty() {
                    return Err(invalid(format!("{prefix}.apps"), "app instance must not be empty"));
                }
                if !seen.insert(app.instance.as_str()) {
                    return Err(invalid(
                        format!("{prefix}.apps"),
                        format!("duplicate app instance '{}'", app.instance),
                    ));
                }
                if !config.bundles.contains_key(&app.bundle) {
                    return Err(invalid(
                        format!("{prefix}.apps.{}.bundle", app.instance),
                        format!("unknown bundle '{}'", app.bundle),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn validate_selectors(config: &Config) -> ConfigResult<()> {
    for (i, selector) in config.selectors.iter().enumerate() {
        if !config.environments.contains_key(&selector.environment) {
            return Err(invalid(
                format!("selectors[{i}].environment"),
                format!("unknown environment '{}'", selector.environment),
            ));
        }
        for field in &selector.requires {
            if !CONTEXT_FIELDS.contains(&field.as_str()) {
                return Err(invalid(
                    format!("selectors[{i}].requires"),
                    format!("unknown context field '{field}'"),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppSection, BundleSection, EngineSection, EnvironmentSection, SelectorSection};

    fn bundle(path: &str) -> BundleSection {
        BundleSection {
            path: path.into(),
            ..Default::default()
        }
    }

    fn config_with_engine(apps: Vec<AppSection>) -> Config {
        let mut config = Config::default();
        config.bundles.insert("tk-engine".into(), bundle("/bundles/engine"));
        config.bundles.insert("tk-app".into(), bundle("/bundles/app"));
        let mut env = EnvironmentSection::default();
        env.engines.insert(
            "tk-engine".into(),
            EngineSection {
                bundle: "tk-engine".into(),
                apps,
                ..Default::default()
            },
        );
        config.environments.insert("project".into(), env);
        config
    }

    fn app(instance: &str, bundle: &str) -> AppSection {
        AppSection {
            instance: instance.into(),
            bundle: bundle.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_valid_environment() {
        let config = config_with_engine(vec![app("a", "tk-app"), app("b", "tk-app")]);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_duplicate_app_instance_rejected() {
        let config = config_with_engine(vec![app("a", "tk-app"), app("a", "tk-app")]);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate app instance 'a'"));
    }

    #[test]
    fn test_unknown_app_bundle_rejected() {
        let config = config_with_engine(vec![app("a", "missing")]);
        assert!(matches!(
            validate(&config),
            Err(ConfigError::ValidationError { field, .. }) if field.ends_with("apps.a.bundle")
        ));
    }

    #[test]
    fn test_selector_unknown_environment_rejected() {
        let mut config = config_with_engine(vec![]);
        config.selectors.push(SelectorSection {
            environment: "shot".into(),
            ..Default::default()
        });
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_context_field_rejected() {
        let mut config = config_with_engine(vec![]);
        config.selectors.push(SelectorSection {
            environment: "project".into(),
            requires: vec!["sequence".into()],
            ..Default::default()
        });
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let mut config = Config::default();
        let mut b = bundle("/bundles/x");
        b.platforms = vec!["beos".into()];
        config.bundles.insert("x".into(), b);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut config = Config::default();
        config.runtime.metrics_queue_capacity = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        assert!(validate(&config).is_err());
    }
}
