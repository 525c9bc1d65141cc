//! Loader assembly and test logging.

use std::sync::Once;

use trellis_runtime::FactoryLoader;

use crate::mocks::{AppScript, BackendScript, Journal, ScriptedApp, ScriptedBackend};

/// Builds a [`FactoryLoader`] whose bundles are scripted and share one
/// [`Journal`].
#[derive(Debug)]
pub struct ScriptedLoader {
    journal: Journal,
    engines: Vec<(String, BackendScript)>,
    apps: Vec<(String, AppScript)>,
}

impl ScriptedLoader {
    /// Start a loader recording into `journal`.
    #[must_use]
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            engines: Vec::new(),
            apps: Vec::new(),
        }
    }

    /// Serve engine bundle `bundle` with a [`ScriptedBackend`].
    #[must_use]
    pub fn with_engine(mut self, bundle: impl Into<String>, script: BackendScript) -> Self {
        self.engines.push((bundle.into(), script));
        self
    }

    /// Serve app bundle `bundle` with [`ScriptedApp`]s.
    #[must_use]
    pub fn with_app(mut self, bundle: impl Into<String>, script: AppScript) -> Self {
        self.apps.push((bundle.into(), script));
        self
    }

    /// Assemble the loader.
    #[must_use]
    pub fn build(self) -> FactoryLoader {
        let mut loader = FactoryLoader::new();
        for (bundle, script) in self.engines {
            let journal = self.journal.clone();
            loader = loader.with_engine(bundle, move |_, _| {
                Ok(Box::new(ScriptedBackend::new(script.clone(), journal.clone())))
            });
        }
        for (bundle, script) in self.apps {
            let journal = self.journal.clone();
            loader = loader.with_app(bundle, move |_, instance| {
                Ok(Box::new(ScriptedApp::new(instance, script.clone(), journal.clone())))
            });
        }
        loader
    }
}

/// Route `tracing` output through the test harness's captured writer.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trellis_runtime=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use trellis_runtime::{BundleLoader, Context};

    use super::*;
    use crate::fixtures::test_bundle;

    #[test]
    fn test_loader_serves_scripted_bundles() {
        init_test_logging();
        let journal = Journal::default();
        let loader = ScriptedLoader::new(journal.clone())
            .with_engine("tk-desktop", BackendScript::default().switching())
            .with_app("tk-multi-publish", AppScript::new().reusable())
            .build();

        let backend = loader.load_engine(&test_bundle("tk-desktop"), "tk-desktop").unwrap();
        assert!(backend.context_change_allowed());
        backend.destroy_engine().unwrap();
        assert_eq!(journal.entries(), vec!["destroy_engine"]);

        let app = loader.load_app(&test_bundle("tk-multi-publish"), "publish").unwrap();
        assert!(app.context_change_allowed());
        app.post_context_change(&Context::empty(), &Context::empty()).unwrap();
        assert_eq!(journal.entries().len(), 2);
        assert!(journal.entries()[1].starts_with("post_change publish"));

        assert!(loader.load_app(&test_bundle("tk-multi-loader"), "loader").is_err());
    }
}
