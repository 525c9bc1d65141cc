//! Test fixtures for contexts, descriptors and configuration files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use trellis_config::{Config, ConfigResult};
use trellis_runtime::{AppEntry, Context, Descriptor, EngineEntry, Entity, Environment};

/// A context holding only a project.
#[must_use]
pub fn test_project(id: i64) -> Context {
    Context::empty().with_project(Entity::new("Project", id).with_name(format!("project_{id}")))
}

/// A shot context inside a project.
#[must_use]
pub fn test_shot(project_id: i64, shot_id: i64) -> Context {
    test_project(project_id).with_entity(Entity::new("Shot", shot_id).with_name(format!("sh{shot_id:03}")))
}

/// A local descriptor installed under `/bundles/<name>`.
#[must_use]
pub fn test_bundle(name: &str) -> Descriptor {
    Descriptor::new(name, format!("/bundles/{name}"))
}

/// An app entry using `test_bundle(bundle)`.
#[must_use]
pub fn test_app_entry(instance: &str, bundle: &str) -> AppEntry {
    AppEntry::new(instance, Arc::new(test_bundle(bundle)))
}

/// An engine entry using `test_bundle(bundle)` with `apps` in load order.
#[must_use]
pub fn test_engine_entry(instance: &str, bundle: &str, apps: Vec<AppEntry>) -> EngineEntry {
    apps.into_iter()
        .fold(EngineEntry::new(instance, Arc::new(test_bundle(bundle))), EngineEntry::with_app)
}

/// An environment holding a single engine.
#[must_use]
pub fn test_environment(name: &str, engine: EngineEntry) -> Arc<Environment> {
    Arc::new(Environment::new(name).with_engine(engine))
}

/// A temporary directory holding bundle folders and a `trellis.toml`.
///
/// The directory is removed when the fixture is dropped.
#[derive(Debug)]
pub struct ConfigFixture {
    dir: TempDir,
}

impl ConfigFixture {
    /// Create an empty fixture directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    /// Root of the fixture.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Path of the configuration file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root().join("trellis.toml")
    }

    /// Create the install folder of a bundle and return it.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder cannot be created.
    pub fn install(&self, bundle: &str) -> io::Result<PathBuf> {
        let path = self.root().join("bundles").join(bundle);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Write `contents` as the configuration file. `{root}` is replaced by
    /// the fixture root.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, contents: &str) -> io::Result<PathBuf> {
        let path = self.config_path();
        let rendered = contents.replace("{root}", &self.root().display().to_string());
        std::fs::write(&path, rendered)?;
        Ok(path)
    }

    /// Load the configuration file.
    ///
    /// # Errors
    ///
    /// Returns the loader's error for missing or invalid files.
    pub fn load(&self) -> ConfigResult<Config> {
        Config::load(&self.config_path())
    }
}

/// A studio configuration with a project and a shot environment.
///
/// `tk-desktop` is installed and switches between the two environments.
/// The project environment runs `publish` and `loader`; the shot
/// environment adds `review` and requires a `fps` setting on it.
pub const STUDIO_CONFIG: &str = r#"
[runtime]
metrics_poll_interval_ms = 10
metrics_flush_timeout_ms = 500

[bundles.tk-desktop]
path = "{root}/bundles/tk-desktop"
version = "2.1.0"
requires_context = ["project"]

[bundles.tk-multi-publish]
path = "{root}/bundles/tk-multi-publish"
version = "1.4.2"
description = "Publish files to the pipeline"

[bundles.tk-multi-loader]
path = "{root}/bundles/tk-multi-loader"
version = "1.19.0"

[bundles.tk-multi-review]
path = "{root}/bundles/tk-multi-review"
requires_context = ["entity"]

[bundles.tk-multi-review.schema.fps]
type = "int"

[environments.project.engines.tk-desktop]
bundle = "tk-desktop"

[[environments.project.engines.tk-desktop.apps]]
instance = "publish"
bundle = "tk-multi-publish"

[[environments.project.engines.tk-desktop.apps]]
instance = "loader"
bundle = "tk-multi-loader"

[environments.shot.engines.tk-desktop]
bundle = "tk-desktop"

[[environments.shot.engines.tk-desktop.apps]]
instance = "publish"
bundle = "tk-multi-publish"

[[environments.shot.engines.tk-desktop.apps]]
instance = "review"
bundle = "tk-multi-review"
settings = { fps = 24 }

[[selectors]]
environment = "shot"
requires = ["project", "entity"]
entity_type = "Shot"

[[selectors]]
environment = "project"
requires = ["project"]
"#;

/// Write [`STUDIO_CONFIG`] into a fresh fixture with every bundle installed.
///
/// # Errors
///
/// Returns an error if the fixture cannot be written.
pub fn studio_fixture() -> io::Result<ConfigFixture> {
    let fixture = ConfigFixture::new()?;
    for bundle in ["tk-desktop", "tk-multi-publish", "tk-multi-loader", "tk-multi-review"] {
        fixture.install(bundle)?;
    }
    fixture.write(STUDIO_CONFIG)?;
    Ok(fixture)
}
