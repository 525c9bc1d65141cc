use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::{Value, json};

use super::EngineState;
use crate::CORE_VERSION;
use crate::app::{App, AppContext};
use crate::backend::{EngineBackend, FactoryLoader};
use crate::command::{CommandAction, CommandProperties, CommandSelector};
use crate::context::{Context, Entity};
use crate::descriptor::{Descriptor, SettingKind, SettingSpec, Settings, SettingsSchema};
use crate::environment::{AppEntry, EngineEntry, Environment};
use crate::error::{DescriptorError, RuntimeError, RuntimeResult};
use crate::metrics::MetricEvent;
use crate::panel::PanelProperties;
use crate::resolver::DescriptorResolver;
use crate::runtime::Runtime;

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(entry.into());
    }

    fn count(&self, entry: &str) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| *e == entry)
            .count()
    }
}

#[derive(Clone, Default)]
struct Script {
    commands: Vec<&'static str>,
    panel: Option<&'static str>,
    reusable: bool,
    fail_init: bool,
    fail_post_engine_init: bool,
    fail_post_change: bool,
    fail_destroy: bool,
}

struct ScriptedApp {
    script: Script,
    journal: Journal,
}

impl App for ScriptedApp {
    fn init_app(&self, ctx: &AppContext<'_>) -> anyhow::Result<()> {
        self.journal.push(format!("init {}", ctx.instance_name()));
        for name in &self.script.commands {
            let label = format!("{} {name}", ctx.instance_name());
            ctx.register_command(
                name,
                CommandAction::standard(move || Ok(Value::String(label.clone()))),
                CommandProperties::new(),
            )?;
        }
        if let Some(panel) = self.script.panel {
            ctx.register_panel(panel, Arc::new(|| Ok(())), PanelProperties::new())?;
        }
        if self.script.fail_init {
            anyhow::bail!("cannot reach the server");
        }
        Ok(())
    }

    fn post_engine_init(&self, _ctx: &AppContext<'_>) -> anyhow::Result<()> {
        if self.script.fail_post_engine_init {
            anyhow::bail!("menu not ready");
        }
        Ok(())
    }

    fn context_change_allowed(&self) -> bool {
        self.script.reusable
    }

    fn post_context_change(&self, _old: &Context, new: &Context) -> anyhow::Result<()> {
        self.journal.push(format!("post_change {new}"));
        if self.script.fail_post_change {
            anyhow::bail!("stale cache");
        }
        Ok(())
    }

    fn destroy_app(&self) -> anyhow::Result<()> {
        self.journal.push("destroy_app");
        if self.script.fail_destroy {
            panic!("widget already deleted");
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct BackendScript {
    allow_change: bool,
    fail_pre_app_init: bool,
}

struct ScriptedBackend {
    script: BackendScript,
    journal: Journal,
}

impl EngineBackend for ScriptedBackend {
    fn pre_app_init(&self, _engine: &super::Engine) -> anyhow::Result<()> {
        if self.script.fail_pre_app_init {
            anyhow::bail!("host application missing");
        }
        Ok(())
    }

    fn context_change_allowed(&self) -> bool {
        self.script.allow_change
    }

    fn destroy_engine(&self) -> anyhow::Result<()> {
        self.journal.push("destroy_engine");
        Ok(())
    }
}

/// Picks the environment registered for the context's project id.
struct ByProject(Vec<(i64, Arc<Environment>)>);

impl DescriptorResolver for ByProject {
    fn pick_environment(&self, context: &Context) -> RuntimeResult<Option<String>> {
        Ok(context
            .project
            .as_ref()
            .and_then(|p| self.0.iter().find(|(id, _)| *id == p.id))
            .map(|(_, env)| env.name.clone()))
    }

    fn environment(&self, name: &str, _context: &Context) -> RuntimeResult<Arc<Environment>> {
        self.0
            .iter()
            .find(|(_, env)| env.name == name)
            .map(|(_, env)| Arc::clone(env))
            .ok_or_else(|| DescriptorError::NotFound(name.to_owned()).into())
    }
}

fn project(id: i64) -> Context {
    Context::empty().with_project(Entity::new("Project", id))
}

fn bundle(name: &str) -> Descriptor {
    Descriptor::new(name, format!("/bundles/{name}"))
}

fn engine_entry(version: &str, apps: Vec<AppEntry>) -> EngineEntry {
    let mut engine = EngineEntry::new("tk-desktop", Arc::new(bundle("tk-desktop").with_version(version)));
    for app in apps {
        engine = engine.with_app(app);
    }
    engine
}

fn app(instance: &str, bundle_name: &str) -> AppEntry {
    AppEntry::new(instance, Arc::new(bundle(bundle_name)))
}

fn environment(name: &str, engine: EngineEntry) -> Arc<Environment> {
    Arc::new(Environment::new(name).with_engine(engine))
}

struct Harness {
    runtime: Runtime,
    journal: Journal,
}

fn harness(envs: Vec<(i64, Arc<Environment>)>, apps: Vec<(&'static str, Script)>, backend: BackendScript) -> Harness {
    let journal = Journal::default();
    let engine_journal = journal.clone();
    let mut loader = FactoryLoader::new().with_engine("tk-desktop", move |_, _| {
        Ok(Box::new(ScriptedBackend {
            script: backend.clone(),
            journal: engine_journal.clone(),
        }))
    });
    for (bundle_name, script) in apps {
        let app_journal = journal.clone();
        loader = loader.with_app(bundle_name, move |_, _| {
            Ok(Box::new(ScriptedApp {
                script: script.clone(),
                journal: app_journal.clone(),
            }))
        });
    }
    let runtime = Runtime::builder(Arc::new(ByProject(envs)), Arc::new(loader)).build();
    Harness { runtime, journal }
}

fn commands(names: &[&'static str]) -> Script {
    Script {
        commands: names.to_vec(),
        ..Script::default()
    }
}

#[test]
fn test_start_loads_apps_in_declared_order() {
    let env = environment(
        "project",
        engine_entry("2.1.0", vec![app("publish", "tk-multi-publish"), app("loader", "tk-multi-loader")]),
    );
    let h = harness(
        vec![(1, env)],
        vec![
            ("tk-multi-publish", commands(&["Publish..."])),
            ("tk-multi-loader", commands(&["Load..."])),
        ],
        BackendScript::default(),
    );

    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    assert_eq!(engine.state(), EngineState::Ready);
    let apps: Vec<String> = engine.apps().iter().map(|a| a.instance_name().to_owned()).collect();
    assert_eq!(apps, vec!["publish", "loader"]);
    assert_eq!(engine.command_names(), vec!["Publish...", "Load..."]);
    assert_eq!(engine.command("Load...").unwrap().invoke().unwrap(), json!("loader Load..."));
    assert!(Arc::ptr_eq(&h.runtime.current_engine().unwrap(), &engine));
}

#[test]
fn test_second_start_fails_without_touching_running_engine() {
    let env = environment("project", engine_entry("2.1.0", vec![app("publish", "tk-multi-publish")]));
    let h = harness(vec![(1, env)], vec![("tk-multi-publish", Script::default())], BackendScript::default());

    let first = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    let err = h.runtime.start_engine("tk-desktop", project(1)).unwrap_err();

    assert!(matches!(err, RuntimeError::Init(_)));
    assert!(Arc::ptr_eq(&h.runtime.current_engine().unwrap(), &first));
    assert_eq!(first.state(), EngineState::Ready);
    assert_eq!(h.journal.count("init publish"), 1);
}

#[test]
fn test_unknown_context_is_init_error() {
    let env = environment("project", engine_entry("2.1.0", Vec::new()));
    let h = harness(vec![(1, env)], Vec::new(), BackendScript::default());

    let err = h.runtime.start_engine("tk-desktop", Context::empty()).unwrap_err();
    assert!(matches!(err, RuntimeError::Init(ref m) if m.contains("not sufficiently detailed")));
    let err = h.runtime.start_engine("tk-maya", project(1)).unwrap_err();
    assert!(matches!(err, RuntimeError::Init(ref m) if m.contains("not configured")));
    assert!(h.runtime.current_engine().is_none());
}

#[test]
fn test_invalid_settings_skip_only_that_app() {
    let strict = Descriptor::new("tk-multi-review", "/bundles/tk-multi-review")
        .with_schema(SettingsSchema::new().with("retries", SettingSpec::required(SettingKind::Int)));
    let mut bad = Settings::new();
    bad.insert("retries".into(), json!("three"));

    let env = environment(
        "project",
        engine_entry(
            "2.1.0",
            vec![
                app("publish", "tk-multi-publish"),
                AppEntry::new("review", Arc::new(strict)).with_settings(bad),
                app("loader", "tk-multi-loader"),
            ],
        ),
    );
    let h = harness(
        vec![(1, env)],
        vec![
            ("tk-multi-publish", Script::default()),
            ("tk-multi-review", Script::default()),
            ("tk-multi-loader", Script::default()),
        ],
        BackendScript::default(),
    );

    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    assert!(engine.app("review").is_none());
    assert!(engine.app("publish").is_some());
    assert!(engine.app("loader").is_some());
    assert_eq!(h.journal.count("init review"), 0);
}

#[test]
fn test_failed_init_rolls_back_registrations() {
    let env = environment(
        "project",
        engine_entry("2.1.0", vec![app("publish", "tk-multi-publish"), app("loader", "tk-multi-loader")]),
    );
    let broken = Script {
        commands: vec!["Publish..."],
        panel: Some("main"),
        fail_init: true,
        ..Script::default()
    };
    let h = harness(
        vec![(1, env)],
        vec![("tk-multi-publish", broken), ("tk-multi-loader", commands(&["Load..."]))],
        BackendScript::default(),
    );

    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    assert!(engine.app("publish").is_none());
    assert_eq!(engine.command_names(), vec!["Load..."]);
    assert!(engine.panel_ids().is_empty());
}

#[test]
fn test_panels_only_during_init() {
    let env = environment("project", engine_entry("2.1.0", vec![app("Shotgun Panel", "tk-multi-shotgunpanel")]));
    let script = Script {
        panel: Some("main"),
        ..Script::default()
    };
    let h = harness(vec![(1, env)], vec![("tk-multi-shotgunpanel", script)], BackendScript::default());

    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    assert_eq!(engine.panel_ids(), vec!["shotgun_panel_main"]);
    assert_eq!(engine.panel("shotgun_panel_main").unwrap().owner, "Shotgun Panel");

    let err = engine
        .register_panel("extra", Arc::new(|| Ok(())), PanelProperties::new())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::NotInInitPhase(ref name) if name == "extra"));
}

#[test]
fn test_post_engine_init_failure_flags_app() {
    let env = environment("project", engine_entry("2.1.0", vec![app("publish", "tk-multi-publish")]));
    let script = Script {
        fail_post_engine_init: true,
        ..Script::default()
    };
    let h = harness(vec![(1, env)], vec![("tk-multi-publish", script)], BackendScript::default());

    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    let publish = engine.app("publish").unwrap();
    assert!(publish.is_init_incomplete());
}

#[test]
fn test_engine_commands_match_by_owner() {
    let env = environment(
        "project",
        engine_entry("2.1.0", vec![app("A", "tk-multi-a"), app("B", "tk-multi-b")]),
    );
    let h = harness(
        vec![(1, env)],
        vec![("tk-multi-a", commands(&["Foo", "Bar"])), ("tk-multi-b", commands(&["Foo"]))],
        BackendScript::default(),
    );

    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    assert_eq!(engine.command_names(), vec!["A:Foo", "Bar", "B:Foo"]);

    let matched = engine.match_commands(&[CommandSelector::all_of("A")]);
    let names: Vec<&str> = matched.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["A:Foo", "Bar"]);
    assert_eq!(matched[0].callback.invoke().unwrap(), json!("A Foo"));

    engine
        .register_command("Sync", CommandAction::standard(|| Ok(Value::Null)), CommandProperties::new())
        .unwrap();
    assert!(engine.command("Sync").is_some());
    assert!(engine.match_commands(&[CommandSelector::all_of("tk-desktop")]).is_empty());
}

fn switching_harness(second_version: &str) -> Harness {
    let apps = || vec![app("publish", "tk-multi-publish"), app("about", "tk-multi-about")];
    let one = environment("project", engine_entry("2.1.0", apps()));
    let two = environment("shot", engine_entry(second_version, apps()));
    let reusable = Script {
        commands: vec!["Publish..."],
        reusable: true,
        ..Script::default()
    };
    harness(
        vec![(1, one), (2, two)],
        vec![("tk-multi-publish", reusable), ("tk-multi-about", commands(&["About"]))],
        BackendScript {
            allow_change: true,
            ..BackendScript::default()
        },
    )
}

#[test]
fn test_context_change_reuses_pooled_apps() {
    let h = switching_harness("2.1.0");
    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    let publish = engine.app("publish").unwrap();
    let about = engine.app("about").unwrap();
    let names_before = engine.command_names();

    engine.change_context(project(2)).unwrap();

    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(engine.context(), project(2));
    assert_eq!(engine.environment().name, "shot");
    assert!(Arc::ptr_eq(&engine.app("publish").unwrap(), &publish));
    assert!(!Arc::ptr_eq(&engine.app("about").unwrap(), &about));
    assert_eq!(publish.context(), project(2));
    assert_eq!(engine.command_names(), names_before);
    assert_eq!(h.journal.count("init publish"), 1);
    assert_eq!(h.journal.count("init about"), 2);
    assert_eq!(h.journal.count(&format!("post_change {}", project(2))), 1);
    assert_eq!(engine.pooled_app_count(), 1);
}

#[test]
fn test_context_change_back_reuses_same_instance() {
    let h = switching_harness("2.1.0");
    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    let publish = engine.app("publish").unwrap();

    engine.change_context(project(2)).unwrap();
    engine.change_context(project(1)).unwrap();

    assert!(Arc::ptr_eq(&engine.app("publish").unwrap(), &publish));
    assert_eq!(h.journal.count("init publish"), 1);
    assert!(engine.command("Publish...").is_some());
}

#[test]
fn test_failed_post_change_rebuilds_app() {
    let apps = || vec![app("publish", "tk-multi-publish")];
    let fragile = Script {
        commands: vec!["Publish..."],
        reusable: true,
        fail_post_change: true,
        ..Script::default()
    };
    let h = harness(
        vec![
            (1, environment("project", engine_entry("2.1.0", apps()))),
            (2, environment("shot", engine_entry("2.1.0", apps()))),
        ],
        vec![("tk-multi-publish", fragile)],
        BackendScript {
            allow_change: true,
            ..BackendScript::default()
        },
    );
    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    let before = engine.app("publish").unwrap();

    engine.change_context(project(2)).unwrap();

    let after = engine.app("publish").unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(h.journal.count("init publish"), 2);
    assert_eq!(engine.command_names(), vec!["Publish..."]);
    assert!(Arc::ptr_eq(
        engine.command("Publish...").unwrap().app().unwrap(),
        &after
    ));
}

#[test]
fn test_context_change_to_other_engine_bundle_is_rejected() {
    let h = switching_harness("3.0.0");
    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    let publish = engine.app("publish").unwrap();

    let err = engine.change_context(project(2)).unwrap_err();

    assert!(matches!(err, RuntimeError::UnsupportedTransition(_)));
    assert_eq!(engine.context(), project(1));
    assert_eq!(engine.state(), EngineState::Ready);
    assert!(Arc::ptr_eq(&engine.app("publish").unwrap(), &publish));
}

#[test]
fn test_context_change_requires_engine_support() {
    let env = environment("project", engine_entry("2.1.0", Vec::new()));
    let h = harness(vec![(1, Arc::clone(&env)), (2, env)], Vec::new(), BackendScript::default());
    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();

    let err = engine.change_context(project(2)).unwrap_err();
    assert!(matches!(err, RuntimeError::UnsupportedTransition(_)));
    assert_eq!(engine.context(), project(1));
    assert_eq!(engine.state(), EngineState::Ready);
}

/// Resolver that tries a second context change on the engine while the
/// first one is being resolved, and records what it saw.
struct Interleaving {
    resolver: ByProject,
    engine: Mutex<Weak<super::Engine>>,
    seen: Mutex<Vec<(EngineState, bool)>>,
}

impl DescriptorResolver for Interleaving {
    fn pick_environment(&self, context: &Context) -> RuntimeResult<Option<String>> {
        let engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner).upgrade();
        if let Some(engine) = engine {
            let rejected = matches!(
                engine.change_context(project(3)),
                Err(RuntimeError::UnsupportedTransition(_))
            );
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((engine.state(), rejected));
        }
        self.resolver.pick_environment(context)
    }

    fn environment(&self, name: &str, context: &Context) -> RuntimeResult<Arc<Environment>> {
        self.resolver.environment(name, context)
    }
}

#[test]
fn test_context_change_claims_the_engine_before_resolving() {
    let env = || environment("project", engine_entry("2.1.0", Vec::new()));
    let resolver = Arc::new(Interleaving {
        resolver: ByProject(vec![(1, env()), (2, env()), (3, env())]),
        engine: Mutex::new(Weak::new()),
        seen: Mutex::new(Vec::new()),
    });
    let loader = FactoryLoader::new().with_engine("tk-desktop", |_, _| {
        Ok(Box::new(ScriptedBackend {
            script: BackendScript {
                allow_change: true,
                ..BackendScript::default()
            },
            journal: Journal::default(),
        }))
    });
    let shared: Arc<dyn DescriptorResolver> = Arc::clone(&resolver) as Arc<dyn DescriptorResolver>;
    let runtime = Runtime::builder(shared, Arc::new(loader)).build();
    let engine = runtime.start_engine("tk-desktop", project(1)).unwrap();
    *resolver.engine.lock().unwrap() = Arc::downgrade(&engine);

    engine.change_context(project(2)).unwrap();

    let seen = resolver.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![(EngineState::Transitioning, true)]);
    assert_eq!(engine.context(), project(2));
    assert_eq!(engine.state(), EngineState::Ready);
}

#[test]
fn test_same_context_is_a_no_op() {
    let h = switching_harness("2.1.0");
    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    engine.change_context(project(1)).unwrap();
    assert_eq!(h.journal.count("init about"), 1);
}

#[test]
fn test_teardown_clears_slot_despite_failing_app() {
    let env = environment(
        "project",
        engine_entry("2.1.0", vec![app("publish", "tk-multi-publish"), app("loader", "tk-multi-loader")]),
    );
    let fragile = Script {
        fail_destroy: true,
        ..Script::default()
    };
    let h = harness(
        vec![(1, env)],
        vec![("tk-multi-publish", fragile), ("tk-multi-loader", Script::default())],
        BackendScript::default(),
    );
    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();

    engine.destroy().unwrap();

    assert!(h.runtime.current_engine().is_none());
    assert_eq!(engine.state(), EngineState::Destroyed);
    assert_eq!(h.journal.count("destroy_app"), 2);
    assert_eq!(h.journal.count("destroy_engine"), 1);
    assert!(engine.command_names().is_empty());
    assert!(matches!(engine.destroy(), Err(RuntimeError::AlreadyDestroyed(_))));
    assert!(matches!(
        engine.register_command("Late", CommandAction::standard(|| Ok(Value::Null)), CommandProperties::new()),
        Err(RuntimeError::AlreadyDestroyed(_))
    ));
    assert!(matches!(
        engine.change_context(project(2)),
        Err(RuntimeError::AlreadyDestroyed(_))
    ));
}

#[test]
fn test_failed_pre_app_init_aborts_start() {
    let env = environment("project", engine_entry("2.1.0", vec![app("publish", "tk-multi-publish")]));
    let h = harness(
        vec![(1, env)],
        vec![("tk-multi-publish", Script::default())],
        BackendScript {
            fail_pre_app_init: true,
            ..BackendScript::default()
        },
    );

    let err = h.runtime.start_engine("tk-desktop", project(1)).unwrap_err();
    assert!(matches!(err, RuntimeError::Init(ref m) if m.contains("host application missing")));
    assert!(h.runtime.current_engine().is_none());
    assert_eq!(h.journal.count("init publish"), 0);
    assert_eq!(h.journal.count("destroy_engine"), 1);
}

#[test]
fn test_dev_app_adds_reload_command() {
    let dev = AppEntry::new("publish", Arc::new(bundle("tk-multi-publish").dev()));
    let env = environment("project", engine_entry("2.1.0", vec![dev]));
    let h = harness(vec![(1, env)], vec![("tk-multi-publish", Script::default())], BackendScript::default());

    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();
    let reload = engine.command("Reload and Restart").unwrap();
    assert_eq!(reload.owner(), "tk-desktop");
    assert_eq!(reload.properties().kind.as_deref(), Some("context_menu"));

    assert_eq!(reload.invoke().unwrap(), json!("tk-desktop"));
    let restarted = h.runtime.current_engine().unwrap();
    assert!(engine.is_destroyed());
    assert_ne!(restarted.session_id(), engine.session_id());
    assert_eq!(restarted.context(), project(1));
    assert_eq!(h.journal.count("init publish"), 2);
}

#[test]
fn test_start_records_metrics() {
    let env = environment("project", engine_entry("2.1.0", Vec::new()));
    let h = harness(vec![(1, env)], Vec::new(), BackendScript::default());
    h.runtime.start_engine("tk-desktop", project(1)).unwrap();

    let events = h.runtime.metrics_queue().unwrap().drain(10);
    assert!(events.iter().any(|e| matches!(
        e,
        MetricEvent::UserActivity { module, action, .. } if module == "tk-desktop" && action == "tk-desktop Init"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        MetricEvent::UserAttribute { name, value, .. } if name == "trellis core version" && value == CORE_VERSION
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        MetricEvent::UserAttribute { name, value, .. } if name == "tk-desktop version" && value == "2.1.0"
    )));
}

#[test]
fn test_main_thread_calls_run_in_place_without_bridge() {
    let env = environment("project", engine_entry("2.1.0", Vec::new()));
    let h = harness(vec![(1, env)], Vec::new(), BackendScript::default());
    let engine = h.runtime.start_engine("tk-desktop", project(1)).unwrap();

    assert_eq!(engine.execute_in_main_thread(|| "inline").unwrap(), "inline");

    let counter = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&counter);
    engine
        .async_execute_in_main_thread(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
