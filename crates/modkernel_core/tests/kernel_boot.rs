use modkernel_core::manifest::class::{ClassManifest, ClassRecord};
use modkernel_core::manifest::discovery::{FileManifestCache, StaticDiscovery};
use modkernel_core::manifest::module::{Module, ModuleManifest};
use modkernel_core::{
    config, BootError, BootStage, ConfigFlags, ConfigReader, Kernel, MapEnv, VarSource,
};
use serde_json::json;
use std::fs;
use std::rc::Rc;

fn discovery() -> Rc<StaticDiscovery> {
    Rc::new(StaticDiscovery::new(
        ClassManifest::from_records([
            ClassRecord::new("Base"),
            ClassRecord::new("Widget").extends("Base"),
        ]),
        ModuleManifest::from_modules([
            Module::new("app", "/srv/app")
                .project()
                .with_config("Widget", "tags", json!(["app"])),
            Module::new("core", "/srv/core").with_config("Widget", "tags", json!(["core"])),
        ]),
    ))
}

fn memory_db_vars() -> Rc<MapEnv> {
    Rc::new(MapEnv::from_pairs([("APP_DATABASE_NAME", ":memory:")]))
}

#[test]
fn boot_runs_every_stage_and_activates_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let discovery = discovery();
    let kernel = Kernel::builder(dir.path())
        .vars(memory_db_vars())
        .discovery(discovery.clone())
        .build();

    assert_eq!(kernel.is_flushed(), None);
    kernel.boot(false).expect("boot should succeed");

    assert_eq!(kernel.stage(), BootStage::Booted);
    assert!(kernel.is_booted());
    assert_eq!(kernel.is_flushed(), Some(false));
    assert!(Rc::ptr_eq(
        &Kernel::current().expect("kernel registered"),
        &kernel
    ));

    let snapshot = config::snapshot().expect("active config");
    assert_eq!(snapshot.get("Widget", "tags"), Some(&json!(["core", "app"])));
    let reader = ConfigReader::new(&snapshot, kernel.class_info());
    assert_eq!(
        reader.get("Widget", "tags", ConfigFlags::NONE),
        Some(json!(["core", "app"]))
    );
    assert_eq!(kernel.class_info().ancestry("widget").map(|chain| chain.len()), Some(2));
}

#[test]
fn boot_twice_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = Kernel::builder(dir.path())
        .vars(memory_db_vars())
        .discovery(discovery())
        .build();
    kernel.boot(false).expect("first boot");

    let err = kernel.boot(true).expect_err("second boot must fail");
    assert!(matches!(err, BootError::AlreadyBooted(BootStage::Booted)));
    assert_eq!(kernel.is_flushed(), Some(false));
}

#[test]
fn missing_database_without_installer_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = Kernel::builder(dir.path())
        .vars(Rc::new(MapEnv::new()))
        .discovery(discovery())
        .build();

    let err = kernel.boot(false).expect_err("boot must fail");
    match err {
        BootError::ConfigurationFatal { diagnostic, artifact } => {
            assert!(diagnostic.contains("missing required configuration"));
            assert!(artifact.is_none());
        }
        other => panic!("expected fatal configuration error, got {other:?}"),
    }
    assert_eq!(kernel.stage(), BootStage::ConfigActivated);
}

#[test]
fn missing_database_with_installer_redirects() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("install.html"), "<html></html>").expect("write installer");
    let kernel = Kernel::builder(dir.path())
        .vars(Rc::new(MapEnv::new()))
        .discovery(discovery())
        .build();

    let err = kernel.boot(false).expect_err("boot must redirect");
    assert!(
        matches!(&err, BootError::ConfigurationRedirect { target } if target.ends_with("install.html"))
    );
}

#[test]
fn legacy_artifact_wins_over_installer() {
    let parent = tempfile::tempdir().expect("tempdir");
    let base = parent.path().join("public");
    fs::create_dir(&base).expect("create base");
    fs::write(base.join("install.html"), "").expect("write installer");
    let legacy = parent.path().join("_environment.legacy");
    fs::write(&legacy, "define('SS_DATABASE_NAME', 'old');").expect("write legacy");

    let kernel = Kernel::builder(&base)
        .vars(Rc::new(MapEnv::new()))
        .discovery(discovery())
        .build();
    let err = kernel.boot(false).expect_err("boot must fail");
    match err {
        BootError::ConfigurationFatal { artifact, .. } => {
            assert_eq!(artifact.as_deref(), Some(legacy.as_path()));
        }
        other => panic!("expected legacy fatal error, got {other:?}"),
    }
}

#[test]
fn missing_base_path_fails_before_discovery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let discovery = discovery();
    let kernel = Kernel::builder(dir.path().join("absent"))
        .vars(memory_db_vars())
        .discovery(discovery.clone())
        .build();

    let err = kernel.boot(false).expect_err("boot must fail");
    assert!(matches!(err, BootError::ConfigurationFatal { .. }));
    assert_eq!(kernel.stage(), BootStage::Uninitialized);
    assert_eq!(discovery.runs(), 0);
}

#[test]
fn env_file_supplies_database_identity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("site.sqlite3");
    fs::write(
        dir.path().join(".env"),
        format!(
            "APP_ENVIRONMENT_TYPE=test\nAPP_DATABASE_NAME=\"{}\"\n",
            db_path.display()
        ),
    )
    .expect("write .env");
    let vars = Rc::new(MapEnv::new());
    let kernel = Kernel::builder(dir.path())
        .vars(vars.clone())
        .discovery(discovery())
        .build();

    kernel.boot(false).expect("boot should succeed");
    assert!(kernel.is_test());
    assert!(db_path.exists());
    assert_eq!(
        vars.var("APP_DATABASE_NAME").as_deref(),
        db_path.to_str()
    );
    assert!(kernel
        .database_config()
        .expect("database config")
        .has_identity());
}

#[test]
fn flush_bypasses_the_manifest_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache_dir = tempfile::tempdir().expect("cache dir");
    let cache = Rc::new(FileManifestCache::new(cache_dir.path()));
    let discovery = discovery();

    let first = Kernel::builder(dir.path())
        .vars(memory_db_vars())
        .discovery(discovery.clone())
        .cache(cache.clone())
        .build();
    first.boot(false).expect("first boot");
    assert_eq!(discovery.runs(), 1);

    let cached = Kernel::builder(dir.path())
        .vars(memory_db_vars())
        .discovery(discovery.clone())
        .cache(cache.clone())
        .build();
    cached.boot(false).expect("cached boot");
    assert_eq!(discovery.runs(), 1);

    let flushed = Kernel::builder(dir.path())
        .vars(memory_db_vars())
        .discovery(discovery.clone())
        .cache(cache)
        .build();
    flushed.boot(true).expect("flushed boot");
    assert_eq!(discovery.runs(), 2);
    assert_eq!(flushed.is_flushed(), Some(true));
}

#[test]
fn module_activators_run_in_module_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = Kernel::builder(dir.path())
        .vars(memory_db_vars())
        .discovery(discovery())
        .build();
    kernel.register_module_activator("app", |module, config| {
        config.merge("Widget", "activated", json!([module.name]));
        Ok(())
    });
    kernel.register_module_activator("core", |module, config| {
        config.merge("Widget", "activated", json!([module.name]));
        Ok(())
    });

    kernel.boot(false).expect("boot");
    let snapshot = config::snapshot().expect("active config");
    assert_eq!(
        snapshot.get("Widget", "activated"),
        Some(&json!(["core", "app"]))
    );
}

#[test]
fn failing_activator_stops_boot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let kernel = Kernel::builder(dir.path())
        .vars(memory_db_vars())
        .discovery(discovery())
        .build();
    kernel.register_module_activator("core", |_, _| Err("bad config".to_string()));

    let err = kernel.boot(false).expect_err("boot must fail");
    assert!(
        matches!(&err, BootError::ModuleActivation { module, message } if module == "core" && message == "bad config")
    );
    assert_eq!(kernel.stage(), BootStage::DatabaseConfigured);
}

#[test]
fn filesystem_discovery_reads_module_declarations() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir(dir.path().join("framework")).expect("create module dir");
    fs::write(
        dir.path().join("framework").join("module.json"),
        r#"{
            "classes": [{"name": "Base"}, {"name": "Widget", "parent": "Base"}],
            "config": {"Widget": {"extensions": ["Painter"]}}
        }"#,
    )
    .expect("write framework module");
    fs::write(
        dir.path().join("module.json"),
        r#"{"name": "site", "project": true, "config": {"Widget": {"size": 3}}}"#,
    )
    .expect("write project module");

    let kernel = Kernel::builder(dir.path()).vars(memory_db_vars()).build();
    kernel.boot(false).expect("boot");

    let modules = kernel.module_loader().borrow_mut().manifest();
    let names: Vec<&str> = modules.modules().iter().map(|module| module.name.as_str()).collect();
    assert_eq!(names, vec!["framework", "site"]);
    assert!(kernel.class_info().is_subclass_of("Widget", "Base"));

    let snapshot = config::snapshot().expect("active config");
    assert_eq!(snapshot.get("Widget", "size"), Some(&json!(3)));
    assert_eq!(snapshot.get("Widget", "extensions"), Some(&json!(["Painter"])));
}
