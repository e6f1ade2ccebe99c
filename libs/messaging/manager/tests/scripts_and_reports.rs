//! Script loading through the context loader, and memory reports

mod common;

use std::sync::Arc;

use common::parent_context;
use manager_config::{ReporterConfig, ScriptsConfig};
use message_manager::{
    listener_fn, CachingScriptLoader, MessageManager, MessageManagerError,
    MessageManagerReporter, ScriptExecutor,
};
use parking_lot::Mutex;

#[derive(Default)]
struct RecordingExecutor {
    runs: Mutex<Vec<(String, String, u64)>>,
}

impl ScriptExecutor for RecordingExecutor {
    fn execute(&self, url: &str, source: &str, scope: &Arc<MessageManager>) -> anyhow::Result<()> {
        if source.contains("throw") {
            anyhow::bail!("script threw");
        }
        self.runs
            .lock()
            .push((url.to_string(), source.to_string(), scope.id()));
        Ok(())
    }
}

#[test]
fn test_scripts_reach_in_process_child_and_are_cached() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("frame.js");
    std::fs::write(&script, "first version").unwrap();

    let ctx = parent_context();
    let executor = Arc::new(RecordingExecutor::default());
    let loader = Arc::new(CachingScriptLoader::from_config(
        &ScriptsConfig {
            cache_enabled: true,
            base_dir: Some(dir.path().to_path_buf()),
        },
        Arc::clone(&executor) as Arc<dyn ScriptExecutor>,
    ));
    ctx.set_script_loader(Arc::clone(&loader) as Arc<dyn message_manager::ScriptLoader>);

    let root = ctx.create_parent_process_manager().unwrap();
    let child = ctx.child_process_manager().unwrap();

    root.load_script("frame.js", true).unwrap();
    std::fs::write(&script, "second version").unwrap();
    root.load_script("frame.js", false).unwrap();
    root.load_script("data:,inline body", false).unwrap();

    let runs = executor.runs.lock().clone();
    assert_eq!(
        runs,
        vec![
            ("frame.js".to_string(), "first version".to_string(), child.id()),
            ("frame.js".to_string(), "first version".to_string(), child.id()),
            ("data:,inline body".to_string(), "inline body".to_string(), child.id()),
        ]
    );
    assert_eq!(loader.cached_urls(), 1);
    assert_eq!(root.delayed_scripts().unwrap(), vec!["frame.js"]);

    ctx.shutdown();
    assert_eq!(loader.cached_urls(), 0);
}

#[test]
fn test_script_failures_surface_as_script_errors() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.js"), "throw").unwrap();

    let ctx = parent_context();
    let executor = Arc::new(RecordingExecutor::default());
    ctx.set_script_loader(Arc::new(CachingScriptLoader::from_config(
        &ScriptsConfig {
            cache_enabled: false,
            base_dir: Some(dir.path().to_path_buf()),
        },
        executor,
    )));
    ctx.create_parent_process_manager().unwrap();
    let same_process = ctx.same_process_parent_manager().unwrap();

    assert!(matches!(
        same_process.load_script("bad.js", false),
        Err(MessageManagerError::Script { .. })
    ));
    assert!(matches!(
        same_process.load_script("missing.js", false),
        Err(MessageManagerError::Script { .. })
    ));
}

#[test]
fn test_reports_cover_well_known_trees() {
    let ctx = parent_context();
    let global = ctx.create_global_manager().unwrap();
    ctx.create_parent_process_manager().unwrap();
    let child = ctx.child_process_manager().unwrap();

    let shared = listener_fn(|_| Ok(None));
    global
        .add_message_listener("a", &listener_fn(|_| Ok(None)))
        .unwrap();
    for _ in 0..2 {
        child
            .add_message_listener("chatty", &listener_fn(|_| Ok(None)))
            .unwrap();
    }
    child.add_weak_message_listener("a", &shared).unwrap();

    let reporter = MessageManagerReporter::from_config(&ReporterConfig {
        suspect_referent_count: 2,
    });
    let reports = reporter.collect_reports(&ctx);
    let amount = |path: &str| {
        reports
            .iter()
            .find(|r| r.path == path)
            .map(|r| r.amount)
    };

    assert_eq!(amount("message-manager/referent/global-manager/strong"), Some(1));
    assert_eq!(amount("message-manager/referent/parent-process-manager/strong"), Some(0));
    assert_eq!(amount("message-manager/referent/child-process-manager/strong"), Some(2));
    assert_eq!(amount("message-manager/referent/child-process-manager/weak/alive"), Some(1));
    assert_eq!(
        amount("message-manager-suspect/child-process-manager/referent(message=chatty)"),
        Some(2)
    );
    assert_eq!(
        amount("message-manager-suspect/global-manager/referent(message=a)"),
        None
    );

    drop(shared);
    let count = reporter.count_referents(&child);
    assert_eq!(count.weak_dead, 1);
    assert_eq!(count.strong, 2);
}
