use std::io;
use std::path::Path;

use wsagent_config::WatcherConfig;
use wsagent_watcher::{Callbacks, DeliveryState, WatchEvent, WatchOperation, WatcherError};

use super::support::{wait_until, Harness, Recorder, TIMEOUT};

fn java(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "java")
}

#[test]
fn exact_path_receives_create_modify_delete() {
    let h = Harness::new();
    let rec = Recorder::new();
    h.manager.register_by_path("/file", rec.callbacks()).unwrap();

    h.push(vec![h.created("/file")]);
    h.push(vec![h.modified("/file")]);
    h.push(vec![h.deleted("/file")]);
    h.push(vec![h.created("/other"), h.modified("/other"), h.deleted("/other")]);

    assert_eq!(
        rec.events(),
        vec![
            (WatchOperation::Create, "/file".to_owned()),
            (WatchOperation::Modify, "/file".to_owned()),
            (WatchOperation::Delete, "/file".to_owned()),
        ]
    );
}

#[test]
fn exact_and_matcher_subscriptions_are_isolated() {
    let h = Harness::new();
    std::fs::create_dir_all(h.abs("/src/deep")).unwrap();

    let exact = Recorder::new();
    let pattern = Recorder::new();
    h.manager.register_by_path("/f", exact.callbacks()).unwrap();
    h.manager.register_by_matcher(java, pattern.callbacks()).unwrap();

    h.push(vec![
        h.created("/g"),
        h.created("/A.java"),
        h.created("/src/B.java"),
        h.created("/src/deep/C.java"),
        h.created("/src/notes.txt"),
    ]);

    assert!(exact.events().is_empty());
    assert_eq!(
        pattern.paths(),
        vec!["/A.java", "/src/B.java", "/src/deep/C.java"]
    );
}

#[test]
fn suspended_events_are_not_replayed() {
    let h = Harness::new();
    let rec = Recorder::new();
    h.manager.register_by_path("/a", rec.callbacks()).unwrap();
    h.manager.register_by_path("/b", rec.callbacks()).unwrap();

    h.manager.suspend();
    assert_eq!(h.manager.delivery_state(), DeliveryState::Suspended);
    h.push(vec![h.created("/a")]);
    assert!(rec.events().is_empty());

    h.manager.resume();
    assert_eq!(h.manager.delivery_state(), DeliveryState::Running);
    h.push(vec![h.created("/b")]);
    assert_eq!(rec.events(), vec![(WatchOperation::Create, "/b".to_owned())]);
}

#[test]
fn unregister_removes_only_that_subscription() {
    let h = Harness::new();
    let first = Recorder::new();
    let second = Recorder::new();
    let a = h.manager.register_by_path("/f", first.callbacks()).unwrap();
    let _b = h.manager.register_by_path("/f", second.callbacks()).unwrap();

    let m1 = Recorder::new();
    let m2 = Recorder::new();
    let c = h.manager.register_by_matcher(java, m1.callbacks()).unwrap();
    let _d = h.manager.register_by_matcher(java, m2.callbacks()).unwrap();

    h.manager.unregister_by_path(a).unwrap();
    h.manager.unregister_by_matcher(c).unwrap();
    // Unknown ids, and ids belonging to the other registry, are no-ops.
    h.manager.unregister_by_path(a).unwrap();
    h.manager.unregister_by_path(c).unwrap();
    h.manager.unregister_by_matcher(a).unwrap();

    h.push(vec![h.modified("/f"), h.modified("/X.java")]);

    assert!(first.events().is_empty());
    assert!(m1.events().is_empty());
    assert_eq!(second.paths(), vec!["/f"]);
    assert_eq!(m2.paths(), vec!["/X.java"]);
}

#[test]
fn default_excludes_drop_git_events() {
    let h = Harness::new();
    std::fs::create_dir_all(h.abs("/.git/refs")).unwrap();
    let rec = Recorder::new();
    h.manager
        .register_by_matcher(|_: &Path| true, rec.callbacks())
        .unwrap();

    h.push(vec![h.modified("/.git/index"), h.modified("/pom.xml")]);

    assert_eq!(rec.paths(), vec!["/pom.xml"]);
    assert!(
        !h.manager
            .watched_directories()
            .iter()
            .any(|(dir, _)| dir.starts_with(h.abs("/.git"))),
        "excluded directories are not walked"
    );
}

#[test]
fn runtime_exclusions_can_be_added_and_removed() {
    let mut config = WatcherConfig::default();
    config.watcher.excludes.clear();
    let h = Harness::with_config(&config);
    let rec = Recorder::new();
    h.manager.register_by_path("/build.log", rec.callbacks()).unwrap();

    let id = h
        .manager
        .add_exclude_matcher(|path: &Path| path.extension().is_some_and(|ext| ext == "log"));
    h.push(vec![h.modified("/build.log")]);
    assert!(rec.events().is_empty());

    assert!(h.manager.remove_exclude_matcher(id));
    assert!(!h.manager.remove_exclude_matcher(id));
    h.push(vec![h.modified("/build.log")]);
    assert_eq!(rec.paths(), vec!["/build.log"]);
}

#[test]
fn registration_failure_is_reported_and_isolated() {
    let h = Harness::new();
    let rec = Recorder::new();
    h.manager.register_by_path("/ok", rec.callbacks()).unwrap();

    h.handle.fail_watch(h.abs("/gone"), io::ErrorKind::NotFound);
    let err = h
        .manager
        .register_by_path("/gone/file", Callbacks::new())
        .expect_err("registration should fail");
    match err {
        WatcherError::Register { path, source } => {
            assert_eq!(path, h.abs("/gone"));
            assert_eq!(source.kind(), io::ErrorKind::NotFound);
        }
        other => panic!("unexpected error: {other}"),
    }

    h.push(vec![h.created("/ok")]);
    assert_eq!(rec.paths(), vec!["/ok"]);
}

#[test]
fn stream_errors_do_not_stop_delivery() {
    let h = Harness::new();
    let rec = Recorder::new();
    h.manager.register_by_path("/a", rec.callbacks()).unwrap();

    h.handle.push_error(io::Error::other("queue hiccup")).unwrap();
    h.handle.push(WatchEvent::Rescan).unwrap();
    h.push(vec![h.created("/a")]);

    assert!(!h.manager.is_stopped());
    assert_eq!(rec.paths(), vec!["/a"]);
}

#[test]
fn disconnected_source_is_observable_as_stopped() {
    let h = Harness::new();
    assert!(!h.manager.is_stopped());

    h.handle.disconnect();
    assert!(h.manager.wait_until_stopped());
}

#[test]
fn panicking_callback_does_not_block_other_subscriptions() {
    let h = Harness::new();
    let rec = Recorder::new();
    h.manager
        .register_by_path("/f", Callbacks::new().on_create(|_| panic!("consumer bug")))
        .unwrap();
    h.manager.register_by_path("/f", rec.callbacks()).unwrap();

    h.push(vec![h.created("/f")]);
    h.push(vec![h.modified("/f")]);

    assert_eq!(
        rec.events(),
        vec![
            (WatchOperation::Create, "/f".to_owned()),
            (WatchOperation::Modify, "/f".to_owned()),
        ]
    );
}

#[test]
fn stop_then_start_keeps_subscriptions() {
    let h = Harness::new();
    let rec = Recorder::new();
    h.manager.register_by_path("/f", rec.callbacks()).unwrap();

    h.manager.stop();
    assert!(h.manager.wait_until_stopped());
    assert!(h.manager.is_stopped());

    h.manager.start().unwrap();
    assert!(!h.manager.is_stopped());
    h.push(vec![h.deleted("/f")]);
    assert_eq!(rec.events(), vec![(WatchOperation::Delete, "/f".to_owned())]);
}

#[test]
fn matcher_and_path_registrations_share_reference_counts() {
    let h = Harness::new();
    std::fs::create_dir_all(h.abs("/src")).unwrap();

    let by_path = h.manager.register_by_path("/src/A.java", Callbacks::new()).unwrap();
    assert_eq!(h.reference_count(&h.abs("/src")), 1);

    let by_matcher = h.manager.register_by_matcher(java, Callbacks::new()).unwrap();
    assert_eq!(h.reference_count(&h.abs("/src")), 2);
    assert_eq!(h.reference_count(&h.root), 1);

    h.manager.unregister_by_matcher(by_matcher).unwrap();
    assert_eq!(h.reference_count(&h.abs("/src")), 1);
    assert_eq!(h.reference_count(&h.root), 0);

    h.manager.unregister_by_path(by_path).unwrap();
    assert!(h.manager.watched_directories().is_empty());
    assert!(h.handle.watched_paths().is_empty());
}

#[test]
fn new_directories_are_covered_for_matchers() {
    let h = Harness::new();
    let rec = Recorder::new();
    h.manager.register_by_matcher(java, rec.callbacks()).unwrap();

    std::fs::create_dir_all(h.abs("/pkg/inner")).unwrap();
    h.push(vec![h.created("/pkg")]);
    assert!(wait_until(TIMEOUT, || h.reference_count(&h.abs("/pkg/inner")) == 1));

    std::fs::remove_dir_all(h.abs("/pkg")).unwrap();
    h.push(vec![h.deleted("/pkg")]);
    assert_eq!(h.reference_count(&h.abs("/pkg")), 0);
    assert_eq!(h.reference_count(&h.abs("/pkg/inner")), 0);
    assert_eq!(h.reference_count(&h.root), 1);
}

#[test]
fn events_outside_root_are_ignored() {
    let h = Harness::new();
    let rec = Recorder::new();
    h.manager
        .register_by_matcher(|_: &Path| true, rec.callbacks())
        .unwrap();

    let outside = h.root.parent().unwrap().join("elsewhere.txt");
    h.push(vec![wsagent_watcher::FileChange::created(outside), h.created("/inside.txt")]);

    assert_eq!(rec.paths(), vec!["/inside.txt"]);
}

#[test]
fn directory_created_while_suspended_is_covered_after_resume() {
    let h = Harness::new();
    let rec = Recorder::new();
    h.manager.register_by_matcher(java, rec.callbacks()).unwrap();

    h.manager.suspend();
    std::fs::create_dir(h.abs("/pkg")).unwrap();
    h.push(vec![h.created("/pkg")]);
    h.manager.resume();

    assert_eq!(h.reference_count(&h.abs("/pkg")), 1);
    assert!(h.handle.watched_paths().contains(&h.abs("/pkg")));

    h.push(vec![h.created("/pkg/A.java")]);
    assert_eq!(rec.paths(), vec!["/pkg/A.java"]);
}

#[test]
fn directory_deleted_while_suspended_is_released_and_recovers() {
    let h = Harness::new();
    std::fs::create_dir(h.abs("/pkg")).unwrap();
    let rec = Recorder::new();
    h.manager.register_by_matcher(java, rec.callbacks()).unwrap();
    assert_eq!(h.reference_count(&h.abs("/pkg")), 1);

    h.manager.suspend();
    std::fs::remove_dir(h.abs("/pkg")).unwrap();
    h.push(vec![h.deleted("/pkg")]);
    h.manager.resume();
    assert_eq!(h.reference_count(&h.abs("/pkg")), 0);
    assert!(!h.handle.watched_paths().contains(&h.abs("/pkg")));

    std::fs::create_dir(h.abs("/pkg")).unwrap();
    h.push(vec![h.created("/pkg")]);
    assert_eq!(h.reference_count(&h.abs("/pkg")), 1);
    assert!(h.handle.watched_paths().contains(&h.abs("/pkg")));
    assert!(rec.events().is_empty());
}

#[test]
fn shared_directory_recreated_gets_its_native_watch_back() {
    let h = Harness::new();
    std::fs::create_dir(h.abs("/sub")).unwrap();
    let exact = Recorder::new();
    let pattern = Recorder::new();
    h.manager.register_by_path("/sub/a.txt", exact.callbacks()).unwrap();
    h.manager.register_by_matcher(java, pattern.callbacks()).unwrap();
    assert_eq!(h.reference_count(&h.abs("/sub")), 2);

    std::fs::remove_dir_all(h.abs("/sub")).unwrap();
    h.push(vec![h.deleted("/sub")]);
    assert_eq!(h.reference_count(&h.abs("/sub")), 1);
    assert!(!h.handle.watched_paths().contains(&h.abs("/sub")));

    std::fs::create_dir(h.abs("/sub")).unwrap();
    h.push(vec![h.created("/sub")]);
    assert_eq!(h.reference_count(&h.abs("/sub")), 2);
    assert!(h.handle.watched_paths().contains(&h.abs("/sub")));

    h.push(vec![h.created("/sub/B.java"), h.created("/sub/a.txt")]);
    assert_eq!(pattern.paths(), vec!["/sub/B.java"]);
    assert_eq!(exact.events(), vec![(WatchOperation::Create, "/sub/a.txt".to_owned())]);
}
