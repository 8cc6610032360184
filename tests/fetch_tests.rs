mod common;

use common::fixture;
use tracksession::{Existence, SessionError, Value};

#[test]
fn test_fetch_skips_entities_that_have_the_fields() {
    let (session, gateway) = fixture();
    let shot = session.get_or_create("Shot", 101).unwrap();
    session.fetch(&[shot.clone()], &["code"], false).unwrap();
    assert_eq!(shot.get("code").unwrap(), Some(Value::Text("AA_001".into())));

    let before = gateway.calls().len();
    session.fetch(&[shot.clone()], &["code"], false).unwrap();
    assert_eq!(gateway.calls().len(), before);
}

#[test]
fn test_fetch_null_counts_as_present() {
    let (session, gateway) = fixture();
    let shot = session.get_or_create("Shot", 101).unwrap();
    session.fetch(&[shot.clone()], &["description"], false).unwrap();
    assert_eq!(shot.get("description").unwrap(), Some(Value::Null));

    // The server said there is nothing there; do not keep asking.
    let before = gateway.calls().len();
    session.fetch(&[shot], &["description"], false).unwrap();
    assert_eq!(gateway.calls().len(), before);
}

#[test]
fn test_fetch_force_refetches() {
    let (session, gateway) = fixture();
    let shot = session.get_or_create("Shot", 101).unwrap();
    session.fetch(&[shot.clone()], &["code"], false).unwrap();

    gateway.poke("Shot", 101, [("code", Value::Text("RENAMED".into()))]);
    session.fetch(&[shot.clone()], &["code"], false).unwrap();
    assert_eq!(shot.get("code").unwrap(), Some(Value::Text("AA_001".into())));

    session.fetch(&[shot.clone()], &["code"], true).unwrap();
    assert_eq!(shot.get("code").unwrap(), Some(Value::Text("RENAMED".into())));
}

#[test]
fn test_fetch_batches_by_type() {
    let (session, gateway) = fixture();
    let a = session.get_or_create("Shot", 101).unwrap();
    let b = session.get_or_create("Shot", 102).unwrap();
    let t = session.get_or_create("Task", 1001).unwrap();
    session
        .fetch(&[a.clone(), b.clone(), t.clone()], &["id"], true)
        .unwrap();
    assert_eq!(gateway.call_count("find:Shot"), 1);
    assert_eq!(gateway.call_count("find:Task"), 1);
    assert_eq!(a.exists(), Existence::Exists);
    assert_eq!(b.exists(), Existence::Exists);
    assert_eq!(t.exists(), Existence::Exists);
}

#[test]
fn test_fetch_missing_ids_error_after_merging() {
    let (session, _) = fixture();
    let good = session.get_or_create("Shot", 101).unwrap();
    let bad = session.get_or_create("Shot", 999).unwrap();
    let err = session
        .fetch(&[good.clone(), bad.clone()], &["code"], false)
        .unwrap_err();
    match err {
        SessionError::NotFound { entity_type, ids } => {
            assert_eq!(entity_type, "Shot");
            assert_eq!(ids, vec![999]);
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
    // What did come back has already merged, and existence is settled.
    assert_eq!(good.get("code").unwrap(), Some(Value::Text("AA_001".into())));
    assert_eq!(good.exists(), Existence::Exists);
    assert_eq!(bad.exists(), Existence::Retired);
}

#[test]
fn test_fetch_core_pulls_important_fields_and_links() {
    let (session, _) = fixture();
    let task = session.get_or_create("Task", 1001).unwrap();
    session.fetch_core(&[task.clone()]).unwrap();
    assert_eq!(task.get("content").unwrap(), Some(Value::Text("Animate".into())));
    // The planner widens the link fields one level deep.
    assert_eq!(
        task.get("step.Step.short_name").unwrap(),
        Some(Value::Text("ANM".into()))
    );
    assert_eq!(
        task.get("entity.Shot.code").unwrap(),
        Some(Value::Text("AA_001".into()))
    );
}

#[test]
fn test_get_prefers_the_cache() {
    let (session, gateway) = fixture();
    let found = session.get("Shot", 101, &["code"]).unwrap().unwrap();
    assert_eq!(gateway.call_count("find:Shot"), 1);
    let again = session.get("Shot", 101, &["code"]).unwrap().unwrap();
    assert!(again.ptr_eq(&found));
    assert_eq!(gateway.call_count("find:Shot"), 1);
    assert!(session.get("Shot", 999, &[]).unwrap().is_none());
}

#[test]
fn test_entity_fetch_convenience() {
    let (session, _) = fixture();
    let shot = session.get_or_create("Shot", 101).unwrap();
    shot.fetch(&["code"], false).unwrap();
    assert_eq!(shot.get("code").unwrap(), Some(Value::Text("AA_001".into())));
    let parent = shot.parent(true).unwrap().unwrap();
    assert!(parent.ptr_eq(&session.get_cached("Sequence", 10).unwrap()));
}

#[test]
fn test_brace_patterns_expand_in_fetch() {
    let (session, _) = fixture();
    let task = session.get_or_create("Task", 1001).unwrap();
    session
        .fetch(&[task.clone()], &["entity.Shot.{code,project}"], false)
        .unwrap();
    assert_eq!(
        task.get("entity.Shot.code").unwrap(),
        Some(Value::Text("AA_001".into()))
    );
    assert!(matches!(
        task.get("entity.Shot.project").unwrap(),
        Some(Value::Entity(_))
    ));
}
