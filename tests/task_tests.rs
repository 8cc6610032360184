mod common;

use common::fixture;
use tracksession::{Filter, Value};

#[test]
fn test_find_task_runs_in_the_background() {
    let (session, _) = fixture();
    let task = session
        .find_task(
            "Shot".to_string(),
            vec![Filter::is("id", 101)],
            vec!["code".to_string()],
        )
        .unwrap();
    let shots = task.wait().unwrap().unwrap();
    assert_eq!(shots.len(), 1);
    // Background results land in the same identity map.
    assert!(shots[0].ptr_eq(&session.get_cached("Shot", 101).unwrap()));
}

#[test]
fn test_fetch_task() {
    let (session, _) = fixture();
    let shot = session.get_or_create("Shot", 101).unwrap();
    let task = session
        .fetch_task(vec![shot.clone()], vec!["code".to_string()], false)
        .unwrap();
    task.wait().unwrap().unwrap();
    assert_eq!(shot.get("code").unwrap(), Some(Value::Text("AA_001".into())));
}

#[test]
fn test_fetch_hierarchy_task() {
    let (session, _) = fixture();
    let shot = session.get_or_create("Shot", 101).unwrap();
    let task = session.fetch_hierarchy_task(vec![shot]).unwrap();
    let all = task.wait().unwrap().unwrap();
    assert_eq!(all.len(), 3);
    assert!(all
        .iter()
        .any(|e| e.entity_type().as_deref() == Some("Project")));
}

#[test]
fn test_submit_arbitrary_work() {
    let (session, _) = fixture();
    let first = session
        .submit(|session| session.get_or_create("Shot", 300))
        .unwrap();
    let second = session
        .submit(|session| session.get_or_create("Shot", 300))
        .unwrap();
    let a = first.wait().unwrap().unwrap();
    let b = second.wait().unwrap().unwrap();
    assert!(a.ptr_eq(&b));
}

#[test]
fn test_tasks_overlap() {
    let (session, gateway) = fixture();
    let tasks: Vec<_> = [101, 102, 201, 202]
        .iter()
        .map(|id| {
            session
                .find_task(
                    "Shot".to_string(),
                    vec![Filter::is("id", *id)],
                    vec!["code".to_string()],
                )
                .unwrap()
        })
        .collect();
    for task in tasks {
        assert_eq!(task.wait().unwrap().unwrap().len(), 1);
    }
    assert_eq!(gateway.call_count("find:Shot"), 4);
    assert!(session.cache_size() >= 4);
}
