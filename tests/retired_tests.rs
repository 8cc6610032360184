mod common;

use common::fixture;
use tracksession::{Existence, Filter, FindOptions, SessionError, Value};

#[test]
fn test_delete_retires_without_evicting() {
    let (session, _) = fixture();
    let shot = session
        .find("Shot", &[Filter::is("id", 101)], &["code"])
        .unwrap()
        .remove(0);
    assert!(session.delete(&shot).unwrap());
    assert_eq!(shot.exists(), Existence::Retired);
    // The cached record and its data are still there.
    let cached = session.get_cached("Shot", 101).unwrap();
    assert!(cached.ptr_eq(&shot));
    assert_eq!(cached.get("code").unwrap(), Some(Value::Text("AA_001".into())));
}

#[test]
fn test_delete_unknown_id_reports_false() {
    let (session, _) = fixture();
    assert!(!session.delete_by_id("Shot", 999).unwrap());
}

#[test]
fn test_fetch_after_delete_is_not_found() {
    let (session, _) = fixture();
    let shot = session
        .find("Shot", &[Filter::is("id", 101)], &[])
        .unwrap()
        .remove(0);
    session.delete(&shot).unwrap();
    let err = session.fetch(&[shot.clone()], &["code"], true).unwrap_err();
    assert!(matches!(err, SessionError::NotFound { .. }));
    assert_eq!(shot.exists(), Existence::Retired);
}

#[test]
fn test_retired_records_are_still_findable_as_retired() {
    let (session, _) = fixture();
    session.delete_by_id("Shot", 101).unwrap();
    let options = FindOptions {
        retired_only: true,
        ..FindOptions::default()
    };
    let retired = session
        .find_with("Shot", &[Filter::is("id", 101)], &["code"], &options)
        .unwrap();
    assert_eq!(retired.len(), 1);
    assert_eq!(
        retired[0].get("code").unwrap(),
        Some(Value::Text("AA_001".into()))
    );
}

#[test]
fn test_filter_exists_checks_unknowns_in_one_find_per_type() {
    let (session, gateway) = fixture();
    let good = session.get_or_create("Shot", 101).unwrap();
    let gone = session.get_or_create("Shot", 999).unwrap();
    let kept = session
        .filter_exists(&[good.clone(), gone.clone()], true, false)
        .unwrap();
    assert_eq!(gateway.call_count("find:Shot"), 1);
    assert_eq!(kept.len(), 1);
    assert!(kept[0].ptr_eq(&good));
    assert_eq!(good.exists(), Existence::Exists);
    assert_eq!(gone.exists(), Existence::Retired);

    // Settled entities are not re-checked.
    session.filter_exists(&[good.clone(), gone.clone()], true, false).unwrap();
    assert_eq!(gateway.call_count("find:Shot"), 1);

    // Unless forced.
    session.filter_exists(&[good, gone], true, true).unwrap();
    assert_eq!(gateway.call_count("find:Shot"), 2);
}

#[test]
fn test_filter_exists_without_check_trusts_the_flags() {
    let (session, gateway) = fixture();
    let unknown = session.get_or_create("Shot", 101).unwrap();
    // Nothing is asked, and an unchecked entity gets the benefit of the
    // doubt; only known-retired ones drop.
    let kept = session.filter_exists(&[unknown.clone()], false, false).unwrap();
    assert_eq!(kept.len(), 1);
    assert!(kept[0].ptr_eq(&unknown));
    assert_eq!(gateway.call_count("find:Shot"), 0);

    session.delete_by_id("Shot", 101).unwrap();
    let kept = session.filter_exists(&[unknown], false, false).unwrap();
    assert!(kept.is_empty());
    assert_eq!(gateway.call_count("find:Shot"), 0);
}

#[test]
fn test_exists_on_server_consults_the_session() {
    let (session, gateway) = fixture();
    let shot = session.get_or_create("Shot", 101).unwrap();
    let gone = session.get_or_create("Shot", 999).unwrap();
    assert!(shot.exists_on_server(true, false).unwrap());
    assert!(!gone.exists_on_server(true, false).unwrap());
    assert_eq!(gateway.call_count("find:Shot"), 2);

    // Settled flags answer without another round trip.
    assert!(shot.exists_on_server(true, false).unwrap());
    assert_eq!(gateway.call_count("find:Shot"), 2);
}
