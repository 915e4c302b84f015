use super::*;
use crate::state::test_helpers::participant;

#[tokio::test]
async fn create_session_is_idempotent_per_board() {
    let registry = SessionRegistry::new();
    let first = registry.create_session("b1", "b1").await;
    let second = registry.create_session("b1", "other-state").await;

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(second.state_id, "b1", "existing session is returned unchanged");
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn distinct_boards_get_distinct_sessions() {
    let registry = SessionRegistry::new();
    let a = registry.create_session("a", "a").await;
    let b = registry.create_session("b", "b").await;
    assert_ne!(a.session_id, b.session_id);
    assert_eq!(registry.len().await, 2);
}

#[tokio::test]
async fn lookups_return_none_when_absent() {
    let registry = SessionRegistry::new();
    assert!(registry.get_session(Uuid::new_v4()).await.is_none());
    assert!(registry.get_session_by_board_id("missing").await.is_none());
}

#[tokio::test]
async fn lookup_by_board_and_by_id_agree() {
    let registry = SessionRegistry::new();
    let created = registry.create_session("b", "b").await;
    let by_id = registry.get_session(created.session_id).await.expect("by id");
    let by_board = registry.get_session_by_board_id("b").await.expect("by board");
    assert_eq!(by_id, by_board);
}

#[tokio::test]
async fn remove_session_clears_both_indices() {
    let registry = SessionRegistry::new();
    let session = registry.create_session("b", "b").await;

    assert!(registry.remove_session(session.session_id).await.is_some());
    assert!(registry.get_session(session.session_id).await.is_none());
    assert!(registry.get_session_by_board_id("b").await.is_none());

    // Removing again only logs.
    assert!(registry.remove_session(session.session_id).await.is_none());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn add_participant_dedupes_by_id_and_stamps_joined_at() {
    let registry = SessionRegistry::new();
    let session = registry.create_session("b", "b").await;

    let after_first = registry
        .add_participant(session.session_id, participant("p1"))
        .await
        .expect("session exists");
    assert_eq!(after_first.participants.len(), 1);
    assert!(after_first.participants[0].joined_at > 0);

    let mut renamed = participant("p1");
    renamed.name = "someone else".into();
    let after_dupe = registry
        .add_participant(session.session_id, renamed)
        .await
        .expect("session exists");
    assert_eq!(after_dupe.participants.len(), 1);
    assert_eq!(after_dupe.participants[0].name, "p1");
}

#[tokio::test]
async fn add_participant_to_missing_session_returns_none() {
    let registry = SessionRegistry::new();
    assert!(
        registry
            .add_participant(Uuid::new_v4(), participant("p1"))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn remove_participant_reports_presence_and_remaining() {
    let registry = SessionRegistry::new();
    let session = registry.create_session("b", "b").await;
    registry.add_participant(session.session_id, participant("p1")).await;
    registry.add_participant(session.session_id, participant("p2")).await;

    let departure = registry
        .remove_participant(session.session_id, "p1")
        .await
        .expect("session exists");
    assert_eq!(departure, Departure { removed: true, remaining: 1 });

    let absent = registry
        .remove_participant(session.session_id, "p1")
        .await
        .expect("session exists");
    assert_eq!(absent, Departure { removed: false, remaining: 1 });

    assert!(registry.remove_participant(Uuid::new_v4(), "p2").await.is_none());
}

#[tokio::test]
async fn remove_session_if_empty_spares_occupied_sessions() {
    let registry = SessionRegistry::new();
    let session = registry.create_session("b", "b").await;
    registry.add_participant(session.session_id, participant("p1")).await;

    assert!(registry.remove_session_if_empty(session.session_id).await.is_none());
    assert!(registry.get_session(session.session_id).await.is_some());

    registry.remove_participant(session.session_id, "p1").await;
    assert!(registry.remove_session_if_empty(session.session_id).await.is_some());
    assert!(registry.get_session_by_board_id("b").await.is_none());
}

#[tokio::test]
async fn new_session_after_removal_gets_fresh_id() {
    let registry = SessionRegistry::new();
    let first = registry.create_session("b", "b").await;
    registry.remove_session(first.session_id).await;
    let second = registry.create_session("b", "b").await;
    assert_ne!(first.session_id, second.session_id);
}
