use std::time::Duration;

use super::{ServerSession, ServerSessionPool};
use crate::bson::Timestamp;

#[tokio::test]
async fn session_pool_reuses_sessions_lifo() {
    let pool = ServerSessionPool::new();
    let timeout = Some(Duration::from_secs(30 * 60));

    let first = pool.check_out(timeout).await;
    let second = pool.check_out(timeout).await;
    assert_ne!(first.id, second.id);

    let first_id = first.id.clone();
    let second_id = second.id.clone();
    pool.check_in(first, timeout).await;
    pool.check_in(second, timeout).await;

    // The most recently checked in session is the first to be reused.
    let reused = pool.check_out(timeout).await;
    assert_eq!(reused.id, second_id);
    let reused = pool.check_out(timeout).await;
    assert_eq!(reused.id, first_id);
}

#[tokio::test]
async fn dirty_sessions_are_discarded() {
    let pool = ServerSessionPool::new();
    let timeout = Some(Duration::from_secs(30 * 60));

    let mut session = pool.check_out(timeout).await;
    session.dirty = true;
    let id = session.id.clone();
    pool.check_in(session, timeout).await;

    assert!(!pool.contains(&id).await);
}

#[tokio::test]
async fn expiring_sessions_are_discarded() {
    let pool = ServerSessionPool::new();

    // With a timeout shorter than the one-minute buffer, every session counts as about to
    // expire and is dropped on check in.
    let timeout = Some(Duration::from_secs(30));
    let session = pool.check_out(timeout).await;
    let id = session.id.clone();
    pool.check_in(session, timeout).await;
    assert!(!pool.contains(&id).await);

    // With no timeout reported by the deployment, sessions never expire client-side.
    let session = pool.check_out(None).await;
    let id = session.id.clone();
    pool.check_in(session, None).await;
    assert!(pool.contains(&id).await);
}

#[test]
fn server_session_ids_are_uuids() {
    let session = ServerSession::new();
    let binary = session.id.get("id").unwrap();
    match binary {
        crate::bson::Bson::Binary(b) => {
            assert_eq!(b.subtype, crate::bson::spec::BinarySubtype::Uuid);
            assert_eq!(b.bytes.len(), 16);
        }
        other => panic!("expected binary session id, got {:?}", other),
    }
}

#[test]
fn operation_time_only_advances() {
    // Timestamps compare by time then increment.
    let early = Timestamp {
        time: 100,
        increment: 1,
    };
    let late = Timestamp {
        time: 100,
        increment: 2,
    };
    assert!(early < late);
}
