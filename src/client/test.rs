use std::time::Duration;

use crate::{
    error::ErrorKind,
    options::{ClientOptions, ServerAddress},
    Client,
};

fn isolated_client(mut options: ClientOptions) -> Client {
    options.test_options_mut().disable_monitoring_tasks = true;
    Client::with_options(options).unwrap()
}

#[tokio::test]
async fn selection_times_out_with_no_reachable_servers() {
    let options = ClientOptions::builder()
        .hosts(vec![ServerAddress::parse("a:27017").unwrap()])
        .server_selection_timeout(Duration::from_millis(100))
        .build();
    let client = isolated_client(options);

    let error = client
        .select_server(None, "test operation", None)
        .await
        .unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::ServerSelection { .. }
    ));
}

#[tokio::test]
async fn try_once_selection_fails_fast() {
    let options = ClientOptions::builder()
        .hosts(vec![ServerAddress::parse("a:27017").unwrap()])
        .server_selection_timeout(Duration::from_secs(30))
        .server_selection_try_once(true)
        .build();
    let client = isolated_client(options);

    let start = std::time::Instant::now();
    let error = client
        .select_server(None, "test operation", None)
        .await
        .unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        ErrorKind::ServerSelection { .. }
    ));
    // A try-once selection must not wait out the full selection timeout.
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn operations_fail_after_shutdown() {
    let options = ClientOptions::builder()
        .hosts(vec![ServerAddress::parse("a:27017").unwrap()])
        .server_selection_timeout(Duration::from_millis(100))
        .build();
    let client = isolated_client(options);
    let clone = client.clone();

    client.shutdown().await;

    let error = clone
        .run_command("admin", crate::bson::doc! { "ping": 1 })
        .await
        .unwrap_err();
    assert!(matches!(error.kind.as_ref(), ErrorKind::Shutdown));
}

#[tokio::test]
async fn sessions_are_returned_to_the_pool_on_drop() {
    let options = ClientOptions::builder()
        .hosts(vec![ServerAddress::parse("a:27017").unwrap()])
        .build();
    let client = isolated_client(options);

    let session = client.start_session(None).await.unwrap();
    let id = session.id().clone();
    drop(session);

    // The drop path spawns a task to check the session in; give it a moment.
    for _ in 0..100 {
        if client.inner.session_pool.contains(&id).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dropped session was not returned to the pool");
}

#[tokio::test]
async fn dirty_sessions_are_not_reused() {
    let options = ClientOptions::builder()
        .hosts(vec![ServerAddress::parse("a:27017").unwrap()])
        .build();
    let client = isolated_client(options);

    let mut session = client.start_session(None).await.unwrap();
    session.mark_dirty();
    assert!(session.is_dirty());
    let id = session.id().clone();
    drop(session);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!client.inner.session_pool.contains(&id).await);
}
