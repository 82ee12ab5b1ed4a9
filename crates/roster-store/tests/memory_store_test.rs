//! Memory store integration tests
//!
//! Exercise the store contract the discovery client depends on: node CRUD,
//! ephemeral ownership, subtree watches and connection-state transitions.

use std::time::Duration;

use roster_store::{
    ConnectionState, CreateMode, MemoryConnector, MemoryStore, NodeEvent, NodeEventKind,
    StoreConfig, StoreConnector, StoreError, StoreEvent, SubtreeWatch, with_session,
};

fn connector(store: &MemoryStore) -> MemoryConnector {
    let config = StoreConfig::from_connect_string("127.0.0.1:2181")
        .with_session_timeout(200)
        .with_retry(2, 5);
    MemoryConnector::new(store.clone(), config).unwrap()
}

async fn next_node(watch: &mut SubtreeWatch) -> NodeEvent {
    match watch.events.recv().await {
        Some(StoreEvent::Node(event)) => event,
        other => panic!("expected a node event, got {:?}", other),
    }
}

// ============== Node CRUD ==============

#[tokio::test]
async fn test_create_list_get_delete() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let conn = connector(&store).connect().await?;

    let name = conn
        .create_node("/services/orders/a", b"one".to_vec(), CreateMode::Persistent)
        .await?;
    assert_eq!(name, "a");
    conn.create_node("/services/orders/b", b"two".to_vec(), CreateMode::Ephemeral)
        .await?;

    assert_eq!(conn.list_children("/services/orders").await?, vec!["a", "b"]);
    assert_eq!(conn.get_data("/services/orders/b").await?, b"two");
    assert!(conn.exists("/services").await?);

    conn.delete_node("/services/orders/a").await?;
    conn.delete_node("/services/orders/a").await?;
    assert_eq!(conn.list_children("/services/orders").await?, vec!["b"]);

    Ok(())
}

#[tokio::test]
async fn test_missing_nodes() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let conn = connector(&store).connect().await?;

    assert!(matches!(
        conn.list_children("/nope").await,
        Err(StoreError::NodeNotFound(_))
    ));
    assert!(matches!(
        conn.get_data("/nope").await,
        Err(StoreError::NodeNotFound(_))
    ));
    assert!(matches!(
        conn.set_data("/nope", vec![]).await,
        Err(StoreError::NodeNotFound(_))
    ));
    assert!(!conn.exists("/nope").await?);
    Ok(())
}

#[tokio::test]
async fn test_create_existing_and_delete_non_empty() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let conn = connector(&store).connect().await?;

    conn.create_node("/a/b", vec![], CreateMode::Persistent).await?;
    assert!(matches!(
        conn.create_node("/a/b", vec![], CreateMode::Persistent).await,
        Err(StoreError::NodeExists(_))
    ));
    assert!(matches!(
        conn.delete_node("/a").await,
        Err(StoreError::NotEmpty(_))
    ));
    assert!(matches!(
        conn.create_node("relative", vec![], CreateMode::Persistent).await,
        Err(StoreError::InvalidPath(_))
    ));
    Ok(())
}

// ============== Ephemeral ownership ==============

#[tokio::test]
async fn test_ephemeral_nodes_vanish_with_session() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let connector = connector(&store);
    let owner = connector.connect().await?;
    let observer = connector.connect().await?;

    owner
        .create_node("/services/orders/eph", vec![], CreateMode::Ephemeral)
        .await?;
    owner
        .create_node("/services/orders/perm", vec![], CreateMode::Persistent)
        .await?;

    owner.close().await;

    assert_eq!(
        observer.list_children("/services/orders").await?,
        vec!["perm"]
    );
    assert_eq!(store.session_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_dropping_connection_closes_session() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    {
        let conn = connector(&store).connect().await?;
        conn.create_node("/x", vec![], CreateMode::Ephemeral).await?;
        assert_eq!(store.session_count(), 1);
    }
    assert_eq!(store.session_count(), 0);
    assert!(!store.node_exists("/x"));
    Ok(())
}

#[tokio::test]
async fn test_closed_connection_rejects_operations() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let conn = connector(&store).connect().await?;
    conn.close().await;

    assert!(matches!(conn.get_data("/").await, Err(StoreError::Closed)));
    assert_eq!(conn.state(), ConnectionState::Lost);
    Ok(())
}

// ============== Watches ==============

#[tokio::test]
async fn test_subtree_watch_delivers_in_order() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let connector = connector(&store);
    let writer = connector.connect().await?;
    let reader = connector.connect().await?;

    writer
        .create_node("/services/orders", vec![], CreateMode::Persistent)
        .await?;
    let mut watch = reader.watch_subtree("/services/orders").await?;

    writer
        .create_node("/services/orders/a", b"1".to_vec(), CreateMode::Ephemeral)
        .await?;
    writer.set_data("/services/orders/a", b"2".to_vec()).await?;
    writer.delete_node("/services/orders/a").await?;
    writer
        .create_node("/services/other/b", vec![], CreateMode::Persistent)
        .await?;

    let created = next_node(&mut watch).await;
    assert_eq!(created.kind, NodeEventKind::Created);
    assert_eq!(created.name, "a");
    assert_eq!(created.data.as_deref(), Some(&b"1"[..]));

    let updated = next_node(&mut watch).await;
    assert_eq!(updated.kind, NodeEventKind::Updated);
    assert_eq!(updated.data.as_deref(), Some(&b"2"[..]));

    let deleted = next_node(&mut watch).await;
    assert_eq!(deleted.kind, NodeEventKind::Deleted);
    assert_eq!(deleted.path, "/services/orders/a");

    assert!(watch.events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_unwatch_closes_channel() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let conn = connector(&store).connect().await?;

    let mut watch = conn.watch_subtree("/services").await?;
    assert_eq!(store.watch_count(), 1);
    conn.unwatch(watch.id);
    assert_eq!(store.watch_count(), 0);

    conn.create_node("/services/a", vec![], CreateMode::Persistent)
        .await?;
    assert!(watch.events.recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_expiry_notifies_other_watchers() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let connector = connector(&store);
    let owner = connector.connect().await?;
    let observer = connector.connect().await?;

    owner
        .create_node("/services/orders/a", vec![], CreateMode::Ephemeral)
        .await?;
    let mut watch = observer.watch_subtree("/services/orders").await?;
    let mut states = owner.connection_states();

    assert!(store.expire_session(owner.session_id()));

    let event = next_node(&mut watch).await;
    assert_eq!(event.kind, NodeEventKind::Deleted);
    assert_eq!(event.name, "a");
    // The observer's own session is untouched
    assert!(watch.events.try_recv().is_err());

    assert_eq!(states.recv().await?, ConnectionState::Lost);
    assert!(states.recv().await.is_err());
    assert!(matches!(
        owner.get_data("/services").await,
        Err(StoreError::SessionExpired(_))
    ));
    Ok(())
}

// ============== Connection state ==============

#[tokio::test]
async fn test_suspend_and_resume() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let conn = connector(&store).connect().await?;
    let mut states = conn.connection_states();

    assert!(store.suspend_session(conn.session_id()));
    assert_eq!(states.recv().await?, ConnectionState::Suspended);
    assert_eq!(conn.state(), ConnectionState::Suspended);

    assert!(store.resume_session(conn.session_id()));
    assert_eq!(states.recv().await?, ConnectionState::Reconnected);
    assert_eq!(conn.state(), ConnectionState::Connected);
    Ok(())
}

#[tokio::test]
async fn test_watch_carries_session_state_changes() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.put_persistent("/services", vec![])?;
    let conn = connector(&store).connect().await?;
    let mut watch = conn.watch_subtree("/services").await?;

    store.suspend_session(conn.session_id());
    store.resume_session(conn.session_id());
    store.put_persistent("/services/orders", vec![])?;
    store.expire_session(conn.session_id());

    let mut seen = Vec::new();
    while let Some(event) = watch.events.recv().await {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            StoreEvent::ConnectionStateChanged(ConnectionState::Suspended),
            StoreEvent::ConnectionStateChanged(ConnectionState::Reconnected),
            StoreEvent::Node(NodeEvent::created("/services/orders", vec![])),
            StoreEvent::ConnectionStateChanged(ConnectionState::Lost),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_operations_fail_after_retries_while_suspended() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let conn = connector(&store).connect().await?;
    store.suspend_session(conn.session_id());

    assert!(matches!(
        conn.list_children("/").await,
        Err(StoreError::Unavailable(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_operation_retried_until_resumed() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let config = StoreConfig::default().with_retry(50, 5);
    let conn = MemoryConnector::new(store.clone(), config)?.connect().await?;
    let session_id = conn.session_id();
    store.suspend_session(session_id);

    let resumer = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        resumer.resume_session(session_id);
    });

    assert!(conn.list_children("/").await?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_suspended_session_expires_after_timeout() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let conn = connector(&store).connect().await?;
    conn.create_node("/eph", vec![], CreateMode::Ephemeral).await?;
    let mut states = conn.connection_states();

    store.suspend_session(conn.session_id());
    assert_eq!(states.recv().await?, ConnectionState::Suspended);
    assert_eq!(states.recv().await?, ConnectionState::Lost);
    assert!(!store.node_exists("/eph"));
    Ok(())
}

#[tokio::test]
async fn test_connect_fails_when_store_unreachable() {
    let store = MemoryStore::new();
    store.set_available(false);
    let connector = connector(&store);

    let result = connector.connect().await;
    assert!(matches!(result, Err(StoreError::Unavailable(_))));
    assert_eq!(connector.connect_count(), 0);
}

// ============== Scoped sessions ==============

#[tokio::test]
async fn test_with_session_closes_on_success_and_failure() {
    let store = MemoryStore::new();
    let connector = connector(&store);

    let created: Result<String, StoreError> = with_session(&connector, |conn| async move {
        conn.create_node("/scoped", vec![], CreateMode::Ephemeral)
            .await
    })
    .await;
    assert_eq!(created.unwrap(), "scoped");
    assert_eq!(store.session_count(), 0);
    assert!(!store.node_exists("/scoped"));

    let failed: Result<Vec<u8>, StoreError> =
        with_session(&connector, |conn| async move { conn.get_data("/missing").await }).await;
    assert!(matches!(failed, Err(StoreError::NodeNotFound(_))));
    assert_eq!(store.session_count(), 0);
}
