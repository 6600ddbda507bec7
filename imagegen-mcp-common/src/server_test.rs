//! Unit tests for server builder utilities.

use super::server::{ServerError, shutdown_channel, until_shutdown};

#[test]
fn test_server_error_bind_failed_display() {
    let err = ServerError::BindFailed {
        addr: "127.0.0.1:3001".to_string(),
        message: "Address already in use".to_string(),
    };
    let msg = err.to_string();
    assert!(msg.contains("127.0.0.1:3001"), "Should contain address");
    assert!(msg.contains("Address already in use"), "Should contain error message");
}

#[test]
fn test_server_error_transport_display() {
    let err = ServerError::Transport("Connection reset".to_string());
    assert!(err.to_string().contains("Connection reset"));
}

#[test]
fn test_server_error_io_conversion() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let err: ServerError = io_err.into();
    assert!(matches!(err, ServerError::Io(_)));
}

#[tokio::test]
async fn test_shutdown_channel_async() {
    let (tx, rx) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let _ = tx.send(());
    });

    assert!(rx.await.is_ok(), "Should receive shutdown signal");
}

#[tokio::test]
async fn test_dropped_sender_also_releases_receiver() {
    let (tx, rx) = shutdown_channel();
    drop(tx);
    assert!(rx.await.is_err());
}

#[tokio::test]
async fn test_until_shutdown_follows_explicit_channel() {
    let (tx, rx) = shutdown_channel();
    let waiter = tokio::spawn(until_shutdown(Some(rx)));
    let _ = tx.send(());
    tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
        .await
        .expect("shutdown should resolve")
        .unwrap();
}
