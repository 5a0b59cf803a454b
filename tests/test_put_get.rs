//! Put and get behavior through the public client surface
//!
//! Covers waiting gets, correlation filters, truncation and browse against
//! the in-process queue manager.

mod test_helpers;

use futures::future::join_all;
use mqclient::error::{GetError, PutError};
use mqclient::{
    CorrelationId, GetOptions, MatchFilter, Message, MqError, OpenMode, Persistence, PutOptions,
    TruncationPolicy, Warning,
};
use std::time::Duration;
use test_helpers::{connected, embedded};

#[tokio::test]
async fn test_hello_round_trip_with_wait() {
    let memory = embedded(&["APP.IN"]);
    let connection = connected(&memory).await;
    let out = connection.open_queue("APP.IN", OpenMode::Output).await.unwrap();
    let input = connection.open_queue("APP.IN", OpenMode::Input).await.unwrap();

    out.put(
        Message::text("hello").with_persistence(Persistence::NotPersistent),
        PutOptions::default(),
    )
    .await
    .unwrap();

    let received = input
        .get(GetOptions::new().wait_for(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(received.message.payload_str(), Some("hello"));
    assert!(!received.truncated);
    assert_eq!(received.warning, None);
}

#[tokio::test]
async fn test_zero_wait_on_empty_queue_returns_immediately() {
    let memory = embedded(&["APP.EMPTY"]);
    let connection = connected(&memory).await;
    let input = connection
        .open_queue("APP.EMPTY", OpenMode::Input)
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = input.get(GetOptions::no_wait()).await.unwrap_err();
    assert_eq!(err, MqError::Get(GetError::NoMessageAvailable));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_waiting_get_sees_message_from_other_connection() {
    let memory = embedded(&["APP.IN"]);
    let consumer = connected(&memory).await;
    let producer = connected(&memory).await;
    let input = consumer.open_queue("APP.IN", OpenMode::Input).await.unwrap();
    let out = producer.open_queue("APP.IN", OpenMode::Output).await.unwrap();

    let waiter = tokio::spawn(async move {
        input
            .get(GetOptions::new().wait_for(Duration::from_secs(5)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    out.put(Message::text("late arrival"), PutOptions::default())
        .await
        .unwrap();

    let received = waiter.await.unwrap().unwrap();
    assert_eq!(received.message.payload_str(), Some("late arrival"));
}

#[tokio::test]
async fn test_get_by_correlation_id_is_byte_identical() {
    let memory = embedded(&["APP.REPLIES"]);
    let connection = connected(&memory).await;
    let out = connection
        .open_queue("APP.REPLIES", OpenMode::Output)
        .await
        .unwrap();
    let input = connection
        .open_queue("APP.REPLIES", OpenMode::Input)
        .await
        .unwrap();

    let wanted = CorrelationId::generate();
    let payload: Vec<u8> = (0u8..=255).collect();
    out.put(Message::text("other"), PutOptions::default())
        .await
        .unwrap();
    out.put(
        Message::new(payload.clone()).with_correlation_id(wanted),
        PutOptions::default(),
    )
    .await
    .unwrap();

    let received = input
        .get(GetOptions::no_wait().filter(MatchFilter::correlation_id(wanted)))
        .await
        .unwrap();
    assert_eq!(received.message.payload.as_ref(), payload.as_slice());
    assert_eq!(received.message.correlation_id(), wanted);
    assert_eq!(memory.queue_depth("APP.REPLIES"), Some(1));
}

#[tokio::test]
async fn test_truncation_policies() {
    let memory = embedded(&["APP.BIG"]);
    let connection = connected(&memory).await;
    let out = connection.open_queue("APP.BIG", OpenMode::Output).await.unwrap();
    let input = connection.open_queue("APP.BIG", OpenMode::Input).await.unwrap();
    out.put(Message::text("0123456789"), PutOptions::default())
        .await
        .unwrap();

    let err = input
        .get(GetOptions::no_wait().buffer_capacity(4))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MqError::Get(GetError::Truncated {
            message_length: 10,
            buffer_capacity: 4
        })
    ));
    assert_eq!(memory.queue_depth("APP.BIG"), Some(1));

    let received = input
        .get(
            GetOptions::no_wait()
                .buffer_capacity(4)
                .truncation(TruncationPolicy::Accept),
        )
        .await
        .unwrap();
    assert!(received.truncated);
    assert_eq!(received.original_length, 10);
    assert_eq!(received.message.payload.as_ref(), b"0123");
    assert_eq!(received.warning, Some(Warning::TruncatedMessageAccepted));
    assert_eq!(memory.queue_depth("APP.BIG"), Some(0));
}

#[tokio::test]
async fn test_browse_leaves_messages_queued() {
    let memory = embedded(&["APP.BROWSE"]);
    let connection = connected(&memory).await;
    let out = connection
        .open_queue("APP.BROWSE", OpenMode::Output)
        .await
        .unwrap();
    let browser = connection
        .open_queue("APP.BROWSE", OpenMode::Browse)
        .await
        .unwrap();
    for text in ["a", "b"] {
        out.put(Message::text(text), PutOptions::default())
            .await
            .unwrap();
    }

    let first = browser.get(GetOptions::no_wait()).await.unwrap();
    let second = browser.get(GetOptions::no_wait()).await.unwrap();
    assert_eq!(first.message.payload_str(), Some("a"));
    assert_eq!(second.message.payload_str(), Some("b"));
    assert!(browser.get(GetOptions::no_wait()).await.unwrap_err().is_no_message());

    let again = browser
        .get(GetOptions::no_wait().restart_browse())
        .await
        .unwrap();
    assert_eq!(again.message.payload_str(), Some("a"));
    assert_eq!(memory.queue_depth("APP.BROWSE"), Some(2));
}

#[tokio::test]
async fn test_put_to_input_handle_is_rejected() {
    let memory = embedded(&["APP.IN"]);
    let connection = connected(&memory).await;
    let input = connection.open_queue("APP.IN", OpenMode::Input).await.unwrap();
    let err = input
        .put(Message::text("x"), PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::Put(PutError::NotOpenForOutput { .. })));
}

#[tokio::test]
async fn test_concurrent_consumers_each_get_distinct_messages() {
    let memory = embedded(&["APP.WORK"]);
    let producer = connected(&memory).await;
    let out = producer.open_queue("APP.WORK", OpenMode::Output).await.unwrap();
    for i in 0..6 {
        out.put(Message::text(format!("job {i}")), PutOptions::default())
            .await
            .unwrap();
    }

    let mut consumers = Vec::new();
    for _ in 0..3 {
        let connection = connected(&memory).await;
        consumers.push(async move {
            let input = connection.open_queue("APP.WORK", OpenMode::Input).await.unwrap();
            let mut taken = Vec::new();
            while let Ok(received) = input.get(GetOptions::no_wait()).await {
                taken.push(received.message.payload_str().unwrap_or_default().to_string());
            }
            taken
        });
    }

    let mut all: Vec<String> = join_all(consumers).await.into_iter().flatten().collect();
    all.sort();
    assert_eq!(all.len(), 6);
    all.dedup();
    assert_eq!(all.len(), 6);
}
