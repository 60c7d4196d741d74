use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use codex_feed_stream::ChannelSource;
use codex_feed_stream::FeedError;
use codex_feed_stream::Notification;
use codex_feed_stream::PullIterator;
use codex_feed_stream::PullIteratorExt;
use codex_feed_stream::StreamIterator;
use feed_test_support::item_source;
use feed_test_support::scripted_source;
use pretty_assertions::assert_eq;
use tokio::time::timeout;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn for_each_sees_items_in_order() {
    let mut iterator = StreamIterator::new(item_source(1..=5));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let had_items = timeout(
        DEFAULT_READ_TIMEOUT,
        iterator.for_each(|item| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(item);
                Ok(())
            }
        }),
    )
    .await
    .expect("timeout")
    .expect("for_each");

    assert!(had_items);
    assert_eq!(vec![1, 2, 3, 4, 5], *seen.lock().unwrap());
    assert!(iterator.is_ended());
}

#[tokio::test]
async fn empty_source_reports_no_items() {
    let mut iterator = StreamIterator::new(item_source(Vec::<u32>::new()));
    let had_items = iterator.for_each(|_| async { Ok(()) }).await.unwrap();
    assert!(!had_items);
}

#[tokio::test]
async fn end_is_reported_once() {
    let mut iterator = StreamIterator::new(item_source(["only"]));
    assert!(matches!(
        iterator.next_notification().await,
        Some(Notification::Item("only"))
    ));
    assert!(matches!(iterator.next_notification().await, Some(Notification::End)));
    assert!(iterator.next_notification().await.is_none());
}

#[tokio::test]
async fn producer_waits_for_advance() {
    let (sender, source) = ChannelSource::new();
    let mut iterator = StreamIterator::new(source.boxed());

    let producer = tokio::spawn(async move {
        for item in 0..3 {
            if !sender.item(item).await {
                return;
            }
        }
        sender.end().await;
    });

    let Some(Notification::Item(first)) = iterator.next_notification().await else {
        panic!("expected an item");
    };
    assert_eq!(0, first);

    // Not advanced: at most the one buffered item may be queued, the producer
    // itself is parked.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());

    iterator.advance();
    let mut rest = Vec::new();
    while let Some(notification) = iterator.next_notification().await {
        if let Notification::Item(item) = notification {
            rest.push(item);
            iterator.advance();
        }
    }
    assert_eq!(vec![1, 2], rest);
    producer.await.unwrap();
}

#[tokio::test]
async fn source_error_fails_for_each_after_earlier_items() {
    let mut iterator = StreamIterator::new(scripted_source(vec![
        Notification::Item(1),
        Notification::Error(FeedError::transport("EACCES", "permission denied")),
        Notification::Item(2),
    ]));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let err = iterator
        .for_each(|item| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(item);
                Ok(())
            }
        })
        .await
        .expect_err("source error");

    assert_eq!(Some("EACCES"), err.code());
    assert_eq!(vec![1], *seen.lock().unwrap());
}

#[tokio::test]
async fn callback_error_stops_iteration() {
    let mut iterator = StreamIterator::new(item_source(1..=3));
    let err = iterator
        .for_each(|item| async move {
            if item == 2 {
                anyhow::bail!("cannot handle {item}");
            }
            Ok(())
        })
        .await
        .expect_err("callback error");

    assert!(matches!(err, FeedError::Callback(_)));
    assert_eq!("cannot handle 2", err.to_string());
}

#[tokio::test]
async fn abort_from_callback_resolves_cleanly() {
    let mut iterator = StreamIterator::new(item_source(1..=10));
    let handle = iterator.abort_handle();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let had_items = iterator
        .for_each(|item| {
            let seen = Arc::clone(&seen);
            let handle = handle.clone();
            async move {
                seen.lock().unwrap().push(item);
                if item == 2 {
                    handle.abort();
                }
                Ok(())
            }
        })
        .await
        .unwrap();

    assert!(had_items);
    assert_eq!(vec![1, 2], *seen.lock().unwrap());
}

#[tokio::test]
async fn abort_without_source_ends() {
    let mut iterator = StreamIterator::<u32>::default();
    let handle = iterator.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();
    });

    let next = timeout(DEFAULT_READ_TIMEOUT, iterator.next_notification())
        .await
        .expect("timeout");
    assert!(matches!(next, Some(Notification::End)));
}

#[tokio::test]
async fn throttled_serial_keeps_order_and_spacing() {
    let mut iterator = StreamIterator::new(item_source(1..=4));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let started = tokio::time::Instant::now();

    let had_items = iterator
        .for_each_throttled(
            |item| {
                let seen = Arc::clone(&seen);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    seen.lock().unwrap().push(item);
                    Ok(())
                }
            },
            1,
        )
        .await
        .unwrap();

    assert!(had_items);
    assert_eq!(vec![1, 2, 3, 4], *seen.lock().unwrap());
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn throttled_limit_bounds_concurrency() {
    let mut iterator = StreamIterator::new(item_source(0..12));
    let active = Arc::new(Mutex::new((0usize, 0usize)));

    iterator
        .for_each_throttled(
            |_| {
                let active = Arc::clone(&active);
                async move {
                    {
                        let mut counts = active.lock().unwrap();
                        counts.0 += 1;
                        counts.1 = counts.1.max(counts.0);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.lock().unwrap().0 -= 1;
                    Ok(())
                }
            },
            3,
        )
        .await
        .unwrap();

    let (now, peak) = *active.lock().unwrap();
    assert_eq!(0, now);
    assert!(peak <= 3, "peak concurrency {peak}");
    assert!(peak >= 2, "callbacks never overlapped");
}

#[tokio::test]
async fn throttled_reports_first_callback_error_after_all_settle() {
    let mut iterator = StreamIterator::new(item_source(1..=5));
    let finished = Arc::new(Mutex::new(Vec::new()));

    let err = iterator
        .for_each_throttled(
            |item| {
                let finished = Arc::clone(&finished);
                async move {
                    if item == 1 {
                        anyhow::bail!("item {item} rejected");
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    finished.lock().unwrap().push(item);
                    Ok(())
                }
            },
            2,
        )
        .await
        .expect_err("callback failure");

    assert_eq!("item 1 rejected", err.to_string());
    assert!(!finished.lock().unwrap().contains(&5));
}

#[tokio::test]
async fn piped_iterator_pulls_through() {
    let upstream = StreamIterator::new(item_source(["a", "b", "c"]));
    let mut downstream: StreamIterator<&str> = upstream.pipe(StreamIterator::default());

    let mut seen = Vec::new();
    while let Some(notification) = downstream.next_notification().await {
        if let Notification::Item(item) = notification {
            seen.push(item);
            downstream.advance();
        }
    }
    assert_eq!(vec!["a", "b", "c"], seen);
}
