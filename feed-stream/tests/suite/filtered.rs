use std::sync::Arc;
use std::sync::Mutex;

use codex_feed_stream::BindSource;
use codex_feed_stream::FeedError;
use codex_feed_stream::Filter;
use codex_feed_stream::FilteredStreamIterator;
use codex_feed_stream::PullIterator;
use codex_feed_stream::PullIteratorExt;
use codex_feed_stream::StreamIterator;
use feed_test_support::item_source;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn skips_and_transforms() {
    let upstream = StreamIterator::new(item_source(1..=6));
    let mut evens = FilteredStreamIterator::from_fn(upstream, |n: u32| {
        Ok(if n % 2 == 0 {
            Filter::Keep(format!("#{n}"))
        } else {
            Filter::Skip
        })
    });
    let seen = Arc::new(Mutex::new(Vec::new()));

    let had_items = evens
        .for_each(|label| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(label);
                Ok(())
            }
        })
        .await
        .unwrap();

    assert!(had_items);
    assert_eq!(vec!["#2", "#4", "#6"], *seen.lock().unwrap());
}

#[tokio::test]
async fn async_transform_with_option() {
    let upstream = StreamIterator::new(item_source(["keep", "drop", "keep"]));
    let mut filtered = FilteredStreamIterator::new(upstream, |word: &'static str| async move {
        tokio::task::yield_now().await;
        Ok(Filter::from((word == "keep").then_some(word.len())))
    });
    let seen = Arc::new(Mutex::new(Vec::new()));

    filtered
        .for_each(|len| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(len);
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(vec![4, 4], *seen.lock().unwrap());
}

#[tokio::test]
async fn everything_skipped_means_no_items() {
    let upstream = StreamIterator::new(item_source(1..=3));
    let mut none = FilteredStreamIterator::from_fn(upstream, |_: u32| Ok(Filter::<u32>::Skip));
    let had_items = none.for_each(|_| async { Ok(()) }).await.unwrap();
    assert!(!had_items);
}

#[tokio::test]
async fn transform_failure_is_a_callback_error() {
    let upstream = StreamIterator::new(item_source(1..=3));
    let mut failing = FilteredStreamIterator::from_fn(upstream, |n: u32| {
        if n == 2 {
            anyhow::bail!("bad item {n}");
        }
        Ok(Filter::Keep(n))
    });

    let err = failing
        .for_each(|_| async { Ok(()) })
        .await
        .expect_err("transform failure");
    assert!(matches!(err, FeedError::Callback(_)));
    assert_eq!("bad item 2", err.to_string());
}

#[tokio::test]
async fn binding_a_filter_binds_its_upstream() {
    let mut passthrough = FilteredStreamIterator::passthrough(StreamIterator::<&str>::default());
    passthrough.set_source(item_source(["x", "y"]));
    let seen = Arc::new(Mutex::new(Vec::new()));

    passthrough
        .for_each(|item| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(item);
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(vec!["x", "y"], *seen.lock().unwrap());
}

#[tokio::test]
async fn abort_passes_to_upstream() {
    let upstream = StreamIterator::new(item_source(1..=100));
    let mut filtered = FilteredStreamIterator::passthrough(upstream);
    let handle = filtered.abort_handle();
    let count = Arc::new(Mutex::new(0));

    filtered
        .for_each(|_| {
            let count = Arc::clone(&count);
            let handle = handle.clone();
            async move {
                *count.lock().unwrap() += 1;
                handle.abort();
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(1, *count.lock().unwrap());
    assert!(filtered.into_inner().is_ended());
}
