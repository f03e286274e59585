//! Behaviour every `DocStorage` backend must show, run by each backend's tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use doc_storage_core::{
    now_timestamp, timestamp_from_millis, DocRecord, DocStorage, DocUpdate, DocUpdateEvent,
};

pub async fn push_and_read(storage: Arc<dyn DocStorage>) {
    let first = storage
        .push_doc_update(DocUpdate::new("doc", vec![1]).with_editor("alice"), None)
        .await
        .unwrap();
    let second = storage
        .push_doc_update(DocUpdate::new("doc", vec![2]), None)
        .await
        .unwrap();
    assert!(second.timestamp > first.timestamp);

    let updates = storage.get_doc_updates("doc").await.unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].bin, vec![1]);
    assert_eq!(updates[0].editor.as_deref(), Some("alice"));
    assert_eq!(updates[1].timestamp, second.timestamp);

    let clock = storage.get_doc_timestamp("doc").await.unwrap().unwrap();
    assert_eq!(clock.timestamp, second.timestamp);
    assert!(storage.get_doc_updates("missing").await.unwrap().is_empty());
}

/// Pushes racing on one document get unique, strictly increasing timestamps.
pub async fn concurrent_pushes(storage: Arc<dyn DocStorage>) {
    const TASKS: usize = 8;
    const PUSHES: usize = 5;

    let handles: Vec<_> = (0..TASKS)
        .map(|task| {
            let storage = storage.clone();
            tokio::spawn(async move {
                let mut clocks = Vec::new();
                for i in 0..PUSHES {
                    let clock = storage
                        .push_doc_update(DocUpdate::new("doc", vec![task as u8, i as u8]), None)
                        .await
                        .unwrap();
                    clocks.push(clock.timestamp);
                }
                clocks
            })
        })
        .collect();

    let mut allocated = Vec::new();
    for result in futures::future::join_all(handles).await {
        let clocks = result.unwrap();
        assert!(clocks.windows(2).all(|w| w[0] < w[1]));
        allocated.extend(clocks);
    }

    let unique: HashSet<_> = allocated.iter().collect();
    assert_eq!(unique.len(), TASKS * PUSHES);

    let stored = storage.get_doc_updates("doc").await.unwrap();
    assert_eq!(stored.len(), TASKS * PUSHES);
    assert!(stored.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

/// A snapshot imported with a future timestamp pushes later updates past it.
pub async fn push_after_future_snapshot(storage: Arc<dyn DocStorage>) {
    let future = now_timestamp() + chrono::Duration::seconds(3600);
    assert!(storage
        .set_doc_snapshot(&DocRecord::new("doc", vec![9], future))
        .await
        .unwrap());

    let clock = storage
        .push_doc_update(DocUpdate::new("doc", vec![1]), None)
        .await
        .unwrap();
    assert!(clock.timestamp > future);
}

pub async fn snapshot_monotonic(storage: Arc<dyn DocStorage>) {
    let at_5 = DocRecord::new("doc", vec![5], timestamp_from_millis(5));
    let at_3 = DocRecord::new("doc", vec![3], timestamp_from_millis(3));

    assert!(storage.set_doc_snapshot(&at_5).await.unwrap());
    assert!(!storage.set_doc_snapshot(&at_3).await.unwrap());
    assert!(!storage.set_doc_snapshot(&at_5).await.unwrap());

    let snapshot = storage.get_doc_snapshot("doc").await.unwrap().unwrap();
    assert_eq!(snapshot.timestamp, timestamp_from_millis(5));
    assert_eq!(snapshot.bin, vec![5]);

    // Accepted snapshots advance the clock.
    let clock = storage.get_doc_timestamp("doc").await.unwrap().unwrap();
    assert_eq!(clock.timestamp, timestamp_from_millis(5));
}

pub async fn timestamps_after(storage: Arc<dyn DocStorage>) {
    storage
        .set_doc_snapshot(&DocRecord::new("A", vec![1], timestamp_from_millis(10)))
        .await
        .unwrap();
    storage
        .set_doc_snapshot(&DocRecord::new("B", vec![2], timestamp_from_millis(20)))
        .await
        .unwrap();

    let after = storage
        .get_doc_timestamps(Some(timestamp_from_millis(15)))
        .await
        .unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after.get("B"), Some(&timestamp_from_millis(20)));

    let all = storage.get_doc_timestamps(None).await.unwrap();
    assert_eq!(all.len(), 2);

    let none = storage
        .get_doc_timestamps(Some(timestamp_from_millis(20)))
        .await
        .unwrap();
    assert!(none.is_empty());
}

pub async fn mark_merged_and_counts(storage: Arc<dyn DocStorage>) {
    for i in 0..3u8 {
        storage
            .push_doc_update(DocUpdate::new("a", vec![i]), None)
            .await
            .unwrap();
    }
    storage
        .push_doc_update(DocUpdate::new("b", vec![0]), None)
        .await
        .unwrap();

    let mut counts = storage.pending_update_counts().await.unwrap();
    counts.sort_by(|x, y| x.doc_id.cmp(&y.doc_id));
    assert_eq!(counts.len(), 2);
    assert_eq!((counts[0].doc_id.as_str(), counts[0].count), ("a", 3));
    assert_eq!((counts[1].doc_id.as_str(), counts[1].count), ("b", 1));
    assert!(counts.iter().all(|c| c.space_id == storage.space_id()));

    let updates = storage.get_doc_updates("a").await.unwrap();
    let merged = storage.mark_updates_merged("a", &updates[..2]).await.unwrap();
    assert_eq!(merged, 2);
    assert_eq!(storage.get_update_count("a").await.unwrap(), 1);

    // Marking twice is harmless.
    assert_eq!(storage.mark_updates_merged("a", &updates[..2]).await.unwrap(), 0);

    storage.mark_updates_merged("b", &storage.get_doc_updates("b").await.unwrap()).await.unwrap();
    let counts = storage.pending_update_counts().await.unwrap();
    assert_eq!(counts.len(), 1);

    // The clock survives the reap.
    assert!(storage.get_doc_timestamp("b").await.unwrap().is_some());
}

pub async fn delete_doc(storage: Arc<dyn DocStorage>) {
    storage
        .push_doc_update(DocUpdate::new("doc", vec![1]), None)
        .await
        .unwrap();
    storage
        .set_doc_snapshot(&DocRecord::new("doc", vec![0], timestamp_from_millis(1)))
        .await
        .unwrap();
    storage
        .push_doc_update(DocUpdate::new("keep", vec![1]), None)
        .await
        .unwrap();

    storage.delete_doc("doc").await.unwrap();

    assert!(storage.get_doc_updates("doc").await.unwrap().is_empty());
    assert!(storage.get_doc_snapshot("doc").await.unwrap().is_none());
    assert!(storage.get_doc_timestamp("doc").await.unwrap().is_none());
    assert_eq!(storage.get_update_count("keep").await.unwrap(), 1);

    // Deleting a missing document is fine.
    storage.delete_doc("doc").await.unwrap();
}

pub async fn subscribers_see_pushes(storage: Arc<dyn DocStorage>) {
    let seen = Arc::new(AtomicU64::new(0));
    let last_origin = Arc::new(std::sync::Mutex::new(None));

    let counter = seen.clone();
    let origin = last_origin.clone();
    let subscription = storage.subscribe_doc_update(Arc::new(move |event: &DocUpdateEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
        *origin.lock().unwrap() = event.origin.clone();
    }));

    storage
        .push_doc_update(DocUpdate::new("doc", vec![1]), Some("tabA"))
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(last_origin.lock().unwrap().as_deref(), Some("tabA"));

    subscription.unsubscribe();
    storage
        .push_doc_update(DocUpdate::new("doc", vec![2]), None)
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

/// Reaping on one instance while another keeps pushing never drops an acknowledged
/// update: each one is either reaped after being read or still pending.
pub async fn reaping_keeps_concurrent_pushes(
    writer: Arc<dyn DocStorage>,
    reaper: Arc<dyn DocStorage>,
    pushes: usize,
) {
    let finished = Arc::new(AtomicBool::new(false));
    let pusher = {
        let finished = finished.clone();
        tokio::spawn(async move {
            let mut acked = Vec::new();
            for i in 0..pushes {
                let clock = writer
                    .push_doc_update(DocUpdate::new("doc", (i as u32).to_be_bytes().to_vec()), None)
                    .await
                    .unwrap();
                acked.push(clock.timestamp);
            }
            finished.store(true, Ordering::SeqCst);
            acked
        })
    };

    let mut reaped = HashSet::new();
    loop {
        let last_pass = finished.load(Ordering::SeqCst);
        let updates = reaper.get_doc_updates("doc").await.unwrap();
        if !updates.is_empty() {
            let removed = reaper.mark_updates_merged("doc", &updates).await.unwrap();
            assert_eq!(removed as usize, updates.len());
            reaped.extend(updates.iter().map(|u| u.timestamp));
        }
        if last_pass {
            break;
        }
        tokio::task::yield_now().await;
    }

    let acked = pusher.await.unwrap();
    let pending = reaper.get_doc_updates("doc").await.unwrap();
    assert!(pending.is_empty());
    assert_eq!(reaped.len(), pushes);
    assert!(acked.iter().all(|ts| reaped.contains(ts)));
}
