//! End-to-end pipeline tests against fake collaborators
//!
//! Jobs are driven by hand through `Worker::run_once`, so every test is deterministic.

mod common;

use common::*;
use issue_courier::collaborators::Delivery;
use issue_courier::db::Item;
use issue_courier::queue::{EnqueueOptions, Job};
use issue_courier::worker::JobOutcome;
use issue_courier::{ItemId, ItemState, LinkStatus, Query, TaskStatus};

const BODY: &[u8] = b"%PDF-1.7 weekly issue body";

async fn items(h: &Harness) -> Vec<Item> {
    h.courier
        .query_items(&Query::new().order_by("id", false))
        .await
        .unwrap()
}

/// Seed one discoverable, resolvable, downloadable weekly issue
fn seed_weekly(h: &Harness, n: u32) -> String {
    let detail = format!("https://source.test/weekly/{n}");
    let url = format!("https://cdn.test/weekly/{n}.pdf");
    h.source.set_resolution(&detail, &url);
    h.transport.set(
        &url,
        Behavior::Serve {
            body: BODY.to_vec(),
            chunk: 5,
        },
    );
    detail
}

#[tokio::test]
async fn discover_is_idempotent() {
    let h = harness().await;
    let d1 = seed_weekly(&h, 1);
    let d2 = seed_weekly(&h, 2);
    h.source.set_page(
        "weekly",
        1,
        vec![
            draft("Weekly 1", None, date(2024, 2, 1), &d1),
            draft("Weekly 2", None, date(2024, 2, 8), &d2),
            draft("No detail page", None, date(2024, 2, 8), ""),
        ],
    );

    h.courier.enqueue_discover("weekly", 1).await.unwrap();
    drain(&h.courier).await;
    let first = items(&h).await;
    assert_eq!(first.len(), 2);

    h.courier.enqueue_discover("weekly", 1).await.unwrap();
    let outcomes = drain(&h.courier).await;
    // Only the discover job itself runs: both items are already resolved
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].1, JobOutcome::Succeeded);

    let second = items(&h).await;
    assert_eq!(second.len(), 2);
    assert_eq!(
        second.iter().map(|i| &i.detail_ref).collect::<Vec<_>>(),
        first.iter().map(|i| &i.detail_ref).collect::<Vec<_>>()
    );
    assert_eq!(h.source.resolves(), 2);
}

#[tokio::test]
async fn discovered_titles_are_classified_into_series() {
    let h = harness().await;
    h.source.set_page(
        "weekly",
        1,
        vec![
            draft("The Monthly Review", None, date(2024, 2, 1), "d-monthly"),
            draft("Weekly 3", None, date(2024, 2, 1), "d-weekly"),
            draft("Explicit", Some("special"), date(2024, 2, 1), "d-special"),
        ],
    );

    h.courier.enqueue_discover("weekly", 1).await.unwrap();
    h.courier.worker().run_once().await.unwrap().unwrap();

    let series: Vec<String> = items(&h).await.into_iter().map(|i| i.series).collect();
    assert_eq!(series, vec!["monthly", "weekly", "special"]);
}

#[tokio::test]
async fn full_pipeline_links_downloads_and_distributes() {
    let h = harness().await;
    let old = seed_weekly(&h, 1);
    let new = seed_weekly(&h, 2);

    let sub = h.courier.create_subscriber("reader@example.com").await.unwrap();
    h.courier
        .add_subscription(sub, "weekly", Some(date(2024, 1, 1)))
        .await
        .unwrap();

    h.source.set_page(
        "weekly",
        1,
        vec![
            draft("Weekly 1", None, date(2023, 12, 1), &old),
            draft("Weekly 2", None, date(2024, 2, 1), &new),
        ],
    );
    h.courier.enqueue_discover("weekly", 1).await.unwrap();
    let outcomes = drain(&h.courier).await;
    // discover + 2 fetch_detail + 2 download
    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(|(_, o)| *o == JobOutcome::Succeeded));

    let all = items(&h).await;
    for item in &all {
        assert_eq!(item.byte_size, BODY.len() as i64);
        assert_eq!(item.format.as_deref(), Some("pdf"));
        let on_disk = std::fs::read(item.local_path.as_deref().unwrap()).unwrap();
        assert_eq!(on_disk, BODY);
    }

    let links = h.courier.links_for_subscriber(sub).await.unwrap();
    let status_of = |id: ItemId| links.iter().find(|l| l.item_id == id).unwrap().status;
    // Published before the subscription started: never sent
    assert_eq!(status_of(all[0].id), LinkStatus::Distributed);
    assert_eq!(status_of(all[1].id), LinkStatus::Downloaded);

    h.courier
        .enqueue(&Job::SweepDistribute, EnqueueOptions::default())
        .await
        .unwrap();
    let outcomes = drain(&h.courier).await;
    assert_eq!(outcomes.len(), 2);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "reader@example.com");
    assert_eq!(sent[0].subject, "New issue: Weekly 2");
    assert_eq!(sent[0].entries.len(), 1);
    assert!(matches!(
        &sent[0].entries[0].delivery,
        Delivery::Attachment { mime_type, .. } if mime_type == "application/pdf"
    ));

    let links = h.courier.links_for_subscriber(sub).await.unwrap();
    assert!(links.iter().all(|l| l.status == LinkStatus::Distributed));
    assert_eq!(
        h.courier.item_state(all[1].id).await.unwrap(),
        ItemState::Distributed
    );

    // Nothing left to send
    h.courier
        .enqueue(&Job::SweepDistribute, EnqueueOptions::default())
        .await
        .unwrap();
    drain(&h.courier).await;
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn fetch_detail_is_noop_when_resolved() {
    let h = harness().await;
    let db = h.courier.db();
    let (item, _) = db
        .upsert_item("Weekly 1", "weekly", date(2024, 2, 1), "d-1")
        .await
        .unwrap();
    db.set_resource_ref(item.id, "https://cdn.test/already.pdf")
        .await
        .unwrap();

    let job = h.courier.enqueue_fetch_detail(item.id).await.unwrap();
    let outcomes = drain(&h.courier).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(h.source.resolves(), 0);

    let task = h.courier.get_task(job.job_id()).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.result.as_deref(), Some(r#"{"outcome":"already_resolved"}"#));
}

#[tokio::test]
async fn download_is_noop_when_file_present() {
    let h = harness().await;
    let db = h.courier.db();
    let (item, _) = db
        .upsert_item("Weekly 1", "weekly", date(2024, 2, 1), "d-1")
        .await
        .unwrap();
    db.set_resource_ref(item.id, "https://cdn.test/1.pdf").await.unwrap();
    db.mark_downloaded(item.id, "/elsewhere/1.pdf", 500, "pdf")
        .await
        .unwrap();

    h.courier.enqueue_download(item.id).await.unwrap();
    drain(&h.courier).await;
    assert_eq!(h.transport.total_calls(), 0);
    assert_eq!(
        db.get_item(item.id).await.unwrap().unwrap().local_path.as_deref(),
        Some("/elsewhere/1.pdf")
    );
}

#[tokio::test]
async fn stale_empty_file_is_replaced() {
    let h = harness().await;
    let db = h.courier.db();
    let (item, _) = db
        .upsert_item("Weekly 1", "weekly", date(2024, 2, 1), "d-1")
        .await
        .unwrap();
    let url = "https://cdn.test/weekly/1.pdf";
    db.set_resource_ref(item.id, url).await.unwrap();
    h.transport.set(
        url,
        Behavior::Serve {
            body: BODY.to_vec(),
            chunk: 3,
        },
    );

    let target = h
        .dir
        .path()
        .join("downloads")
        .join("weekly")
        .join(format!("{}-weekly-1.pdf", item.id));
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(&target, b"").unwrap();

    h.courier.enqueue_download(item.id).await.unwrap();
    let outcomes = drain(&h.courier).await;
    assert_eq!(outcomes[0].1, JobOutcome::Succeeded);

    let stored = db.get_item(item.id).await.unwrap().unwrap();
    assert_eq!(stored.byte_size, BODY.len() as i64);
    assert_eq!(stored.local_path.as_deref(), Some(target.to_str().unwrap()));
    assert_eq!(std::fs::read(&target).unwrap(), BODY);
}

#[tokio::test]
async fn failed_download_leaves_no_file() {
    let h = harness().await;
    let db = h.courier.db();
    let (item, _) = db
        .upsert_item("Weekly 1", "weekly", date(2024, 2, 1), "d-1")
        .await
        .unwrap();
    let url = "https://cdn.test/weekly/1.pdf";
    db.set_resource_ref(item.id, url).await.unwrap();
    h.transport.set(
        url,
        Behavior::BreakAfter {
            sent: BODY[..8].to_vec(),
            declared: BODY.len() as u64,
        },
    );

    h.courier.enqueue_download(item.id).await.unwrap();
    let (_, outcome) = h.courier.worker().run_once().await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::Retrying { .. }));

    let target = h
        .dir
        .path()
        .join("downloads")
        .join("weekly")
        .join(format!("{}-weekly-1.pdf", item.id));
    assert!(!target.exists());
    assert_eq!(db.get_item(item.id).await.unwrap().unwrap().byte_size, 0);
}

#[tokio::test]
async fn failed_send_flips_nothing() {
    let h = harness().await;
    let db = h.courier.db();
    let sub = h.courier.create_subscriber("reader@example.com").await.unwrap();
    h.courier
        .add_subscription(sub, "weekly", Some(date(2024, 1, 1)))
        .await
        .unwrap();

    let file = h.dir.path().join("1.pdf");
    std::fs::write(&file, BODY).unwrap();
    let (item, _) = db
        .upsert_item("Weekly 1", "weekly", date(2024, 2, 1), "d-1")
        .await
        .unwrap();
    h.courier.reconcile_now(sub).await.unwrap();
    db.mark_downloaded(item.id, file.to_str().unwrap(), BODY.len() as i64, "pdf")
        .await
        .unwrap();

    h.notifier.reject(true);
    h.courier
        .enqueue_distribute(vec![item.id], "reader@example.com")
        .await
        .unwrap();
    let (_, outcome) = h.courier.worker().run_once().await.unwrap().unwrap();
    assert!(matches!(outcome, JobOutcome::Retrying { .. }));
    assert_eq!(
        db.get_link(sub, item.id).await.unwrap().unwrap().status,
        LinkStatus::Downloaded
    );

    // The retried attempt goes through once the notifier recovers
    h.notifier.reject(false);
    let (_, outcome) = h.courier.worker().run_once().await.unwrap().unwrap();
    assert_eq!(outcome, JobOutcome::Succeeded);
    assert_eq!(
        db.get_link(sub, item.id).await.unwrap().unwrap().status,
        LinkStatus::Distributed
    );
}

#[tokio::test]
async fn distribute_skips_items_without_files() {
    let h = harness().await;
    let db = h.courier.db();
    let sub = h.courier.create_subscriber("reader@example.com").await.unwrap();
    h.courier
        .add_subscription(sub, "weekly", Some(date(2024, 1, 1)))
        .await
        .unwrap();

    let file = h.dir.path().join("1.pdf");
    std::fs::write(&file, BODY).unwrap();
    let (ready, _) = db
        .upsert_item("Weekly 1", "weekly", date(2024, 2, 1), "d-1")
        .await
        .unwrap();
    let (pending, _) = db
        .upsert_item("Weekly 2", "weekly", date(2024, 2, 8), "d-2")
        .await
        .unwrap();
    h.courier.reconcile_now(sub).await.unwrap();
    db.mark_downloaded(ready.id, file.to_str().unwrap(), BODY.len() as i64, "pdf")
        .await
        .unwrap();

    h.courier
        .enqueue_distribute(vec![ready.id, pending.id], "reader@example.com")
        .await
        .unwrap();
    drain(&h.courier).await;

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].entries.len(), 1);
    assert_eq!(sent[0].entries[0].title, "Weekly 1");
    assert_eq!(
        db.get_link(sub, ready.id).await.unwrap().unwrap().status,
        LinkStatus::Distributed
    );
    assert_eq!(
        db.get_link(sub, pending.id).await.unwrap().unwrap().status,
        LinkStatus::Pending
    );
}

#[tokio::test]
async fn large_files_are_sent_as_links() {
    let h = harness_with(|c| c.distribution.attachment_size_limit = 4).await;
    let db = h.courier.db();
    let file = h.dir.path().join("big.pdf");
    std::fs::write(&file, BODY).unwrap();
    let (item, _) = db
        .upsert_item("Weekly 1", "weekly", date(2024, 2, 1), "d-1")
        .await
        .unwrap();
    db.mark_downloaded(item.id, file.to_str().unwrap(), BODY.len() as i64, "pdf")
        .await
        .unwrap();

    h.courier
        .enqueue_distribute(vec![item.id], "reader@example.com")
        .await
        .unwrap();
    drain(&h.courier).await;

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0].entries[0].delivery {
        Delivery::Link {
            url,
            expires_in_secs,
            ..
        } => {
            assert!(url.starts_with("https://store.test/big.pdf"));
            assert_eq!(*expires_in_secs, 7 * 24 * 3600);
        }
        other => panic!("expected a link, got {other:?}"),
    }
    assert_eq!(h.store.uploads.lock().unwrap().len(), 1);
}

/// A downloaded weekly issue whose body packs down well
async fn downloaded_compressible(h: &Harness) -> (Item, Vec<u8>) {
    let db = h.courier.db();
    let body = b"%PDF-1.7 weekly issue body ".repeat(400);
    let dir = h.dir.path().join("downloads");
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("1-weekly-1.pdf");
    std::fs::write(&file, &body).unwrap();
    let (item, _) = db
        .upsert_item("Weekly 1", "weekly", date(2024, 2, 1), "d-1")
        .await
        .unwrap();
    db.mark_downloaded(item.id, file.to_str().unwrap(), body.len() as i64, "pdf")
        .await
        .unwrap();
    (db.get_item(item.id).await.unwrap().unwrap(), body)
}

#[tokio::test]
async fn compress_sweep_packs_downloaded_pdfs_once() {
    let h = harness().await;
    let (item, body) = downloaded_compressible(&h).await;

    h.courier
        .enqueue(&Job::SweepCompress, EnqueueOptions::default())
        .await
        .unwrap();
    let outcomes = drain(&h.courier).await;
    assert_eq!(outcomes.len(), 2);

    let packed = h.courier.db().get_item(item.id).await.unwrap().unwrap();
    assert!(packed.is_compressed());
    assert!(packed.compressed_size < body.len() as i64);
    let archive = packed.compressed_path.clone().unwrap();
    assert!(archive.ends_with("1-weekly-1.7z"));
    assert_eq!(
        std::fs::metadata(&archive).unwrap().len() as i64,
        packed.compressed_size
    );
    assert!(!std::path::Path::new(&format!("{archive}.part")).exists());

    // Already packed: the sweep finds nothing and a direct job is a no-op
    h.courier
        .enqueue(&Job::SweepCompress, EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(drain(&h.courier).await.len(), 1);
    h.courier.enqueue_compress(item.id).await.unwrap();
    drain(&h.courier).await;
    let again = h.courier.db().get_item(item.id).await.unwrap().unwrap();
    assert_eq!(again.compressed_size, packed.compressed_size);
}

#[tokio::test]
async fn compress_skips_ineligible_formats() {
    let h = harness_with(|c| c.compression.formats = vec!["epub".into()]).await;
    let (item, _) = downloaded_compressible(&h).await;

    h.courier
        .enqueue(&Job::SweepCompress, EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(drain(&h.courier).await.len(), 1);

    h.courier.enqueue_compress(item.id).await.unwrap();
    drain(&h.courier).await;
    let item = h.courier.db().get_item(item.id).await.unwrap().unwrap();
    assert!(!item.is_compressed());
}

#[tokio::test]
async fn compressed_size_decides_attachment_over_link() {
    // Original is ~10 KiB; the archive is far below the limit
    let h = harness_with(|c| c.distribution.attachment_size_limit = 2048).await;
    let (item, body) = downloaded_compressible(&h).await;
    assert!(body.len() > 2048);

    h.courier.enqueue_compress(item.id).await.unwrap();
    drain(&h.courier).await;
    let packed = h.courier.db().get_item(item.id).await.unwrap().unwrap();

    h.courier
        .enqueue_distribute(vec![item.id], "reader@example.com")
        .await
        .unwrap();
    drain(&h.courier).await;

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    let entry = &sent[0].entries[0];
    assert_eq!(entry.byte_size, packed.compressed_size);
    match &entry.delivery {
        Delivery::Attachment {
            file_name,
            mime_type,
            ..
        } => {
            assert_eq!(file_name, "1-weekly-1.7z");
            assert_eq!(mime_type, "application/x-7z-compressed");
        }
        other => panic!("expected an attachment, got {other:?}"),
    }
    assert!(h.store.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn removing_a_subscription_drops_its_links() {
    let h = harness().await;
    let db = h.courier.db();
    db.upsert_item("Weekly 1", "weekly", date(2024, 2, 1), "w-1")
        .await
        .unwrap();
    db.upsert_item("Monthly 1", "monthly", date(2024, 2, 1), "m-1")
        .await
        .unwrap();

    let sub = h.courier.create_subscriber("reader@example.com").await.unwrap();
    for series in ["weekly", "monthly"] {
        h.courier
            .add_subscription(sub, series, Some(date(2024, 1, 1)))
            .await
            .unwrap();
    }
    assert_eq!(h.courier.links_for_subscriber(sub).await.unwrap().len(), 2);

    assert_eq!(
        h.courier.remove_subscription(sub, "weekly").await.unwrap(),
        Some(1)
    );
    let links = h.courier.links_for_subscriber(sub).await.unwrap();
    assert_eq!(links.len(), 1);

    // Reconciliation does not bring it back
    let report = h.courier.reconcile_now(sub).await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.removed, 0);
}

#[tokio::test]
async fn trigger_entry_points_validate_input() {
    let h = harness().await;

    assert!(matches!(
        h.courier.enqueue_discover("unknown", 1).await,
        Err(issue_courier::Error::Validation(_))
    ));
    assert!(matches!(
        h.courier.enqueue_download(ItemId(42)).await,
        Err(issue_courier::Error::Validation(_))
    ));
    assert!(matches!(
        h.courier.enqueue_distribute(vec![ItemId(1)], "  ").await,
        Err(issue_courier::Error::Validation(_))
    ));
    assert!(matches!(
        h.courier.add_subscription(issue_courier::SubscriberId(1), "unknown", None).await,
        Err(issue_courier::Error::Validation(_))
    ));
}
