use pagesync_core::blocks::{BlockKind, SyncedBlock, TextRun};
use pagesync_core::cache::SharedCache;
use pagesync_core::db::PageRecord;
use pagesync_core::format::LineFormatter;
use pagesync_core::remote::testing::{MockRemote, RemoteCall};
use pagesync_core::{EngineError, PageSource, Resolution, SyncEngine};
use std::sync::Arc;
use std::time::Duration;

fn paragraph(id: &str, text: &str) -> SyncedBlock {
    SyncedBlock::new(id, BlockKind::Paragraph, vec![TextRun::plain(text)])
}

fn lines(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn setup_engine(blocks: Vec<SyncedBlock>, ttl: Duration) -> (Arc<MockRemote>, SyncEngine) {
    let remote = Arc::new(MockRemote::new());
    remote.insert_page("page-1", "Roadmap", blocks);
    let cache = Arc::new(SharedCache::new());
    cache.init_in_memory().expect("cache init");
    let engine = SyncEngine::new(remote.clone(), cache, Arc::new(LineFormatter), ttl);
    (remote, engine)
}

fn fetch_count(remote: &MockRemote) -> usize {
    remote
        .calls()
        .iter()
        .filter(|call| matches!(call, RemoteCall::FetchChildren { .. }))
        .count()
}

#[tokio::test]
async fn second_open_is_served_from_cache() {
    let (remote, engine) = setup_engine(
        vec![paragraph("a", "one"), paragraph("b", "two")],
        Duration::from_secs(300),
    );

    let first = engine.open_page("page-1").await.expect("open");
    assert_eq!(first.source, PageSource::Remote);
    assert_eq!(engine.lines(first.handle).expect("lines"), lines(&["one", "two"]));
    engine.close(first.handle);

    let second = engine.open_page("page-1").await.expect("reopen");
    assert_eq!(second.source, PageSource::Cache);
    assert_eq!(engine.lines(second.handle).expect("lines"), lines(&["one", "two"]));
    assert_eq!(fetch_count(&remote), 1);

    let record = engine
        .cache()
        .with(|db| db.get_page("page-1"))
        .expect("get page")
        .expect("page row");
    assert_eq!(record.title, "Roadmap");
    assert_eq!(record.open_count, 2);
    let title = engine
        .with_session(second.handle, |session| session.page.title.clone())
        .expect("session");
    assert_eq!(title, "Roadmap");
}

#[tokio::test]
async fn expired_cache_goes_back_to_remote() {
    let (remote, engine) = setup_engine(vec![paragraph("a", "one")], Duration::ZERO);

    engine.open_page("page-1").await.expect("open");
    let again = engine.open_page("page-1").await.expect("reopen");

    assert_eq!(again.source, PageSource::Remote);
    assert_eq!(fetch_count(&remote), 2);
}

#[tokio::test]
async fn failed_fetch_closes_the_session() {
    let (remote, engine) = setup_engine(Vec::new(), Duration::from_secs(300));
    remote.fail_fetches(true);

    let err = engine.open_page("page-1").await.unwrap_err();
    assert!(matches!(err, EngineError::Remote(_)));
}

#[tokio::test]
async fn edit_then_sync_updates_remote_and_cache() {
    let (remote, engine) = setup_engine(
        vec![paragraph("a", "one"), paragraph("b", "two")],
        Duration::from_secs(300),
    );
    remote.push_created_ids(["b2", "c"]);
    let opened = engine.open_page("page-1").await.expect("open");

    // Paragraph to bullet is a type change: "b" is deleted and re-created.
    engine
        .edit(opened.handle, 1, 2, lines(&["- two", "three"]))
        .expect("edit");
    assert_eq!(
        engine.changed_since_cache(opened.handle).expect("changed").len(),
        2
    );

    let outcome = engine.sync(opened.handle).await.expect("sync");

    assert!(outcome.ok, "{:?}", outcome.errors);
    let stored = remote.children("page-1");
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[1].id, "b2");
    assert_eq!(stored[1].kind, BlockKind::BulletedListItem);
    assert_eq!(stored[2].id, "c");
    assert!(engine
        .changed_since_cache(opened.handle)
        .expect("changed")
        .is_empty());

    let cached = engine
        .cache()
        .with(|db| db.get_content("page-1"))
        .expect("content")
        .expect("cached");
    assert_eq!(cached.blocks, stored);
    assert_eq!(outcome.content_hash.as_deref(), Some(cached.content_hash.as_str()));
    let pushed = engine
        .cache()
        .with(|db| db.last_pushed_hash("page-1"))
        .expect("pushed");
    assert_eq!(pushed, outcome.content_hash);
}

#[tokio::test]
async fn refreshing_metadata_after_sync_keeps_cached_content() {
    let (_remote, engine) = setup_engine(vec![paragraph("a", "one")], Duration::from_secs(300));
    let opened = engine.open_page("page-1").await.expect("open");
    engine
        .edit(opened.handle, 1, 1, lines(&["two"]))
        .expect("edit");
    assert!(engine.sync(opened.handle).await.expect("sync").ok);

    engine
        .cache()
        .with(|db| db.save_page(&PageRecord::new("page-1", "Renamed")))
        .expect("save page");

    let (content, hashes) = engine
        .cache()
        .with(|db| Ok((db.get_content("page-1")?, db.block_hashes("page-1")?)))
        .expect("read cache");
    assert_eq!(content.expect("content").block_count, 2);
    assert_eq!(hashes.len(), 2);
}

#[tokio::test]
async fn divider_edits_are_reverted_and_not_synced() {
    let (remote, engine) = setup_engine(
        vec![
            paragraph("a", "one"),
            SyncedBlock::new("d", BlockKind::Divider, Vec::new()),
        ],
        Duration::from_secs(300),
    );
    let opened = engine.open_page("page-1").await.expect("open");

    let reverted = engine
        .edit(opened.handle, 1, 2, lines(&["-- -"]))
        .expect("edit");

    assert_eq!(reverted, vec!["d".to_string()]);
    assert_eq!(engine.lines(opened.handle).expect("lines"), lines(&["one", "---"]));
    assert!(engine.plan(opened.handle).expect("plan").is_empty());
    remote.clear_calls();
    assert!(engine.sync(opened.handle).await.expect("sync").ok);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn reload_finishing_after_close_is_dropped() {
    let (remote, engine) = setup_engine(vec![paragraph("a", "one")], Duration::from_secs(300));
    let opened = engine.open_page("page-1").await.expect("open");
    remote.delay("page-1", Duration::from_millis(30));

    let (result, closed) = tokio::join!(engine.reload(opened.handle), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.close(opened.handle)
    });

    assert!(closed);
    assert!(matches!(result, Err(EngineError::StaleSession)));
    assert!(matches!(
        engine.lines(opened.handle),
        Err(EngineError::StaleSession)
    ));
}

#[tokio::test]
async fn two_sessions_syncing_one_page_write_once() {
    let (remote, engine) = setup_engine(vec![paragraph("a", "one")], Duration::from_secs(300));
    let first = engine.open_page("page-1").await.expect("open");
    let second = engine.open_page("page-1").await.expect("open again");
    for handle in [first.handle, second.handle] {
        engine.edit(handle, 1, 1, lines(&["added"])).expect("edit");
    }
    remote.delay("page-1", Duration::from_millis(30));

    let (a, b) = tokio::join!(engine.sync(first.handle), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.sync(second.handle).await
    });

    let a = a.expect("first sync");
    let b = b.expect("second sync");
    assert!(a.ok, "{:?}", a.errors);
    assert!(!b.ok);
    assert!(b.errors[0].contains("in progress"));
    let texts: Vec<_> = remote
        .children("page-1")
        .iter()
        .map(|block| block.content.clone())
        .collect();
    assert_eq!(
        texts,
        vec![vec![TextRun::plain("one")], vec![TextRun::plain("added")]]
    );
}

#[tokio::test]
async fn reload_is_refused_while_a_sync_runs() {
    let (remote, engine) = setup_engine(vec![paragraph("a", "one")], Duration::from_secs(300));
    let opened = engine.open_page("page-1").await.expect("open");
    engine
        .edit(opened.handle, 0, 1, lines(&["changed"]))
        .expect("edit");
    remote.delay("a", Duration::from_millis(30));

    let (outcome, reloaded) = tokio::join!(engine.sync(opened.handle), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.reload(opened.handle).await
    });

    let outcome = outcome.expect("sync");
    assert!(outcome.ok, "{:?}", outcome.errors);
    assert!(matches!(reloaded, Err(EngineError::SyncInProgress(ref page)) if page == "page-1"));
    assert_eq!(engine.lines(opened.handle).expect("lines"), lines(&["changed"]));
    assert!(engine.plan(opened.handle).expect("plan").is_empty());

    engine.reload(opened.handle).await.expect("reload after sync");
    assert_eq!(engine.lines(opened.handle).expect("lines"), lines(&["changed"]));
}

#[tokio::test]
async fn older_reload_does_not_overwrite_a_newer_one() {
    let (remote, engine) = setup_engine(vec![paragraph("a", "one")], Duration::from_secs(300));
    let opened = engine.open_page("page-1").await.expect("open");
    remote.delay("page-1", Duration::from_millis(30));

    let (slow, fast) = tokio::join!(engine.reload(opened.handle), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        remote.delay("page-1", Duration::ZERO);
        engine.reload(opened.handle).await
    });

    fast.expect("newer reload");
    assert!(matches!(slow, Err(EngineError::Superseded)));
    assert_eq!(engine.lines(opened.handle).expect("lines"), lines(&["one"]));
}

#[tokio::test]
async fn ambiguous_duplicate_is_resolved_by_the_caller() {
    let (remote, engine) = setup_engine(
        vec![
            paragraph("a", "intro"),
            paragraph("b", "same"),
            paragraph("d", "same"),
        ],
        Duration::from_secs(300),
    );
    let opened = engine.open_page("page-1").await.expect("open");

    engine
        .edit(opened.handle, 1, 3, lines(&["same"]))
        .expect("edit");
    let mut plan = engine.plan(opened.handle).expect("plan");
    assert_eq!(plan.unmatched.len(), 1);
    assert_eq!(
        plan.unmatched[0].candidates,
        vec!["b".to_string(), "d".to_string()]
    );
    assert!(plan.deletes.is_empty());

    plan.resolve_unmatched(0, Resolution::Relink("d".to_string()))
        .expect("resolve");
    let outcome = engine.execute(opened.handle, plan).await;

    assert!(outcome.ok, "{:?}", outcome.errors);
    assert_eq!(outcome.unmatched, 0);
    let ids: Vec<_> = remote
        .children("page-1")
        .into_iter()
        .map(|block| block.id)
        .collect();
    assert_eq!(ids, vec!["a", "d"]);
    let relinked = engine
        .with_session(opened.handle, |session| {
            session.blocks()[1].id().map(str::to_string)
        })
        .expect("session");
    assert_eq!(relinked.as_deref(), Some("d"));
    assert!(engine.plan(opened.handle).expect("plan").is_empty());
}

#[tokio::test]
async fn unresolved_ambiguity_is_left_alone() {
    let (remote, engine) = setup_engine(
        vec![
            paragraph("a", "intro"),
            paragraph("b", "same"),
            paragraph("d", "same"),
        ],
        Duration::from_secs(300),
    );
    let opened = engine.open_page("page-1").await.expect("open");
    engine
        .edit(opened.handle, 1, 3, lines(&["same"]))
        .expect("edit");
    remote.clear_calls();

    let outcome = engine.sync(opened.handle).await.expect("sync");

    assert!(outcome.ok);
    assert_eq!(outcome.unmatched, 1);
    assert!(remote.calls().is_empty());
    assert_eq!(remote.children("page-1").len(), 3);
}
