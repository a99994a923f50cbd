//! Coordinator operations beyond a plain pass: multi-output digesters,
//! contract violations, panics, blobs, removal, rename, explicit reset and
//! the ordered read API.

#[cfg(test)]
mod tests {
  use std::sync::atomic::Ordering;

  use pretty_assertions::assert_eq;

  use crate::{
    db::DigestStore,
    digest::{
      CascadeTable, CoordinatorError, DigestCoordinator, ProcessOptions, ProcessOutcome,
      __tests__::helpers::{DigestTestContext, Scripted, registry, summary},
    },
    domain::digest::{BinaryPayload, DigestContent, DigestOutput, DigestRecord, DigestStatus},
  };

  fn crawler() -> Scripted {
    Scripted::new("url-crawl")
      .outputs(&["url-crawl-content", "url-crawl-screenshot", "url-crawl-metadata"])
      .applies_when(|f| f.is_url_reference())
  }

  fn screenshot() -> BinaryPayload {
    BinaryPayload {
      bytes: vec![0x89, b'P', b'N', b'G'],
      extension: "png".into(),
    }
  }

  #[tokio::test]
  async fn test_multi_output_missing_output_skipped() {
    let ctx = DigestTestContext::new();
    let link = ctx.write_file("links/rust.url", b"[InternetShortcut]\nURL=https://www.rust-lang.org\n");

    let digester = crawler().produces(|_, _| {
      Ok(vec![
        DigestOutput::completed("url-crawl-content", Some(DigestContent::text("Rust"))),
        DigestOutput::completed("url-crawl-screenshot", None).with_binary(screenshot()),
      ])
    });
    let coordinator = ctx.coordinator(registry(vec![digester]), CascadeTable::new());

    let pass = summary(coordinator.process_file(&link, ProcessOptions::default()).await.unwrap());
    assert_eq!(pass.completed, 2);
    assert_eq!(pass.skipped, 1);
    assert_eq!(pass.invoked, 1);

    let shot = ctx.record("links/rust.url", "url-crawl-screenshot").await;
    let key = shot.binary_ref.clone().unwrap();
    assert_eq!(ctx.blobs.read(&key).await.unwrap(), screenshot().bytes);

    let metadata = ctx.record("links/rust.url", "url-crawl-metadata").await;
    assert_eq!(metadata.status, DigestStatus::Skipped);
    assert!(metadata.error.is_none());
  }

  #[tokio::test]
  async fn test_multi_output_failure_is_atomic() {
    let ctx = DigestTestContext::new();
    let link = ctx.write_file("links/down.url", b"URL=https://example.invalid\n");

    let digester = crawler().failing("crawl timed out");
    let coordinator = ctx.coordinator(registry(vec![digester]), CascadeTable::new());

    let pass = summary(coordinator.process_file(&link, ProcessOptions::default()).await.unwrap());
    assert_eq!(pass.failed, 3);
    for record in ctx.snapshot() {
      assert_eq!(record.status, DigestStatus::Failed);
      assert_eq!(record.attempts, 1);
      assert_eq!(record.error.as_deref(), Some("Extraction failed: crawl timed out"));
    }
  }

  #[tokio::test]
  async fn test_not_applicable_all_outputs_skipped() {
    let ctx = DigestTestContext::new();
    let note = ctx.write_file("note.md", b"# not a link");
    let digester = crawler();
    let calls = digester.calls();
    let coordinator = ctx.coordinator(registry(vec![digester]), CascadeTable::new());

    let pass = summary(coordinator.process_file(&note, ProcessOptions::default()).await.unwrap());
    assert_eq!(pass.skipped, 3);
    assert_eq!(pass.invoked, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(ctx.snapshot().iter().all(|r| r.attempts == 0));
  }

  #[tokio::test]
  async fn test_undeclared_and_terminal_outputs_ignored() {
    let ctx = DigestTestContext::new();
    let file = ctx.write_file("a.txt", b"x");

    // "extra" is not declared; "second" is already terminal
    let mut done = DigestRecord::new("a.txt", "second");
    done.status = DigestStatus::Completed;
    done.content = Some(DigestContent::text("keep me"));
    done.attempts = 1;
    ctx.seed(done.clone()).await;

    let digester = Scripted::new("multi").outputs(&["first", "second"]).produces(|_, _| {
      Ok(vec![
        DigestOutput::completed("first", Some(DigestContent::text("one"))),
        DigestOutput::completed("second", Some(DigestContent::text("overwritten?"))),
        DigestOutput::completed("extra", Some(DigestContent::text("stray"))),
      ])
    });
    let coordinator = ctx.coordinator(registry(vec![digester]), CascadeTable::new());
    coordinator.process_file(&file, ProcessOptions::default()).await.unwrap();

    assert_eq!(ctx.record("a.txt", "first").await.text(), Some("one"));
    assert_eq!(ctx.record("a.txt", "second").await, done);
    assert!(ctx.store.get("a.txt", "extra").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_panic_recorded_as_failure() {
    let ctx = DigestTestContext::new();
    let file = ctx.write_file("a.txt", b"x");

    let panicky = Scripted::new("panicky").produces(|_, _| panic!("index out of bounds"));
    let after = Scripted::new("after");
    let coordinator = ctx.coordinator(registry(vec![panicky, after]), CascadeTable::new());

    let pass = summary(coordinator.process_file(&file, ProcessOptions::default()).await.unwrap());
    assert_eq!(pass.failed, 1);
    assert_eq!(pass.completed, 1, "later digesters still run");

    let record = ctx.record("a.txt", "panicky").await;
    assert_eq!(record.status, DigestStatus::Failed);
    assert!(record.error.unwrap().contains("index out of bounds"));
    assert!(coordinator.locks().info("a.txt").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_process_path_removes_deleted_file() {
    let ctx = DigestTestContext::new();
    ctx.write_file("links/a.url", b"URL=https://example.com\n");

    let digester = crawler().produces(|_, _| {
      Ok(vec![
        DigestOutput::completed("url-crawl-content", Some(DigestContent::text("Example"))),
        DigestOutput::completed("url-crawl-screenshot", None).with_binary(screenshot()),
        DigestOutput::skipped("url-crawl-metadata"),
      ])
    });
    let coordinator = ctx.coordinator(registry(vec![digester]), CascadeTable::new());

    coordinator.process_path("links/a.url", ProcessOptions::default()).await.unwrap();
    let key = ctx.record("links/a.url", "url-crawl-screenshot").await.binary_ref.unwrap();
    assert!(ctx.blobs.exists(&key).await);

    std::fs::remove_file(ctx.library.path().join("links/a.url")).unwrap();
    let outcome = coordinator.process_path("links/a.url", ProcessOptions::default()).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Removed(3));
    assert!(ctx.snapshot().is_empty());
    assert!(!ctx.blobs.exists(&key).await);
  }

  #[tokio::test]
  async fn test_process_path_requires_library_root() {
    let ctx = DigestTestContext::new();
    let coordinator = DigestCoordinator::new(
      ctx.store.clone(),
      ctx.locks.clone(),
      ctx.blobs.clone(),
      std::sync::Arc::new(registry(vec![])),
      std::sync::Arc::new(CascadeTable::new()),
    );
    let err = coordinator.process_path("a.md", ProcessOptions::default()).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::NoLibraryRoot));
  }

  #[tokio::test]
  async fn test_rename_moves_records() {
    let ctx = DigestTestContext::new();
    let file = ctx.write_file("old/name.txt", b"x");
    let coordinator = ctx.coordinator(registry(vec![Scripted::new("a"), Scripted::new("b")]), CascadeTable::new());
    coordinator.process_file(&file, ProcessOptions::default()).await.unwrap();

    let outcome = coordinator.rename_file("old/name.txt", "new/name.txt").await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Renamed(2));
    assert!(coordinator.records("old/name.txt").await.unwrap().is_empty());
    let moved = coordinator.records("new/name.txt").await.unwrap();
    assert_eq!(moved.len(), 2);
    assert!(moved.iter().all(|r| r.status == DigestStatus::Completed));
  }

  fn shooter() -> Scripted {
    Scripted::new("shot").produces(|_, _| Ok(vec![DigestOutput::completed("shot", None).with_binary(screenshot())]))
  }

  #[tokio::test]
  async fn test_renamed_blob_not_shared_with_new_file_at_old_path() {
    let ctx = DigestTestContext::new();
    let file = ctx.write_file("a.md", b"first");
    let coordinator = ctx.coordinator(registry(vec![shooter()]), CascadeTable::new());

    coordinator.process_file(&file, ProcessOptions::default()).await.unwrap();
    let moved_key = ctx.record("a.md", "shot").await.binary_ref.unwrap();
    coordinator.rename_file("a.md", "b.md").await.unwrap();
    assert_eq!(ctx.record("b.md", "shot").await.binary_ref.as_deref(), Some(moved_key.as_str()));

    // A new file shows up at the old path and gets its own blob
    let file = ctx.write_file("a.md", b"second");
    coordinator.process_file(&file, ProcessOptions::default()).await.unwrap();
    let fresh_key = ctx.record("a.md", "shot").await.binary_ref.unwrap();
    assert_ne!(fresh_key, moved_key);

    coordinator.remove_file("b.md").await.unwrap();
    assert!(!ctx.blobs.exists(&moved_key).await);
    assert_eq!(ctx.blobs.read(&fresh_key).await.unwrap(), screenshot().bytes);
  }

  #[tokio::test]
  async fn test_rename_over_existing_path_deletes_replaced_blobs() {
    let ctx = DigestTestContext::new();
    let a = ctx.write_file("a.md", b"a");
    let b = ctx.write_file("b.md", b"b");
    let coordinator = ctx.coordinator(registry(vec![shooter()]), CascadeTable::new());
    coordinator.process_file(&a, ProcessOptions::default()).await.unwrap();
    coordinator.process_file(&b, ProcessOptions::default()).await.unwrap();
    let a_key = ctx.record("a.md", "shot").await.binary_ref.unwrap();
    let b_key = ctx.record("b.md", "shot").await.binary_ref.unwrap();

    assert_eq!(coordinator.rename_file("a.md", "b.md").await.unwrap(), ProcessOutcome::Renamed(1));
    assert!(!ctx.blobs.exists(&b_key).await);
    assert!(ctx.blobs.exists(&a_key).await);
    assert_eq!(ctx.record("b.md", "shot").await.binary_ref, Some(a_key));
  }

  #[tokio::test]
  async fn test_reset_digester_clears_outputs_and_blobs() {
    let ctx = DigestTestContext::new();
    let link = ctx.write_file("links/a.url", b"URL=https://example.com\n");
    let digester = crawler().produces(|_, _| {
      Ok(vec![
        DigestOutput::completed("url-crawl-content", Some(DigestContent::text("Example"))),
        DigestOutput::completed("url-crawl-screenshot", None).with_binary(screenshot()),
        DigestOutput::completed("url-crawl-metadata", None),
      ])
    });
    let calls = digester.calls();
    let coordinator = ctx.coordinator(
      registry(vec![digester, Scripted::new("tags")]),
      CascadeTable::new(),
    );
    coordinator.process_file(&link, ProcessOptions::default()).await.unwrap();
    let key = ctx.record("links/a.url", "url-crawl-screenshot").await.binary_ref.unwrap();

    // By digester name: all three outputs
    let outcome = coordinator.reset_digester("links/a.url", "url-crawl").await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Reset(3));
    assert!(!ctx.blobs.exists(&key).await);
    let shot = ctx.record("links/a.url", "url-crawl-screenshot").await;
    assert_eq!((shot.status, shot.attempts, shot.binary_ref), (DigestStatus::Todo, 0, None));
    assert_eq!(ctx.record("links/a.url", "tags").await.status, DigestStatus::Completed);

    // By single output name
    coordinator.process_file(&link, ProcessOptions::default()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let outcome = coordinator.reset_digester("links/a.url", "url-crawl-content").await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Reset(1));
    assert_eq!(
      ctx.record("links/a.url", "url-crawl-metadata").await.status,
      DigestStatus::Completed
    );
  }

  #[tokio::test]
  async fn test_records_in_registry_order() {
    let ctx = DigestTestContext::new();
    let file = ctx.write_file("a.txt", b"x");
    ctx.seed(DigestRecord::new("a.txt", "zz-legacy")).await;
    ctx.seed(DigestRecord::new("a.txt", "aa-legacy")).await;

    let coordinator = ctx.coordinator(
      registry(vec![Scripted::new("zeta"), Scripted::new("alpha"), Scripted::new("mid")]),
      CascadeTable::new(),
    );
    coordinator.process_file(&file, ProcessOptions::default()).await.unwrap();

    let names: Vec<String> = coordinator
      .records("a.txt")
      .await
      .unwrap()
      .into_iter()
      .map(|r| r.digester)
      .collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid", "aa-legacy", "zz-legacy"]);
  }

  #[tokio::test]
  async fn test_events_published_per_output() {
    let ctx = DigestTestContext::new();
    let file = ctx.write_file("a.txt", b"x");
    let coordinator = ctx.coordinator(
      registry(vec![Scripted::new("ok"), Scripted::new("bad").failing("nope")]),
      CascadeTable::new(),
    );
    let mut events = coordinator.subscribe();

    coordinator.process_file(&file, ProcessOptions::default()).await.unwrap();

    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();
    assert_eq!((first.digester.as_str(), first.status), ("ok", DigestStatus::Completed));
    assert_eq!((second.digester.as_str(), second.status), ("bad", DigestStatus::Failed));
    assert!(events.try_recv().is_err());
  }
}
