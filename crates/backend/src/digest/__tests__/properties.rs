//! Pipeline invariants: status domain, terminal stability, applicability
//! determinism, idempotence, per-path exclusion, cascade rules, retry bound.

#[cfg(test)]
mod tests {
  use std::sync::{Arc, atomic::Ordering};

  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use crate::{
    db::{DigestDb, DigestStore},
    digest::{
      CascadeTable, DigestCoordinator, Digester, ProcessOptions, ProcessOutcome,
      __tests__::helpers::{DigestTestContext, Gate, MAX_ATTEMPTS, Scripted, registry, summary},
      builtin::{DocToMarkdown, FileHash, SearchKeyword, Tags, default_cascades, default_registry},
    },
    domain::digest::{DigestContent, DigestOutput, DigestRecord, DigestStatus},
  };

  /// Statuses read back from the LanceDB store are always one of the five
  #[tokio::test]
  async fn test_persisted_statuses_stay_in_domain() {
    let ctx = DigestTestContext::new();
    let db_dir = TempDir::new().unwrap();
    let db: Arc<dyn DigestStore> = Arc::new(DigestDb::open(db_dir.path()).await.unwrap());

    let text = ctx.write_file("a.md", b"alpha beta beta");
    let binary = ctx.write_file("b.bin", &[0u8, 1, 2, 3]);
    let broken = ctx.write_file("c.txt", &[0xff, 0xfe, 0x00]);

    let coordinator = DigestCoordinator::new(
      db.clone(),
      ctx.locks.clone(),
      ctx.blobs.clone(),
      Arc::new(default_registry().unwrap()),
      Arc::new(default_cascades()),
    )
    .with_max_attempts(MAX_ATTEMPTS);

    for file in [&text, &binary, &broken] {
      coordinator.process_file(file, ProcessOptions::default()).await.unwrap();
    }

    let mut total = 0;
    for status in DigestStatus::ALL {
      total += db.list_by_status(status).await.unwrap().len();
    }
    // 3 files x 4 digesters, every row accounted for by a known status
    assert_eq!(total, 12);
    assert_eq!(db.status_counts().await.unwrap().total, 12);

    // Non-text file: text digesters skipped
    let binary_tags = db.get("b.bin", Tags::NAME).await.unwrap().unwrap();
    assert_eq!(binary_tags.status, DigestStatus::Skipped);
    // Undecodable text: conversion failed, dependents wait
    let broken_doc = db.get("c.txt", DocToMarkdown::NAME).await.unwrap().unwrap();
    assert_eq!(broken_doc.status, DigestStatus::Failed);
    assert!(broken_doc.error.is_some());
  }

  /// Terminal records are never rewritten by further passes
  #[tokio::test]
  async fn test_terminal_records_unchanged() {
    let ctx = DigestTestContext::new();
    let image = ctx.write_file("p.png", &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0]);

    let ocr = Scripted::new("image-ocr").applies_when(|f| f.is_image());
    let doc = Scripted::new("doc").applies_when(|f| f.is_text());
    let coordinator = ctx.coordinator(registry(vec![ocr, doc]), CascadeTable::new());

    coordinator.process_file(&image, ProcessOptions::default()).await.unwrap();
    let before = ctx.snapshot();
    assert_eq!(before[0].status, DigestStatus::Skipped);
    assert_eq!(before[1].status, DigestStatus::Completed);

    let pass = summary(coordinator.process_file(&image, ProcessOptions::default()).await.unwrap());
    assert!(pass.is_noop());
    assert_eq!(pass.invoked, 0);
    assert_eq!(ctx.snapshot(), before);
  }

  /// Applicability depends on the descriptor alone
  #[tokio::test]
  async fn test_can_apply_deterministic() {
    let ctx = DigestTestContext::new();
    let files = [
      ctx.write_file("a.md", b"# a"),
      ctx.write_file("b.html", b"<p>b</p>"),
      ctx.write_file("c.jpg", &[0xff, 0xd8, 0xff, 0xe0, 0, 0x10, b'J', b'F', b'I', b'F', 0]),
      ctx.write_file("d", b"no extension"),
    ];
    let digesters: Vec<Box<dyn Digester>> = vec![
      Box::new(FileHash),
      Box::new(DocToMarkdown),
      Box::new(Tags::default()),
      Box::new(SearchKeyword::default()),
    ];

    for file in &files {
      for digester in &digesters {
        assert_eq!(
          digester.can_apply(file),
          digester.can_apply(&file.clone()),
          "{} on {}",
          digester.name(),
          file.path
        );
      }
    }
    assert!(!DocToMarkdown.can_apply(&files[2]));
    assert!(DocToMarkdown.can_apply(&files[1]));
  }

  /// Repeated passes after the first make no changes
  #[tokio::test]
  async fn test_process_file_idempotent() {
    let ctx = DigestTestContext::new();
    let file = ctx.write_file("journal/2024-05-01.md", b"Walked to the lake. Lake was cold.");
    let coordinator = ctx.coordinator(default_registry().unwrap(), default_cascades());

    let first = summary(coordinator.process_file(&file, ProcessOptions::default()).await.unwrap());
    assert_eq!(first.completed, 4);
    let after_first = ctx.snapshot();

    for _ in 0..5 {
      let pass = summary(coordinator.process_file(&file, ProcessOptions::default()).await.unwrap());
      assert!(pass.is_noop());
    }
    assert_eq!(ctx.snapshot(), after_first);
  }

  /// Two simultaneous calls: one works, the other mutates nothing
  #[tokio::test]
  async fn test_concurrent_calls_exclusive() {
    let ctx = DigestTestContext::new();
    let file = ctx.write_file("a.txt", b"x");

    let gate = Gate::new();
    let first_digester = Scripted::new("first").gated(gate.clone());
    let second_digester = Scripted::new("second");
    let calls = (first_digester.calls(), second_digester.calls());
    let coordinator = ctx.coordinator(registry(vec![first_digester, second_digester]), CascadeTable::new());

    let (a, b) = tokio::join!(coordinator.process_file(&file, ProcessOptions::default()), async {
      gate.wait_entered().await;
      let before = ctx.snapshot();
      let outcome = coordinator.process_file(&file, ProcessOptions::default()).await;
      let after = ctx.snapshot();
      gate.open();
      (outcome, before, after)
    });

    let (outcome, before, after) = b;
    assert_eq!(outcome.unwrap(), ProcessOutcome::Busy);
    assert_eq!(before, after, "losing caller wrote nothing");
    assert!(matches!(a.unwrap(), ProcessOutcome::Processed(_)));

    assert_eq!(ctx.locks.acquired(), 1);
    assert_eq!(ctx.locks.rejected(), 1);
    assert_eq!(calls.0.load(Ordering::SeqCst), 1);
    assert_eq!(calls.1.load(Ordering::SeqCst), 1);
  }

  /// Different paths never block each other
  #[tokio::test]
  async fn test_different_paths_run_concurrently() {
    let ctx = DigestTestContext::new();
    let a = ctx.write_file("a.txt", b"a");
    let b = ctx.write_file("b.txt", b"b");

    let gate = Gate::new();
    let coordinator = ctx.coordinator(
      registry(vec![
        Scripted::new("gated")
          .applies_when(|f| f.path == "a.txt")
          .gated(gate.clone()),
      ]),
      CascadeTable::new(),
    );

    let (first, second) = tokio::join!(coordinator.process_file(&a, ProcessOptions::default()), async {
      gate.wait_entered().await;
      let outcome = coordinator.process_file(&b, ProcessOptions::default()).await;
      gate.open();
      outcome
    });

    assert!(matches!(first.unwrap(), ProcessOutcome::Processed(_)));
    let second = summary(second.unwrap());
    assert_eq!(second.skipped, 1);
    assert_eq!(ctx.locks.rejected(), 0);
  }

  /// A cascade resets settled downstream records and leaves active ones
  #[tokio::test]
  async fn test_cascade_rules() {
    for (initial, expected) in [
      (DigestStatus::Completed, DigestStatus::Todo),
      (DigestStatus::Skipped, DigestStatus::Todo),
      (DigestStatus::Failed, DigestStatus::Todo),
      (DigestStatus::Todo, DigestStatus::Todo),
      (DigestStatus::InProgress, DigestStatus::InProgress),
    ] {
      let ctx = DigestTestContext::new();
      let file = ctx.write_file("a.md", b"x");

      for name in ["b", "c"] {
        let mut record = DigestRecord::new("a.md", name);
        record.status = initial;
        record.attempts = 2;
        if initial == DigestStatus::Completed {
          record.content = Some(DigestContent::text("stale"));
        }
        if initial == DigestStatus::Failed {
          record.error = Some("boom".into());
        }
        ctx.seed(record).await;
      }

      // B and C are not registered, so only the cascade touches them
      let coordinator = ctx.coordinator(
        registry(vec![Scripted::new("a")]),
        CascadeTable::new().with_rule("a", ["b", "c"]),
      );
      let pass = summary(coordinator.process_file(&file, ProcessOptions::default()).await.unwrap());

      for name in ["b", "c"] {
        let record = ctx.record("a.md", name).await;
        assert_eq!(record.status, expected, "{:?} -> {:?}", initial, expected);
        if initial.is_cascade_resettable() {
          assert_eq!(record.attempts, 0);
          assert!(record.content.is_none());
          assert!(record.error.is_none());
        } else {
          assert_eq!(record.attempts, 2, "active record untouched");
        }
      }
      let expected_resets = if initial.is_cascade_resettable() { 2 } else { 0 };
      assert_eq!(pass.cascaded, expected_resets);
    }
  }

  /// Completion without content does not cascade
  #[tokio::test]
  async fn test_no_cascade_without_content() {
    let ctx = DigestTestContext::new();
    let file = ctx.write_file("a.md", b"x");

    let mut downstream = DigestRecord::new("a.md", "b");
    downstream.status = DigestStatus::Completed;
    downstream.attempts = 1;
    ctx.seed(downstream).await;

    let empty = Scripted::new("a").produces(|_, _| Ok(vec![DigestOutput::completed("a", None)]));
    let coordinator = ctx.coordinator(registry(vec![empty]), CascadeTable::new().with_rule("a", ["b"]));
    let pass = summary(coordinator.process_file(&file, ProcessOptions::default()).await.unwrap());

    assert_eq!(pass.cascaded, 0);
    assert_eq!(ctx.record("a.md", "b").await.status, DigestStatus::Completed);
  }

  /// An always-failing digester is invoked exactly MAX_ATTEMPTS times
  #[tokio::test]
  async fn test_retry_bound() {
    let ctx = DigestTestContext::new();
    let file = ctx.write_file("a.txt", b"x");

    let broken = Scripted::new("broken").failing("always");
    let calls = broken.calls();
    let coordinator = ctx.coordinator(registry(vec![broken]), CascadeTable::new());

    for pass in 1..=(MAX_ATTEMPTS as usize + 4) {
      coordinator.process_file(&file, ProcessOptions::default()).await.unwrap();
      let record = ctx.record("a.txt", "broken").await;
      assert_eq!(record.status, DigestStatus::Failed);
      assert_eq!(record.attempts as usize, pass.min(MAX_ATTEMPTS as usize));
      assert!(!record.is_pending(MAX_ATTEMPTS) || pass < MAX_ATTEMPTS as usize);
    }

    assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
    assert!(ctx.record("a.txt", "broken").await.is_terminal(MAX_ATTEMPTS));
  }
}
