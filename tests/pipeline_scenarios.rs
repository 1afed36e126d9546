#[path = "common/mod.rs"]
mod common;

use common::*;
use mailconv::{checkpoint_path, CheckpointStore, PipelineError, ShutdownCoordinator, SinkAdapter, StopReason, VecSource};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SOURCE_ID: &str = "vec:scenario";

/// 1200 records, batch size 500, fresh checkpoint, every write succeeds.
/// Outcome: 1200 committed, three batches, checkpoint holds all 1200 fingerprints.
#[test]
fn full_run_commits_every_record_in_three_batches() {
    let ckpt = tempfile::tempdir().unwrap();
    let source = VecSource::new(SOURCE_ID, make_records(1200));
    let sink = Arc::new(ScriptedSink::accepting("full"));

    let report = test_converter(ckpt.path())
        .run(&source, sink.clone(), &ShutdownCoordinator::default())
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Completed);
    assert!(!report.partial);
    assert_eq!((report.committed, report.failed, report.skipped), (1200, 0, 0));
    assert_eq!(report.batches_committed, 3);
    assert_eq!(report.last_batch_index, 3);
    assert!(report.failure_samples.is_empty());

    assert_eq!(sink.calls(), 1200);
    assert_eq!(sink.max_writes_per_record(), 1);

    let store = CheckpointStore::open(ckpt.path(), SOURCE_ID, &sink.identity()).unwrap();
    let totals = store.totals();
    assert_eq!(totals.fingerprints, 1200);
    assert_eq!(totals.records_committed, 1200);
    assert_eq!(totals.last_batch_index, 3);
    for fp in fingerprints_of(&make_records(1200)) {
        assert!(store.contains(&fp));
    }
}

/// Running twice with the same checkpoint never calls the sink again.
#[test]
fn second_run_skips_everything_already_committed() {
    let ckpt = tempfile::tempdir().unwrap();
    let source = VecSource::new(SOURCE_ID, make_records(750));
    let sink = Arc::new(ScriptedSink::accepting("twice"));
    let conv = test_converter(ckpt.path());

    let first = conv.run(&source, sink.clone(), &ShutdownCoordinator::default()).unwrap();
    assert_eq!(first.committed, 750);

    let second = conv.run(&source, sink.clone(), &ShutdownCoordinator::default()).unwrap();
    assert_eq!(second.stop_reason, StopReason::Completed);
    assert_eq!((second.committed, second.failed, second.skipped), (0, 0, 750));
    // Nothing admitted, so no batch index is consumed.
    assert_eq!(second.batches_committed, 0);
    assert_eq!(second.last_batch_index, 2);
    assert_eq!(second.historical.records_committed, 750);

    assert_eq!(sink.calls(), 750);
    assert_eq!(sink.max_writes_per_record(), 1);
}

/// The source dies right after batch 2 commits (1000 records in).
/// Outcome: the run aborts with a read error, the checkpoint holds exactly
/// batches 1..2, and the resumed run writes only the remaining 200.
#[test]
fn crash_after_second_batch_resumes_with_remaining_records() {
    let ckpt = tempfile::tempdir().unwrap();
    let records = make_records(1200);
    let sink = Arc::new(ScriptedSink::accepting("crash"));
    let conv = test_converter(ckpt.path());

    let broken = FailingSource::new(SOURCE_ID, records.clone(), 1000);
    let err = conv.run(&broken, sink.clone(), &ShutdownCoordinator::default()).unwrap_err();
    match err {
        PipelineError::SourceRead { position, .. } => assert_eq!(position, 1000),
        other => panic!("expected a source read error, got {other}"),
    }
    assert_eq!(sink.calls(), 1000);

    {
        let store = CheckpointStore::open(ckpt.path(), SOURCE_ID, &sink.identity()).unwrap();
        assert_eq!(store.totals().last_batch_index, 2);
        assert_eq!(store.totals().fingerprints, 1000);
        let fps = fingerprints_of(&records);
        assert!(fps[..1000].iter().all(|fp| store.contains(fp)));
        assert!(fps[1000..].iter().all(|fp| !store.contains(fp)));
    }

    let healthy = VecSource::new(SOURCE_ID, records);
    let report = conv.run(&healthy, sink.clone(), &ShutdownCoordinator::default()).unwrap();
    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!((report.committed, report.skipped), (200, 1000));
    assert_eq!(report.last_batch_index, 3);
    assert_eq!(report.historical.records_committed, 1200);
    assert_eq!(report.historical.fingerprints, 1200);

    assert_eq!(sink.calls(), 1200);
    assert_eq!(sink.distinct_written(), 1200);
    assert_eq!(sink.max_writes_per_record(), 1);
}

/// A single interrupt mid-way through batch 2 lets the admitted records finish,
/// commits them, and reports a partial run. A rerun completes the rest with no
/// record written twice.
#[test]
fn interrupt_drains_in_flight_batch_then_rerun_completes() {
    let ckpt = tempfile::tempdir().unwrap();
    let records = make_records(1200);
    let source = VecSource::new(SOURCE_ID, records);
    let shutdown = ShutdownCoordinator::new(Duration::from_secs(30));

    let seen = Arc::new(AtomicUsize::new(0));
    let sink = {
        let shutdown = shutdown.clone();
        let seen = Arc::clone(&seen);
        Arc::new(ScriptedSink::new("drain", move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 600 {
                shutdown.interrupt();
            }
            Ok(())
        }))
    };
    let conv = test_converter(ckpt.path());

    let first = conv.run(&source, sink.clone(), &shutdown).unwrap();
    assert_eq!(first.stop_reason, StopReason::Drained);
    assert!(first.partial);
    assert_eq!(first.failed, 0);
    assert!(first.committed >= 600 && first.committed < 1200, "committed {}", first.committed);
    assert_eq!(first.last_batch_index, 2);
    // Everything handed to the sink was committed before stopping.
    assert_eq!(first.committed as usize, sink.calls());

    let second = conv.run(&source, sink.clone(), &ShutdownCoordinator::default()).unwrap();
    assert_eq!(second.stop_reason, StopReason::Completed);
    assert_eq!(second.skipped, first.committed);
    assert_eq!(first.committed + second.committed, 1200);
    assert_eq!(second.historical.fingerprints, 1200);
    assert_eq!(sink.max_writes_per_record(), 1);
}

/// A second interrupt abandons the in-flight batch: nothing from it is checkpointed.
#[test]
fn second_interrupt_abandons_in_flight_batch() {
    let ckpt = tempfile::tempdir().unwrap();
    let source = VecSource::new(SOURCE_ID, make_records(1200));
    let shutdown = ShutdownCoordinator::new(Duration::from_secs(30));

    let seen = Arc::new(AtomicUsize::new(0));
    let sink = {
        let shutdown = shutdown.clone();
        let seen = Arc::clone(&seen);
        Arc::new(ScriptedSink::new("abort", move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 600 {
                shutdown.interrupt();
                shutdown.interrupt();
            }
            Ok(())
        }))
    };
    let conv = test_converter(ckpt.path());

    let first = conv.run(&source, sink.clone(), &shutdown).unwrap();
    assert_eq!(first.stop_reason, StopReason::Aborted);
    assert!(first.partial);
    assert_eq!(first.committed, 500);
    assert_eq!(first.last_batch_index, 1);
    assert_eq!(first.historical.fingerprints, 500);

    // Records of the abandoned batch are written again; the sink contract covers that.
    let second = conv.run(&source, sink.clone(), &ShutdownCoordinator::default()).unwrap();
    assert_eq!(second.stop_reason, StopReason::Completed);
    assert_eq!((second.committed, second.skipped), (700, 500));
    assert_eq!(second.historical.fingerprints, 1200);
    assert_eq!(second.last_batch_index, 3);
}

/// One interrupt, then the grace period runs out while a slow write is still
/// in flight. The batch is abandoned unrecorded and no write starts after the
/// run has returned.
#[test]
fn grace_period_expiry_abandons_in_flight_batch() {
    let ckpt = tempfile::tempdir().unwrap();
    let source = VecSource::new(SOURCE_ID, make_records(10));
    let shutdown = ShutdownCoordinator::new(Duration::from_millis(50));

    let sink = {
        let shutdown = shutdown.clone();
        Arc::new(ScriptedSink::new("slow", move |rec, _| {
            if rec.ordinal == 0 {
                shutdown.interrupt();
            }
            thread::sleep(Duration::from_millis(300));
            Ok(())
        }))
    };
    // Queue deep enough that every record is admitted before the first write ends.
    let conv = test_converter(ckpt.path()).workers(1).queue_capacity(16);

    let report = conv.run(&source, sink.clone(), &shutdown).unwrap();
    assert_eq!(report.stop_reason, StopReason::Aborted);
    assert!(report.partial);
    assert_eq!((report.committed, report.failed), (0, 0));
    assert_eq!(report.last_batch_index, 0);
    assert_eq!(report.historical.last_batch_index, 0);
    assert_eq!(report.historical.fingerprints, 0);

    let calls_at_return = sink.calls();
    assert_eq!(calls_at_return, 1);
    thread::sleep(Duration::from_millis(700));
    assert_eq!(sink.calls(), calls_at_return);

    let store = CheckpointStore::open(ckpt.path(), SOURCE_ID, &sink.identity()).unwrap();
    assert_eq!(store.totals().last_batch_index, 0);
    assert_eq!(store.totals().fingerprints, 0);
}

/// The checkpoint file becomes un-replaceable while batch 2 is in flight.
/// The run fails with a persistence error, batch 1 stays durable, and a rerun
/// over the repaired checkpoint only redoes the rest.
#[test]
fn checkpoint_persistence_failure_aborts_run_and_keeps_earlier_batches() {
    let ckpt = tempfile::tempdir().unwrap();
    let records = make_records(12);
    let source = VecSource::new(SOURCE_ID, records.clone());
    let live = checkpoint_path(ckpt.path(), SOURCE_ID, "scripted:persist");
    let parked = ckpt.path().join("parked.json");

    let seen = Arc::new(AtomicUsize::new(0));
    let sink = {
        let seen = Arc::clone(&seen);
        let (live, parked) = (live.clone(), parked.clone());
        Arc::new(ScriptedSink::new("persist", move |_, _| {
            // First write of batch 2: batch 1 is already on disk.
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 6 {
                fs::rename(&live, &parked).unwrap();
                fs::create_dir(&live).unwrap();
                fs::write(live.join("occupied"), b"x").unwrap();
            }
            Ok(())
        }))
    };
    let conv = test_converter(ckpt.path()).batch_size(5);

    let err = conv.run(&source, sink.clone(), &ShutdownCoordinator::default()).unwrap_err();
    match &err {
        PipelineError::CheckpointPersistence { path, .. } => assert_eq!(path, &live),
        other => panic!("expected a checkpoint persistence error, got {other}"),
    }
    assert_eq!(sink.calls(), 10);

    fs::remove_dir_all(&live).unwrap();
    fs::rename(&parked, &live).unwrap();
    {
        let store = CheckpointStore::open(ckpt.path(), SOURCE_ID, &sink.identity()).unwrap();
        assert_eq!(store.totals().last_batch_index, 1);
        assert_eq!(store.totals().fingerprints, 5);
        let fps = fingerprints_of(&records);
        assert!(fps[..5].iter().all(|fp| store.contains(fp)));
        assert!(fps[5..].iter().all(|fp| !store.contains(fp)));
    }

    let report = conv.run(&source, sink.clone(), &ShutdownCoordinator::default()).unwrap();
    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!((report.committed, report.skipped), (7, 5));
    assert_eq!(report.last_batch_index, 3);
    assert_eq!(report.historical.fingerprints, 12);
}

/// An interrupt that arrives after the last record was read, while the final
/// batch is still being written, still ends the run as completed.
#[test]
fn interrupt_after_source_exhausted_still_completes() {
    let ckpt = tempfile::tempdir().unwrap();
    let source = VecSource::new(SOURCE_ID, make_records(10));
    let shutdown = ShutdownCoordinator::new(Duration::from_secs(30));

    let sink = {
        let shutdown = shutdown.clone();
        Arc::new(ScriptedSink::new("late", move |rec, _| {
            if rec.ordinal == 9 {
                shutdown.interrupt();
            }
            Ok(())
        }))
    };
    // Queue holds every record, so the last write starts only after the source is drained.
    let conv = test_converter(ckpt.path()).queue_capacity(16);

    let report = conv.run(&source, sink.clone(), &shutdown).unwrap();
    assert_eq!(report.stop_reason, StopReason::Completed);
    assert!(!report.partial);
    assert_eq!(report.committed, 10);
    assert_eq!(report.last_batch_index, 1);

    let again = conv.run(&source, sink.clone(), &ShutdownCoordinator::default()).unwrap();
    assert_eq!((again.committed, again.skipped), (0, 10));
}

/// Identical records inside one run are written once; later copies are skipped.
#[test]
fn duplicate_records_in_source_are_written_once() {
    let ckpt = tempfile::tempdir().unwrap();
    let mut records = make_records(10);
    let mut dup = records[3].clone();
    dup.ordinal = 10;
    records.push(dup);
    let mut dup = records[7].clone();
    dup.ordinal = 11;
    records.push(dup);

    let sink = Arc::new(ScriptedSink::accepting("dups"));
    let report = test_converter(ckpt.path())
        .batch_size(4)
        .run(&VecSource::new(SOURCE_ID, records), sink.clone(), &ShutdownCoordinator::default())
        .unwrap();

    assert_eq!((report.committed, report.skipped), (10, 2));
    assert_eq!(sink.calls(), 10);
    assert_eq!(report.historical.records_seen, 10);
}

/// An empty source completes immediately without touching any batch.
#[test]
fn empty_source_completes_without_batches() {
    let ckpt = tempfile::tempdir().unwrap();
    let sink = Arc::new(ScriptedSink::accepting("empty"));
    let report = test_converter(ckpt.path())
        .run(&VecSource::new(SOURCE_ID, Vec::new()), sink.clone(), &ShutdownCoordinator::default())
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Completed);
    assert_eq!(report.processed(), 0);
    assert_eq!(report.batches_committed, 0);
    assert_eq!(report.last_batch_index, 0);
    assert_eq!(sink.calls(), 0);
}

/// A different target gets its own checkpoint and therefore its own full run.
#[test]
fn checkpoints_are_scoped_per_target() {
    let ckpt = tempfile::tempdir().unwrap();
    let source = VecSource::new(SOURCE_ID, make_records(20));
    let conv = test_converter(ckpt.path()).batch_size(8);

    let a = Arc::new(ScriptedSink::accepting("target-a"));
    let b = Arc::new(ScriptedSink::accepting("target-b"));
    conv.run(&source, a.clone(), &ShutdownCoordinator::default()).unwrap();
    let report = conv.run(&source, b.clone(), &ShutdownCoordinator::default()).unwrap();

    assert_eq!(report.committed, 20);
    assert_eq!(report.skipped, 0);
    assert_eq!((a.calls(), b.calls()), (20, 20));
}
