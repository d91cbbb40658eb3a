//! End-to-end job tests
//!
//! Runs whole jobs through the TransitionScheduler with the built-in filters
//! and checks the totals every scope and stream must reach.

use std::path::PathBuf;

use streamscope::config::JobConfig;
use streamscope::counter::Transition;
use streamscope::error::{Result, SchedulerError, ViolationKind};
use streamscope::filters::{
    BeginLumiFilter, BeginProcessBlockFilter, BeginRunFilter, EndLumiFilter, EndProcessBlockFilter, EndRunFilter,
    InputProcessBlockIntFilter, LumiIntFilter, ProcessBlockIntFilter, RunIntFilter,
};
use streamscope::scheduler::{SchedulerConfig, TransitionScheduler};
use streamscope::scope::ScopeKind;
use streamscope::source::JobInput;

fn scheduler(streams: usize) -> TransitionScheduler {
    TransitionScheduler::new(SchedulerConfig::default().with_streams(streams)).unwrap()
}

fn demo_job() -> JobConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos").join("job.yml");
    JobConfig::load_from_file(path).unwrap()
}

/// Every run and lumi begins and ends exactly once whatever the pool size
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scopes_begin_and_end_once_for_any_stream_count() -> Result<()> {
    for streams in 1..=4 {
        let mut s = scheduler(streams);
        s.add_module(BeginRunFilter::new("testBeginRun", 3))?;
        s.add_module(EndLumiFilter::new("testEndLumi", 6))?;

        let report = s.run(&JobInput::uniform(3, 2, 4)).await?;
        let t = &report.transitions;
        assert_eq!(t.get(ScopeKind::Run, Transition::Begin), 3, "streams={}", streams);
        assert_eq!(t.get(ScopeKind::Run, Transition::End), 3, "streams={}", streams);
        assert_eq!(t.get(ScopeKind::LuminosityBlock, Transition::Begin), 6);
        assert_eq!(t.get(ScopeKind::LuminosityBlock, Transition::End), 6);
        assert_eq!(t.get(ScopeKind::Stream, Transition::Begin), streams as u64);
        assert_eq!(t.get(ScopeKind::Stream, Transition::End), streams as u64);
        assert_eq!(report.events_seen, 24);
        assert_eq!(report.per_stream.len(), streams);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stream_lumi_transitions_within_range() -> Result<()> {
    let streams = 3;
    let mut s = scheduler(streams);
    s.add_module(LumiIntFilter::new("testGlobalLumiFilter", 4 + 8 + 4, 2))?;

    let report = s.run(&JobInput::uniform(2, 2, 2)).await?;
    let t = &report.transitions;
    let begins = t.get(ScopeKind::LuminosityBlock, Transition::StreamBegin);
    let ends = t.get(ScopeKind::LuminosityBlock, Transition::StreamEnd);
    assert!((4..=4 * streams as u64).contains(&begins), "begins={}", begins);
    assert_eq!(begins, ends);
    assert_eq!(t.get(ScopeKind::Run, Transition::StreamBegin), 2 * streams as u64);
    Ok(())
}

/// Three streams, two runs of one lumi with five events, every filter
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_filter_scenario() -> Result<()> {
    let config = demo_job();
    assert_eq!(config.modules.len(), 13);

    let report = config.build_scheduler()?.run(&config.input).await?;
    assert_eq!(report.streams, 3);
    assert_eq!(report.events_seen, 10);
    assert_eq!(report.events_accepted, 10);
    for module in &report.modules {
        assert_eq!(module.passed, 10, "{}", module.label);
        assert_eq!(module.rejected, 0, "{}", module.label);
    }

    let global = report.module("testGlobalFilter").unwrap();
    assert_eq!(global.concurrency_limit, Some(1));
    assert!(global.peak_concurrency <= 1);

    let lumi = report.module("testGlobalLumiFilter").unwrap();
    assert!(lumi.peak_concurrency <= 2);

    let t = &report.transitions;
    assert_eq!(t.get(ScopeKind::Process, Transition::AccessInput), 1);
    assert_eq!(t.get(ScopeKind::Process, Transition::EndJob), 1);
    Ok(())
}

#[tokio::test]
async fn test_process_block_artifacts_reach_watchers() -> Result<()> {
    let mut s = scheduler(2);
    s.add_module(BeginProcessBlockFilter::new("testBeginProcessBlock", 1 + 6))?;
    s.add_module(EndProcessBlockFilter::new("testEndProcessBlock", 6 + 1))?;
    s.add_module(
        ProcessBlockIntFilter::new("testProcessBlock", 1 + 6 + 1)
            .consumes_begin(Some("begin".to_string()))
            .consumes_end(Some("end".to_string())),
    )?;

    let report = s.run(&JobInput::uniform(1, 2, 3)).await?;
    assert_eq!(report.events_accepted, 6);
    Ok(())
}

#[tokio::test]
async fn test_missing_artifact_aborts_job() {
    let mut s = scheduler(2);
    s.add_module(ProcessBlockIntFilter::new("testProcessBlock", 4).consumes_begin(Some("begin".to_string())))
        .unwrap();

    let err = s.run(&JobInput::uniform(1, 1, 2)).await.unwrap_err();
    assert!(err.is_violation(ViolationKind::MissingArtifact), "{}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_input_caches_filled_from_upstream_block() -> Result<()> {
    let mut s = scheduler(3);
    s.add_module(InputProcessBlockIntFilter::new("testInputProcessBlock", 3 + 1 + 4, vec![72, 72], 72))?;

    let input = JobInput::uniform(2, 1, 2).with_process_block("PROD1", &[("begin", 31), ("end", 41)]);
    let report = s.run(&input).await?;
    assert_eq!(report.events_accepted, 4);
    assert_eq!(report.transitions.get(ScopeKind::Process, Transition::AccessInput), 1);
    Ok(())
}

#[tokio::test]
async fn test_wrong_expected_cache_value_fails() {
    let mut s = scheduler(1);
    s.add_module(InputProcessBlockIntFilter::new("testInputProcessBlock", 6, vec![70], 72))
        .unwrap();

    let input = JobInput::uniform(1, 1, 2).with_process_block("PROD1", &[("begin", 31), ("end", 41)]);
    let err = s.run(&input).await.unwrap_err();
    assert!(err.is_violation(ViolationKind::Count), "{}", err);
    assert!(err.to_string().contains("first cached value was 72 but it was supposed to be 70"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_bounds_filter_calls() -> Result<()> {
    let mut s = scheduler(4);
    s.add_module_with_limit(RunIntFilter::new("testGlobalFilter", 2 + 40 + 2, 20), Some(1))?;
    s.add_module_with_limit(EndRunFilter::new("testEndRun", 2), Some(2))?;

    let report = s.run(&JobInput::uniform(2, 1, 20)).await?;
    assert!(report.module("testGlobalFilter").unwrap().peak_concurrency <= 1);
    assert!(report.module("testEndRun").unwrap().peak_concurrency <= 2);
    assert_eq!(report.events_accepted, 40);
    Ok(())
}

#[tokio::test]
async fn test_wrong_cache_value_aborts_with_count_violation() {
    let mut s = scheduler(2);
    s.add_module(RunIntFilter::new("testGlobalFilter", 2 + 5 + 2, 4)).unwrap();

    let err = s.run(&JobInput::uniform(2, 1, 5)).await.unwrap_err();
    assert!(err.is_violation(ViolationKind::Count), "{}", err);
    assert!(err.to_string().contains("testGlobalFilter"));
}

#[tokio::test]
async fn test_wrong_transition_total_fails_at_end_job() {
    let mut s = scheduler(2);
    s.add_module(BeginLumiFilter::new("testBeginLumi", 3)).unwrap();

    let err = s.run(&JobInput::uniform(1, 2, 1)).await.unwrap_err();
    let violation = err.violation().unwrap();
    assert_eq!(violation.kind, ViolationKind::Count);
    assert!(violation.message.contains("transitions 2 but it was supposed to be 3"));
}

#[tokio::test]
async fn test_job_without_modules_rejected() {
    let err = scheduler(2).run(&JobInput::uniform(1, 1, 1)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Config(_)));
}

/// Fold the same contributions from concurrent tasks, spawned in each order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reducer_folds_agree_across_orders() {
    use std::sync::Arc;
    use streamscope::filters::StreamTally;
    use streamscope::summary::SummaryReducer;

    let contributions = [2u32, 0, 3, 5];
    let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];
    let mut finals = Vec::new();

    for order in orders {
        let reducer = Arc::new(SummaryReducer::new(StreamTally::default()));
        let tasks: Vec<_> = order
            .iter()
            .map(|&i| {
                let reducer = Arc::clone(&reducer);
                let events = contributions[i];
                tokio::spawn(async move {
                    reducer.fold(|summary| {
                        summary.value += events;
                        Ok(())
                    })
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(reducer.fold_count(), 4);
        finals.push(reducer.finalize(|summary| Ok(summary.value)).unwrap());
    }

    assert!(finals.iter().all(|&v| v == 10), "{:?}", finals);
}

/// Summary filters finalize the same value whatever the pool size, so
/// the fold order across streams does not matter
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_summary_filters_agree_for_one_and_four_streams() -> Result<()> {
    use streamscope::filters::{LumiSummaryIntFilter, RunSummaryIntFilter};

    for streams in [1u32, 4] {
        let mut s = scheduler(streams as usize);
        // begin_stream, begin summary per run, events, fold per stream and run, end summary per run
        s.add_module(RunSummaryIntFilter::new("testRunSummary", streams + 2 + 10 + streams * 2 + 2, 5))?;
        // begin_stream, begin summary per lumi, events, end summary per lumi
        s.add_module(LumiSummaryIntFilter::new("testLumiSummary", streams + 2 + 10 + 2, 5))?;

        let report = s.run(&JobInput::uniform(2, 1, 5)).await?;
        assert_eq!(report.events_accepted, 10, "streams={}", streams);
        let run_summary = report.module("testRunSummary").unwrap();
        assert_eq!(run_summary.transitions.get(ScopeKind::Run, Transition::EndSummary), 2);
        assert_eq!(
            run_summary.transitions.get(ScopeKind::Run, Transition::StreamEndSummary),
            2 * streams as u64
        );
    }
    Ok(())
}
