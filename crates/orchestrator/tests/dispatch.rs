use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use events::{Event, EventBus};
use ledger::{create_memory_pool, run_migrations, MemoryLedger, RunRecordRepository, SampleLedger, SqliteLedger};
use orchestrator::{
    Dispatcher, DispatcherConfig, OrchestratorError, PlanCompiler, RunScheduler, Spacing, TriggerConfig, TriggerLine,
    TriggerLines,
};
use pal_core::{
    ArchiveParams, Component, CustomCapabilities, ErrorKind, Method, MicroStep, PositionRequest, Sample, SampleStatus,
    Tool, TransferParams, TrayCoord, TrayKind, WashFlags,
};
use registry::{PositionRegistry, Topology};
use transport::{DryRunTransport, InstrumentTransport, JobCommand, JobState, TransportError};

/// A line the instrument holds high: every read observes it.
struct AlwaysHigh;

#[async_trait]
impl TriggerLine for AlwaysHigh {
    async fn read(&self) -> orchestrator::Result<bool> {
        Ok(true)
    }

    async fn reset(&self) -> orchestrator::Result<()> {
        Ok(())
    }
}

fn instant_triggers() -> TriggerLines {
    TriggerLines::new(Arc::new(AlwaysHigh), Arc::new(AlwaysHigh), Arc::new(AlwaysHigh))
}

/// Launches nothing; reports the job as running for a fixed number of polls.
struct ScriptedLaunch {
    running_polls: AtomicUsize,
    exit_failed: bool,
    terminated: AtomicBool,
}

impl ScriptedLaunch {
    fn new(running_polls: usize, exit_failed: bool) -> Self {
        Self {
            running_polls: AtomicUsize::new(running_polls),
            exit_failed,
            terminated: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl InstrumentTransport for ScriptedLaunch {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn prepare_aux_log(&self, _path: &str) -> transport::Result<()> {
        Ok(())
    }

    async fn transmit(&self, _command: &JobCommand) -> transport::Result<()> {
        Ok(())
    }

    fn poll_job(&self) -> transport::Result<JobState> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(JobState::Idle);
        }
        let remaining = self.running_polls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.running_polls.store(remaining - 1, Ordering::SeqCst);
            return Ok(JobState::Running);
        }
        if self.exit_failed {
            Err(TransportError::CommandFailed("PAL.exe exited with 1".to_string()))
        } else {
            Ok(JobState::Idle)
        }
    }

    fn terminate(&self) -> transport::Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn archive_reservoir(volume_ul: f64) -> MicroStep {
    MicroStep::new(
        Method::Archive(ArchiveParams {
            source: PositionRequest::custom("elec_res1"),
            volume_ul,
        }),
        Tool::Ls3,
    )
}

fn topology() -> Topology {
    Topology::new()
        .with_custom("elec_res1", CustomCapabilities::default().with_destination(false))
        .with_custom("cell1_we", CustomCapabilities::default().with_assembly(true))
        .with_custom("lcInjector1", CustomCapabilities::default().with_always_destroys(true))
        .with_tray(1, 1, TrayKind::Vt15)
        .with_tray(2, 1, TrayKind::Vt54)
}

fn trigger_config() -> TriggerConfig {
    TriggerConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_start_timeout(Duration::from_secs(30))
        .with_continue_timeout(Duration::from_secs(30))
        .with_done_timeout(Duration::from_secs(30))
}

fn transfer_to_cell(volume_ul: f64) -> MicroStep {
    MicroStep::new(
        Method::Transfer(TransferParams {
            source: PositionRequest::custom("elec_res1"),
            destination: PositionRequest::custom("cell1_we"),
            volume_ul,
        }),
        Tool::Ls3,
    )
    .with_wash(WashFlags {
        wash1: true,
        ..WashFlags::default()
    })
}

fn archive_cell(volume_ul: f64) -> MicroStep {
    MicroStep::new(
        Method::Archive(ArchiveParams {
            source: PositionRequest::custom("cell1_we"),
            volume_ul,
        }),
        Tool::Ls3,
    )
}

fn dispatcher_config() -> DispatcherConfig {
    DispatcherConfig::default()
        .with_method_dir("C:/PAL/methods")
        .with_log_dir("C:/PAL/logs")
        .with_triggers(trigger_config())
}

/// Dispatcher over a scripted launch; the registry starts with a reservoir.
async fn scripted(
    tmp: &TempDir,
    triggers: Option<TriggerLines>,
    launch: Arc<ScriptedLaunch>,
) -> (PlanCompiler, Arc<Dispatcher>) {
    let registry = PositionRegistry::load(tmp.path().join("registry.json"), topology())
        .await
        .unwrap();
    let ledger: Arc<dyn SampleLedger> = Arc::new(MemoryLedger::new("lab"));
    let reservoir = ledger
        .put(vec![Sample::liquid(50.0, vec![Component::new("KOH", 1.0)])])
        .await
        .unwrap()
        .remove(0);
    registry.update_custom("elec_res1", Some(reservoir)).await.unwrap();

    let mut dispatcher = Dispatcher::new(registry.clone(), ledger, launch, dispatcher_config());
    if let Some(lines) = triggers {
        dispatcher = dispatcher.with_triggers(lines);
    }
    (PlanCompiler::new(registry), Arc::new(dispatcher))
}

struct Rig {
    _tmp: TempDir,
    registry: PositionRegistry,
    ledger: Arc<dyn SampleLedger>,
    transport: Arc<DryRunTransport>,
    compiler: PlanCompiler,
    dispatcher: Arc<Dispatcher>,
    bus: EventBus,
    run_records: Option<RunRecordRepository>,
}

async fn rig(triggers: Option<TriggerLines>, sqlite: bool) -> Rig {
    let tmp = TempDir::new().unwrap();
    let bus = EventBus::new();
    let registry = PositionRegistry::load(tmp.path().join("registry.json"), topology())
        .await
        .unwrap()
        .with_event_bus(bus.clone());

    let (ledger, run_records) = if sqlite {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let ledger: Arc<dyn SampleLedger> = Arc::new(SqliteLedger::new(pool.clone(), "lab"));
        (ledger, Some(RunRecordRepository::new(pool)))
    } else {
        let ledger: Arc<dyn SampleLedger> = Arc::new(MemoryLedger::new("lab"));
        (ledger, None)
    };

    let reservoir = ledger
        .put(vec![Sample::liquid(50.0, vec![Component::new("KOH", 1.0)])])
        .await
        .unwrap()
        .remove(0);
    registry.update_custom("elec_res1", Some(reservoir)).await.unwrap();

    let transport = Arc::new(DryRunTransport::new());
    let config = dispatcher_config();
    let mut dispatcher = Dispatcher::new(registry.clone(), ledger.clone(), transport.clone(), config)
        .with_event_bus(bus.clone());
    if let Some(lines) = triggers {
        dispatcher = dispatcher.with_triggers(lines);
    }
    if let Some(repository) = &run_records {
        dispatcher = dispatcher.with_run_records(repository.clone());
    }

    Rig {
        _tmp: tmp,
        compiler: PlanCompiler::new(registry.clone()),
        registry,
        ledger,
        transport,
        dispatcher: Arc::new(dispatcher),
        bus,
        run_records,
    }
}

#[tokio::test]
async fn test_transfer_then_archive_commits_provenance() {
    let rig = rig(Some(instant_triggers()), true).await;
    let mut events = rig.bus.subscribe();

    let mut job = rig
        .compiler
        .compile(&[transfer_to_cell(200.0), archive_cell(100.0)])
        .await
        .unwrap();
    rig.dispatcher.submit(&mut job).await.unwrap();

    // One command carrying both method calls.
    let commands = rig.transport.commands().await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].calls.len(), 2);
    assert_eq!(commands[0].calls[0].method_file, "C:/PAL/methods/lcfc_transfer.cam");
    let logfile = job.aux_log_path.clone().unwrap();
    assert!(logfile.starts_with("C:/PAL/logs/"));
    assert_eq!(
        commands[0].calls[0].params,
        format!("LS3;200;elec_res1;;;;cell1_we;;;;1;0;0;0;{}", logfile)
    );
    assert_eq!(
        commands[0].calls[1].params,
        format!("LS3;100;cell1_we;;;;tray;2;1;1;0;0;0;0;{}", logfile)
    );
    assert_eq!(rig.transport.aux_logs().await, vec![logfile]);

    // The cell holds the labeled transfer product, less what was archived.
    let cell = rig.registry.query_custom("cell1_we").await.unwrap().unwrap();
    assert_eq!(cell.label(), Some("lab__liquid__2"));
    assert!((cell.volume_ml().unwrap() - 0.1).abs() < 1e-9);
    assert!(cell.has_status(SampleStatus::Created));
    assert_eq!(cell.meta().source, vec!["lab__liquid__1".to_string()]);
    assert_eq!(cell.meta().created_at, job.runs[0].continue_time);

    // The archive vial holds a new sample drawn from the cell.
    let vial = rig.registry.query_tray(2, 1, 1).await.unwrap().unwrap();
    assert_eq!(vial.label(), Some("lab__liquid__3"));
    assert_eq!(vial.volume_ml(), Some(0.1));
    assert_eq!(vial.meta().source, vec!["lab__liquid__2".to_string()]);
    assert!(!rig.registry.snapshot().await.is_blocked(TrayCoord::new(2, 1, 1)).unwrap());

    // Ledger and registry agree on the reservoir.
    let reservoir = rig.ledger.get(&["lab__liquid__1".to_string()]).await.unwrap().remove(0);
    assert!((reservoir.volume_ml().unwrap() - 49.8).abs() < 1e-9);
    let in_registry = rig.registry.query_custom("elec_res1").await.unwrap().unwrap();
    assert_eq!(in_registry.label(), reservoir.label());
    assert!((in_registry.volume_ml().unwrap() - 49.8).abs() < 1e-9);

    assert!(job.runs.iter().all(|run| run.is_confirmed()));
    let records = rig
        .run_records
        .as_ref()
        .unwrap()
        .find_by_job_id(job.id)
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().any(|r| r.method == "archive"
        && r.destination_coord == Some(TrayCoord::new(2, 1, 1))
        && r.samples_out == vec!["lab__liquid__3".to_string()]));

    let mut confirmed = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        if let Event::StepRunConfirmed { samples_out, .. } = envelope.event {
            confirmed.push(samples_out);
        }
    }
    assert_eq!(
        confirmed,
        vec![vec!["lab__liquid__2".to_string()], vec!["lab__liquid__3".to_string()]]
    );
}

#[tokio::test]
async fn test_repeated_transfer_dilutes_committed_sample() {
    let rig = rig(Some(instant_triggers()), false).await;

    let mut job = rig
        .compiler
        .compile(&[transfer_to_cell(200.0).with_repeat(3)])
        .await
        .unwrap();
    rig.dispatcher.submit(&mut job).await.unwrap();

    let cell = rig.registry.query_custom("cell1_we").await.unwrap().unwrap();
    assert_eq!(cell.label(), Some("lab__liquid__2"));
    assert!((cell.volume_ml().unwrap() - 0.6).abs() < 1e-9);
    assert!(job.runs[1].samples_out.is_empty());
    assert_eq!(job.runs[2].samples_in[1].sample.label(), Some("lab__liquid__2"));
}

#[tokio::test]
async fn test_unconfigured_triggers_stamp_local_clock() {
    let rig = rig(None, false).await;

    let mut job = rig.compiler.compile(&[transfer_to_cell(200.0)]).await.unwrap();
    rig.dispatcher.submit(&mut job).await.unwrap();

    let run = &job.runs[0];
    assert!(run.start_time.is_some());
    assert_eq!(run.start_time, run.continue_time);
    assert_eq!(run.continue_time, run.done_time);
    let cell = rig.registry.query_custom("cell1_we").await.unwrap().unwrap();
    assert!((cell.volume_ml().unwrap() - 0.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_injection_clears_injector() {
    let rig = rig(Some(instant_triggers()), false).await;
    let inject = MicroStep::new(
        Method::InjectLiquid(pal_core::InjectParams {
            source: PositionRequest::custom("elec_res1"),
            injector: "lcInjector1".to_string(),
            volume_ul: 10.0,
        }),
        Tool::Ls1,
    );

    let mut job = rig.compiler.compile(&[inject]).await.unwrap();
    rig.dispatcher.submit(&mut job).await.unwrap();

    assert!(rig.registry.query_custom("lcInjector1").await.unwrap().is_none());
    let injected = rig.ledger.get(&["lab__liquid__2".to_string()]).await.unwrap().remove(0);
    assert!(injected.has_status(SampleStatus::Destroyed));
}

#[tokio::test(start_paused = true)]
async fn test_continue_timeout_leaves_state_untouched() {
    let (lines, handles) = TriggerLines::memory();
    let lines = TriggerLines::new(Arc::new(AlwaysHigh), lines.continue_, lines.done);
    let rig = rig(Some(lines), false).await;

    let mut job = rig
        .compiler
        .compile(&[transfer_to_cell(1000.0), archive_cell(200.0)])
        .await
        .unwrap();
    let err = rig.dispatcher.submit(&mut job).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ContinueTimeout);
    let run = &job.runs[0];
    assert!(run.start_time.is_some());
    assert!(run.continue_time.is_none());
    assert!(run.done_time.is_none());
    assert!(!handles[1].is_set());

    // Nothing was committed and the archive vial reservation is gone.
    assert!(rig.registry.query_custom("cell1_we").await.unwrap().is_none());
    assert!(!rig.registry.snapshot().await.is_blocked(TrayCoord::new(2, 1, 1)).unwrap());
    assert!(!rig.dispatcher.is_busy());
}

#[tokio::test]
async fn test_second_submit_is_rejected_and_abort_stops_wait() {
    let (lines, _handles) = TriggerLines::memory();
    let rig = rig(Some(lines), false).await;

    let mut first = rig.compiler.compile(&[transfer_to_cell(200.0)]).await.unwrap();
    let dispatcher = rig.dispatcher.clone();
    let running = tokio::spawn(async move { dispatcher.submit(&mut first).await });

    while !rig.dispatcher.is_busy() {
        tokio::task::yield_now().await;
    }

    let mut second = rig
        .compiler
        .compile(&[MicroStep::new(Method::DeepClean, Tool::Ls1)])
        .await
        .unwrap();
    let err = rig.dispatcher.submit(&mut second).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InProgress));

    rig.dispatcher.abort();
    let err = running.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Estop);

    // The stop stays latched until cleared.
    let err = rig.dispatcher.submit(&mut second).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Estop);
    rig.dispatcher.reset_abort();
    assert!(!rig.dispatcher.is_aborted());
}

#[tokio::test(start_paused = true)]
async fn test_linear_schedule_spacing() {
    let rig = rig(None, false).await;
    let scheduler = RunScheduler::new(rig.compiler.clone(), rig.dispatcher.clone());

    let runs = scheduler
        .run_schedule(
            &[MicroStep::new(Method::DeepClean, Tool::Ls1)],
            3,
            &Spacing::Linear {
                periods: vec![Duration::from_secs(60), Duration::from_secs(600), Duration::from_secs(1140)],
            },
            Duration::ZERO,
        )
        .await
        .unwrap();

    assert_eq!(runs.len(), 3);
    assert!(runs[0].offset_from_start >= Duration::from_secs(60));
    assert!(runs[1].offset_from_start >= Duration::from_secs(660));
    assert!(runs[2].offset_from_start >= Duration::from_secs(1800));
    assert!(runs[2].offset_from_start < Duration::from_secs(1801));
    assert_eq!(rig.transport.commands().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_schedule_abort_between_runs() {
    let rig = rig(None, false).await;
    let scheduler = RunScheduler::new(rig.compiler.clone(), rig.dispatcher.clone());
    let dispatcher = rig.dispatcher.clone();

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(100)).await;
        dispatcher.abort();
    });
    let err = scheduler
        .run_schedule(
            &[MicroStep::new(Method::DeepClean, Tool::Ls1)],
            3,
            &Spacing::Custom {
                offsets: vec![Duration::ZERO, Duration::from_secs(300), Duration::from_secs(600)],
            },
            Duration::ZERO,
        )
        .await
        .unwrap_err();
    stopper.await.unwrap();

    assert_eq!(err.kind(), ErrorKind::Estop);
    assert_eq!(rig.transport.commands().await.len(), 1);
}

#[tokio::test]
async fn test_rejected_submit_releases_reservations() {
    let (lines, _handles) = TriggerLines::memory();
    let rig = rig(Some(lines), false).await;

    let mut first = rig.compiler.compile(&[transfer_to_cell(200.0)]).await.unwrap();
    let dispatcher = rig.dispatcher.clone();
    let running = tokio::spawn(async move { dispatcher.submit(&mut first).await });
    while !rig.dispatcher.is_busy() {
        tokio::task::yield_now().await;
    }

    let vial = TrayCoord::new(2, 1, 1);
    let mut second = rig.compiler.compile(&[archive_reservoir(100.0)]).await.unwrap();
    assert!(rig.registry.snapshot().await.is_blocked(vial).unwrap());
    let err = rig.dispatcher.submit(&mut second).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InProgress));
    assert!(!rig.registry.snapshot().await.is_blocked(vial).unwrap());

    rig.dispatcher.abort();
    running.await.unwrap().unwrap_err();

    let mut third = rig.compiler.compile(&[archive_reservoir(100.0)]).await.unwrap();
    assert!(rig.registry.snapshot().await.is_blocked(vial).unwrap());
    let err = rig.dispatcher.submit(&mut third).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Estop);
    assert!(!rig.registry.snapshot().await.is_blocked(vial).unwrap());
    assert!(rig.registry.query_tray(2, 1, 1).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_job_exiting_with_error_fails_trigger_wait() {
    let tmp = TempDir::new().unwrap();
    let (lines, _handles) = TriggerLines::memory();
    let launch = Arc::new(ScriptedLaunch::new(3, true));
    let (compiler, dispatcher) = scripted(&tmp, Some(lines), launch).await;

    let mut job = compiler.compile(&[archive_reservoir(100.0)]).await.unwrap();
    let started = tokio::time::Instant::now();
    let err = dispatcher.submit(&mut job).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CmdError);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(job.runs[0].start_time.is_none());
    assert!(!compiler.registry().snapshot().await.is_blocked(TrayCoord::new(2, 1, 1)).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_unconfigured_triggers_wait_for_job_exit() {
    let tmp = TempDir::new().unwrap();
    let launch = Arc::new(ScriptedLaunch::new(5, false));
    let (compiler, dispatcher) = scripted(&tmp, None, launch.clone()).await;

    let mut job = compiler.compile(&[transfer_to_cell(200.0)]).await.unwrap();
    let started = tokio::time::Instant::now();
    dispatcher.submit(&mut job).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(launch.running_polls.load(Ordering::SeqCst), 0);
    assert!(job.runs[0].is_confirmed());
    assert!(compiler.registry().query_custom("cell1_we").await.unwrap().is_some());
}

#[tokio::test]
async fn test_abort_kills_launched_job() {
    let tmp = TempDir::new().unwrap();
    let (lines, _handles) = TriggerLines::memory();
    let launch = Arc::new(ScriptedLaunch::new(usize::MAX, false));
    let (compiler, dispatcher) = scripted(&tmp, Some(lines), launch.clone()).await;

    let mut job = compiler.compile(&[transfer_to_cell(200.0)]).await.unwrap();
    let submitting = dispatcher.clone();
    let running = tokio::spawn(async move { submitting.submit(&mut job).await });
    while !dispatcher.is_busy() {
        tokio::task::yield_now().await;
    }

    dispatcher.abort();
    let err = running.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Estop);
    assert!(launch.terminated.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_rejected_scheduled_run_releases_reservation() {
    let (lines, _handles) = TriggerLines::memory();
    let rig = rig(Some(lines), false).await;

    let mut first = rig.compiler.compile(&[transfer_to_cell(200.0)]).await.unwrap();
    let dispatcher = rig.dispatcher.clone();
    let running = tokio::spawn(async move { dispatcher.submit(&mut first).await });
    while !rig.dispatcher.is_busy() {
        tokio::task::yield_now().await;
    }

    let scheduler = RunScheduler::new(rig.compiler.clone(), rig.dispatcher.clone());
    let err = scheduler
        .run_schedule(
            &[archive_reservoir(100.0)],
            1,
            &Spacing::Custom { offsets: vec![Duration::ZERO] },
            Duration::ZERO,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InProgress));
    assert!(!rig.registry.snapshot().await.is_blocked(TrayCoord::new(2, 1, 1)).unwrap());

    rig.dispatcher.abort();
    running.await.unwrap().unwrap_err();
}
