use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use slotflow_conveyor::{
    ConveyorConfig, ConveyorError, Entropy, InputRejected, PulseConveyor, PulseData,
    PulseGenerator, PulseNumber, PulseSlotState,
};
use slotflow_smachine::{
    constructor, run_worker, CreateFn, ExecutionContext, MigrationContext, SlotMachineConfig,
    SlotWorker, StateMachine, StateUpdate, WorkerId, WorkerSignal,
};

type Log = Arc<Mutex<Vec<String>>>;
type Created = Result<CreateFn, InputRejected>;

fn record(log: &Log, entry: String) {
    log.lock().unwrap().push(entry);
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn config(retention: usize) -> ConveyorConfig {
    ConveyorConfig {
        machine: SlotMachineConfig {
            slot_page_size: 16,
            polling_period: Duration::from_millis(50),
            polling_truncate: Duration::from_millis(1),
            scan_count_limit: 1000,
        },
        past_pulse_retention: retention,
    }
}

/// Sleeps forever and reports its migrations.
struct Resident {
    log: Log,
    pulse: PulseNumber,
    value: u32,
}

impl StateMachine for Resident {
    fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
        ctx.set_default_migration(Resident::on_migrate);
        record(&self.log, format!("init {} {}", self.value, self.pulse));
        ctx.sleep().then_repeat()
    }
}

impl Resident {
    fn on_migrate(&mut self, ctx: &mut MigrationContext<'_>) -> StateUpdate {
        record(
            &self.log,
            format!("migrate {} {}", self.value, ctx.migration_count()),
        );
        ctx.stay()
    }
}

fn resident_conveyor(log: &Log, retention: usize) -> PulseConveyor<u32> {
    let log = log.clone();
    PulseConveyor::new(
        config(retention),
        move |pulse: PulseNumber, value: u32| -> Created {
            Ok(constructor(Resident {
                log: log.clone(),
                pulse,
                value,
            }))
        },
    )
    .unwrap()
}

fn drain(conveyor: &PulseConveyor<u32>, worker: &SlotWorker) {
    for _ in 0..100 {
        if !conveyor.scan_once(worker).repeat_now {
            return;
        }
    }
    panic!("conveyor did not become idle");
}

fn pulses(n: usize) -> Vec<PulseData> {
    PulseGenerator::new(10).unwrap().take(n).collect()
}

#[test]
fn test_future_input_waits_for_commit() {
    let log: Log = Arc::default();
    let conveyor = resident_conveyor(&log, 1);
    let worker = SlotWorker::new(WorkerId(0), conveyor.signal().clone());
    let p = pulses(2);

    conveyor.commit_pulse_change(p[0].clone()).unwrap();
    let next = p[0].next_pulse_number().unwrap();
    conveyor.add_input(next, 1).unwrap();
    assert_eq!(conveyor.pulse_state(next), Some(PulseSlotState::Future));

    drain(&conveyor, &worker);
    assert!(entries(&log).is_empty());
    assert_eq!(conveyor.slot_count(next), Some(0));

    conveyor.commit_pulse_change(p[1].clone()).unwrap();
    assert_eq!(entries(&log), [format!("init 1 {next}")]);
    assert_eq!(conveyor.pulse_state(next), Some(PulseSlotState::Present));
    assert_eq!(conveyor.present_pulse(), Some(p[1].clone()));
}

#[test]
fn test_commit_migrates_every_live_slot_once() {
    let log: Log = Arc::default();
    let conveyor = resident_conveyor(&log, 2);
    let worker = SlotWorker::new(WorkerId(0), conveyor.signal().clone());
    let p = pulses(3);

    conveyor.commit_pulse_change(p[0].clone()).unwrap();
    conveyor.commit_pulse_change(p[1].clone()).unwrap();
    conveyor.add_input(p[0].pulse_number, 1).unwrap();
    conveyor.add_input(p[1].pulse_number, 2).unwrap();
    drain(&conveyor, &worker);
    assert_eq!(entries(&log).len(), 2);

    conveyor.commit_pulse_change(p[2].clone()).unwrap();
    let mut migrations: Vec<_> = entries(&log)
        .into_iter()
        .filter(|e| e.starts_with("migrate"))
        .collect();
    migrations.sort();
    assert_eq!(migrations, ["migrate 1 2", "migrate 2 1"]);

    drain(&conveyor, &worker);
    assert_eq!(entries(&log).len(), 4);
}

#[test]
fn test_future_and_past_inputs_around_commit() {
    let log: Log = Arc::default();
    let conveyor = resident_conveyor(&log, 2);
    let p = pulses(3);
    let (past, present, future) = (p[0].pulse_number, p[1].pulse_number, p[2].pulse_number);

    conveyor.commit_pulse_change(p[0].clone()).unwrap();
    conveyor.commit_pulse_change(p[1].clone()).unwrap();
    assert_eq!(conveyor.present_pulse().unwrap().pulse_number, present);

    conveyor.add_input(future, 1).unwrap();
    conveyor.add_input(past, 2).unwrap();
    conveyor.commit_pulse_change(p[2].clone()).unwrap();

    assert!(entries(&log).contains(&format!("init 1 {future}")));
    assert_eq!(conveyor.pulse_state(future), Some(PulseSlotState::Present));
    assert_eq!(conveyor.slot_count(future), Some(1));
    assert_eq!(conveyor.pulse_state(past), Some(PulseSlotState::Past));
    assert_eq!(conveyor.slot_count(past), Some(1));
}

#[test]
fn test_rejects_out_of_window_pulses() {
    let log: Log = Arc::default();
    let conveyor = resident_conveyor(&log, 1);
    let p = pulses(3);
    conveyor.commit_pulse_change(p[0].clone()).unwrap();
    conveyor.commit_pulse_change(p[1].clone()).unwrap();
    conveyor.commit_pulse_change(p[2].clone()).unwrap();

    assert!(matches!(
        conveyor.add_input(p[0].pulse_number, 1),
        Err(ConveyorError::PulseTooOld { .. })
    ));
    let far = p[2].next_pulse_number().unwrap().checked_add(1).unwrap();
    assert!(matches!(
        conveyor.add_input(far, 1),
        Err(ConveyorError::FutureTooFar { .. })
    ));
    assert!(matches!(
        conveyor.commit_pulse_change(p[1].clone()),
        Err(ConveyorError::NonMonotonic { .. })
    ));
    assert!(conveyor
        .commit_pulse_change(PulseData::new_first(0, Entropy::default()))
        .is_err());
}

#[test]
fn test_stop_drops_every_arena() {
    let log: Log = Arc::default();
    let conveyor = resident_conveyor(&log, 1);
    let p = pulses(1);
    conveyor.commit_pulse_change(p[0].clone()).unwrap();
    conveyor.add_input(p[0].pulse_number, 1).unwrap();
    drain(
        &conveyor,
        &SlotWorker::new(WorkerId(0), conveyor.signal().clone()),
    );

    assert_eq!(conveyor.stop(), 1);
    assert_eq!(conveyor.arena_count(), 0);
    assert!(matches!(
        conveyor.add_input(p[0].pulse_number, 1),
        Err(ConveyorError::NotStarted)
    ));
}

#[test]
fn test_commit_does_not_rerun_finished_init() {
    let log: Log = Arc::default();
    let conveyor = resident_conveyor(&log, 1);
    let worker = SlotWorker::new(WorkerId(0), conveyor.signal().clone());
    let p = pulses(2);

    conveyor.commit_pulse_change(p[0].clone()).unwrap();
    conveyor.add_input(p[0].pulse_number, 1).unwrap();
    drain(&conveyor, &worker);
    conveyor.commit_pulse_change(p[1].clone()).unwrap();
    drain(&conveyor, &worker);

    assert_eq!(
        entries(&log),
        [format!("init 1 {}", p[0].pulse_number), "migrate 1 1".to_string()]
    );
}

type ConveyorCell = Arc<OnceLock<Weak<PulseConveyor<u32>>>>;

/// Sends an input for the next pulse from inside its init step.
struct Forwarder {
    log: Log,
    conveyor: ConveyorCell,
    next: PulseNumber,
}

impl StateMachine for Forwarder {
    fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
        let forwarded = match self.conveyor.get().and_then(Weak::upgrade) {
            Some(conveyor) => conveyor.add_input(self.next, 7).is_ok(),
            None => false,
        };
        record(&self.log, format!("forwarded {forwarded}"));
        ctx.stop()
    }
}

#[test]
fn test_step_can_open_future_arena() {
    let log: Log = Arc::default();
    let p = pulses(2);
    let next = p[0].next_pulse_number().unwrap();
    let cell: ConveyorCell = Arc::default();

    let factory_log = log.clone();
    let factory_cell = cell.clone();
    let conveyor = Arc::new(
        PulseConveyor::new(config(1), move |pulse: PulseNumber, value: u32| -> Created {
            if value == 0 {
                return Ok(constructor(Forwarder {
                    log: factory_log.clone(),
                    conveyor: factory_cell.clone(),
                    next,
                }));
            }
            Ok(constructor(Resident {
                log: factory_log.clone(),
                pulse,
                value,
            }))
        })
        .unwrap(),
    );
    cell.set(Arc::downgrade(&conveyor)).unwrap();
    conveyor.commit_pulse_change(p[0].clone()).unwrap();
    conveyor.add_input(p[0].pulse_number, 0).unwrap();

    let scanner = conveyor.clone();
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let worker = SlotWorker::new(WorkerId(0), scanner.signal().clone());
        drain(&scanner, &worker);
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("scan pass finished");

    assert_eq!(entries(&log), ["forwarded true"]);
    assert_eq!(conveyor.pulse_state(next), Some(PulseSlotState::Future));
    assert_eq!(conveyor.arena_count(), 2);

    conveyor.commit_pulse_change(p[1].clone()).unwrap();
    assert_eq!(
        entries(&log),
        ["forwarded true".to_string(), format!("init 7 {next}")]
    );
    assert_eq!(conveyor.slot_count(next), Some(1));
}

/// Records its event and stops.
struct Finish {
    log: Log,
    value: u32,
}

impl StateMachine for Finish {
    fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
        record(&self.log, format!("finish {}", self.value));
        ctx.stop()
    }
}

#[tokio::test]
async fn test_worker_drives_conveyor_across_pulses() {
    let log: Log = Arc::default();
    let factory_log = log.clone();
    let signal = WorkerSignal::new();
    let conveyor = Arc::new(
        PulseConveyor::with_signal(
            config(1),
            move |_pulse: PulseNumber, value: u32| -> Created {
                Ok(constructor(Finish {
                    log: factory_log.clone(),
                    value,
                }))
            },
            signal.clone(),
        )
        .unwrap(),
    );
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let driver = tokio::spawn(run_worker(
        conveyor.driver(),
        SlotWorker::new(WorkerId(0), signal),
        Duration::from_secs(30),
        async move {
            let _ = stop_rx.await;
        },
    ));

    for (value, pd) in (0u32..).zip(PulseGenerator::new(10).unwrap().take(3)) {
        conveyor.commit_pulse_change(pd.clone()).unwrap();
        conveyor.add_input(pd.pulse_number, value).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for _ in 0..100 {
        if entries(&log).len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut seen = entries(&log);
    seen.sort();
    assert_eq!(seen, ["finish 0", "finish 1", "finish 2"]);

    stop_tx.send(()).unwrap();
    let driver = driver.await.unwrap();
    let present = driver.conveyor().present_pulse().unwrap();
    assert_eq!(driver.conveyor().slot_count(present.pulse_number), Some(0));
}
