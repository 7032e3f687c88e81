use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use slotflow::{
    constructor, run_worker, ConveyorConfig, CreateFn, ExecutionContext, InputRejected,
    MigrationContext, PulseConveyor, PulseGenerator, PulseNumber, SlotMachineConfig, SlotWorker,
    StateMachine, StateUpdate, WorkerId, WorkerSignal,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Slotflow - push events through a pulse conveyor
#[derive(Parser, Debug)]
#[command(name = "slotflow")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of pulses to commit
    #[arg(long, default_value_t = 5)]
    pulses: usize,

    /// Events submitted per pulse, for the present and the next pulse each
    #[arg(long, default_value_t = 3)]
    events: u32,

    /// Milliseconds between pulse commits
    #[arg(long, default_value_t = 200)]
    interval: u64,

    /// Pulse number delta between pulses
    #[arg(long, default_value_t = 10)]
    delta: u16,

    /// Polls an event waits before it completes
    #[arg(long, default_value_t = 2)]
    polls: u32,

    /// Conveyor configuration as JSON; overrides the options below
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 1024)]
    page_size: usize,

    #[arg(long, default_value_t = 10_000)]
    scan_limit: usize,

    /// Milliseconds between polls of a waiting slot
    #[arg(long, default_value_t = 20)]
    polling_period: u64,

    /// Past pulses kept alive
    #[arg(long, default_value_t = 2)]
    retention: usize,
}

impl Args {
    fn conveyor_config(&self) -> Result<ConveyorConfig, Box<dyn std::error::Error>> {
        if let Some(path) = &self.config {
            let text = std::fs::read_to_string(path)?;
            return Ok(ConveyorConfig::from_json(&text)?);
        }
        Ok(ConveyorConfig {
            machine: SlotMachineConfig {
                slot_page_size: self.page_size,
                polling_period: Duration::from_millis(self.polling_period),
                polling_truncate: Duration::from_millis(1),
                scan_count_limit: self.scan_limit,
            },
            past_pulse_retention: self.retention,
        })
    }
}

/// An input event.
#[derive(Debug, Clone)]
struct Event {
    name: String,
}

/// Processes one event: waits a few polls, then completes.
struct EventMachine {
    pulse: PulseNumber,
    event: Event,
    polls_left: u32,
    done: Arc<AtomicUsize>,
}

impl StateMachine for EventMachine {
    fn init(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
        ctx.set_default_migration(EventMachine::migrate);
        ctx.jump(EventMachine::process)
    }
}

impl EventMachine {
    fn process(&mut self, ctx: &mut ExecutionContext<'_>) -> StateUpdate {
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return ctx.poll().then_repeat();
        }
        info!(pulse = %self.pulse, event = %self.event.name, "event processed");
        self.done.fetch_add(1, Ordering::Relaxed);
        ctx.stop()
    }

    fn migrate(&mut self, ctx: &mut MigrationContext<'_>) -> StateUpdate {
        debug!(
            pulse = %self.pulse,
            event = %self.event.name,
            migration = ctx.migration_count(),
            "event migrated"
        );
        ctx.stay()
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.conveyor_config()?;
    let done = Arc::new(AtomicUsize::new(0));
    let signal = WorkerSignal::new();

    let factory_done = done.clone();
    let polls = args.polls;
    let factory = move |pulse: PulseNumber, event: Event| -> Result<CreateFn, InputRejected> {
        if event.name.is_empty() {
            return Err(InputRejected::new("event without a name"));
        }
        Ok(constructor(EventMachine {
            pulse,
            event,
            polls_left: polls,
            done: factory_done.clone(),
        }))
    };
    let conveyor = Arc::new(PulseConveyor::with_signal(config, factory, signal.clone())?);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = tokio::spawn(run_worker(
        conveyor.driver(),
        SlotWorker::new(WorkerId(0), signal),
        Duration::from_millis(args.interval.max(1)),
        async move {
            let _ = stop_rx.await;
        },
    ));

    let mut submitted = 0usize;
    for pd in PulseGenerator::new(args.delta)?.take(args.pulses) {
        conveyor.commit_pulse_change(pd.clone())?;
        info!(pulse = %pd.pulse_number, "pulse committed");

        let targets = [Some(pd.pulse_number), pd.next_pulse_number()];
        for (label, pulse) in ["present", "future"].iter().zip(targets) {
            let Some(pulse) = pulse else {
                continue;
            };
            for i in 0..args.events {
                let event = Event {
                    name: format!("{label}-{}-{i}", pd.pulse_number),
                };
                match conveyor.add_input(pulse, event) {
                    Ok(()) => submitted += 1,
                    Err(e) => warn!(pulse = %pulse, error = %e, "input refused"),
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(args.interval)).await;
    }

    let _ = stop_tx.send(());
    worker.await?;
    let stopped = conveyor.stop();
    info!(
        submitted,
        processed = done.load(Ordering::Relaxed),
        stopped,
        "conveyor finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
