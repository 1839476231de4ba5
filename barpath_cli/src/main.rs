use barpath_core::archive::{cleanup_processed_wals, wal_to_csv_and_archive};
use barpath_core::equipment::{achievable_loads, format_weight};
use barpath_core::history::{load_all_records, previous_session_data, read_records};
use barpath_core::machine::WorkoutState;
use barpath_core::timer::TimerEvent;
use barpath_core::*;
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "barpath")]
#[command(about = "Guided strength sessions with load calibration and plate math", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON plan file to use instead of the built-in workouts
    #[arg(long, global = true)]
    plan: Option<PathBuf>,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a workout
    Run {
        /// Workout id from the plan library
        #[arg(long, default_value = "full_body_a")]
        workout: String,

        #[command(flatten)]
        drive: DriveArgs,
    },

    /// Resume an interrupted workout
    Resume {
        /// Continue the interrupted timer or start it over
        #[arg(long, value_enum, default_value_t = ChoiceArg::Continue)]
        timer: ChoiceArg,

        /// Continue an interrupted calibration or start it over
        #[arg(long, value_enum, default_value_t = ChoiceArg::Continue)]
        calibration: ChoiceArg,

        #[command(flatten)]
        drive: DriveArgs,
    },

    /// Throw away an interrupted workout
    Discard,

    /// Show whether an interrupted workout is waiting
    Status,

    /// List available workouts
    Workouts,

    /// Compute the plate change to reach a target load
    Plates {
        #[arg(long, default_value = "olympic_barbell")]
        equipment: String,

        /// Plates currently on one side, e.g. 20,10
        #[arg(long, value_delimiter = ',')]
        current: Vec<f64>,

        #[arg(long)]
        target: f64,
    },

    /// List every load the equipment can produce
    Loads {
        #[arg(long, default_value = "olympic_barbell")]
        equipment: String,
    },

    /// Roll up the set history WAL into CSV
    Rollup {
        /// Clean up processed WAL files after rollup
        #[arg(long)]
        cleanup: bool,
    },
}

#[derive(clap::Args, Clone, Copy)]
struct DriveArgs {
    /// Non-interactive: accept planned values and skip rests (for testing)
    #[arg(long)]
    auto: bool,

    /// With --auto, stop after this many transitions, leaving the workout
    /// interrupted
    #[arg(long, requires = "auto")]
    stop_after: Option<usize>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ChoiceArg {
    Continue,
    Restart,
}

impl From<ChoiceArg> for ChoiceMode {
    fn from(choice: ChoiceArg) -> Self {
        match choice {
            ChoiceArg::Continue => ChoiceMode::Continue,
            ChoiceArg::Restart => ChoiceMode::Restart,
        }
    }
}

/// Where everything lives under the data directory
struct DataPaths {
    wal_dir: PathBuf,
    wal: PathBuf,
    csv: PathBuf,
    checkpoints: PathBuf,
}

impl DataPaths {
    fn new(data_dir: &Path) -> Self {
        let wal_dir = data_dir.join("wal");
        Self {
            wal: wal_dir.join("sets.wal"),
            wal_dir,
            csv: data_dir.join("sets.csv"),
            checkpoints: data_dir.join("checkpoints"),
        }
    }

    fn services(&self, config: &Config) -> SessionServices {
        SessionServices::new(
            Arc::new(SystemClock),
            Box::new(JsonlHistory::new(&self.wal)),
            Box::new(FileCheckpointStore::new(&self.checkpoints)),
            config,
        )
    }

    fn recovery(&self, config: &Config) -> RecoveryManager {
        RecoveryManager::new(
            Box::new(FileCheckpointStore::new(&self.checkpoints)),
            &config.recovery,
        )
    }
}

fn main() {
    let cli = Cli::parse();
    barpath_core::logging::init_with_verbosity(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    let result = runtime.block_on(run(cli));
    // The stdin reader may still be parked on a blocking read
    runtime.shutdown_background();

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = cli.data_dir {
        config.data.data_dir = dir;
    }
    if let Some(plan) = cli.plan {
        config.data.plan_file = Some(plan);
    }

    let library = match &config.data.plan_file {
        Some(path) => PlanLibrary::load_from(path)?,
        None => get_default_library().clone(),
    };
    let paths = DataPaths::new(&config.data.data_dir);
    tracing::debug!("Using data directory {:?}", config.data.data_dir);

    match cli.command {
        Commands::Run { workout, drive } => cmd_run(&library, &config, &paths, &workout, drive).await,
        Commands::Resume {
            timer,
            calibration,
            drive,
        } => {
            let choice = ResumeChoice {
                timer: timer.into(),
                calibration: calibration.into(),
            };
            cmd_resume(&library, &config, &paths, choice, drive).await
        }
        Commands::Discard => cmd_discard(&library, &config, &paths),
        Commands::Status => cmd_status(&library, &config, &paths),
        Commands::Workouts => cmd_workouts(&library),
        Commands::Plates {
            equipment,
            current,
            target,
        } => cmd_plates(&library, &equipment, &current, target),
        Commands::Loads { equipment } => cmd_loads(&library, &equipment),
        Commands::Rollup { cleanup } => cmd_rollup(&paths, cleanup),
    }
}

async fn cmd_run(
    library: &PlanLibrary,
    config: &Config,
    paths: &DataPaths,
    workout_id: &str,
    drive: DriveArgs,
) -> Result<()> {
    std::fs::create_dir_all(&paths.wal_dir)?;

    if let Some(pending) = paths.recovery(config).load_pending(library, chrono::Utc::now()) {
        eprintln!(
            "An interrupted '{}' workout is waiting. Use `barpath resume` or `barpath discard`.",
            pending.workout_id
        );
        return Err(Error::Other("interrupted workout pending".into()));
    }

    let workout = library.workout(workout_id)?;
    let records = load_all_records(&paths.wal, &paths.csv)?;
    let previous = previous_session_data(&records, workout_id, None);

    let session = WorkoutSession::start(library, workout_id, config, previous, paths.services(config))?;
    println!("{}", workout.name);
    println!("─────────────────────────────────────────");

    drive_session(session, config, paths, drive).await
}

async fn cmd_resume(
    library: &PlanLibrary,
    config: &Config,
    paths: &DataPaths,
    choice: ResumeChoice,
    drive: DriveArgs,
) -> Result<()> {
    let mut services = paths.services(config);
    let Some(interrupted) = services.recovery.load_pending(library, chrono::Utc::now()) else {
        println!("No interrupted workout.");
        return Ok(());
    };

    let records = load_all_records(&paths.wal, &paths.csv)?;
    let previous = previous_session_data(
        &records,
        &interrupted.workout_id,
        Some(interrupted.workout_history_id),
    );

    println!("Resuming '{}'", interrupted.workout_id);
    let session = WorkoutSession::resume_from(library, interrupted, choice, config, previous, services)?;
    drive_session(session, config, paths, drive).await
}

fn cmd_discard(library: &PlanLibrary, config: &Config, paths: &DataPaths) -> Result<()> {
    let mut recovery = paths.recovery(config);
    match recovery.load_pending(library, chrono::Utc::now()) {
        Some(pending) => {
            recovery.discard(pending.workout_history_id)?;
            println!("✓ Discarded interrupted '{}' workout", pending.workout_id);
        }
        None => println!("No interrupted workout."),
    }
    Ok(())
}

fn cmd_status(library: &PlanLibrary, config: &Config, paths: &DataPaths) -> Result<()> {
    let Some(pending) = paths.recovery(config).load_pending(library, chrono::Utc::now()) else {
        println!("No interrupted workout.");
        return Ok(());
    };

    let state = &pending.snapshot.current;
    println!("Interrupted workout: {}", pending.workout_id);
    println!("  Session:    {}", pending.workout_history_id);
    match state.set() {
        Some(set) => println!("  State:      {} ({})", state.name(), set.id()),
        None => println!("  State:      {}", state.name()),
    }
    println!("  Started:    {}", pending.start_time.to_rfc3339());
    println!("  Last saved: {}", pending.last_persisted_at.to_rfc3339());
    Ok(())
}

fn cmd_workouts(library: &PlanLibrary) -> Result<()> {
    for id in library.workout_ids() {
        let workout = library.workout(id)?;
        println!("{:<16} {}", id, workout.name);
    }
    Ok(())
}

fn cmd_plates(library: &PlanLibrary, equipment_id: &str, current: &[f64], target: f64) -> Result<()> {
    let equipment = library.equipment(equipment_id)?;
    let change = compute_plate_change(equipment, current, target);
    print_plate_change(&change);
    Ok(())
}

fn cmd_loads(library: &PlanLibrary, equipment_id: &str) -> Result<()> {
    let equipment = library.equipment(equipment_id)?;
    let loads = achievable_loads(equipment);
    if loads.is_empty() {
        println!("{} has no load model.", equipment.name());
        return Ok(());
    }
    let rendered: Vec<String> = loads.iter().map(|w| format_weight(*w)).collect();
    println!("{} ({} loads):", equipment.name(), loads.len());
    println!("  {}", rendered.join(" "));
    Ok(())
}

fn cmd_rollup(paths: &DataPaths, cleanup: bool) -> Result<()> {
    if !paths.wal.exists() {
        println!("No WAL file found - nothing to roll up.");
        return Ok(());
    }

    let count = wal_to_csv_and_archive(&paths.wal, &paths.csv)?;
    tracing::info!("Rollup moved {} records into {:?}", count, paths.csv);

    println!("✓ Rolled up {} sets to CSV", count);
    println!("  CSV: {}", paths.csv.display());

    if cleanup {
        let cleaned = cleanup_processed_wals(&paths.wal_dir)?;
        if cleaned > 0 {
            println!("✓ Cleaned up {} processed WAL files", cleaned);
        }
    }

    Ok(())
}

// ============================================================================
// Session driving
// ============================================================================

async fn drive_session(
    mut session: WorkoutSession,
    config: &Config,
    paths: &DataPaths,
    drive: DriveArgs,
) -> Result<()> {
    print_state(&session);

    if drive.auto {
        let mut transitions = 0;
        while !session.is_completed() {
            if drive.stop_after == Some(transitions) {
                println!("Stopped after {} transitions; workout can be resumed.", transitions);
                return Ok(());
            }
            auto_step(&mut session, config)?;
            transitions += 1;
            print_state(&session);
        }
    } else {
        print_help();
        match interactive(&mut session, config).await? {
            Exit::Completed => {}
            Exit::Saved => return Ok(()),
            Exit::Discard => {
                let id = session.workout_history_id();
                session.discard()?;
                println!("✓ Discarded workout {}", id);
                return Ok(());
            }
        }
    }

    if session.is_completed() {
        print_summary(&session, paths)?;
    }
    Ok(())
}

/// One transition with planned values, as an operator accepting every
/// default would do
fn auto_step(session: &mut WorkoutSession, config: &Config) -> Result<()> {
    match session.current() {
        WorkoutState::Set(_) => {
            if let Some(change) = session.plate_change() {
                if !change.is_no_change() {
                    print_plate_change(&change);
                    session.confirm_plates_loaded(&change)?;
                }
            }
            session.advance()
        }
        WorkoutState::Rest(_) => session.skip_rest(),
        WorkoutState::CalibrationLoadSelection(state) => {
            let planned = match &state.current_set_data {
                SetData::Weight(d) => d.actual_weight,
                _ => 0.0,
            };
            session.select_calibration_load(planned)?;
            session.advance()
        }
        WorkoutState::CalibrationRirSelection(_) => {
            session.confirm_rir(config.calibration.target_rir, None)?;
            session.advance()
        }
        WorkoutState::Preparing => session.advance(),
        WorkoutState::Completed => Ok(()),
    }
}

enum Flow {
    Continue,
    Quit,
    Discard,
}

enum Exit {
    Completed,
    Saved,
    Discard,
}

async fn interactive(session: &mut WorkoutSession, config: &Config) -> Result<Exit> {
    let (tx, mut events) = mpsc::unbounded_channel();
    session.start_timer_task(tx.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut housekeeping = tokio::time::interval(config.tick_interval());

    while !session.is_completed() {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    println!("Input closed; workout saved for `barpath resume`.");
                    return Ok(Exit::Saved);
                };
                match handle_command(session, line.trim()) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => {
                        println!("Workout saved for `barpath resume`.");
                        return Ok(Exit::Saved);
                    }
                    Ok(Flow::Discard) => return Ok(Exit::Discard),
                    Err(e) if e.is_consistency() => eprintln!("  ! {}", e),
                    Err(e) => return Err(e),
                }
                session.start_timer_task(tx.clone());
            }
            Some(event) = events.recv() => {
                match event {
                    TimerEvent::Tick { progress_millis } => {
                        print!("\r  {} ", format_millis(progress_millis));
                        std::io::stdout().flush()?;
                    }
                    TimerEvent::Completed => {
                        println!();
                        if session.tick()? {
                            print_state(session);
                            session.start_timer_task(tx.clone());
                        }
                    }
                }
            }
            _ = housekeeping.tick() => {
                if session.tick()? {
                    print_state(session);
                    session.start_timer_task(tx.clone());
                }
            }
        }
    }
    Ok(Exit::Completed)
}

fn handle_command(session: &mut WorkoutSession, input: &str) -> Result<Flow> {
    let mut parts = input.split_whitespace();
    let command = parts.next().unwrap_or("");
    let arg = parts.next();

    match command {
        "" | "d" => session.advance()?,
        "u" => {
            if !session.undo() {
                println!("  Nothing to undo.");
            }
        }
        "b" => {
            if !session.go_to_previous_set() {
                println!("  No previous set.");
            }
        }
        "s" => session.skip_rest()?,
        "p" => {
            let paused = session.current().timer().map(|t| t.is_frozen()).unwrap_or(false);
            if paused {
                session.resume_timer()?;
            } else {
                session.pause_timer()?;
            }
        }
        "l" => {
            let weight = parse_arg::<f64>(arg, "load")?;
            let load = session.select_calibration_load(weight)?;
            println!("  Load set to {} kg", format_weight(load));
            return Ok(Flow::Continue);
        }
        "r" => {
            let rir = parse_arg::<u8>(arg, "RIR")?;
            let explicit = match parts.next() {
                Some("f") => Some(true),
                Some("nf") => Some(false),
                _ => None,
            };
            let rating = session.confirm_rir(rir, explicit)?;
            println!(
                "  RIR {}{}",
                rating.rir,
                if rating.form_breakdown { " (form breakdown)" } else { "" }
            );
            return Ok(Flow::Continue);
        }
        "reps" | "w" => {
            session.enter_set_edit()?;
            let mut data = session
                .current()
                .current_set_data()
                .cloned()
                .ok_or_else(|| Error::consistency("no set data to edit"))?;
            match (&mut data, command) {
                (SetData::Weight(d), "reps") => d.actual_reps = parse_arg(arg, "reps")?,
                (SetData::BodyWeight(d), "reps") => d.actual_reps = parse_arg(arg, "reps")?,
                (SetData::Weight(d), "w") => d.actual_weight = parse_arg(arg, "weight")?,
                (SetData::BodyWeight(d), "w") => d.additional_weight = parse_arg(arg, "weight")?,
                _ => return Err(Error::consistency("this set has no reps or weight")),
            }
            session.update_set_data(data)?;
            session.exit_set_edit();
        }
        "t" => {
            let seconds = parse_arg::<i64>(arg, "seconds")?;
            session.enter_timer_edit()?;
            session.edit_timer(seconds * 1000)?;
            session.exit_timer_edit()?;
        }
        "plates" => {
            match session.plate_change() {
                Some(change) => print_plate_change(&change),
                None => println!("  No plates to load for this step."),
            }
            return Ok(Flow::Continue);
        }
        "loaded" => {
            let change = session
                .plate_change()
                .ok_or_else(|| Error::consistency("no plates to load for this step"))?;
            session.confirm_plates_loaded(&change)?;
            println!("  ✓ Plates loaded");
            return Ok(Flow::Continue);
        }
        "q" => return Ok(Flow::Quit),
        "x" => return Ok(Flow::Discard),
        "?" | "h" => {
            print_help();
            return Ok(Flow::Continue);
        }
        other => {
            println!("  Unknown command '{}'; '?' for help.", other);
            return Ok(Flow::Continue);
        }
    }

    print_state(session);
    Ok(Flow::Continue)
}

fn parse_arg<T: std::str::FromStr>(arg: Option<&str>, what: &str) -> Result<T> {
    arg.and_then(|a| a.parse().ok())
        .ok_or_else(|| Error::consistency(format!("expected a {} value", what)))
}

// ============================================================================
// Output
// ============================================================================

fn print_help() {
    println!("Enter = done · u = undo · b = previous set · s = skip rest · p = pause/resume");
    println!("l <kg> = calibration load · r <rir> [f|nf] = confirm RIR");
    println!("reps <n> · w <kg> · t <seconds> = set timer · plates · loaded · q = save & quit · x = discard");
}

fn print_state(session: &WorkoutSession) {
    let now = session.now();
    match session.current() {
        WorkoutState::Preparing => println!("Preparing..."),
        WorkoutState::Set(state) => {
            let tag = if state.is_calibration_set { " [calibration]" } else { "" };
            println!(
                "▶ {} · {}{}: {}",
                state.exercise_id,
                state.set.id(),
                tag,
                describe(&state.current_set_data)
            );
            if let Some(previous) = &state.previous_set_data {
                println!("  last time: {}", describe(previous));
            }
            if let Some(timer) = &state.timer {
                println!("  timer: {}", format_millis(timer.progress(now)));
            }
        }
        WorkoutState::Rest(state) => {
            let next = state
                .next_exercise_id
                .as_deref()
                .map(|id| format!(" → next: {}", id))
                .unwrap_or_default();
            println!("⏸ Rest {}{}", format_millis(state.timer.progress(now)), next);
        }
        WorkoutState::CalibrationLoadSelection(state) => {
            let candidates: Vec<String> = state.candidate_loads.iter().map(|w| format_weight(*w)).collect();
            println!(
                "Calibration for {}: pick a load with `l <kg>` then Enter",
                state.exercise_id
            );
            println!("  candidates: {}", candidates.join(" "));
            println!("  selected:   {}", describe(&state.current_set_data));
        }
        WorkoutState::CalibrationRirSelection(state) => {
            println!(
                "How many reps in reserve on {}? `r <rir>` then Enter",
                state.calibration_set.id()
            );
        }
        WorkoutState::Completed => println!("✓ Workout complete"),
    }
}

fn print_plate_change(change: &PlateChangeResult) {
    if change.is_no_change() {
        println!("  No plate change needed ({} kg)", format_weight(change.achieved_weight));
        return;
    }
    for step in &change.steps {
        let verb = match step.action {
            PlateAction::Add => "add",
            PlateAction::Remove => "remove",
        };
        println!("  {} {} kg each side", verb, format_weight(step.weight));
    }
    if change.is_exact() {
        println!("  → {} kg", format_weight(change.achieved_weight));
    } else {
        println!(
            "  → {} kg (closest to requested {} kg)",
            format_weight(change.achieved_weight),
            format_weight(change.target_weight)
        );
    }
}

fn print_summary(session: &WorkoutSession, paths: &DataPaths) -> Result<()> {
    let records: Vec<SetRecord> = read_records(&paths.wal)?
        .into_iter()
        .filter(|r| r.workout_history_id == session.workout_history_id())
        .collect();

    // Latest commit per set
    let mut latest: HashMap<&str, &SetRecord> = HashMap::new();
    for record in &records {
        latest.insert(record.set_id.as_str(), record);
    }
    let work: Vec<&&SetRecord> = latest
        .values()
        .filter(|r| !matches!(r.data, SetData::Rest(_)))
        .collect();
    let volume: f64 = work
        .iter()
        .map(|r| match &r.data {
            SetData::Weight(d) => d.volume,
            SetData::BodyWeight(d) => d.volume,
            _ => 0.0,
        })
        .sum();

    println!("─────────────────────────────────────────");
    println!("✓ {} sets logged, {} kg total volume", work.len(), format_weight(volume));
    Ok(())
}

fn describe(data: &SetData) -> String {
    match data {
        SetData::Weight(d) => format!("{} × {} kg", d.actual_reps, format_weight(d.actual_weight)),
        SetData::BodyWeight(d) if d.additional_weight > 0.0 => {
            format!("{} reps +{} kg", d.actual_reps, format_weight(d.additional_weight))
        }
        SetData::BodyWeight(d) => format!("{} reps", d.actual_reps),
        SetData::Endurance(t) => format!("hold up to {}", format_millis(t.start_timer)),
        SetData::TimedDuration(t) => format!("{} timed", format_millis(t.start_timer)),
        SetData::Rest(t) => format!("{} rest", format_millis(t.start_timer)),
    }
}

fn format_millis(millis: i64) -> String {
    let total = millis.max(0) / 1000;
    format!("{:02}:{:02}", total / 60, total % 60)
}
