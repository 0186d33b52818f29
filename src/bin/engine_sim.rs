use clap::{App, Arg};
use colored::*;
use enginectl::events::ControlEvent;
use enginectl::hal::sim::{EnginePlant, PlantParams};
use enginectl::{EngineConfig, EngineController, HardwareSet, MonitorState, StartupPhase};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{self, Instant};
use tracing::{info, warn};

const PLANT_STEP: Duration = Duration::from_millis(5);
const BREACH_OFFSET_BAR: f64 = 50.0;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("engine-sim")
        .version("0.1.0")
        .author("Propulsion Controls Engineering Team")
        .about("🚀 Engine control core driven against a simulated plant")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON engine profile (defaults to the built-in demonstration profile)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration")
                .value_name("SECONDS")
                .help("Simulated run time")
                .takes_value(true)
                .default_value("12")
                .validator(|v| match v.parse::<f64>() {
                    Ok(s) if s > 0.0 => Ok(()),
                    _ => Err("duration must be a positive number of seconds".into()),
                }),
        )
        .arg(
            Arg::with_name("thrust")
                .short("t")
                .long("thrust")
                .value_name("NEWTONS")
                .help("Steady-state thrust setpoint")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("inject-breach")
                .long("inject-breach")
                .value_name("SECONDS")
                .help("Inject a chamber over-pressure after this many seconds")
                .takes_value(true),
        )
        .arg(Arg::with_name("dump-config").long("dump-config").help("Print the effective profile as JSON and exit"))
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(thrust) = matches.value_of("thrust") {
        config.steady_state_thrust_n = thrust.parse()?;
        config.validate()?;
    }
    if matches.is_present("dump-config") {
        println!("{}", config.to_json_pretty()?);
        return Ok(());
    }
    let duration = Duration::from_secs_f64(matches.value_of("duration").unwrap_or("12").parse()?);
    let breach_at = matches.value_of("inject-breach").map(str::parse::<f64>).transpose()?.map(Duration::from_secs_f64);

    println!("{}", "🚀 Engine Control Core - simulated run".bright_blue().bold());
    println!("   steady-state setpoint: {} N", config.steady_state_thrust_n.to_string().bright_cyan());

    let plant = EnginePlant::new(PlantParams::default());
    let hardware = HardwareSet::simulated(&plant, &config)?;
    let mut engine = EngineController::new(config, hardware)?;
    let mut events = engine.subscribe_events();

    let stepper = plant.clone();
    let plant_task = tokio::spawn(async move {
        let mut interval = time::interval(PLANT_STEP);
        loop {
            interval.tick().await;
            stepper.step(PLANT_STEP.as_secs_f64());
        }
    });

    engine.start().await?;
    engine.begin_startup()?;

    let started = Instant::now();
    let deadline = time::sleep(duration);
    tokio::pin!(deadline);
    let mut breach_injected = false;
    let mut status_tick = time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = status_tick.tick() => {
                if let Some(at) = breach_at {
                    if !breach_injected && started.elapsed() >= at {
                        warn!(offset_bar = BREACH_OFFSET_BAR, "injecting chamber over-pressure");
                        plant.inject_pressure_offset(BREACH_OFFSET_BAR);
                        breach_injected = true;
                    }
                }
                let throttle = engine.throttle_status();
                let state = plant.snapshot();
                info!(
                    phase = ?engine.phase(),
                    mode = ?throttle.mode,
                    output = throttle.last_output,
                    thrust_n = state.thrust_n,
                    "status"
                );
            }
            received = events.recv() => match received {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "console lagged behind the event bus"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let report = engine.shutdown().await?;
    plant_task.abort();

    println!();
    println!("{}", "📊 Run summary".bright_blue().bold());
    let phase = format!("{:?}", report.phase);
    let phase = match report.phase {
        StartupPhase::SteadyState => phase.bright_green(),
        StartupPhase::Abort | StartupPhase::Shutdown => phase.bright_red(),
        _ => phase.yellow(),
    };
    println!("   final phase:     {phase}");
    let monitor = match report.monitor_state {
        MonitorState::Armed => "armed".bright_green(),
        MonitorState::Tripped => "TRIPPED".bright_red().bold(),
    };
    println!("   safety monitor:  {monitor}");
    println!("   throttle:        {:?} at {:.3}", report.throttle_mode, report.last_throttle_output);
    for (name, stats) in [
        ("throttle", report.statistics.throttle),
        ("sequencer", report.statistics.sequencer),
        ("monitor", report.statistics.monitor),
    ] {
        println!(
            "   {:<10} cycles {:>6}  violations {:>4}  max {:>8.1?}",
            name.bright_white(),
            stats.cycles,
            stats.violations,
            stats.max_cycle
        );
    }
    println!("   final thrust:    {:.0} N", plant.snapshot().thrust_n);
    Ok(())
}

fn print_event(event: &ControlEvent) {
    match event {
        ControlEvent::PhaseChanged { from, to, .. } => {
            println!("{} phase {:?} -> {}", "▶".bright_blue(), from, format!("{to:?}").bright_cyan());
        }
        ControlEvent::ModeChanged { mode } => println!("{} throttle {:?}", "⚙".bright_blue(), mode),
        ControlEvent::Tripped { reason, .. } => println!("{} {}", "❌ SAFETY TRIP:".bright_red().bold(), reason),
        ControlEvent::AdvisoryBreach { sensor, value } => {
            println!("{} advisory {} = {:.2}", "⚠".yellow(), sensor, value);
        }
        other if other.is_escalation() => println!("{} {:?}", "⚠".bright_yellow(), other),
        _ => {}
    }
}
