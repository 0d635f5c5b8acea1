use std::env;
use std::net::SocketAddr;

use contracts::{AgentConfig, BuildOrder, GameCatalog, ManagerFlags, RecruitOrder};
use steward_api::{serve, AppState};
use steward_core::runtime::AgentRuntime;
use steward_core::sim::{SimHandle, SimSettlement, SimWorld, SimulatedDriver};
use steward_core::stacking::NoopStacker;
use steward_core::store::{MemoryStore, SqliteStateStore, StateStore};

fn print_usage() {
    println!("steward <command>");
    println!("commands:");
    println!("  serve [addr]");
    println!("    run the control api against a simulated game surface");
    println!("    default addr: 127.0.0.1:8080");
    println!("  simulate [minutes] [sqlite_path]");
    println!("    drive a demo world on a virtual clock and print the journal");
    println!("    default minutes: 120");
    println!("  status");
    println!("    print the status snapshot of a freshly initialized runtime");
}

fn parse_socket_addr(value: Option<&String>) -> Result<SocketAddr, String> {
    let raw = value.map(String::as_str).unwrap_or("127.0.0.1:8080");
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

fn parse_minutes(value: Option<&String>) -> Result<u64, String> {
    match value {
        None => Ok(120),
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| format!("invalid minutes: {raw}")),
    }
}

fn default_sqlite_path() -> Option<String> {
    std::env::var("STEWARD_SQLITE_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn demo_world() -> SimWorld {
    SimWorld::new(vec![
        SimSettlement::new("Northwatch")
            .with_cluster("east_isle")
            .with_farm_targets(&["abandoned_mill", "crumbled_keep"]),
        SimSettlement::new("Eastmere")
            .with_cluster("east_isle")
            .with_farm_targets(&["abandoned_mill"]),
        SimSettlement::new("Southfen").with_farm_targets(&["sunken_village"]),
    ])
}

fn open_store(path: Option<String>) -> Result<Box<dyn StateStore + Send>, String> {
    match path {
        Some(path) => SqliteStateStore::open(&path)
            .map(|store| Box::new(store) as Box<dyn StateStore + Send>)
            .map_err(|err| format!("failed to open state store at {path}: {err}")),
        None => Ok(Box::new(MemoryStore::new())),
    }
}

fn build_runtime(
    config: AgentConfig,
    store: Box<dyn StateStore + Send>,
    wall_clock: bool,
) -> Result<(AgentRuntime, SimHandle, u64), String> {
    let mut world = demo_world();
    if wall_clock {
        world.enable_wall_clock();
    }
    let now_ms = world.now_ms();
    let retry = config.build_retry_interval_ms;
    let (driver, handle) = SimulatedDriver::new(world);
    let runtime = AgentRuntime::new(
        config,
        GameCatalog::default_catalog(),
        Box::new(driver),
        store,
        Box::new(NoopStacker::new(retry)),
        now_ms,
    )
    .map_err(|err| format!("failed to initialize runtime: {err}"))?;
    Ok((runtime, handle, now_ms))
}

fn run_simulation(args: &[String]) -> Result<(), String> {
    let minutes = parse_minutes(args.get(2))?;
    let sqlite_path = args.get(3).cloned().or_else(default_sqlite_path);
    let store = open_store(sqlite_path)?;

    let config = AgentConfig {
        humanize: false,
        managers: ManagerFlags {
            farming: true,
            building: true,
            recruiting: true,
        },
        ..AgentConfig::default()
    };
    let (mut runtime, handle, start_ms) = build_runtime(config, store, false)?;

    runtime
        .queue_build("Northwatch", BuildOrder::new("timber_camp", 3), start_ms)
        .map_err(|err| err.to_string())?;
    runtime
        .queue_build("Northwatch", BuildOrder::new("barracks", 2), start_ms)
        .map_err(|err| err.to_string())?;
    runtime
        .queue_recruit("Southfen", RecruitOrder::slots("spearman", 3), start_ms)
        .map_err(|err| err.to_string())?;

    let end_ms = start_ms + minutes * 60_000;
    while let Some(due) = runtime.next_due() {
        if due > end_ms {
            break;
        }
        handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .set_now(due);
        runtime.run_due(due);
    }

    let world = handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    println!("journal ({} entries):", world.journal().len());
    for entry in world.journal() {
        println!("  {entry}");
    }
    drop(world);
    println!("{}", runtime.status(end_ms));
    Ok(())
}

async fn run_serve(args: &[String]) -> Result<(), String> {
    let addr = parse_socket_addr(args.get(2))?;
    let store = open_store(default_sqlite_path())?;
    let (runtime, _handle, _now) = build_runtime(AgentConfig::default(), store, true)?;

    println!("serving control api on http://{addr}");
    serve(addr, AppState::new(runtime))
        .await
        .map_err(|err| format!("server error: {err}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("serve") => {
            if let Err(err) = run_serve(&args).await {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
        Some("simulate") => {
            if let Err(err) = run_simulation(&args) {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        }
        Some("status") => {
            match build_runtime(AgentConfig::default(), Box::new(MemoryStore::new()), false) {
                Ok((runtime, _handle, now_ms)) => println!("{}", runtime.status(now_ms)),
                Err(err) => {
                    eprintln!("error: {err}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            print_usage();
        }
    }
}
