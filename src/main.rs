//! Command-line driver for the weft scheduler.
//!
//! Reads a JSON description of classified logic (the interface the external
//! classifier hands over), runs the scheduling pipeline, and prints the
//! placement report as JSON.
use argh::FromArgs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use weft_ir::{ClockId, Design, Domain, LogicClasses, Signal, SignalId, Stmt, WordCost};
use weft_sched::{
    FiberClass, GreedyPartitioner, MergeStrategy, SchedConfig, Schedule,
};
use weft_utils::{DumpCtx, Error, Id, WeftResult};

#[derive(Debug, FromArgs)]
/// Map a synchronous design onto a tile-grid accelerator under the BSP
/// execution model.
struct Args {
    /// path to the classified-design JSON file
    #[argh(positional)]
    input: PathBuf,

    /// output file (default: stdout)
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,

    /// total number of tiles, possibly spanning several devices
    #[argh(option, default = "1")]
    tiles: u32,

    /// workers per tile
    #[argh(option, default = "1")]
    workers: u32,

    /// tiles in one physical device
    #[argh(option, default = "1472")]
    tiles_per_device: u32,

    /// merge strategy: conservative, forced, or lpt
    #[argh(option, default = "String::from(\"conservative\")")]
    merge_strategy: String,

    /// per-core memory bound in words
    #[argh(option, default = "65536")]
    max_mem_words: u32,

    /// hypergraph imbalance tolerance
    #[argh(option, default = "0.03")]
    imbalance: f64,

    /// run the retiming engine before scheduling
    #[argh(switch)]
    retime: bool,

    /// run the resynchronization engine before scheduling
    #[argh(switch)]
    resync: bool,

    /// skip the inter-device communication partition
    #[argh(switch)]
    no_inter_device_comm: bool,

    /// directory for debug dumps
    #[argh(option)]
    dump_dir: Option<PathBuf>,

    /// dump verbosity level
    #[argh(option, default = "0")]
    dump_level: u32,
}

fn default_one() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SignalSpec {
    name: String,
    #[serde(default = "default_one")]
    width_words: u32,
    #[serde(default = "default_one")]
    array_elems: u32,
}

#[derive(Debug, Deserialize)]
struct StmtSpec {
    /// "comb", "clocked", "initial", "static", or "final"
    domain: String,
    #[serde(default)]
    clock: u32,
    #[serde(default)]
    reads: Vec<String>,
    #[serde(default)]
    writes: Vec<String>,
    cost: u32,
    #[serde(default = "default_true")]
    pure: bool,
}

#[derive(Debug, Deserialize)]
struct DesignSpec {
    signals: Vec<SignalSpec>,
    statements: Vec<StmtSpec>,
}

#[derive(Debug, Serialize)]
struct FiberReport {
    class: &'static str,
    device: u32,
    tile: u32,
    worker: u32,
    supervisor: bool,
    cost: u32,
    statements: Vec<usize>,
    commits: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ScheduleReport {
    devices_used: u32,
    fibers: Vec<FiberReport>,
    new_signals: Vec<String>,
    substitutions: Vec<[String; 2]>,
}

fn build_design(spec: &DesignSpec) -> WeftResult<Design> {
    let mut design = Design::new();
    let mut by_name: HashMap<&str, SignalId> = HashMap::new();
    for sig in &spec.signals {
        if by_name.contains_key(sig.name.as_str()) {
            return Err(Error::misc(format!("duplicate signal `{}`", sig.name)));
        }
        let id = design.add_signal(Signal::new(
            Id::new(&sig.name),
            sig.width_words,
            sig.array_elems,
        ));
        by_name.insert(sig.name.as_str(), id);
    }
    let resolve = |names: &[String]| -> WeftResult<Vec<SignalId>> {
        names
            .iter()
            .map(|n| {
                by_name
                    .get(n.as_str())
                    .copied()
                    .ok_or_else(|| Error::misc(format!("unknown signal `{}`", n)))
            })
            .collect()
    };
    for stmt in &spec.statements {
        let domain = match stmt.domain.as_str() {
            "comb" => Domain::Comb,
            "clocked" => Domain::Clocked(ClockId(stmt.clock)),
            "initial" => Domain::Initial,
            "static" => Domain::Static,
            "final" => Domain::Final,
            other => {
                return Err(Error::misc(format!("unknown domain `{}`", other)));
            }
        };
        let mut built = Stmt::new(domain, resolve(&stmt.reads)?, resolve(&stmt.writes)?, stmt.cost);
        if !stmt.pure {
            built = built.impure();
        }
        design.add_stmt(built);
    }
    Ok(design)
}

fn report(design: &Design, schedule: &Schedule) -> ScheduleReport {
    let fibers = schedule
        .fibers
        .iter()
        .map(|fiber| {
            let placement = fiber.placement.expect("placer assigns every fiber");
            FiberReport {
                class: match fiber.class {
                    FiberClass::Compute => "compute",
                    FiberClass::Initial => "initial",
                },
                device: placement.device,
                tile: placement.tile,
                worker: placement.worker,
                supervisor: placement.supervisor,
                cost: fiber.instr_cost(design, &WordCost),
                statements: fiber.stmts.iter().map(|sid| sid.index()).collect(),
                commits: fiber
                    .commits
                    .iter()
                    .map(|&sig| design.signals[sig].name.to_string())
                    .collect(),
            }
        })
        .collect();
    ScheduleReport {
        devices_used: schedule.devices_used,
        fibers,
        new_signals: schedule
            .new_signals
            .iter()
            .map(|&sig| design.signals[sig].name.to_string())
            .collect(),
        substitutions: schedule
            .subst
            .iter()
            .map(|(from, to)| {
                [
                    design.signals[from].name.to_string(),
                    design.signals[to].name.to_string(),
                ]
            })
            .collect(),
    }
}

fn run(args: &Args) -> WeftResult<()> {
    let text = std::fs::read_to_string(&args.input)?;
    let spec: DesignSpec =
        serde_json::from_str(&text).map_err(|e| Error::misc(format!("bad input: {}", e)))?;
    let mut design = build_design(&spec)?;

    let merge_strategy = match args.merge_strategy.as_str() {
        "conservative" => MergeStrategy::Conservative,
        "forced" => MergeStrategy::Forced,
        "lpt" => MergeStrategy::Lpt,
        other => {
            return Err(Error::misc(format!("unknown merge strategy `{}`", other)));
        }
    };
    let cfg = SchedConfig {
        tiles: args.tiles,
        workers: args.workers,
        tiles_per_device: args.tiles_per_device,
        merge_strategy,
        max_mem_words: args.max_mem_words,
        imbalance: args.imbalance,
        retime: args.retime,
        resync: args.resync,
        inter_device_comm: !args.no_inter_device_comm,
        ..SchedConfig::default()
    };
    let dump = match &args.dump_dir {
        Some(dir) => DumpCtx::new(dir.clone(), args.dump_level),
        None => DumpCtx::disabled(),
    };

    // classification sanity is part of schedule(); gather early only to
    // report the region sizes
    let classes = LogicClasses::gather(&design);
    log::info!(
        "{} comb, {} clocked, {} initial statements",
        classes.comb.len(),
        classes.clocked.len(),
        classes.initial.len()
    );

    let schedule = weft_sched::schedule(&mut design, &cfg, &WordCost, &GreedyPartitioner, &dump)?;
    let out = report(&design, &schedule);
    let text = serde_json::to_string_pretty(&out)
        .map_err(|e| Error::write_failure(format!("serializing report: {}", e)))?;
    match &args.output {
        Some(path) => std::fs::write(path, text)?,
        None => println!("{}", text),
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args: Args = argh::from_env();
    if let Err(err) = run(&args) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
