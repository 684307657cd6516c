//! Evoloop CLI - run and inspect code evolution.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use evoloop_core::{EvolutionPolicy, OperatorKind, QualityTier, Trajectory, TrajectoryFilter};
use evoloop_evolution::{CheckpointStore, CodeSynthesizer, CommandSynthesizer};
use evoloop_execution::{EvolutionEngine, EvolutionOutcome, Promotion, RunRequest};
use evoloop_quality::{Benchmark, BenchmarkRunner, BenchmarkSuite};
use evoloop_sandbox::{DockerBackend, ExecutionBackend, ProcessBackend, RuntimeSpec, SandboxExecutor};
use evoloop_storage::{JsonKvStore, JsonTrajectoryPool, TrajectoryPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "evoloop")]
#[command(about = "Self-improving code evolution", long_about = None)]
struct Cli {
    /// Data directory (pool, checkpoints, calibration)
    #[arg(long, global = true, default_value = ".evoloop")]
    data_dir: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one evolution
    Run {
        /// Agent whose code is evolved
        #[arg(long)]
        agent: String,
        /// File holding the problem description
        #[arg(long)]
        problem: PathBuf,
        /// File holding the initial candidate
        #[arg(long)]
        seed: PathBuf,
        /// Benchmark suite (JSON)
        #[arg(long)]
        suite: Option<PathBuf>,
        /// Evolution policy (JSON); defaults apply when omitted
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Synthesizer command line (shell-style quoting); reads the prompt on stdin, writes code to stdout
        #[arg(long)]
        synth_cmd: Option<String>,
        /// Execution backend
        #[arg(long, value_enum, default_value_t = Backend::Process)]
        backend: Backend,
        /// Candidate runtime
        #[arg(long, value_enum, default_value_t = Runtime::Python)]
        runtime: Runtime,
        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// List pool trajectories
    Pool {
        /// Only this generation
        #[arg(long)]
        generation: Option<u32>,
        /// Only this operator
        #[arg(long)]
        operator: Option<OperatorKind>,
        /// Minimum CMP
        #[arg(long)]
        min_cmp: Option<f64>,
        /// Include archived generations
        #[arg(long)]
        all: bool,
    },
    /// List an agent's checkpoints
    Checkpoints {
        /// Agent name
        agent: String,
        /// Show the best checkpoint at or above this tier
        #[arg(long)]
        min_tier: Option<QualityTier>,
    },
    /// Check a file's syntax without running it
    Validate {
        /// Source file
        file: PathBuf,
        /// Runtime whose checker to use
        #[arg(long, value_enum, default_value_t = Runtime::Python)]
        runtime: Runtime,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Process,
    Docker,
}

#[derive(Clone, Copy, ValueEnum)]
enum Runtime {
    Python,
    Shell,
}

impl Runtime {
    fn spec(self) -> RuntimeSpec {
        match self {
            Runtime::Python => RuntimeSpec::python(),
            Runtime::Shell => RuntimeSpec::shell(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::Run {
            agent,
            problem,
            seed,
            suite,
            policy,
            synth_cmd,
            backend,
            runtime,
            json,
        } => {
            let policy = match policy {
                Some(path) => EvolutionPolicy::from_json_file(&path)
                    .with_context(|| format!("loading policy {}", path.display()))?,
                None => EvolutionPolicy::default(),
            };
            let problem = read(&problem)?;
            let seed = read(&seed)?;

            let backend: Arc<dyn ExecutionBackend> = match backend {
                Backend::Process => Arc::new(ProcessBackend::new()),
                Backend::Docker => Arc::new(DockerBackend::new()),
            };
            let sandbox = Arc::new(
                SandboxExecutor::new(backend)
                    .with_runtime(runtime.spec())
                    .allow_unisolated_network(policy.capabilities.allow_unisolated_network),
            );

            let mut request = RunRequest::new(agent, problem, seed);
            let benchmark: Option<Arc<dyn Benchmark>> = match suite {
                Some(path) => {
                    let suite = BenchmarkSuite::from_json_file(&path)
                        .with_context(|| format!("loading suite {}", path.display()))?;
                    request = request.with_suite(suite.id.clone());
                    let runner = BenchmarkRunner::new(sandbox.clone(), policy.sandbox.clone());
                    runner.register(suite).await.context("registering suite")?;
                    let runner: Arc<dyn Benchmark> = Arc::new(runner);
                    Some(runner)
                }
                None => None,
            };

            let synthesizer = synthesizer(synth_cmd)?;
            let pool = JsonTrajectoryPool::open(cli.data_dir.join("pool"))
                .await
                .context("opening trajectory pool")?;
            let store = Arc::new(JsonKvStore::open(cli.data_dir.join("kv")).await.context("opening store")?);

            let mut engine = EvolutionEngine::with_defaults(pool, policy, sandbox, synthesizer, store, benchmark)?;
            let outcome = engine.run(request).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
        }
        Commands::Pool {
            generation,
            operator,
            min_cmp,
            all,
        } => {
            let pool = JsonTrajectoryPool::open(cli.data_dir.join("pool"))
                .await
                .context("opening trajectory pool")?;
            let filter = TrajectoryFilter {
                generation,
                operator,
                min_cmp,
                include_archived: all,
                ..Default::default()
            };
            let trajectories = pool.query(&filter).await?;

            println!("Trajectories ({})", trajectories.len());
            for t in &trajectories {
                print_trajectory(t);
            }
        }
        Commands::Checkpoints { agent, min_tier } => {
            let store = Arc::new(JsonKvStore::open(cli.data_dir.join("kv")).await.context("opening store")?);
            let checkpoints = CheckpointStore::new(store);

            if let Some(tier) = min_tier {
                match checkpoints.best_checkpoint(&agent, tier).await? {
                    Some(cp) => println!(
                        "Best: v{} | {} | success {:.3} | cmp {:.3} | {}",
                        cp.version, cp.quality_tier, cp.metrics.success_rate, cp.metrics.cmp_score, cp.code_reference
                    ),
                    None => println!("No checkpoint at or above {}", tier),
                }
                return Ok(());
            }

            let all = checkpoints.list(&agent).await?;
            println!("Checkpoints for {} ({})", agent, all.len());
            for cp in all {
                println!(
                    "  v{} | {} | success {:.3} | cmp {:.3} | {} | {}",
                    cp.version,
                    cp.quality_tier,
                    cp.metrics.success_rate,
                    cp.metrics.cmp_score,
                    cp.run_id,
                    cp.created_at
                );
            }
        }
        Commands::Validate { file, runtime } => {
            let code = read(&file)?;
            let sandbox = SandboxExecutor::new(Arc::new(ProcessBackend::new())).with_runtime(runtime.spec());
            match sandbox.validate_syntax(&code).await {
                (true, _) => println!("{}: ok", file.display()),
                (false, message) => bail!("{}: {}", file.display(), message.unwrap_or_else(|| "invalid".into())),
            }
        }
    }

    Ok(())
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn synthesizer(synth_cmd: Option<String>) -> Result<Arc<dyn CodeSynthesizer>> {
    let line = match synth_cmd.or_else(|| std::env::var("EVOLOOP_SYNTH_CMD").ok()) {
        Some(line) => line,
        None => bail!("no synthesizer: pass --synth-cmd or set EVOLOOP_SYNTH_CMD"),
    };
    let synth = CommandSynthesizer::from_command_line(&line).with_context(|| format!("invalid synthesizer command: {:?}", line))?;
    info!(command = %line, "Using command synthesizer");
    let synth: Arc<dyn CodeSynthesizer> = Arc::new(synth);
    Ok(synth)
}

fn print_outcome(outcome: &EvolutionOutcome) {
    println!("Run {} ({})", outcome.run_id, outcome.agent_name);
    println!("  Status: {}", outcome.status);
    println!("  Iterations: {}", outcome.iterations);
    if let Some(v) = outcome.warm_start_version {
        println!("  Warm start: v{}", v);
    }
    for s in &outcome.history {
        println!(
            "  #{} gen {} | best {} | so far {} | approved {} rejected {} failed {} timed out {}",
            s.iteration,
            s.generation,
            fmt_cmp(s.best_cmp),
            fmt_cmp(s.best_cmp_so_far),
            s.counts.approved,
            s.counts.rejected,
            s.counts.failed,
            s.counts.timed_out
        );
    }
    match &outcome.promotion {
        Promotion::Promoted(cp) => println!("  Promoted: v{} ({}) from {}", cp.version, cp.quality_tier, cp.code_reference),
        Promotion::NoImprovement => println!("  No improvement over the warm-start checkpoint"),
        Promotion::NoSafeCandidate { advisory } => {
            println!("  No safe candidate");
            if let Some(t) = advisory {
                println!("  Advisory (not promoted):");
                print_trajectory(t);
            }
        }
    }
    println!("  Operators:");
    for (op, o) in &outcome.operator_stats.by_operator {
        println!(
            "    {} | {} attempts | {} approved | {} failed | mean cmp {}",
            op,
            o.attempts,
            o.approved,
            o.failed + o.timed_out,
            fmt_cmp(o.mean_cmp)
        );
    }
}

fn print_trajectory(t: &Trajectory) {
    println!(
        "  {} | gen {} | {} | {} | cmp {}{}",
        t.id,
        t.generation,
        t.operator_used,
        t.status,
        fmt_cmp(t.cmp_score),
        t.failure_reason.as_deref().map(|r| format!(" | {}", r)).unwrap_or_default()
    );
}

fn fmt_cmp(cmp: Option<f64>) -> String {
    cmp.map(|c| format!("{:.3}", c)).unwrap_or_else(|| "-".to_string())
}
