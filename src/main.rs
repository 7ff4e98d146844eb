use clap::Parser;
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use jvm_profiler_session::{
    cli::{Cli, Command, ProfileMode},
    protocol::{CodeSelection, InstrumentationMode},
    AttachMode, Collaborators, Config, TargetRunner,
};
use std::sync::atomic::AtomicBool;
use std::thread;
use tracing::info;
use tracing_subscriber::EnvFilter;

const FORCED_DUMP_RETRIES: u32 = 3;

fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.remote_host = Some(host);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(timeout) = cli.timeout {
        config.liveness_interval_ms = timeout.as_millis().max(1) as u64;
    }
    config.validate()?;

    let hooks = Collaborators::defaults(&config);
    let runner = TargetRunner::new(config, hooks);
    let cancel = AtomicBool::new(false);

    match cli.command {
        Command::Attach {
            mode,
            root,
            dynamic,
            duration,
            terminate,
        } => {
            let attach = if dynamic {
                AttachMode::Dynamic
            } else {
                AttachMode::Direct
            };
            runner.attach(attach, &cancel)?;
            initiate(&runner, mode, &root)?;

            if !runner.start_target_app(attach)? {
                bail!("target application did not start");
            }

            if let Some(duration) = duration {
                info!(duration = %humantime::format_duration(duration), "profiling");
                thread::sleep(duration);
                let dumped = runner
                    .client()
                    .force_obtained_results_dump(false, FORCED_DUMP_RETRIES)?;
                info!(dumped, "results collected");
            }

            if terminate {
                runner.terminate()?;
            } else {
                runner.detach()?;
            }
        }
        Command::Calibrate => {
            runner.calibrate(&cancel)?;
        }
        Command::Stats => {
            runner.attach(AttachMode::Dynamic, &cancel)?;
            println!("{}", runner.internal_stats_text()?);
            runner.detach()?;
        }
    }

    Ok(())
}

fn initiate(runner: &TargetRunner, mode: ProfileMode, roots: &[String]) -> Result<()> {
    let client = runner.client();
    let selections: Vec<CodeSelection> = roots.iter().map(CodeSelection::class).collect();

    match mode {
        ProfileMode::Monitor => client.initiate_monitoring()?,
        ProfileMode::Sampling => client.initiate_cpu_sampling()?,
        ProfileMode::Cpu => {
            if selections.is_empty() {
                bail!("cpu profiling needs at least one --root class");
            }
            client.initiate_recursive_cpu(&selections)?
        }
        ProfileMode::CodeRegion => {
            let selection = selections
                .first()
                .ok_or_else(|| eyre!("code region profiling needs a --root class"))?;
            client.initiate_code_region(selection)?
        }
        ProfileMode::Alloc => {
            client.initiate_memory_instrumentation(InstrumentationMode::ObjectAllocations)?
        }
        ProfileMode::Liveness => {
            client.initiate_memory_instrumentation(InstrumentationMode::ObjectLiveness)?
        }
        ProfileMode::MemorySampling => {
            client.initiate_memory_instrumentation(InstrumentationMode::NoneMemorySampling)?
        }
    }
    Ok(())
}
