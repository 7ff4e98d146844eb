use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "jvm-profiler")]
#[command(author = "Anurag Ambuj")]
#[command(version)]
#[command(about = "Drive a profiling session against a JVM profiler agent", long_about = None)]
pub struct Cli {
    #[arg(long, help = "Agent host (treated as a remote target)")]
    pub host: Option<String>,

    #[arg(short, long, help = "Agent port")]
    pub port: Option<u16>,

    #[arg(
        short = 'c',
        long,
        help = "Path to configuration file",
        env = "JVM_PROFILER_CONFIG"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short = 't',
        long,
        help = "How long to wait for an answer before giving up (e.g. 30s, 2m)",
        value_parser = parse_duration
    )]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect, instrument, run the target and collect results.
    Attach {
        #[arg(short, long, value_enum, default_value_t = ProfileMode::Monitor)]
        mode: ProfileMode,

        #[arg(long, help = "Root class for cpu and code-region modes")]
        root: Vec<String>,

        #[arg(long, help = "The agent was loaded into an already running JVM")]
        dynamic: bool,

        #[arg(
            short,
            long,
            help = "How long to profile before dumping results (e.g. 10s)",
            value_parser = parse_duration
        )]
        duration: Option<Duration>,

        #[arg(long, help = "Terminate the target instead of detaching")]
        terminate: bool,
    },

    /// Calibrate the injected code against a freshly launched target.
    Calibrate,

    /// Print the agent's internal statistics, then detach.
    Stats,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileMode {
    Monitor,
    Sampling,
    Cpu,
    CodeRegion,
    Alloc,
    Liveness,
    MemorySampling,
}

fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_attach_arguments() {
        let cli = Cli::try_parse_from([
            "jvm-profiler",
            "--port",
            "5141",
            "--timeout",
            "90s",
            "attach",
            "--mode",
            "code-region",
            "--root",
            "app.Main",
            "--duration",
            "1m",
        ])
        .unwrap();

        assert_eq!(cli.port, Some(5141));
        assert_eq!(cli.timeout, Some(Duration::from_secs(90)));
        match cli.command {
            Command::Attach {
                mode,
                root,
                duration,
                terminate,
                dynamic,
            } => {
                assert_eq!(mode, ProfileMode::CodeRegion);
                assert_eq!(root, vec!["app.Main".to_string()]);
                assert_eq!(duration, Some(Duration::from_secs(60)));
                assert!(!terminate);
                assert!(!dynamic);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_bad_duration_is_rejected() {
        assert!(Cli::try_parse_from(["jvm-profiler", "--timeout", "soon", "stats"]).is_err());
    }
}
