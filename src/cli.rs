use clap::Parser;
use std::path::PathBuf;

// Build version with engine info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Engine: headless (tick-driven)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Animation orchestration demo: runs a headless session and prints a JSON report
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Animation recipe to enqueue (default: a scripted batch)
    #[arg(short = 'a', long = "animation", value_name = "ID")]
    pub animation: Option<String>,

    /// Target selector for --animation (can be specified multiple times)
    #[arg(short = 't', long = "target", value_name = "SELECTOR")]
    pub targets: Vec<String>,

    /// Priority for --animation requests: low, normal, high, critical
    #[arg(short = 'p', long = "priority", value_name = "PRIORITY", default_value = "normal")]
    pub priority: String,

    /// Session length in seconds (ticked at the engine frame rate)
    #[arg(short = 's', long = "seconds", value_name = "SECS", default_value_t = 3.0)]
    pub seconds: f64,

    /// Turn the system reduced-motion signal on halfway through the session
    #[arg(short = 'r', long = "reduced-motion")]
    pub reduced_motion: bool,

    /// Write the effective settings to the config directory and exit
    #[arg(long = "write-config")]
    pub write_config: bool,

    /// Enable debug logging to file (default: choreo.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_flags() {
        let args = Args::parse_from(["choreo", "-a", "fade-in", "-t", "#a", "-t", "#b", "-p", "high", "-vv"]);
        assert_eq!(args.animation.as_deref(), Some("fade-in"));
        assert_eq!(args.targets, vec!["#a", "#b"]);
        assert_eq!(args.priority, "high");
        assert_eq!(args.verbosity, 2);
        assert_eq!(args.seconds, 3.0);
    }

    #[test]
    fn test_log_flag_optional_value() {
        let args = Args::parse_from(["choreo", "--log"]);
        assert_eq!(args.log_file, Some(None));
        let args = Args::parse_from(["choreo", "--log", "out.log"]);
        assert_eq!(args.log_file, Some(Some(PathBuf::from("out.log"))));
    }
}
