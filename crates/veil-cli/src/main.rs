//! veil command line tool
//!
//! Rewrites a module so that its local variables show fabricated values in a
//! debugger, and writes the result next to the input under `Output/`.

mod output;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use output::{resolve_color_choice, StyledOutput};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use veil_engine::{obfuscate, ObfuscationOptions, ObfuscationReport, StrategyKind};
use veil_metadata::Module;

/// Directory created next to the input when no output directory is given
const DEFAULT_OUTPUT_DIR: &str = "Output";

#[derive(Parser)]
#[command(name = "veil")]
#[command(about = "Hide local variables from the debugger", long_about = None)]
#[command(version)]
struct Cli {
    /// Module to obfuscate
    file: PathBuf,

    /// Display mode: empty, mimic, failfast, stackoverflow, statechanger
    #[arg(short, long)]
    mode: Option<String>,

    /// Place proxies in an embedded module
    #[arg(long)]
    dynamic: bool,

    /// Attach type proxies to declared types
    #[arg(long)]
    annotate_types: bool,

    /// Seed for synthetic values
    #[arg(long)]
    seed: Option<u64>,

    /// Options file (veil.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory [default: <input dir>/Output]
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Colored output: auto, always, never
    #[arg(long)]
    color: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    let mut out = StyledOutput::new(resolve_color_choice(cli.color.as_deref()));
    if let Err(err) = run(&cli, &mut out) {
        out.stderr_error(&format!("{:#}", err));
        std::process::exit(1);
    }
}

fn run(cli: &Cli, out: &mut StyledOutput) -> Result<()> {
    let options = resolve_options(cli)?;
    debug!("Options: {:?}", options);

    let bytes = std::fs::read(&cli.file)
        .with_context(|| format!("Failed to read {}", cli.file.display()))?;
    let mut module = Module::decode(&bytes)
        .with_context(|| format!("Failed to load module {}", cli.file.display()))?;

    let report = obfuscate(&mut module, &options)
        .with_context(|| format!("Failed to obfuscate {}", module.name))?;

    let destination = output_path(&cli.file, cli.output_dir.as_deref())?;
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&destination, module.encode())
        .with_context(|| format!("Failed to write {}", destination.display()))?;

    print_summary(out, &report, &destination);
    Ok(())
}

/// File options first, then command line overrides
fn resolve_options(cli: &Cli) -> Result<ObfuscationOptions> {
    // Checked before anything is read so a typo fails fast
    let mode = cli
        .mode
        .as_deref()
        .map(str::parse::<StrategyKind>)
        .transpose()?;

    let mut options = match &cli.config {
        Some(path) => ObfuscationOptions::from_file(path)
            .with_context(|| format!("Failed to load options from {}", path.display()))?,
        None => ObfuscationOptions::default(),
    };

    if let Some(mode) = mode {
        options.mode = mode;
    }
    options.dynamic |= cli.dynamic;
    options.annotate_types |= cli.annotate_types;
    if cli.seed.is_some() {
        options.seed = cli.seed;
    }
    Ok(options)
}

/// `<output dir>/<file name>`, the output dir defaulting to `<input dir>/Output`
fn output_path(input: &Path, output_dir: Option<&Path>) -> Result<PathBuf> {
    let file_name = input
        .file_name()
        .with_context(|| format!("{} is not a file", input.display()))?;
    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => input
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(DEFAULT_OUTPUT_DIR),
    };
    Ok(dir.join(file_name))
}

fn print_summary(out: &mut StyledOutput, report: &ObfuscationReport, destination: &Path) {
    out.success("Obfuscated");
    out.plain(" with mode ");
    out.bold(report.mode.name());
    out.newline();

    out.info("  locals proxied:  ");
    out.plain(&report.stats.locals_proxied.to_string());
    out.newline();
    out.info("  proxy types:     ");
    out.plain(&report.proxies_created.to_string());
    out.newline();
    if report.stats.locals_skipped_address_taken > 0 {
        out.info("  address taken:   ");
        out.plain(&report.stats.locals_skipped_address_taken.to_string());
        out.newline();
    }
    if report.types_annotated > 0 {
        out.info("  types annotated: ");
        out.plain(&report.types_annotated.to_string());
        out.newline();
    }
    if let Some(resource) = &report.embedded_resource {
        out.info("  embedded as:     ");
        out.plain(resource);
        out.newline();
    }

    out.plain("Written to ");
    out.bold(&destination.display().to_string());
    out.newline();
    out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["veil"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_default_output_path() {
        let path = output_path(Path::new("/tmp/app/App.vmod"), None).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/app/Output/App.vmod"));

        let path = output_path(Path::new("App.vmod"), None).unwrap();
        assert_eq!(path, PathBuf::from("Output/App.vmod"));
    }

    #[test]
    fn test_explicit_output_dir() {
        let path = output_path(Path::new("/tmp/app/App.vmod"), Some(Path::new("/out"))).unwrap();
        assert_eq!(path, PathBuf::from("/out/App.vmod"));
    }

    #[test]
    fn test_flags_override_defaults() {
        let options = resolve_options(&cli(&["App.vmod", "--mode", "FailFast", "--dynamic", "--seed", "3"])).unwrap();
        assert_eq!(options.mode, StrategyKind::Crash);
        assert!(options.dynamic);
        assert!(!options.annotate_types);
        assert_eq!(options.seed, Some(3));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = resolve_options(&cli(&["App.vmod", "--mode", "chaos"])).unwrap_err();
        assert!(err.to_string().contains("chaos"));
    }

    #[test]
    fn test_config_file_then_flags() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("veil.toml");
        std::fs::write(&config, "mode = \"empty\"\nannotate_types = true\nseed = 9\n").unwrap();
        let config = config.to_str().unwrap();

        let options = resolve_options(&cli(&["App.vmod", "--config", config])).unwrap();
        assert_eq!(options.mode, StrategyKind::Empty);
        assert!(options.annotate_types);
        assert_eq!(options.seed, Some(9));

        let options = resolve_options(&cli(&["App.vmod", "--config", config, "--mode", "statechanger", "--seed", "1"])).unwrap();
        assert_eq!(options.mode, StrategyKind::StateMutator);
        assert_eq!(options.seed, Some(1));
    }
}
