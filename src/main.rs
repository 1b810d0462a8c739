//! nmr-workbench: load NMR datasets, convert between containers and replay
//! processing macros from the command line.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use nmr_workbench::data::spectrum::SpectrumData;
use nmr_workbench::pipeline::conversion;
use nmr_workbench::session::{ConsoleFrontend, Session};

#[derive(Parser)]
#[command(
    name = "nmr-workbench",
    version,
    about = "Load, convert and process multi-vendor NMR data"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Detect and load a dataset, then print its metadata and history
    Inspect {
        /// Data file or acquisition directory
        path: PathBuf,
    },
    /// Load a dataset and save it; the output extension picks the writer
    Convert {
        path: PathBuf,
        /// Output file (.json, .mat, .fid or .spe)
        out: PathBuf,
        /// Write the SIMPSON BINARY payload instead of text
        #[arg(long, default_value_t = false)]
        binary: bool,
    },
    /// Load a dataset and replay a macro file on it
    Run {
        path: PathBuf,
        /// Macro file: JSON array of [opcode, [args]] pairs
        #[arg(short, long = "macro")]
        macro_file: PathBuf,
        /// Save the processed dataset here
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Save the session journal here (.json for JSON, text otherwise)
        #[arg(short, long)]
        journal: Option<PathBuf>,
        /// Correct the Bruker digital filter delay first, using this acqus
        /// file or experiment directory
        #[arg(long, value_name = "ACQUS")]
        digital_filter: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        binary: bool,
    },
}

fn print_summary(spectrum: &SpectrumData) {
    println!("  shape:   {:?}", spectrum.shape());
    for (i, axis) in spectrum.axes().iter().enumerate() {
        println!(
            "  dim {}:   freq {:.6} MHz, sw {:.3} kHz, {}{}{}",
            i + 1,
            axis.freq * 1e-6,
            axis.sw * 1e-3,
            if axis.spec { "frequency" } else { "time" },
            if axis.whole_echo { ", whole echo" } else { "" },
            axis.reference
                .map(|r| format!(", ref {:.6} MHz", r * 1e-6))
                .unwrap_or_default(),
        );
    }
    println!("  history:");
    for line in spectrum.history() {
        println!("    {}", line);
    }
}

fn inspect(path: PathBuf) -> ExitCode {
    match conversion::load_spectrum(&path) {
        Ok(loaded) => {
            println!("{}: {}", path.display(), loaded.format);
            print_summary(&loaded.spectrum);
            for warning in &loaded.warnings {
                println!("  warning: {}", warning);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn convert(path: PathBuf, out: PathBuf, binary: bool) -> ExitCode {
    let mut session = Session::new(Box::new(ConsoleFrontend));
    if session.load(&path).is_none() || !session.save_current(&out, binary) {
        return ExitCode::FAILURE;
    }
    ::log::info!("Converted {} -> {}", path.display(), out.display());
    ExitCode::SUCCESS
}

fn run(
    path: PathBuf,
    macro_file: PathBuf,
    out: Option<PathBuf>,
    journal: Option<PathBuf>,
    digital_filter: Option<PathBuf>,
    binary: bool,
) -> ExitCode {
    let mut session = Session::new(Box::new(ConsoleFrontend));
    if session.load(&path).is_none() {
        return ExitCode::FAILURE;
    }
    if let Some(acqus) = digital_filter {
        if !session.correct_digital_filter(&acqus, -1) {
            return ExitCode::FAILURE;
        }
    }
    let name = match session.load_macro(&macro_file) {
        Some(name) => name,
        None => return ExitCode::FAILURE,
    };
    let mut status = ExitCode::SUCCESS;
    if let Some(report) = session.run_macro(&name) {
        println!(
            "{}: {} of {} steps applied",
            macro_file.display(),
            report.applied,
            session.macro_steps(&name).map_or(0, <[_]>::len)
        );
        if !report.messages.is_empty() {
            status = ExitCode::FAILURE;
        }
    }
    if let Some(ws) = session.current() {
        print_summary(ws.spectrum());
    }
    if let Some(out) = out {
        if !session.save_current(&out, binary) {
            status = ExitCode::FAILURE;
        }
    }
    if let Some(journal) = journal {
        if let Err(e) = session.journal().save(&journal) {
            eprintln!("Error writing journal {}: {}", journal.display(), e);
            status = ExitCode::FAILURE;
        }
    }
    status
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { path } => inspect(path),
        Command::Convert { path, out, binary } => convert(path, out, binary),
        Command::Run {
            path,
            macro_file,
            out,
            journal,
            digital_filter,
            binary,
        } => run(path, macro_file, out, journal, digital_filter, binary),
    }
}
