/// IonScript CLI (ionscript)
///
/// Compiles and runs a single `.is` script, or every `.is` script in a
/// directory, printing compile/execute timings for each.

use clap::Parser as ClapParser;
use ionscript::parser::Parser;
use ionscript::runtime::Runtime;
use miette::{IntoDiagnostic, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(ClapParser)]
#[command(
    name = "ionscript",
    version = "0.1.0",
    about = "Run IonScript (.is) scripts"
)]
struct Cli {
    /// Script file, or a directory of .is scripts
    path: PathBuf,

    /// Dump the syntax tree before executing
    #[arg(short = 't', long)]
    tree: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.path.is_dir() {
        run_directory(&cli.path, cli.tree)
    } else {
        run_file(&cli.path, cli.tree)
    }
}

fn run_directory(dir: &Path, dump_tree: bool) -> Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| miette::miette!("Cannot read directory '{}': {}", dir.display(), e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("is"))
        .collect();
    entries.sort();

    let mut had_error = false;
    for path in entries {
        if let Err(e) = run_file(&path, dump_tree) {
            eprintln!("{e:?}");
            had_error = true;
        }
    }

    if had_error {
        Err(miette::miette!("one or more scripts failed"))
    } else {
        Ok(())
    }
}

fn run_file(path: &Path, dump_tree: bool) -> Result<()> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| miette::miette!("Cannot read '{}': {}", path.display(), e))?;

    if dump_tree {
        let tree = Parser::new(&source)
            .map_err(|e| miette::Report::new(e))?
            .parse_program()
            .map_err(|e| miette::Report::new(e))?;
        println!("{tree:#?}");
    }

    let mut runtime = Runtime::new();

    let compile_start = Instant::now();
    runtime
        .compile_into(&source)
        .map_err(|e| miette::Report::new(e))?;
    let compile_elapsed = compile_start.elapsed();

    let run_start = Instant::now();
    let mut stdout = std::io::stdout();
    runtime
        .run(&mut stdout)
        .map_err(|e| miette::Report::new(e))?;
    let run_elapsed = run_start.elapsed();
    stdout.flush().into_diagnostic()?;

    eprintln!(
        "{}: compiled in {:?}, ran in {:?}",
        path.display(),
        compile_elapsed,
        run_elapsed
    );
    Ok(())
}
