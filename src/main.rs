use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;

use ferndb::concurrency::{LockManager, TransactionManager};
use ferndb::database::Database;
use ferndb::query::{Engine, Session};
use ferndb::recovery::{self, RecoveryManager};

const HISTORY_FILE: &str = ".ferndb_history";

#[derive(Parser)]
#[command(author, version, about = "ferndb - a disk-backed key/value engine")]
struct Cli {
    /// Database directory
    #[arg(default_value = "data")]
    db_dir: String,

    /// Buffer pool frames per table
    #[arg(long, default_value_t = ferndb::storage::NUM_FRAMES)]
    frames: usize,

    /// Statement to execute instead of starting the shell
    #[arg(short = 'c', long)]
    command: Option<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

/// Startup order: prime the directory from the last checkpoint
/// snapshot, open the database, wire lock manager -> transaction
/// manager -> recovery manager, recover, then accept input.
fn bootstrap(db_dir: &str, frames: usize) -> Result<Arc<Engine>> {
    let base = std::path::Path::new(db_dir);
    recovery::prime(base).context("priming database directory")?;
    let db = Arc::new(Database::open_with_frames(base, frames).context("opening database")?);
    let lm = Arc::new(LockManager::new());
    let tm = Arc::new(TransactionManager::new(lm));
    let rm = Arc::new(
        RecoveryManager::new(Arc::clone(&db), Arc::clone(&tm), recovery::log_path(base))
            .context("opening log file")?,
    );
    rm.recover().context("recovering from log")?;
    Ok(Arc::new(Engine::new(db, tm, rm)))
}

fn run(cli: &Cli) -> Result<()> {
    let engine = bootstrap(&cli.db_dir, cli.frames)?;
    let mut session = engine.session();

    if let Some(statement) = &cli.command {
        match session.execute_line(statement) {
            Ok(response) => println!("{}", response),
            Err(err) => anyhow::bail!("{}", err),
        }
        engine.db().close()?;
        return Ok(());
    }

    run_shell(&mut session)?;
    engine.db().close()?;
    Ok(())
}

fn run_shell(session: &mut Session) -> Result<()> {
    println!("ferndb shell. Type .help for commands, .quit to exit.");
    let mut rl = Editor::<(), DefaultHistory>::new()?;
    let _ = rl.load_history(HISTORY_FILE);

    loop {
        match rl.readline("ferndb> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(&line);
                match line.as_str() {
                    ".quit" | ".exit" => break,
                    ".help" => print_help(),
                    _ => match session.execute_line(&line) {
                        Ok(response) => println!("{}", response),
                        Err(err) => println!("error: {}", err),
                    },
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }

    if session.in_transaction() {
        println!("warning: open transaction abandoned; it will be rolled back on next startup");
    }
    let _ = rl.save_history(HISTORY_FILE);
    Ok(())
}

fn print_help() {
    println!("create {{hash|btree}} table <name>   create a table");
    println!("insert <key> <value> into <name>   insert an entry");
    println!("update <name> <key> <value>        overwrite an entry");
    println!("delete <key> from <name>           remove an entry");
    println!("find <key> from <name>             look up one key");
    println!("select from <name>                 list all entries");
    println!("range <start> <end> from <name>    scan [start, end) (btree only)");
    println!("transaction begin|commit|rollback  explicit transactions");
    println!(".checkpoint                        flush and checkpoint");
    println!(".help                              this message");
    println!(".quit                              exit");
}
