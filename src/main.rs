// src/main.rs

use dagrun::history::read_history;
use dagrun::{cli, logging};

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("dagrun error: {err:?}");
        std::process::exit(2);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;

    match args.command {
        cli::Command::List => list(&args.workdir),
    }
}

fn list(workdir: &str) -> anyhow::Result<()> {
    let entries = read_history(std::path::Path::new(workdir))?;
    if entries.is_empty() {
        println!("no workflows scheduled under {workdir}");
        return Ok(());
    }

    for (i, entry) in entries.iter().enumerate() {
        let id = entry.workflow_id.to_string();
        println!(
            "{i:>3}  {name}  {id}  {date}  {backend}  jobs={jobs}  errors={errors}",
            name = entry.name,
            id = &id[..8],
            date = entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            backend = entry.backend,
            jobs = entry.job_count,
            errors = entry.error_count,
        );
    }
    Ok(())
}
