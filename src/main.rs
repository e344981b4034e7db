use std::fs;

use clap::Parser;

use sshp::config::{Config, Settings};
use sshp::logdir::query_logs;
use sshp::runner;
use sshp::Result;

#[tokio::main]
async fn main() {
    let cli = Config::parse();
    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ERROR: sshp: {err}");
            1
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: &Config) -> Result<i32> {
    if !cli.logs.is_empty() {
        return print_logs(cli);
    }
    runner::run(cli).await
}

/// `-L`: print log files from a previous run instead of running.
fn print_logs(cli: &Config) -> Result<i32> {
    let settings = Settings::resolve(cli)?;
    let files = query_logs(
        &settings.dirlog,
        settings.job.as_deref(),
        cli.run_id.as_deref(),
        &cli.logs,
    )?;
    let banner = files.len() > 1;
    for path in files {
        if banner {
            println!("==> {} <==", path.display());
        }
        print!("{}", fs::read_to_string(&path)?);
    }
    Ok(0)
}
