use cdnwarm::cli::Args;
use cdnwarm::interrupt::{FORCED_EXIT_CODE, watch_interrupts};
use cdnwarm::logging::init_logging;
use clap::Parser;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let guard = match init_logging(args.verbose, args.quiet, args.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let token = CancellationToken::new();
    tokio::spawn(watch_interrupts(
        tokio::signal::ctrl_c,
        token.clone(),
        || {
            process::exit(FORCED_EXIT_CODE);
        },
    ));

    if let Err(e) = cdnwarm::run(args, token).await {
        error!("{e}");
        eprintln!("Error: {e}");
        drop(guard);
        process::exit(1);
    }
}
