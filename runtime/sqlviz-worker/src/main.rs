use sqlviz_worker::{WorkerConfig, stdio};
use std::io;
use tracing_subscriber::{EnvFilter, fmt};

fn init_tracing() {
    let filter = EnvFilter::try_from_env("SQLVIZ_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> io::Result<()> {
    init_tracing();
    let config = WorkerConfig::from_env();
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    stdio::serve(&config, &mut reader, io::stdout())?;
    Ok(())
}
