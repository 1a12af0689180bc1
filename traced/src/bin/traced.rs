use clap::Parser;
use eyre::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use traced::Collector;

#[derive(Parser)]
#[command(name = "traced")]
#[command(about = "collects trace chunks and writes a Chrome trace document")]
struct Args {
    #[arg(
        short,
        long,
        help = "output file for the trace document (defaults to stdout)"
    )]
    output: Option<PathBuf>,

    #[arg(
        short,
        long,
        default_value = protocol::CONTROL_SOCKET_PATH,
        help = "control socket path clients announce chunks on"
    )]
    socket: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received ctrl+c, shutting down");
        flag.store(true, Ordering::SeqCst);
    })?;

    let writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(std::io::stdout()),
    };

    let mut collector = Collector::new(&args.socket, writer)
        .with_context(|| format!("failed to start on {}", args.socket.display()))?;
    collector.run(&shutdown)?;

    let events = collector.events();
    collector.finish()?;
    tracing::info!(events, "trace document complete");
    Ok(())
}
