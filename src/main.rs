use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use grumble::server::freeze;
use grumble::server::lock::LockError;
use grumble::server::lock::LockFile;
use grumble::server::tls;
use grumble::server::Registry;

#[derive(Parser, Debug)]
#[command(name = "grumble", about = "Mumble-compatible voice chat server", version)]
struct Args {
    /// Directory holding server state, certificates and blobs
    #[arg(long, value_name = "PATH", default_value = ".")]
    datadir: PathBuf,

    /// Write log output to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,

    /// Generate a fresh self-signed certificate pair and exit
    #[arg(long)]
    regen_keys: bool,

    /// Import a murmur SQLite database as the initial snapshot and exit
    #[arg(long, value_name = "PATH")]
    import_murmurdb: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // The guard must outlive the subscriber; without it, buffered log
    // lines are lost on exit.
    let _log_guard = match init_logging(&args) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to set up logging: {}", err);
            return ExitCode::from(1);
        }
    };

    if let Err(err) = std::fs::create_dir_all(&args.datadir) {
        error!("cannot create data directory: {}", err);
        return ExitCode::from(1);
    }

    if args.regen_keys {
        return match tls::generate_self_signed(&args.datadir) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{}", err);
                ExitCode::from(1)
            }
        };
    }

    let _lock = match LockFile::acquire(&args.datadir) {
        Ok(lock) => lock,
        Err(LockError::Held(pid)) => {
            error!("data directory in use by pid {}", pid);
            return ExitCode::from(2);
        }
        Err(err) => {
            error!("{}", err);
            return ExitCode::from(1);
        }
    };

    if let Some(db) = &args.import_murmurdb {
        return match import_murmurdb(db, &args.datadir) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("murmur import failed: {}", err);
                ExitCode::from(1)
            }
        };
    }

    match serve(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {}", err);
            ExitCode::from(1)
        }
    }
}

type LogGuard = Option<tracing_appender::non_blocking::WorkerGuard>;

fn init_logging(args: &Args) -> anyhow::Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &args.log {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

fn import_murmurdb(db: &std::path::Path, datadir: &std::path::Path) -> anyhow::Result<()> {
    let frozen = freeze::import_murmur(db, 1)?;
    let server_dir = datadir.join("servers").join("1");
    std::fs::create_dir_all(&server_dir)?;
    freeze::write_snapshot(&server_dir, &frozen)?;
    info!(dir = %server_dir.display(), "snapshot imported");
    Ok(())
}

#[tokio::main]
async fn serve(args: &Args) -> anyhow::Result<()> {
    let acceptor = Arc::new(tls::load_or_generate_acceptor(&args.datadir)?);
    let registry = Registry::load(&args.datadir)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        servers = registry.servers.len(),
        datadir = %args.datadir.display(),
        "starting"
    );

    for server in &registry.servers {
        let addr: SocketAddr = ([0, 0, 0, 0], Registry::port_for(server.id)).into();
        let server = server.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(err) = server.clone().run(acceptor, addr).await {
                error!(server = server.id, "server failed: {}", err);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for server in &registry.servers {
        server.mark_dirty();
        server.freeze_if_dirty().await;
    }
    Ok(())
}
