//! Command-line front end for chunkferry uploads.

mod paths;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chunkferry_protocol::types::UploadProgress;
use chunkferry_transfer::{FileStore, StateStore, UploadSession};
use chunkferry_uploader::{DirectoryTransport, FileSource, Uploader, UploaderConfig};

#[derive(Parser)]
#[command(name = "chunkferry")]
#[command(about = "Resumable chunked file uploads")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "CHUNKFERRY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding persistent upload state
    #[arg(long, global = true, env = "CHUNKFERRY_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, resuming any earlier interrupted attempt
    Upload {
        /// File to upload
        file: PathBuf,
        /// Destination directory the file is assembled in
        #[arg(long)]
        dest: PathBuf,
        /// Explicit session id (default: derived from name, size and mtime)
        #[arg(long)]
        session_id: Option<String>,
        /// Chunk size in bytes (overrides config)
        #[arg(long)]
        chunk_size: Option<u64>,
        /// Concurrent chunk transfers (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Show a stored session
    Status {
        /// Session id
        id: String,
    },
    /// List stored sessions
    List,
    /// Delete a stored session and its chunk records
    Clear {
        /// Session id
        id: String,
        /// Also discard parts already written under this destination
        #[arg(long)]
        dest: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Cli {
        config,
        state_dir,
        command,
    } = Cli::parse();
    let config_path = config.unwrap_or_else(paths::config_file);
    let state_dir = state_dir.unwrap_or_else(paths::state_dir);

    match command {
        Commands::Upload {
            file,
            dest,
            session_id,
            chunk_size,
            concurrency,
        } => {
            let mut config = UploaderConfig::load(&config_path)
                .with_context(|| format!("loading {}", config_path.display()))?;
            if let Some(size) = chunk_size {
                config.chunk_size = size;
            }
            if let Some(n) = concurrency {
                config.concurrency = n;
            }
            config.validate()?;
            upload(&file, &dest, session_id, &state_dir, config).await
        }
        Commands::Status { id } => {
            let store = open_store(&state_dir).await?;
            match store.get_session(&id).await? {
                Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
                None => bail!("no stored session {id}"),
            }
            Ok(())
        }
        Commands::List => {
            let store = open_store(&state_dir).await?;
            let sessions = store.list_sessions().await?;
            if sessions.is_empty() {
                println!("no stored sessions");
            }
            for session in &sessions {
                println!("{}", summary(session));
            }
            Ok(())
        }
        Commands::Clear { id, dest } => {
            let store = open_store(&state_dir).await?;
            store.delete_session_and_chunks(&id).await?;
            if let Some(dest) = dest {
                DirectoryTransport::new(dest).discard(&id).await?;
            }
            println!("cleared {id}");
            Ok(())
        }
    }
}

async fn open_store(state_dir: &Path) -> Result<FileStore> {
    FileStore::open(state_dir)
        .await
        .with_context(|| format!("opening state in {}", state_dir.display()))
}

async fn upload(
    file: &Path,
    dest: &Path,
    session_id: Option<String>,
    state_dir: &Path,
    config: UploaderConfig,
) -> Result<()> {
    let mut source = FileSource::from_path(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    if let Some(id) = session_id {
        source = source.with_session_id(id);
    }
    let interval = config.progress_interval();
    let store = Arc::new(open_store(state_dir).await?);
    let transport = Arc::new(DirectoryTransport::new(dest));
    let uploader = Uploader::new(source, store, transport, config);

    let last_report: Mutex<Option<Instant>> = Mutex::new(None);
    uploader.on_progress(move |p: UploadProgress| {
        let mut last = last_report.lock().unwrap_or_else(PoisonError::into_inner);
        let done = p.completed_chunks >= p.total_chunks;
        if !done && last.is_some_and(|at| at.elapsed() < interval) {
            return;
        }
        *last = Some(Instant::now());
        tracing::info!(
            session = %p.session_id,
            completed = p.completed_chunks,
            total = p.total_chunks,
            percent = %format!("{:.1}", p.percentage()),
            speed_kib = %format!("{:.0}", p.bytes_per_second / 1024.0),
            "progress"
        );
    });

    tracing::info!(
        session = %uploader.session_id(),
        file = %file.display(),
        dest = %dest.display(),
        "upload starting"
    );

    tokio::select! {
        result = uploader.start() => {
            let receipt = result?;
            println!("{} ({} bytes)", receipt.reference, receipt.size);
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            uploader.pause();
            tracing::warn!(session = %uploader.session_id(), "interrupted, rerun to resume");
            bail!("upload interrupted")
        }
    }
}

fn summary(session: &UploadSession) -> String {
    let mut line = format!(
        "{}  {}  {}  {}/{} chunks  {} bytes",
        session.id,
        session.status,
        session.file_name,
        session.uploaded_chunks,
        session.total_chunks,
        session.file_size
    );
    if let Some(error) = &session.last_error {
        line.push_str("  error: ");
        line.push_str(error);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkferry_protocol::types::SessionStatus;

    #[test]
    fn cli_parses_upload() {
        let cli = Cli::try_parse_from([
            "chunkferry",
            "upload",
            "movie.mkv",
            "--dest",
            "/srv/in",
            "--concurrency",
            "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Upload {
                file,
                dest,
                concurrency,
                chunk_size,
                ..
            } => {
                assert_eq!(file, PathBuf::from("movie.mkv"));
                assert_eq!(dest, PathBuf::from("/srv/in"));
                assert_eq!(concurrency, Some(4));
                assert_eq!(chunk_size, None);
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn global_state_dir_after_subcommand() {
        let cli = Cli::try_parse_from(["chunkferry", "list", "--state-dir", "/var/cf"]).unwrap();
        assert_eq!(cli.state_dir, Some(PathBuf::from("/var/cf")));
    }

    #[test]
    fn upload_requires_dest() {
        assert!(Cli::try_parse_from(["chunkferry", "upload", "a.bin"]).is_err());
    }

    #[test]
    fn summary_includes_error() {
        let mut session = UploadSession::new("s".into(), "a.bin".into(), 10, 4, 3, "sha256");
        session.status = SessionStatus::Failed;
        session.last_error = Some("boom".into());
        let line = summary(&session);
        assert!(line.contains("a.bin"));
        assert!(line.contains("0/3 chunks"));
        assert!(line.ends_with("error: boom"));
    }
}
