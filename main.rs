use album_indexer::album_tree;
use album_indexer::cleanup::{NoopConsumer, Reconciler};
use album_indexer::config::{AppPaths, Settings};
use album_indexer::db::{self, DbPool};
use album_indexer::jobs::ScanQueue;
use album_indexer::models::User;
use album_indexer::scan::{self, LoggingProcessor, ScanContext};
use album_indexer::watcher::FsWatcher;
use album_indexer::{Error, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "album-indexer")]
#[command(about = "Indexes photo directories into an album catalog", long_about = None)]
struct Cli {
    /// Directory holding the catalog database and derived caches
    #[arg(long, env = "ALBUM_INDEXER_DATA", default_value = "data")]
    data_dir: PathBuf,

    /// Settings file, defaults to settings.json inside the data directory
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a user
    AddUser {
        username: String,
        #[arg(long)]
        admin: bool,
    },
    /// Register a root album directory for a user
    AddRoot { username: String, path: PathBuf },
    /// Crawl the albums of one user, or of every user
    Scan {
        #[arg(long)]
        user: Option<String>,
        /// Revisit albums whose modify time did not change
        #[arg(long)]
        force: bool,
    },
    /// Scan, then follow filesystem changes until stdin is closed
    Watch {
        #[arg(long)]
        user: Option<String>,
    },
    /// Make the next scan revisit the albums containing a path
    MarkModified { path: PathBuf },
    /// Index one media file again and hand it to the processor
    Reprocess { path: PathBuf },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let paths = AppPaths::discover(&cli.data_dir)?;
    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(|| paths.root.join("settings.json"));
    let settings = Settings::load(&settings_path)?;
    settings.validate()?;
    let pool = db::init_database(&paths.db_path)?;

    let ctx = ScanContext {
        config: settings.scanner.clone(),
        reconciler: Reconciler::new(paths.clone(), Arc::new(NoopConsumer)),
        processor: Arc::new(LoggingProcessor),
    };

    match cli.command {
        Commands::AddUser { username, admin } => {
            let conn = pool.get()?;
            let user = db::create_user(&conn, &username, admin)?;
            println!("Created user {} ({})", user.username, user.id);
        }
        Commands::AddRoot { username, path } => {
            let conn = pool.get()?;
            let user = require_user(&pool, &username)?;
            let path = path.canonicalize().map_err(|err| Error::io_at(&path, err))?;
            let album = album_tree::add_root_album(&conn, user.id, &path)?;
            println!("Root album {} ({}) for {}", album.title, album.id, user.username);
        }
        Commands::Scan { user, force } => {
            let queue = ScanQueue::new(pool.clone(), ctx, &settings)?;
            match user {
                Some(username) => queue.enqueue(require_user(&pool, &username)?.id, force)?,
                None => {
                    queue.enqueue_all(force)?;
                }
            }
            let stats = queue.shutdown();
            println!(
                "{} scans done, {} failed, {} albums processed, {} errors",
                stats.completed, stats.failed, stats.albums, stats.errors
            );
        }
        Commands::Watch { user } => {
            let owners: Vec<User> = match user {
                Some(username) => vec![require_user(&pool, &username)?],
                None => {
                    let conn = pool.get()?;
                    db::list_users(&conn)?
                }
            };

            let queue = ScanQueue::new(pool.clone(), ctx.clone(), &settings)?;
            for owner in &owners {
                queue.enqueue(owner.id, false)?;
            }
            queue.shutdown();

            let owner_ids = owners.iter().map(|owner| owner.id).collect();
            let watcher = FsWatcher::start(pool, ctx, settings.database, owner_ids)?;
            println!(
                "Watching {} directories, close stdin to stop",
                watcher.registry().len()
            );
            let mut sink = String::new();
            while std::io::stdin().read_line(&mut sink)? > 0 {
                sink.clear();
            }
            watcher.stop();
        }
        Commands::MarkModified { path } => {
            let now = chrono::Utc::now().timestamp();
            let conn = pool.get()?;
            let touched = album_tree::mark_modified(&conn, &path, now)?;
            println!("Marked {} albums as modified", touched);
        }
        Commands::Reprocess { path } => {
            let path = path.canonicalize().map_err(|err| Error::io_at(&path, err))?;
            let conn = pool.get()?;
            let parent = path
                .parent()
                .ok_or_else(|| Error::Path(format!("{} has no parent", path.display())))?;
            let album = album_tree::find_album_by_path(&conn, parent)?
                .ok_or_else(|| Error::Path(format!("{} is not in an album", path.display())))?;
            let mut cache = ctx.new_cache();
            let (media, created) =
                scan::scan_one_media(&conn, &path, album.id, &mut cache, &ctx.config.retouch_marker)?;
            scan::process_single_media(&conn, &ctx, &media, Some(&album))?;
            println!("Reprocessed {} (new: {})", media.path, created);
        }
    }
    Ok(())
}

fn require_user(pool: &DbPool, username: &str) -> Result<User> {
    let conn = pool.get()?;
    db::find_user_by_name(&conn, username)?
        .ok_or_else(|| Error::Config(format!("unknown user {username}")))
}
