//! upperfs - passthrough filesystem with quota and a persistent xattr store
//!
//! Usage:
//!   upperfs mount <source> <mount_point>   - Mirror a directory
//!   upperfs unmount <mount_point>          - Unmount
//!   upperfs usage <path>                   - Show the recursive size of a tree
//!   upperfs exceeded <path> --quota SIZE   - Check a tree against a limit
//!   upperfs xattrs <path>                  - List stored attributes of a path

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use upperfs::{
    config::{CacheMode, Config},
    fs::{IdentityCache, UpperFs},
    quota::{format_size, parse_size, total_size, SpaceAccountant},
    xattr::AttributeStore,
};

#[derive(Parser)]
#[command(name = "upperfs")]
#[command(author = "upperfs Contributors")]
#[command(version)]
#[command(about = "Passthrough FUSE filesystem with write-time quota and a persistent xattr store")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror a source directory at a mount point
    Mount {
        /// Directory to mirror
        source: PathBuf,

        /// Mount point directory
        mount_point: PathBuf,

        /// Size limit, e.g. 500M or 10GiB
        #[arg(short, long)]
        quota: Option<String>,

        /// Apply the limit to this subdirectory of the source only
        #[arg(long)]
        quota_path: Option<PathBuf>,

        /// Attribute database directory
        #[arg(long)]
        xattr_db: Option<PathBuf>,

        /// Reject extended attribute calls
        #[arg(long)]
        no_xattr: bool,

        /// Kernel cache policy: never, auto or always
        #[arg(long)]
        cache: Option<CacheMode>,

        /// Entry and attribute timeout in seconds
        #[arg(long)]
        timeout: Option<f64>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Mount read-only
        #[arg(long)]
        read_only: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Print the recursive size of a tree
    Usage {
        path: PathBuf,
    },

    /// Check whether a tree is at or over a size limit
    Exceeded {
        path: PathBuf,

        /// Size limit, e.g. 500M or 10GiB
        #[arg(short, long)]
        quota: String,
    },

    /// List the extended attributes stored for a source path
    Xattrs {
        path: PathBuf,

        /// Attribute database directory
        #[arg(long)]
        xattr_db: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    if let Err(e) = run_command(cli.command, cli.config.as_deref()) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Mount {
            source,
            mount_point,
            quota,
            quota_path,
            xattr_db,
            no_xattr,
            cache,
            timeout,
            allow_other,
            read_only,
        } => {
            let mut config = load_config(config_path, &source, &mount_point)?;
            if quota.is_some() {
                config.quota.limit = quota;
            }
            if quota_path.is_some() {
                config.quota.path = quota_path;
            }
            if xattr_db.is_some() {
                config.xattr.db_dir = xattr_db;
            }
            if no_xattr {
                config.xattr.enabled = false;
            }
            if let Some(cache) = cache {
                config.mount.cache = cache;
            }
            if timeout.is_some() {
                config.mount.timeout = timeout;
            }
            config.mount.allow_other |= allow_other;
            config.mount.read_only |= read_only;
            cmd_mount(config)
        }

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Usage { path } => cmd_usage(&path),

        Commands::Exceeded { path, quota } => cmd_exceeded(&path, &quota),

        Commands::Xattrs { path, xattr_db } => {
            let mut config = match config_path {
                Some(p) => Config::load(p)?,
                None => {
                    let mut config = Config::new(PathBuf::new(), PathBuf::new());
                    config.apply_env_overrides();
                    config
                }
            };
            if xattr_db.is_some() {
                config.xattr.db_dir = xattr_db;
            }
            cmd_xattrs(&config, &path)
        }
    }
}

fn load_config(config_path: Option<&Path>, source: &Path, mount_point: &Path) -> anyhow::Result<Config> {
    let mut config = match config_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {:?}", path))?,
        None => {
            let mut config = Config::new(source, mount_point);
            config.apply_env_overrides();
            config
        }
    };
    config.mount.source = source.to_path_buf();
    config.mount.mount_point = mount_point.to_path_buf();
    Ok(config)
}

/// One descriptor stays open per live node, so lift the soft limit
fn raise_fd_limit() {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        warn!("getrlimit failed: {}", std::io::Error::last_os_error());
        return;
    }
    if limit.rlim_cur >= limit.rlim_max {
        return;
    }

    let previous = limit.rlim_cur;
    limit.rlim_cur = limit.rlim_max;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        warn!("setrlimit failed: {}", std::io::Error::last_os_error());
    } else {
        info!("Raised open file limit from {} to {}", previous, limit.rlim_max);
    }
}

fn cmd_mount(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    config.ensure_directories()?;

    let source = config
        .mount
        .source
        .canonicalize()
        .with_context(|| format!("resolving source {:?}", config.mount.source))?;
    let mount_point = &config.mount.mount_point;

    info!("Starting upperfs: {:?} -> {:?}", source, mount_point);
    raise_fd_limit();

    let nodes = Arc::new(IdentityCache::new(&source)?);
    let quota = Arc::new(SpaceAccountant::new(config.quota_root(), config.quota_limit()?)?);
    if let Some(limit) = quota.limit() {
        info!("Quota of {} on {:?}", format_size(limit), quota.root());
    }
    let attrs = config.xattr.enabled.then(|| {
        info!("Attribute store at {:?}", config.xattr_db_dir());
        Arc::new(AttributeStore::new(config.xattr_db_dir()))
    });

    let fs = UpperFs::new(nodes, quota, attrs, config.ttl()?);

    std::fs::create_dir_all(mount_point)?;

    let mut options = vec![
        fuser::MountOption::FSName("upperfs".to_string()),
        fuser::MountOption::AutoUnmount,
    ];
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
        options.push(fuser::MountOption::DefaultPermissions);
    }
    if config.mount.read_only {
        options.push(fuser::MountOption::RO);
    }

    info!("Mounting at {:?}", mount_point);
    fuser::mount2(fs, mount_point, &options)
        .with_context(|| format!("mounting at {:?}", mount_point))?;
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> anyhow::Result<()> {
    info!("Unmounting {:?}...", mount_point);

    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()
        .context("running fusermount")?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        bail!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    }
}

fn cmd_usage(path: &Path) -> anyhow::Result<()> {
    let size = total_size(path).with_context(|| format!("measuring {:?}", path))?;
    println!("{}\t{} ({} bytes)", path.display(), format_size(size), size);
    Ok(())
}

fn cmd_exceeded(path: &Path, quota: &str) -> anyhow::Result<()> {
    let limit = parse_size(quota)?;
    let accountant = SpaceAccountant::new(path, Some(limit))?;
    if accountant.would_exceed()? {
        println!("EXCEEDED");
    } else {
        println!("NOT EXCEEDED");
    }
    println!(
        "used {} of {}",
        format_size(accountant.used()?),
        format_size(limit)
    );
    Ok(())
}

fn cmd_xattrs(config: &Config, path: &Path) -> anyhow::Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("resolving {:?}", path))?;
    let store = AttributeStore::new(config.xattr_db_dir());

    let entries = store.entries(&path)?;
    if entries.is_empty() {
        println!("No attributes stored for {}", path.display());
    }
    for (name, value) in entries {
        println!(
            "{} = {:?}",
            name.to_string_lossy(),
            String::from_utf8_lossy(&value)
        );
    }
    store.close()?;
    Ok(())
}
