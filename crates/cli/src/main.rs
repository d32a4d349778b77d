//! The `hit` tool: helper subcommands over hdist-core.
//!
//! This is deliberately thin: build an artifact from a spec file, drive
//! the source cache, assemble profiles, manage GC roots and run the
//! collector. A few subcommands (`build-profile`, `create-links`,
//! `patch-shebangs`) exist so build jobs can re-enter the tool from inside
//! the sandbox.
//!
//! Exit codes: 0 success, 1 build failure, 2 usage error, 3 store I/O
//! error, 4 integrity failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use hdist_core::build_store::KeepBuild;
use hdist_core::config::{Config, StoreContext, init_home};
use hdist_core::gc::{GcRoots, Retention, RetentionPolicy, collect_garbage};
use hdist_core::links::{LinkRule, execute_links};
use hdist_core::profile::{ProfileManifest, assemble_into, make_profile, profile_build_spec};
use hdist_core::source_cache::{RetentionTag, SourceKey, SourceScheme};
use hdist_core::tools::{patch_shebangs, scan_store_paths};
use hdist_core::{ArtifactId, BuildSpec, BuildStore, Error, SourceCache};

#[derive(Parser)]
#[command(name = "hit")]
#[command(author, version, about = "Content-addressed build store and profile composer")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (overrides HDIST_CONFIG and the default location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the ~/.hashdist directory skeleton and a default config
    InitHome {
        /// Home directory to initialize
        #[arg(default_value = "~/.hashdist")]
        home: PathBuf,
    },

    /// Build an artifact from a build spec, unless already present
    Build {
        /// Path to the build spec (build.json)
        spec: PathBuf,

        /// Resolve a virtual import, e.g. --virtual virtual:unix=unix/host/abc...
        #[arg(long = "virtual", value_name = "ALIAS=ID")]
        virtuals: Vec<String>,

        /// What to do with the staging build dir: never, error, always
        #[arg(long, default_value = "error")]
        keep_build: String,
    },

    /// Resolve an artifact id (full or short form) to its store path
    Resolve {
        id: String,
    },

    /// Remove one artifact from the store
    Purge {
        id: String,
    },

    /// Download a source archive into the source cache
    Fetch {
        url: String,

        /// Archive type when it cannot be guessed from the URL
        #[arg(long, value_name = "TYPE")]
        r#type: Option<String>,

        /// Accept changed content under an already-known URL
        #[arg(long)]
        refresh: bool,
    },

    /// Fetch a git commit, branch or tag into the source cache
    FetchGit {
        repository: String,
        rev: String,
    },

    /// Store a local file or directory in the source cache
    Put {
        path: PathBuf,
    },

    /// Unpack a source cache entry (verifying it against its key)
    Unpack {
        key: String,
        target: PathBuf,

        /// Leading path components to drop
        #[arg(long, default_value_t = 0)]
        strip: u32,
    },

    /// Assemble a profile directory directly from a list of artifact ids
    MakeProfile {
        target: PathBuf,
        ids: Vec<String>,
    },

    /// Build a profile as a cached, content-addressed artifact
    BuildProfile {
        /// Profile manifest ({"artifacts": [...]}); inside a build job this
        /// is the file carried by the synthesized spec
        manifest: PathBuf,

        /// Profile artifact name
        #[arg(long, default_value = "profile")]
        name: String,
    },

    /// Apply a link-rules document against the current environment
    CreateLinks {
        rules: PathBuf,
    },

    /// Manage GC roots
    #[command(subcommand)]
    Root(RootCommands),

    /// Remove everything not reachable from a GC root
    Gc {
        /// Report what would be removed without removing it
        #[arg(long)]
        dry_run: bool,

        /// Retention per source tag, e.g. --retain targz=30days or
        /// --retain transient=0days (default: keep everything forever)
        #[arg(long = "retain", value_name = "TAG=POLICY")]
        retain: Vec<String>,
    },

    /// Rewrite absolute shebangs into relocatable trampolines
    PatchShebangs {
        dir: PathBuf,
    },

    /// List files embedding the absolute store root (relocatability scan)
    ScanStorePaths {
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum RootCommands {
    /// Create a symlink to an artifact and register it as a GC root
    Add { id: String, link: PathBuf },
    /// Deregister a root and remove its symlink
    Rm { link: PathBuf },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => {}
        Err(err) => {
            let code = err
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(hdist_core::error::EXIT_USAGE);
            eprintln!("{} {:#}", style("error:").red().bold(), err);
            std::process::exit(code);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::InitHome { home } => {
            let home = expand_home(&home)?;
            init_home(&home).map_err(Error::from)?;
            println!("{} {}", style("Initialized").green().bold(), home.display());
            Ok(())
        }
        command => {
            let ctx = load_context(cli.config.as_deref())?;
            dispatch(command, &ctx)
        }
    }
}

fn dispatch(command: Commands, ctx: &StoreContext) -> anyhow::Result<()> {
    let store = BuildStore::open(ctx).map_err(Error::from)?;
    let cache = SourceCache::open(ctx.source_cache_root()).map_err(Error::from)?;

    match command {
        Commands::InitHome { .. } => unreachable!("handled before context loading"),

        Commands::Build { spec, virtuals, keep_build } => {
            let doc: serde_json::Value = read_json(&spec)?;
            let spec = BuildSpec::new(&doc).map_err(Error::from)?;
            let virtuals = parse_virtuals(&virtuals)?;
            let keep_build = parse_keep_build(&keep_build)?;

            println!(
                "{} {}",
                style("Building").green().bold(),
                spec.id.short_form()
            );
            let (id, dir) = store
                .ensure_present(&spec, &cache, &virtuals, keep_build)
                .map_err(Error::from)?;
            println!("{}", id);
            println!("{}", dir.display());
            Ok(())
        }

        Commands::Resolve { id } => {
            match store.resolve_str(&id).map_err(Error::from)? {
                Some(dir) => {
                    println!("{}", dir.display());
                    Ok(())
                }
                None => Err(anyhow!("artifact '{}' is not present", id)),
            }
        }

        Commands::Purge { id } => {
            match store.delete(&id).map_err(Error::from)? {
                Some(dir) => {
                    println!("{} {}", style("Removed").yellow().bold(), dir.display());
                    Ok(())
                }
                None => Err(anyhow!("artifact '{}' is not present", id)),
            }
        }

        Commands::Fetch { url, r#type, refresh } => {
            let scheme = r#type
                .map(|t| SourceScheme::from_str(&t).map_err(Error::from))
                .transpose()?;
            let key = cache.fetch(&url, scheme, refresh).map_err(Error::from)?;
            println!("{}", key);
            Ok(())
        }

        Commands::FetchGit { repository, rev } => {
            let key = cache.fetch_git(&repository, &rev).map_err(Error::from)?;
            println!("{}", key);
            Ok(())
        }

        Commands::Put { path } => {
            let key = if path.is_dir() {
                cache.put_dir(&path).map_err(Error::from)?
            } else {
                cache.put_file(&path).map_err(Error::from)?
            };
            println!("{}", key);
            Ok(())
        }

        Commands::Unpack { key, target, strip } => {
            let key: SourceKey = key.parse().map_err(Error::from)?;
            cache.unpack(&key, &target, strip).map_err(Error::from)?;
            Ok(())
        }

        Commands::MakeProfile { target, ids } => {
            let ids = parse_ids(&ids)?;
            let manifest = make_profile(&store, &ids, &target).map_err(Error::from)?;
            println!(
                "{} {} ({} artifacts)",
                style("Assembled").green().bold(),
                target.display(),
                manifest.artifacts.len()
            );
            Ok(())
        }

        Commands::BuildProfile { manifest, name } => {
            let doc: ProfileManifest = read_json(&manifest)?;
            let ids = parse_ids(&doc.artifacts)?;

            // Inside a build job $ARTIFACT is the staging dir to assemble
            // into; outside one, synthesize the profile spec and build it.
            if let Ok(target) = std::env::var("ARTIFACT") {
                assemble_into(&store, &ids, Path::new(&target)).map_err(Error::from)?;
                return Ok(());
            }

            let spec = profile_build_spec(&name, &ids).map_err(Error::from)?;
            let (id, dir) = store
                .ensure_present(&spec, &cache, &BTreeMap::new(), KeepBuild::OnError)
                .map_err(Error::from)?;
            println!("{}", id);
            println!("{}", dir.display());
            Ok(())
        }

        Commands::CreateLinks { rules } => {
            let rules: Vec<LinkRule> = read_json(&rules)?;
            let env: BTreeMap<String, String> = std::env::vars().collect();
            execute_links(&rules, &env).map_err(Error::from)?;
            Ok(())
        }

        Commands::Root(RootCommands::Add { id, link }) => {
            let id: ArtifactId = id
                .parse()
                .map_err(|_| anyhow!("'{}' is not a valid artifact id", id))?;
            let roots = GcRoots::new(store.gc_roots_dir());
            roots.add(&store, &id, &link).map_err(Error::from)?;
            Ok(())
        }

        Commands::Root(RootCommands::Rm { link }) => {
            let roots = GcRoots::new(store.gc_roots_dir());
            roots.remove(&link).map_err(Error::from)?;
            Ok(())
        }

        Commands::Gc { dry_run, retain } => {
            let policy = parse_retention(&retain)?;
            let result = collect_garbage(&store, &cache, &policy, dry_run).map_err(Error::from)?;
            let verb = if dry_run { "Would remove" } else { "Removed" };
            println!(
                "{} {} artifacts, {} sources ({} bytes)",
                style(verb).yellow().bold(),
                result.stats.artifacts_deleted,
                result.stats.sources_deleted,
                result.stats.total_bytes_freed()
            );
            for path in &result.deleted_paths {
                println!("  {}", path.display());
            }
            Ok(())
        }

        Commands::PatchShebangs { dir } => {
            let patched = patch_shebangs(&dir).map_err(Error::from)?;
            for path in &patched {
                println!("{}", path.display());
            }
            Ok(())
        }

        Commands::ScanStorePaths { dir } => {
            let hits = scan_store_paths(&dir, store.store_root()).map_err(Error::from)?;
            for path in &hits {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

fn load_context(override_path: Option<&Path>) -> anyhow::Result<StoreContext> {
    let path = match override_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_path().map_err(Error::from)?,
    };
    let config = Config::load(&path)
        .map_err(Error::from)
        .with_context(|| format!("run 'hit init-home' to create {}", path.display()))?;
    // Build jobs re-enter this tool through the sandboxed `hit` bootstrap;
    // the config location is the one variable that passes through.
    std::env::set_var(hdist_core::config::CONFIG_ENV_VAR, &path);
    Ok(StoreContext::new(config).map_err(Error::from)?)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_virtuals(pairs: &[String]) -> anyhow::Result<BTreeMap<String, ArtifactId>> {
    let mut out = BTreeMap::new();
    for pair in pairs {
        let (alias, id) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected ALIAS=ID, got '{}'", pair))?;
        if !alias.starts_with("virtual:") {
            return Err(anyhow!("virtual alias '{}' must start with 'virtual:'", alias));
        }
        let id: ArtifactId = id
            .parse()
            .map_err(|_| anyhow!("'{}' is not a valid artifact id", id))?;
        out.insert(alias.to_string(), id);
    }
    Ok(out)
}

fn parse_ids(ids: &[String]) -> anyhow::Result<Vec<ArtifactId>> {
    ids.iter()
        .map(|id| {
            id.parse::<ArtifactId>()
                .map_err(|_| anyhow!("'{}' is not a valid artifact id", id))
        })
        .collect()
}

fn parse_keep_build(value: &str) -> anyhow::Result<KeepBuild> {
    match value {
        "never" => Ok(KeepBuild::Never),
        "error" => Ok(KeepBuild::OnError),
        "always" => Ok(KeepBuild::Always),
        other => Err(anyhow!("invalid keep-build value '{}' (never|error|always)", other)),
    }
}

fn parse_retention(pairs: &[String]) -> anyhow::Result<RetentionPolicy> {
    let mut policy = RetentionPolicy::new();
    for pair in pairs {
        let (tag, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected TAG=POLICY, got '{}'", pair))?;
        let tag = match tag {
            "transient" => RetentionTag::Transient,
            "targz" => RetentionTag::Targz,
            "git" => RetentionTag::Git,
            "file" => RetentionTag::File,
            "dir" => RetentionTag::Dir,
            other => return Err(anyhow!("unknown source tag '{}'", other)),
        };
        let retention = if value == "forever" {
            Retention::Forever
        } else if let Some(days) = value.strip_suffix("days") {
            Retention::Days(
                days.parse()
                    .map_err(|_| anyhow!("invalid retention '{}'", value))?,
            )
        } else {
            return Err(anyhow!("invalid retention '{}' (forever|<N>days)", value));
        };
        policy.insert(tag, retention);
    }
    Ok(policy)
}

fn expand_home(path: &Path) -> anyhow::Result<PathBuf> {
    if let Ok(rest) = path.strip_prefix("~") {
        let home = std::env::var("HOME").map_err(|_| anyhow!("HOME is not set"))?;
        Ok(PathBuf::from(home).join(rest))
    } else {
        Ok(path.to_path_buf())
    }
}
