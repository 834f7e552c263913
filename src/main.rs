//! dyldis - A symbolizing ARM64 disassembler for the dyld shared cache.
//!
//! Disassemble functions of cached images with every referenced address
//! resolved to a symbol, a string literal or a function offset.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use dyldis::disasm::render_classification;
use dyldis::symbols::{self, IndexOptions};
use dyldis::{
    locate, AddressClassifier, DisassOptions, Disassembler, DyldContext, FunctionTable,
    IndexBuilder, SharedCache, SymbolIndex, Target,
};

/// A symbolizing ARM64 disassembler for the dyld shared cache.
#[derive(Parser, Debug)]
#[command(name = "dyldis")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Disassemble a function or address range
    Disass {
        /// Path to the dyld shared cache (file, or directory with --arch)
        cache: PathBuf,

        /// Symbol name, or a 0x-prefixed address
        target: Option<String>,

        /// Restrict symbol lookup to images matching this substring
        #[arg(short, long)]
        image: Option<String>,

        /// Number of instructions (default: to the end of the function)
        #[arg(short, long, default_value = "0")]
        count: usize,

        /// Demangle C++ and Rust names
        #[arg(short, long)]
        demangle: bool,

        /// Architecture to use when CACHE is a directory
        #[arg(short, long)]
        arch: Option<String>,

        /// Rebuild the symbol index even if one exists
        #[arg(long)]
        rebuild_index: bool,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },

    /// Build the companion symbol index
    Index {
        /// Path to the dyld shared cache (file, or directory with --arch)
        cache: PathBuf,

        /// Architecture to use when CACHE is a directory
        #[arg(short, long)]
        arch: Option<String>,

        /// Rebuild the symbol index even if one exists
        #[arg(long)]
        rebuild_index: bool,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },

    /// Show what an address refers to
    Lookup {
        /// Path to the dyld shared cache (file, or directory with --arch)
        cache: PathBuf,

        /// Address to lookup (hex, e.g., 0x180000000)
        address: String,

        /// Architecture to use when CACHE is a directory
        #[arg(short, long)]
        arch: Option<String>,

        /// Demangle C++ and Rust names
        #[arg(short, long)]
        demangle: bool,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Disass {
            cache,
            target,
            image,
            count,
            demangle,
            arch,
            rebuild_index,
            verbosity,
        } => {
            setup_logging(verbosity);
            let Some(target) = target else {
                bail!("Missing symbol or address to disassemble");
            };
            let options = DisassOptions {
                count,
                demangle,
                ..Default::default()
            };
            cmd_disass(
                &cache,
                arch.as_deref(),
                &target,
                image.as_deref(),
                options,
                rebuild_index,
            )
        }
        Commands::Index {
            cache,
            arch,
            rebuild_index,
            verbosity,
        } => {
            setup_logging(verbosity);
            cmd_index(&cache, arch.as_deref(), rebuild_index)
        }
        Commands::Lookup {
            cache,
            address,
            arch,
            demangle,
            verbosity,
        } => {
            setup_logging(verbosity);
            cmd_lookup(&cache, arch.as_deref(), &address, demangle)
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Discovers the main cache files (`dyld_shared_cache_<arch>`) in a directory.
fn discover_caches(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut caches = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        // Subcaches and companions carry an extension (.01, .symbols, .a2s)
        if name.contains('.') {
            continue;
        }
        if let Some(arch) = name.strip_prefix("dyld_shared_cache_") {
            caches.push((arch.to_string(), path.clone()));
        }
    }

    caches.sort();
    Ok(caches)
}

/// Resolves the cache argument to a canonical cache file path.
///
/// Symlinks are resolved so the companion index always sits next to the real
/// cache file.
fn resolve_cache_path(path: &Path, arch: Option<&str>) -> Result<PathBuf> {
    let path = fs::canonicalize(path)
        .with_context(|| format!("Cache path does not exist: {}", path.display()))?;

    if path.is_file() {
        return Ok(path);
    }

    let caches = discover_caches(&path)?;
    if caches.is_empty() {
        bail!("No dyld shared caches found in: {}", path.display());
    }

    let matching: Vec<_> = caches
        .iter()
        .filter(|(a, _)| arch.map_or(true, |filter| a.contains(filter)))
        .collect();

    match matching.as_slice() {
        [(_, path)] => Ok(path.clone()),
        [] => {
            let available: Vec<_> = caches.iter().map(|(a, _)| a.as_str()).collect();
            bail!(
                "No cache matches architecture '{}'. Available: {}",
                arch.unwrap_or(""),
                available.join(", ")
            );
        }
        _ => {
            let available: Vec<_> = matching.iter().map(|(a, _)| a.as_str()).collect();
            bail!(
                "Multiple caches match. Please specify --arch. Available: {}",
                available.join(", ")
            );
        }
    }
}

fn open_cache(path: &Path, arch: Option<&str>) -> Result<(DyldContext, PathBuf)> {
    let resolved = resolve_cache_path(path, arch)?;
    info!("Opening cache: {}", resolved.display());
    let cache = DyldContext::open(&resolved)
        .with_context(|| format!("Failed to open cache: {}", resolved.display()))?;
    Ok((cache, resolved))
}

/// Loads or builds the companion index behind a spinner.
fn load_index(cache: &DyldContext, cache_path: &Path, rebuild: bool) -> Result<SymbolIndex> {
    let options = IndexOptions {
        rebuild,
        ..Default::default()
    };
    let index_path = options.index_path(cache_path);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Loading symbol index {}", index_path.display()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = symbols::load_or_build(cache, cache_path, &options);
    spinner.finish_and_clear();

    result.with_context(|| {
        format!(
            "Failed to load symbol index {} (try --rebuild-index)",
            index_path.display()
        )
    })
}

fn cmd_disass(
    cache_path: &Path,
    arch: Option<&str>,
    target: &str,
    image_filter: Option<&str>,
    options: DisassOptions,
    rebuild: bool,
) -> Result<()> {
    let target: Target = target
        .parse()
        .with_context(|| format!("Invalid address: {}", target))?;

    let (cache, cache_path) = open_cache(cache_path, arch)?;
    let mut index = load_index(&cache, &cache_path, rebuild)?;

    let (image, addr) = locate(&cache, &index, &target, image_filter)?;
    let lines = Disassembler::new(&cache, options)
        .listing(&mut index, image, addr)
        .with_context(|| format!("Failed to disassemble {} in {}", target, image.path))?;

    let mut out = io::stdout().lock();
    for line in lines {
        if line.is_label() {
            writeln!(out)?;
        }
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    Ok(())
}

fn cmd_index(cache_path: &Path, arch: Option<&str>, rebuild: bool) -> Result<()> {
    let start = Instant::now();

    let (cache, cache_path) = open_cache(cache_path, arch)?;
    let index = load_index(&cache, &cache_path, rebuild)?;

    println!(
        "{} symbols in {}",
        index.len(),
        IndexOptions::default().index_path(&cache_path).display()
    );
    info!("Done in {:.2}s", start.elapsed().as_secs_f64());

    Ok(())
}

fn cmd_lookup(cache_path: &Path, arch: Option<&str>, address: &str, demangle: bool) -> Result<()> {
    let address = match address.parse::<Target>() {
        Ok(Target::Address(addr)) => addr,
        _ => bail!("Invalid address: {} (expected 0x-prefixed hex)", address),
    };

    let (cache, cache_path) = open_cache(cache_path, arch)?;
    let mut index = load_index(&cache, &cache_path, false)?;

    println!("Address {:#x}:", address);

    let Some(image) = cache.image_containing(address) else {
        let options = DisassOptions {
            demangle,
            ..Default::default()
        };
        let classification = AddressClassifier::new(&index, FunctionTable::default(), Vec::new())
            .classify(address);
        match render_classification(&classification, &options) {
            Some(text) => println!("  Symbol: {}", text),
            None => println!("  Not found in any image"),
        }
        return Ok(());
    };

    IndexBuilder::new(&cache)
        .enrich_image(&mut index, image)
        .with_context(|| format!("Failed to collect symbols of {}", image.path))?;

    let functions = FunctionTable::from(cache.function_starts(image)?);
    let strings = cache.cstring_regions(image)?;
    let classifier = AddressClassifier::new(&index, functions, strings);
    let options = DisassOptions {
        demangle,
        ..Default::default()
    };

    println!("  Image:  {}", image.path);
    println!("  Base:   {:#x}", image.address);
    match render_classification(&classifier.classify(address), &options) {
        Some(text) => println!("  Symbol: {}", text),
        None => println!("  Symbol: (unresolved)"),
    }

    Ok(())
}
