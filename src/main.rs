use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use rusty_ffu::compress::{CompressionAlgorithm, NativeCodec};
use rusty_ffu::config::{load_exclusion_file, FfuConfig};
use rusty_ffu::export::{export_disk, ExportFormat};
use rusty_ffu::ffu::verify::verify;
use rusty_ffu::ffu::writer::write_ffu;
use rusty_ffu::ffu::{FfuImage, FormatVersion, StoreInput};
use rusty_ffu::partition::format_size;
use rusty_ffu::sign::{CatalogSigner, UnsignedCatalog};
use rusty_ffu::stream::open_seekable_source;

/// One `--store` argument: `image=PATH[,device=DEVPATH][,fixed=BOOL][,blank=N][,exclude=A;B]`.
#[derive(Debug, Clone, PartialEq)]
struct StoreSpec {
    image: PathBuf,
    device_path: String,
    fixed_size: bool,
    max_blank_blocks: Option<u32>,
    exclude: Vec<String>,
}

impl FromStr for StoreSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut spec = StoreSpec {
            image: PathBuf::new(),
            device_path: String::new(),
            fixed_size: false,
            max_blank_blocks: None,
            exclude: Vec::new(),
        };
        for field in s.split(',') {
            let (key, value) = field.split_once('=').unwrap_or(("image", field));
            match key.trim() {
                "image" => spec.image = PathBuf::from(value),
                "device" => spec.device_path = value.to_string(),
                "fixed" => {
                    spec.fixed_size = value
                        .parse()
                        .map_err(|_| format!("fixed expects true or false, got {value}"))?
                }
                "blank" => {
                    spec.max_blank_blocks = Some(
                        value
                            .parse()
                            .map_err(|_| format!("blank expects a block count, got {value}"))?,
                    )
                }
                "exclude" => spec.exclude.extend(
                    value
                        .split(';')
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .map(str::to_string),
                ),
                other => return Err(format!("unknown store field: {other}")),
            }
        }
        if spec.image.as_os_str().is_empty() {
            return Err("store needs image=PATH".into());
        }
        Ok(spec)
    }
}

#[derive(Parser)]
#[command(version = env!("APP_VERSION"), about = "Full Flash Update (FFU) image tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an FFU container from one or more raw disk images.
    Generate {
        #[arg(long = "store", required = true)]
        stores: Vec<StoreSpec>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long = "platform-id")]
        platform_ids: Vec<String>,
        #[arg(long)]
        block_size: Option<u32>,
        #[arg(long)]
        sector_size: Option<u32>,
        #[arg(long)]
        format: Option<FormatVersion>,
        #[arg(long)]
        compression: Option<CompressionAlgorithm>,
        #[arg(long)]
        os_version: Option<String>,
        /// Replace the configured exclusion list with the names in this file.
        #[arg(long)]
        exclude_file: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Describe a container's headers, stores and partitions.
    Info {
        ffu: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Check every header chunk and data block against the hash table.
    Verify { ffu: PathBuf },
    /// Write a store's virtual disk to a file.
    Extract {
        ffu: PathBuf,
        output: PathBuf,
        /// 1-based store index.
        #[arg(long, default_value_t = 1)]
        store: usize,
        #[arg(long, default_value = "raw")]
        format: ExportFormat,
    },
}

/// Log progress at every 10% step.
fn progress_logger(what: &'static str) -> impl FnMut(u64, u64) {
    let mut last_step = 0;
    move |done, total| {
        if total == 0 {
            return;
        }
        let step = done * 10 / total;
        if step > last_step {
            last_step = step;
            info!("{what}: {}%", step * 10);
        }
    }
}

fn open_ffu(path: &Path) -> Result<FfuImage<BufReader<File>>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    FfuImage::open(BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

#[allow(clippy::too_many_arguments)]
fn generate(
    specs: Vec<StoreSpec>,
    output: &Path,
    platform_ids: Vec<String>,
    block_size: Option<u32>,
    sector_size: Option<u32>,
    format: Option<FormatVersion>,
    compression: Option<CompressionAlgorithm>,
    os_version: Option<String>,
    exclude_file: Option<PathBuf>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => FfuConfig::load_from_path(path)?,
        None => FfuConfig::load(),
    };
    if let Some(v) = block_size {
        config.block_size = v;
    }
    if let Some(v) = sector_size {
        config.sector_size = v;
    }
    if let Some(v) = format {
        config.format = v;
    }
    if compression.is_some() {
        config.compression = compression;
        if format.is_none() {
            config.format = FormatVersion::V1Compressed;
        }
    }
    if let Some(v) = os_version {
        config.os_version = v;
    }
    if !platform_ids.is_empty() {
        config.platform_ids = platform_ids;
    }
    if let Some(path) = exclude_file {
        config.excluded_partitions = load_exclusion_file(&path)?;
    }
    config.validate()?;
    if config.platform_ids.is_empty() {
        warn!("No platform id given; the container will not match any device");
    }

    let mut stores = Vec::with_capacity(specs.len());
    for spec in specs {
        let (source, len) = open_seekable_source(&spec.image)?;
        info!("Store source {}: {}", spec.image.display(), format_size(len));
        let mut excluded = config.excluded_partitions.clone();
        excluded.extend(spec.exclude);
        stores.push(StoreInput {
            source,
            device_path: spec.device_path,
            fixed_size: spec.fixed_size,
            max_blank_blocks: spec.max_blank_blocks.unwrap_or(config.max_blank_blocks),
            excluded_partitions: excluded,
        });
    }

    let signer: Box<dyn CatalogSigner> = match config.signing.clone() {
        Some(external) => Box::new(external),
        None => Box::new(UnsignedCatalog),
    };

    let partial = partial_path(output);
    let file = File::create(&partial)
        .with_context(|| format!("failed to create {}", partial.display()))?;
    let mut writer = BufWriter::new(file);
    let result = write_ffu(
        &mut stores,
        &config.ffu_options(),
        &NativeCodec,
        signer.as_ref(),
        &mut writer,
        &mut progress_logger("Generating"),
        &|| false,
    )
    .map_err(anyhow::Error::from)
    .and_then(|summary| {
        writer.flush()?;
        Ok(summary)
    });

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            drop(writer);
            let _ = fs::remove_file(&partial);
            return Err(e.context("failed to generate FFU"));
        }
    };
    drop(writer);
    fs::rename(&partial, output)
        .with_context(|| format!("failed to move {} into place", partial.display()))?;

    for store in &summary.stores {
        info!(
            "Store {}: {} block(s) written, {} blank block(s) elided, {} excluded partition(s)",
            store.store_index,
            store.payload_count,
            store.elided_blocks,
            store.excluded_partitions.len()
        );
    }
    println!(
        "{}: {} {} container, {}",
        output.display(),
        summary.format.as_str(),
        format_size(summary.block_size as u64),
        format_size(summary.total_bytes)
    );
    Ok(())
}

fn print_info(path: &Path, json: bool) -> Result<()> {
    let mut image = open_ffu(path)?;
    let info = image.info()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Container:   {}", path.display());
    if let Some(format) = info.format {
        println!("Format:      {}", format.as_str());
    }
    println!("Block size:  {}", format_size(info.block_size as u64));
    println!("Catalog:     {} bytes", info.security.catalog_size);
    println!("Hash table:  {} entries", info.hash_table_entries);
    for (key, value) in info
        .manifest
        .sections_named("FullFlash")
        .flat_map(|s| s.entries.iter())
    {
        println!("  {key} = {value}");
    }
    for store in &info.stores {
        println!();
        println!(
            "Store {}: {} write descriptor(s), {} of {} block(s) mapped, disk {}",
            store.index,
            store.write_descriptor_count,
            store.mapped_blocks,
            store.total_blocks,
            format_size(store.disk_size)
        );
        if let Some(partitions) = &store.partitions {
            for p in partitions {
                println!(
                    "  {:<24} {:>12} {:>12}  {}",
                    p.name,
                    p.first_sector,
                    p.size_in_sectors(),
                    p.type_name()
                );
            }
        }
    }
    Ok(())
}

fn run_verify(path: &Path) -> Result<()> {
    let mut image = open_ffu(path)?;
    let report = verify(&mut image, &mut progress_logger("Verifying"), &|| false)
        .with_context(|| format!("verification of {} failed", path.display()))?;
    println!(
        "{}: OK ({} header chunk(s), {} data block(s))",
        path.display(),
        report.header_chunks,
        report.data_blocks
    );
    Ok(())
}

fn extract(path: &Path, output: &Path, store: usize, format: ExportFormat) -> Result<()> {
    if store == 0 {
        bail!("store indices start at 1");
    }
    let mut image = open_ffu(path)?;
    let mut disk = image.store_disk(store - 1)?;
    let total = disk.len();
    let written = export_disk(
        &mut disk,
        total,
        output,
        format,
        &mut progress_logger("Extracting"),
        &|| false,
    )?;
    println!(
        "{}: store {} as {}, {}",
        output.display(),
        store,
        format,
        format_size(written)
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Generate {
            stores,
            output,
            platform_ids,
            block_size,
            sector_size,
            format,
            compression,
            os_version,
            exclude_file,
            config,
        } => generate(
            stores,
            &output,
            platform_ids,
            block_size,
            sector_size,
            format,
            compression,
            os_version,
            exclude_file,
            config,
        ),
        Command::Info { ffu, json } => print_info(&ffu, json),
        Command::Verify { ffu } => run_verify(&ffu),
        Command::Extract {
            ffu,
            output,
            store,
            format,
        } => extract(&ffu, &output, store, format),
    }
}
