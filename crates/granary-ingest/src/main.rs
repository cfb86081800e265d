//! Granary Ingest - granule discovery, staging and relocation

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use granary_common::logging::{init_logging, LogConfig, LogLevel};
use granary_common::types::{BucketsConfig, Collection, Destination, DuplicateHandling, Granule};
use granary_ingest::discover::{
    discover_granules, discover_pdrs, stage_pdr, DiscoverOptions, GranuleRegistry, PdrDiscovery,
};
use granary_ingest::mover::{
    DistributionUrlUpdater, GranuleMover, HttpMetadataUpdater, MetadataUpdater, MoveOptions,
};
use granary_ingest::provider::{
    build_provider_client, CredentialDecryptor, KeyPairDecryptor, KmsDecryptor, ProviderConfig,
    ProviderContext,
};
use granary_ingest::store::{ObjectStore, S3ObjectStore};
use granary_ingest::transfer::{duplicate_handling_type, GranuleTransfer, TransferOptions};
use granary_ingest::IngestConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "granary-ingest")]
#[command(author, version, about = "Granule ingest from remote providers")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a provider and emit new granules
    DiscoverGranules {
        /// JSON message file, `-` for stdin
        #[arg(short, long)]
        input: PathBuf,
    },

    /// List a provider and emit PDRs not yet staged
    DiscoverPdrs {
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Stage granule files into the object store
    SyncGranule {
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Move staged granule files to their destinations
    MoveGranule {
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverGranulesMessage {
    provider: ProviderConfig,
    collection: Collection,
    #[serde(default)]
    buckets: BucketsConfig,
    #[serde(default)]
    provider_path: Option<String>,
    #[serde(default)]
    duplicate_handling: Option<DuplicateHandling>,
    #[serde(default)]
    ignore_files_config_for_discovery: Option<bool>,
    /// Granule IDs already in the system of record
    #[serde(default)]
    existing_granule_ids: Option<HashSet<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverPdrsMessage {
    provider: ProviderConfig,
    provider_path: String,
    #[serde(default)]
    force: bool,
    /// Also download every new PDR into the stack's PDR folder
    #[serde(default)]
    stage: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncGranuleMessage {
    provider: ProviderConfig,
    collection: Collection,
    buckets: BucketsConfig,
    granules: Vec<Granule>,
    #[serde(default)]
    file_staging_dir: Option<String>,
    #[serde(default)]
    duplicate_handling: Option<DuplicateHandling>,
    #[serde(default)]
    force_duplicate_overwrite: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveGranuleMessage {
    granule: Granule,
    destinations: Vec<Destination>,
    #[serde(default)]
    distribution_endpoint: Option<String>,
    #[serde(default)]
    strict: bool,
    /// External metadata service; URLs are computed locally when unset
    #[serde(default)]
    metadata_endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
struct GranulesOutput {
    granules: Vec<Granule>,
}

#[derive(Debug, Serialize)]
struct PdrsOutput<T: Serialize> {
    pdrs: Vec<T>,
}

struct ExistingGranules(HashSet<String>);

#[async_trait]
impl GranuleRegistry for ExistingGranules {
    async fn granule_exists(&self, granule_id: &str, _collection_id: &str) -> granary_common::Result<bool> {
        Ok(self.0.contains(granule_id))
    }
}

struct Runtime {
    config: IngestConfig,
    store: Arc<dyn ObjectStore>,
    ctx: ProviderContext,
}

impl Runtime {
    async fn new(config: IngestConfig) -> Self {
        let sdk_config = config.storage.sdk_config().await;
        let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.storage).await);

        let decryptors: Vec<Arc<dyn CredentialDecryptor>> = vec![
            Arc::new(KmsDecryptor::from_sdk_config(&sdk_config)),
            Arc::new(KeyPairDecryptor::new(store.clone(), config.system_bucket.clone(), &config.stack)),
        ];
        let ctx = ProviderContext::new(store.clone(), config.system_bucket.clone(), config.stack.clone())
            .with_timeout(config.provider_timeout())
            .with_decryptors(decryptors);

        Self { config, store, ctx }
    }
}

fn read_message<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = if path == Path::new("-") {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer).context("Failed to read message from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?
    };
    serde_json::from_str(&raw).with_context(|| format!("Invalid message in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_discover_granules(rt: &Runtime, message: DiscoverGranulesMessage) -> Result<()> {
    let client = build_provider_client(&message.provider, rt.ctx.clone())?;
    let registry = message.existing_granule_ids.map(ExistingGranules);
    let options = DiscoverOptions {
        provider_path: message.provider_path,
        duplicate_handling: message.duplicate_handling,
        ignore_files_config_for_discovery: message.ignore_files_config_for_discovery,
        concurrency: rt.config.concurrency,
    };

    let granules = discover_granules(
        client.as_ref(),
        &message.collection,
        &message.buckets,
        registry.as_ref().map(|r| r as &dyn GranuleRegistry),
        &options,
    )
    .await?;
    print_json(&GranulesOutput { granules })
}

async fn run_discover_pdrs(rt: &Runtime, message: DiscoverPdrsMessage) -> Result<()> {
    let client = build_provider_client(&message.provider, rt.ctx.clone())?;
    let options = PdrDiscovery {
        force: message.force,
        ..PdrDiscovery::from_config(&rt.config)
    };

    let pdrs = discover_pdrs(client.as_ref(), rt.store.clone(), &options, &message.provider_path).await?;
    if !message.stage {
        return print_json(&PdrsOutput { pdrs });
    }

    let mut staged = Vec::with_capacity(pdrs.len());
    let result = async {
        for pdr in &pdrs {
            staged.push(stage_pdr(client.as_ref(), rt.store.as_ref(), &options, pdr).await?);
        }
        Ok::<_, granary_common::GranaryError>(())
    }
    .await;
    client.close().await?;
    result?;
    print_json(&PdrsOutput { pdrs: staged })
}

async fn run_sync_granule(rt: &Runtime, message: SyncGranuleMessage) -> Result<()> {
    let client = build_provider_client(&message.provider, rt.ctx.clone())?;
    let options = TransferOptions {
        file_staging_dir: message
            .file_staging_dir
            .unwrap_or_else(|| rt.config.file_staging_dir.clone()),
        duplicate_handling: duplicate_handling_type(
            message.duplicate_handling,
            message.collection.duplicate_handling,
            message.force_duplicate_overwrite,
        ),
        concurrency: rt.config.concurrency,
    };
    info!(policy = %options.duplicate_handling, granules = message.granules.len(), "Syncing granules");

    let transfer = GranuleTransfer::new(
        rt.store.clone(),
        client.clone(),
        message.collection,
        message.buckets,
        options,
    );
    let results = transfer.ingest_granules(&message.granules).await;
    client.close().await?;

    let mut granules = Vec::with_capacity(results.len());
    let mut failed = 0;
    for (input, result) in message.granules.iter().zip(results) {
        match result {
            Ok(granule) => granules.push(granule),
            Err(e) => {
                error!(granule_id = %input.granule_id, kind = e.kind(), error = %e, "Granule sync failed");
                failed += 1;
            },
        }
    }
    print_json(&GranulesOutput { granules })?;
    if failed > 0 {
        bail!("{} of {} granules failed to sync", failed, message.granules.len());
    }
    Ok(())
}

async fn run_move_granule(rt: &Runtime, message: MoveGranuleMessage) -> Result<()> {
    let updater: Arc<dyn MetadataUpdater> = match message.metadata_endpoint {
        Some(url) => Arc::new(HttpMetadataUpdater::new(url, rt.config.provider_timeout())?),
        None => Arc::new(DistributionUrlUpdater),
    };
    let options = MoveOptions {
        strict: message.strict,
        distribution_endpoint: message.distribution_endpoint,
        concurrency: rt.config.concurrency,
    };

    let mover = GranuleMover::new(rt.store.clone(), options).with_metadata_updater(updater);
    let result = mover.move_granule_files(&message.granule, &message.destinations).await?;
    print_json(&result)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("granary-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;

    init_logging(&log_config)?;

    let config = IngestConfig::load()?;
    let rt = Runtime::new(config).await;

    match cli.command {
        Command::DiscoverGranules { input } => {
            info!("Discovering granules");
            run_discover_granules(&rt, read_message(&input)?).await?;
        },
        Command::DiscoverPdrs { input } => {
            info!("Discovering PDRs");
            run_discover_pdrs(&rt, read_message(&input)?).await?;
        },
        Command::SyncGranule { input } => {
            info!("Syncing granules");
            run_sync_granule(&rt, read_message(&input)?).await?;
        },
        Command::MoveGranule { input } => {
            info!("Moving granule files");
            run_move_granule(&rt, read_message(&input)?).await?;
        },
    }

    info!("Done");
    Ok(())
}
