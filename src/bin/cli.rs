//! tilestore CLI
//!
//! Maintenance commands over a workspace.

use clap::{Parser, Subcommand};
use tilestore::{Config, StorageManager};
use tracing_subscriber::{fmt, EnvFilter};

/// tilestore CLI
#[derive(Parser, Debug)]
#[command(name = "tilestore-cli")]
#[command(about = "Inspect and maintain a tilestore workspace")]
#[command(version)]
struct Args {
    /// Workspace directory
    #[arg(short, long, default_value = "./tilestore_workspace")]
    workspace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the schema of an array or metadata store
    Describe {
        /// Workspace-relative name
        name: String,
    },

    /// List fragments in creation order
    Fragments {
        /// Workspace-relative name
        name: String,
    },

    /// Merge all fragments into one
    Consolidate {
        /// Workspace-relative name
        name: String,
    },

    /// List a workspace directory
    Ls {
        /// Workspace-relative directory ("" for the root)
        #[arg(default_value = "")]
        dir: String,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tilestore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    let config = Config::builder().workspace(&args.workspace).aio_workers(1).build();
    let manager = match StorageManager::open(config) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to open workspace: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&manager, args.command) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(manager: &StorageManager, command: Commands) -> tilestore::Result<()> {
    match command {
        Commands::Describe { name } => {
            let schema = match manager.dir_type(&name) {
                tilestore::DirType::Metadata => manager.metadata_schema(&name)?,
                _ => manager.array_schema(&name)?,
            };
            println!("{} ({:?})", schema.name(), schema.kind());
            for dim in schema.dimensions() {
                println!(
                    "  dim  {:<16} [{}, {}] extent {:?}",
                    dim.name, dim.domain.0, dim.domain.1, dim.tile_extent
                );
            }
            for attr in schema.attributes() {
                println!(
                    "  attr {:<16} {:?} x {:?} ({:?})",
                    attr.name, attr.datatype, attr.cell_val_num, attr.compressor
                );
            }
            println!(
                "  cell order {:?}, tile order {:?}, capacity {}",
                schema.cell_order(),
                schema.tile_order(),
                schema.capacity()
            );
        }

        Commands::Fragments { name } => {
            for info in manager.fragment_info(&name)? {
                println!(
                    "{}  cells={}  tiles={}  domain={:?}",
                    info.id, info.cell_num, info.tile_num, info.non_empty_domain
                );
            }
        }

        Commands::Consolidate { name } => {
            let stats = match manager.dir_type(&name) {
                tilestore::DirType::Metadata => manager.metadata_consolidate(&name)?,
                _ => manager.array_consolidate(&name)?,
            };
            println!(
                "merged {} fragments, {} cells",
                stats.merged_fragments, stats.cell_num
            );
        }

        Commands::Ls { dir } => {
            for (name, kind) in manager.ls(&dir)? {
                println!("{:<10} {}", format!("{:?}", kind), name);
            }
        }
    }
    Ok(())
}
