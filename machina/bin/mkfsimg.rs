//! `mkfsimg` builds an ext4 block image from a directory tree.
//!
//! This is the filesystem-image assembly stage of the provisioning pipeline
//! exposed as a standalone tool, useful for preparing init drive images and
//! debugging rootfs builds.
//!
//! ## Usage
//!
//! ```bash
//! mkfsimg --input /path/to/rootfs --output rootfs.img
//! mkfsimg --input /path/to/rootfs --output rootfs.img --size 512
//! ```

use std::path::PathBuf;

use clap::Parser;
use machina::{rootfs, MachinaResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Build an ext4 image from a directory.
#[derive(Debug, Parser)]
#[command(name = "mkfsimg", author, about, version)]
struct MkfsimgArgs {
    /// Input directory containing the filesystem tree.
    #[arg(short, long)]
    input: PathBuf,

    /// Output ext4 image path.
    #[arg(short, long, default_value = "rootfs.img")]
    output: PathBuf,

    /// Size of the image in MB; 0 sizes it automatically from the content.
    #[arg(short, long, default_value_t = 0)]
    size: u64,
}

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> MachinaResult<()> {
    tracing_subscriber::fmt::init();

    let args = MkfsimgArgs::parse();
    rootfs::create_ext4_image(&args.input, &args.output, args.size).await?;

    println!("wrote {}", args.output.display());
    Ok(())
}
