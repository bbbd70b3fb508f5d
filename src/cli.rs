use clap::{Parser, Subcommand};
use squashkit::{CompressionId, DEFAULT_BLOCK_SIZE};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "squashkit",
    about = "Build and inspect compressed read-only filesystem images",
    long_about = "Pack a host directory into a SquashFS-compatible image, or list and extract files from one without mounting it"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pack a host directory into an image
    Pack {
        /// Directory to pack
        dir: PathBuf,

        /// Image file to create (overwritten if it exists)
        image: PathBuf,

        /// Data block size in bytes (power of two, 4096..=1048576)
        #[arg(short = 'b', long = "block-size", default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u32,

        /// Compression algorithm (gzip, zstd)
        #[arg(short = 'c', long = "compression", default_value = "gzip", value_parser = parse_compression)]
        compression: CompressionId,

        /// Do not write the export table
        #[arg(long = "no-export")]
        no_export: bool,

        /// Store file tails as short blocks instead of fragments
        #[arg(long = "no-fragments")]
        no_fragments: bool,

        /// Record this uid for every entry
        #[arg(long = "force-uid", value_name = "UID")]
        force_uid: Option<u32>,

        /// Record this gid for every entry
        #[arg(long = "force-gid", value_name = "GID")]
        force_gid: Option<u32>,
    },

    /// List a directory inside an image
    Ls {
        image: PathBuf,

        /// Directory to list [default: /]
        #[arg(default_value = "/")]
        path: String,

        /// List subdirectories recursively
        #[arg(short = 'r', long = "recursive")]
        recursive: bool,
    },

    /// Write a file from an image to stdout
    Cat { image: PathBuf, path: String },

    /// Show the superblock of an image
    Info { image: PathBuf },
}

fn parse_compression(s: &str) -> Result<CompressionId, String> {
    CompressionId::from_name(s).ok_or_else(|| format!("unknown compression {s:?}"))
}
