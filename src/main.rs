mod cli;
mod pack;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Args, Command};
use log::debug;
use squashkit::{walk, EntryKind, FinalizeOptions, Image, ImageBuilder, Walk};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    match args.command {
        Command::Pack {
            dir,
            image,
            block_size,
            compression,
            no_export,
            no_fragments,
            force_uid,
            force_gid,
        } => {
            let options = FinalizeOptions {
                compression,
                export_table: !no_export,
                force_uid,
                force_gid,
                no_fragments,
                ..Default::default()
            };
            pack_directory(&dir, &image, block_size, &options)
        }
        Command::Ls {
            image,
            path,
            recursive,
        } => list(&image, &path, recursive),
        Command::Cat { image, path } => cat(&image, &path),
        Command::Info { image } => info(&image),
    }
}

fn pack_directory(dir: &Path, image: &Path, block_size: u32, options: &FinalizeOptions) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image)
        .with_context(|| format!("Failed to create {image:?}"))?;
    let mut builder = ImageBuilder::create(file, block_size)?;
    let stats = pack::stage_directory(&mut builder, dir)?;
    debug!("staged {:?}", stats);
    builder
        .finalize(options)
        .with_context(|| format!("Failed to write image {image:?}"))?;

    let size = builder.backend().metadata()?.len();
    println!(
        "{}: {} directories, {} files, {} symlinks ({} bytes of content) -> {} bytes",
        image.display(),
        stats.dirs,
        stats.files,
        stats.symlinks,
        stats.bytes,
        size
    );
    if stats.skipped > 0 {
        println!("skipped {} unsupported entries", stats.skipped);
    }
    Ok(())
}

fn open_image(path: &Path) -> Result<Image<File>> {
    let file = File::open(path).with_context(|| format!("Failed to open {path:?}"))?;
    Image::open(file).with_context(|| format!("Failed to read image {path:?}"))
}

fn list(image_path: &Path, path: &str, recursive: bool) -> Result<()> {
    let image = open_image(image_path)?;
    let mut out = io::stdout().lock();
    if !recursive {
        for entry in image.read_dir(path)? {
            let full = format!("{}/{}", path.trim_end_matches('/'), entry.name);
            print_entry(&mut out, &image, &full, &entry.name)?;
        }
        return Ok(());
    }

    let mut failure = None;
    walk(&image, path, |full, entry, err| {
        if let Some(e) = err {
            return Err(e);
        }
        let name = entry.map_or(full, |e| e.name.as_str());
        if let Err(e) = print_entry(&mut out, &image, full, name) {
            failure = Some(e);
            return Ok(Walk::SkipAll);
        }
        Ok(Walk::Continue)
    })?;
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn print_entry(out: &mut impl Write, image: &Image<File>, full: &str, name: &str) -> Result<()> {
    let meta = image.symlink_metadata(full)?;
    let kind = match meta.kind {
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::File => '-',
        EntryKind::BlockDevice => 'b',
        EntryKind::CharDevice => 'c',
        EntryKind::Fifo => 'p',
        EntryKind::Socket => 's',
    };
    write!(
        out,
        "{}{:04o} {:>5} {:>5} {:>10} {}",
        kind, meta.permissions, meta.uid, meta.gid, meta.size, name
    )?;
    if meta.is_symlink() {
        write!(out, " -> {}", image.readlink(full)?)?;
    }
    writeln!(out)?;
    Ok(())
}

fn cat(image_path: &Path, path: &str) -> Result<()> {
    let image = open_image(image_path)?;
    let mut reader = image.open_file(path)?;
    let mut out = io::stdout().lock();
    io::copy(&mut reader, &mut out).with_context(|| format!("Failed to read {path}"))?;
    out.flush()?;
    Ok(())
}

fn info(image_path: &Path) -> Result<()> {
    let image = open_image(image_path)?;
    let sb = image.superblock();
    let table = |start: u64| {
        if start == squashkit::format::NO_TABLE {
            "none".to_string()
        } else {
            start.to_string()
        }
    };
    println!("compression:      {}", sb.compression.name());
    println!("block size:       {}", sb.block_size);
    println!("inodes:           {}", sb.inode_count);
    println!("fragments:        {}", sb.fragment_count);
    println!("ids:              {}", sb.id_count);
    println!("flags:            0x{:04x}", sb.flags);
    println!("modified:         {}", sb.modification_time);
    println!("bytes used:       {}", sb.bytes_used);
    println!("inode table:      {}", sb.inode_table_start);
    println!("directory table:  {}", sb.directory_table_start);
    println!("fragment table:   {}", table(sb.fragment_table_start));
    println!("export table:     {}", table(sb.export_table_start));
    println!("id table:         {}", sb.id_table_start);
    Ok(())
}
