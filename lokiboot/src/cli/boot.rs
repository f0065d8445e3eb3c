/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    format::{
        header::Header,
        reader::{FormatKind, Reader},
        segment::EntryType,
    },
    util::NumBytes,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Android,
    Loki,
}

impl From<FormatArg> for FormatKind {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Android => Self::Android,
            FormatArg::Loki => Self::Loki,
        }
    }
}

/// Contents of the header TOML file.
#[derive(Serialize)]
struct HeaderInfo<'a> {
    format: &'static str,
    header: &'a Header,
}

fn open_reader(
    path: &Path,
    format: Option<FormatArg>,
) -> Result<(Reader<BufReader<File>>, Header)> {
    let file = File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))?;

    let mut reader = Reader::new(BufReader::new(file));

    match format {
        Some(f) => reader
            .set_format(f.into())
            .with_context(|| format!("Failed to select format: {f:?}"))?,
        None => reader.enable_all_formats(),
    }

    let header = reader
        .read_header()
        .with_context(|| format!("Failed to read boot image header: {path:?}"))?;

    Ok((reader, header))
}

fn write_header(path: &Path, format: FormatKind, header: &Header) -> Result<()> {
    let info = HeaderInfo {
        format: format.name(),
        header,
    };

    let data = toml_edit::ser::to_string_pretty(&info)
        .with_context(|| format!("Failed to serialize header TOML: {path:?}"))?;
    fs::write(path, data).with_context(|| format!("Failed to write header TOML: {path:?}"))?;

    Ok(())
}

fn display_info(cli: &BootCli, format: Option<FormatKind>, header: &Header) {
    if !cli.quiet {
        if let Some(format) = format {
            println!("Format: {format}");
        }

        if cli.debug {
            println!("{header:#?}");
        } else {
            println!("{header}");
        }
    }
}

fn unpack_subcommand(boot_cli: &BootCli, cli: &UnpackCli) -> Result<()> {
    let (mut reader, header) = open_reader(&cli.input, boot_cli.format)?;
    let format = reader.format();
    display_info(boot_cli, format, &header);

    if let Some(format) = format {
        write_header(&cli.output_header, format, &header)?;
    }

    let mut buf = vec![0u8; 64 * 1024];

    while let Some(entry) = reader.read_entry()? {
        let path = match entry.entry_type {
            EntryType::Kernel => &cli.output_kernel,
            EntryType::Ramdisk => &cli.output_ramdisk,
            EntryType::SecondBoot => &cli.output_second,
            EntryType::DeviceTree => &cli.output_dtb,
        };

        if entry.size == 0 {
            warn!("Skipping empty {} entry", entry.entry_type);
            continue;
        }

        info!("Extracting {} ({:?}) to {path:?}", entry.entry_type, NumBytes(entry.size));

        let file =
            File::create(path).with_context(|| format!("Failed to open for writing: {path:?}"))?;
        let mut writer = BufWriter::new(file);

        loop {
            let n = reader
                .read_data(&mut buf)
                .with_context(|| format!("Failed to read {} data", entry.entry_type))?;
            if n == 0 {
                break;
            }

            writer
                .write_all(&buf[..n])
                .with_context(|| format!("Failed to write data: {path:?}"))?;
        }

        writer
            .flush()
            .with_context(|| format!("Failed to flush data: {path:?}"))?;
    }

    Ok(())
}

fn info_subcommand(boot_cli: &BootCli, cli: &InfoCli) -> Result<()> {
    let (reader, header) = open_reader(&cli.input, boot_cli.format)?;
    display_info(boot_cli, reader.format(), &header);

    if !boot_cli.quiet {
        println!("Entries:");

        for segment in reader.segments() {
            println!(
                "- {:<12} offset={:#x} size={}",
                segment.entry_type.name(),
                segment.offset,
                segment.size,
            );
        }
    }

    Ok(())
}

pub fn boot_main(cli: &BootCli) -> Result<()> {
    match &cli.command {
        BootCommand::Unpack(c) => unpack_subcommand(cli, c),
        BootCommand::Info(c) => info_subcommand(cli, c),
    }
}

/// Unpack a boot image.
#[derive(Debug, Parser)]
struct UnpackCli {
    /// Path to input boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output header TOML.
    #[arg(long, value_name = "FILE", value_parser, default_value = "header.toml")]
    output_header: PathBuf,

    /// Path to output kernel image.
    #[arg(long, value_name = "FILE", value_parser, default_value = "kernel.img")]
    output_kernel: PathBuf,

    /// Path to output ramdisk image.
    #[arg(long, value_name = "FILE", value_parser, default_value = "ramdisk.img")]
    output_ramdisk: PathBuf,

    /// Path to output second stage bootloader image.
    #[arg(long, value_name = "FILE", value_parser, default_value = "second.img")]
    output_second: PathBuf,

    /// Path to output device tree blob image.
    #[arg(long, value_name = "FILE", value_parser, default_value = "dtb.img")]
    output_dtb: PathBuf,
}

/// Display boot image header information and entry layout.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input boot image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum BootCommand {
    Unpack(UnpackCli),
    Info(InfoCli),
}

/// Inspect or unpack boot images, including Loki-patched ones.
#[derive(Debug, Parser)]
pub struct BootCli {
    #[command(subcommand)]
    command: BootCommand,

    /// Force a specific format instead of detecting it.
    #[arg(short, long, global = true, value_name = "FORMAT", value_enum)]
    format: Option<FormatArg>,

    /// Don't print boot image header information.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print boot image header information in debug format.
    #[arg(short, long, global = true)]
    debug: bool,
}
