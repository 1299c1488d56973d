//! Command-line front-end for describing a VM configuration.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;

/// VM configuration CLI
#[derive(Parser, Debug)]
#[command(name = "cloude", version, about, long_about = None)]
struct Args {
    /// Number of CPUs to allocate to the VM
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..))]
    cpu: u8,

    /// Amount of RAM in GB to allocate to the VM
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..))]
    ram: u32,

    /// Path to the kernel image file
    #[arg(short = 'k', long)]
    kernel: PathBuf,

    /// Path to the initramfs image file
    #[arg(short = 'i', long)]
    initramfs: PathBuf,

    /// Path to the disk image file
    #[arg(short = 'f', long)]
    file: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
}

#[derive(ValueEnum, Clone, Debug)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct ConfigJson {
    cpu: u8,
    ram_gb: u32,
    kernel: String,
    initramfs: String,
    file: String,
}

fn main() {
    let args = Args::parse();

    match args.output {
        OutputFormat::Text => {
            println!("CPU: {}", args.cpu);
            println!("RAM: {} GB", args.ram);
            println!("Kernel: {}", args.kernel.display());
            println!("Initramfs: {}", args.initramfs.display());
            println!("File: {}", args.file.display());
        }
        OutputFormat::Json => {
            let config = ConfigJson {
                cpu: args.cpu,
                ram_gb: args.ram,
                kernel: args.kernel.display().to_string(),
                initramfs: args.initramfs.display().to_string(),
                file: args.file.display().to_string(),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&config).expect("config serializes")
            );
        }
    }
}
