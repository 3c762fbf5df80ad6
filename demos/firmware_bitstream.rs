// Firmware bitstream example
//
// Loads a vendor SIGMA firmware image, removes the obfuscation and expands
// it into the bitbang byte stream that configures the FPGA.

use asix_sigma_rs::firmware::{deobfuscate, to_bitbang};
use asix_sigma_rs::{Firmware, FirmwareDir, FirmwareSource};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "firmware_bitstream")]
#[command(version = "1.0")]
#[command(about = "Inspect the bitbang stream of a SIGMA firmware image")]
struct Args {
    /// Directory holding the asix-sigma-*.fw files
    firmware_dir: PathBuf,

    /// Firmware variant: 50, 100, 200, 50sync or phasor
    #[arg(short = 'f', long, default_value = "50")]
    variant: String,

    /// Write the bitbang stream to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let firmware = match args.variant.as_str() {
        "50" => Firmware::Sigma50,
        "100" => Firmware::Sigma100,
        "200" => Firmware::Sigma200,
        "50sync" => Firmware::Sigma50Sync,
        "phasor" => Firmware::Phasor,
        other => {
            eprintln!("Unknown firmware variant: {}", other);
            std::process::exit(1);
        }
    };

    let source = FirmwareDir::new(&args.firmware_dir);
    let mut image = source.load(firmware.file_name())?;
    println!("Firmware:  {}", firmware.file_name());
    println!("Image:     {} bytes", image.len());

    deobfuscate(&mut image);
    let head: Vec<String> = image.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    println!("Header:    {}", head.join(" "));

    let stream = to_bitbang(&image)?;
    println!("Bitstream: {} bytes", stream.len());

    if let Some(path) = args.output {
        std::fs::write(&path, &stream)?;
        println!("Written to {}", path.display());
    }

    Ok(())
}
