// Trigger LUT example
//
// Compiles channel trigger conditions into the SIGMA's trigger masks and
// prints the LUT register words that would be uploaded to the FPGA.

use asix_sigma_rs::samplerate::{is_fast, MHZ};
use asix_sigma_rs::{ChannelTrigger, SigmaTrigger, TriggerLut, TriggerMatch};
use clap::Parser;

#[derive(Parser)]
#[command(name = "trigger_lut")]
#[command(version = "1.0")]
#[command(about = "Compile SIGMA trigger conditions into LUT register words")]
struct Args {
    /// Conditions as CHANNEL=MATCH, MATCH one of 1, 0, r (rising), f (falling)
    #[arg(required = true)]
    conditions: Vec<String>,

    /// Samplerate in Hz
    #[arg(short, long, default_value_t = 50 * MHZ)]
    samplerate: u64,

    /// Enabled channel mask
    #[arg(short, long, default_value_t = 0xffff)]
    enabled: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_condition(text: &str) -> Result<ChannelTrigger, String> {
    let (channel, matching) = text
        .split_once('=')
        .ok_or_else(|| format!("Expected CHANNEL=MATCH, got '{}'", text))?;
    let channel: usize = channel
        .trim()
        .parse()
        .map_err(|e| format!("Invalid channel '{}': {}", channel, e))?;
    let matching = match matching.trim() {
        "1" | "high" => TriggerMatch::One,
        "0" | "low" => TriggerMatch::Zero,
        "r" | "rising" => TriggerMatch::Rising,
        "f" | "falling" => TriggerMatch::Falling,
        other => return Err(format!("Unknown match '{}'", other)),
    };
    Ok(ChannelTrigger::new(channel, matching))
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

    let matches = args
        .conditions
        .iter()
        .map(|c| parse_condition(c))
        .collect::<Result<Vec<_>, _>>()?;

    let trigger = SigmaTrigger::from_matches(&matches, args.enabled, args.samplerate)?;
    println!("Samplerate:   {} Hz", args.samplerate);
    println!("Simple value: {:#06x}", trigger.simplevalue);
    println!("Simple mask:  {:#06x}", trigger.simplemask);
    println!("Rising mask:  {:#06x}", trigger.risingmask);
    println!("Falling mask: {:#06x}", trigger.fallingmask);

    if is_fast(args.samplerate) {
        println!("Fast mode uses the pin trigger, no LUT is uploaded.");
        return Ok(());
    }

    let lut = TriggerLut::build_basic(&trigger)?;
    println!("\nLUT register words:");
    for (i, word) in lut.register_words().iter().enumerate() {
        println!("  {:2}: {:02x} {:02x}", i, word[0], word[1]);
    }
    println!("Parameters: {:02x?}", lut.params.to_bytes());

    Ok(())
}
