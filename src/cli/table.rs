use std::path::Path;

use anyhow::Result;

use hotplugd::config::Config;
use hotplugd::platform::{CpuSource, SysfsPlatform};
use hotplugd::tuning::ThresholdTable;

pub fn run_table(config: Option<&Path>) -> Result<()> {
    let cfg = Config::resolve(config)?;
    let platform = SysfsPlatform::new(true)?;

    let freqs = platform.frequency_table()?;
    let freq_max = freqs.iter().copied().max().unwrap_or(0);
    let freq_min = freqs.iter().copied().min().unwrap_or(0);
    let nr_cpus = platform.possible_cpus();
    let peak = freq_max as u64 * nr_cpus as u64;

    let mut table = ThresholdTable::calibrate(cfg.mips_low, cfg.mips_high, peak, nr_cpus);
    cfg.apply_overrides(&mut table)?;

    println!("CPUS:             {}", nr_cpus);
    println!("FREQ RANGE:       {}-{} kHz", freq_min, freq_max);
    println!("PEAK THROUGHPUT:  {} (kHz x cores)", peak);
    println!("BOUND FREQ:       {} kHz", cfg.policy(freq_min).freq_floor_khz);
    println!();
    println!("{}", table.render());
    Ok(())
}
