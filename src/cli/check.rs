use std::io::Read;
use std::path::Path;

use anyhow::Result;

use hotplugd::platform::{parse_cpu_list, CpuSource, SysfsPlatform};

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz         NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz         UNREADABLE (SKIPPED)");
        return true;
    }
    let found = config.lines().any(|l| l.trim() == "CONFIG_HOTPLUG_CPU=y");
    if found {
        println!("  CONFIG_HOTPLUG_CPU      OK");
    } else {
        println!("  CONFIG_HOTPLUG_CPU      NOT FOUND -- cores cannot be offlined");
    }
    found
}

// AT LEAST ONE NON-BOOT CORE MUST EXPOSE A WRITABLE online FILE
fn check_hotplug_sysfs() -> bool {
    let base = Path::new("/sys/devices/system/cpu");
    let possible = std::fs::read_to_string(base.join("possible")).unwrap_or_default();
    let cpus = parse_cpu_list(&possible);
    let pluggable: Vec<usize> = cpus
        .iter()
        .copied()
        .filter(|&c| c != 0 && base.join(format!("cpu{}/online", c)).exists())
        .collect();
    if pluggable.is_empty() {
        println!("  cpuN/online             MISSING (no hotpluggable cores among {})", cpus.len());
        false
    } else {
        println!("  cpuN/online             OK ({} of {} cores hotpluggable)", pluggable.len(), cpus.len());
        true
    }
}

fn check_cpufreq() -> bool {
    let platform = match SysfsPlatform::new(true) {
        Ok(p) => p,
        Err(e) => {
            println!("  sysfs                   UNREADABLE ({})", e);
            return false;
        }
    };
    let mut ok = true;
    match platform.frequency_table() {
        Ok(t) => {
            let min = t.iter().min().copied().unwrap_or(0);
            let max = t.iter().max().copied().unwrap_or(0);
            println!("  frequency table         OK ({} entries, {}-{} kHz)", t.len(), min, max);
        }
        Err(e) => {
            println!("  frequency table         MISSING ({})", e);
            ok = false;
        }
    }
    match platform.current_freq_khz() {
        Ok(f) => println!("  scaling_cur_freq        OK ({} kHz)", f),
        Err(e) => {
            println!("  scaling_cur_freq        UNREADABLE ({})", e);
            ok = false;
        }
    }
    match platform.run_queues() {
        Ok(rq) if !rq.per_cpu.is_empty() => {
            println!("  sched debug             OK ({} run queues)", rq.per_cpu.len());
        }
        _ => println!("  sched debug             UNAVAILABLE (per-core queues read as 0)"),
    }
    ok
}

pub fn run_check() -> Result<()> {
    println!("HOTPLUGD ENVIRONMENT CHECK");
    println!();

    let mut ok = true;

    println!("KERNEL CONFIG:");
    if !check_kernel_config() {
        ok = false;
    }
    println!();

    println!("SYSFS:");
    if !check_hotplug_sysfs() {
        ok = false;
    }
    if !check_cpufreq() {
        ok = false;
    }
    println!();

    let root = unsafe { libc::geteuid() } == 0;
    if root {
        println!("  privileges              OK (root)");
    } else {
        println!("  privileges              NOT ROOT -- run with --dry-run or as root");
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        std::process::exit(1);
    }

    Ok(())
}
