// HOTPLUGD PLATFORM
// EVERYTHING THAT TOUCHES THE MACHINE: COUNTERS, RUN QUEUES, CPUFREQ, HOTPLUG.
//
// TWO SEAMS: CpuSource (WHAT THE GOVERNOR READS) AND Activation (WHAT IT DOES).
// SysfsPlatform IMPLEMENTS BOTH ON TOP OF /sys AND /proc. ROOTS ARE
// CONFIGURABLE SO THE PARSERS CAN BE EXERCISED AGAINST A FAKE TREE.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{HotplugError, Result};
use crate::load::CpuTimes;

// --- SEAMS ---

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunQueues {
    pub per_cpu: Vec<(usize, u64)>,
    pub total: u64,
}

impl RunQueues {
    pub fn len_of(&self, cpu: usize) -> u64 {
        self.per_cpu
            .iter()
            .find(|(c, _)| *c == cpu)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

pub trait CpuSource {
    fn possible_cpus(&self) -> usize;
    fn online_cpus(&self) -> Result<Vec<usize>>;
    fn cpu_times(&self, cpus: &[usize]) -> Result<Vec<(usize, CpuTimes)>>;
    fn run_queues(&self) -> Result<RunQueues>;
    fn current_freq_khz(&self) -> Result<u32>;
    fn frequency_table(&self) -> Result<Vec<u32>>;
}

pub trait Activation {
    fn bring_online(&self, cpu: usize) -> Result<()>;
    fn take_offline(&self, cpu: usize) -> Result<()>;
}

pub trait Platform: CpuSource + Activation + Send + Sync {}

impl<T: CpuSource + Activation + Send + Sync> Platform for T {}

// --- PARSERS ---

// "0-3,5,7-8" -> [0,1,2,3,5,7,8]
pub fn parse_cpu_list(raw: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for range in raw.trim().split(',') {
        let parts: Vec<&str> = range.trim().split('-').collect();
        match parts.len() {
            1 => {
                if let Ok(c) = parts[0].parse::<usize>() {
                    cpus.push(c);
                }
            }
            2 => {
                if let (Ok(lo), Ok(hi)) = (parts[0].parse::<usize>(), parts[1].parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            _ => {}
        }
    }
    cpus
}

pub struct ProcStat {
    pub cpus: HashMap<usize, (u64, u64)>, // ID -> (IDLE TICKS, TOTAL TICKS)
    pub procs_running: u64,
}

// PER-CPU LINES ONLY ("cpu " IS THE AGGREGATE). IDLE = idle + iowait.
// TOTAL STOPS AT steal: guest AND guest_nice ARE ALREADY INSIDE user AND nice.
pub fn parse_proc_stat(raw: &str) -> ProcStat {
    let mut cpus = HashMap::new();
    let mut procs_running = 0;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("procs_running") {
            procs_running = rest.trim().parse().unwrap_or(0);
            continue;
        }
        if !line.starts_with("cpu") || line.starts_with("cpu ") {
            continue;
        }
        let mut it = line.split_whitespace();
        let Some(id) = it.next().and_then(|s| s[3..].parse::<usize>().ok()) else { continue };
        let fields: Vec<u64> = it.filter_map(|s| s.parse().ok()).collect();
        if fields.len() < 4 {
            continue;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().take(8).sum();
        cpus.insert(id, (idle, total));
    }
    ProcStat { cpus, procs_running }
}

pub struct SchedDebugParser {
    header: Regex,
    nr_running: Regex,
}

impl SchedDebugParser {
    pub fn new() -> Result<Self> {
        let compile = |re: &str| {
            Regex::new(re).map_err(|e| HotplugError::Parse { what: "regex", detail: e.to_string() })
        };
        Ok(Self {
            header: compile(r"(?m)^cpu#(\d+)")?,
            nr_running: compile(r"(?m)^\s*\.nr_running\s*:\s*(\d+)")?,
        })
    }

    // FIRST .nr_running AFTER EACH cpu#N HEADER IS THE RQ'S OWN COUNT
    pub fn parse(&self, raw: &str) -> Vec<(usize, u64)> {
        let headers: Vec<(usize, usize)> = self
            .header
            .captures_iter(raw)
            .filter_map(|c| {
                let m = c.get(0)?;
                let cpu = c.get(1)?.as_str().parse().ok()?;
                Some((m.end(), cpu))
            })
            .collect();

        let mut out = Vec::with_capacity(headers.len());
        for (i, &(start, cpu)) in headers.iter().enumerate() {
            let end = headers.get(i + 1).map(|&(s, _)| s).unwrap_or(raw.len());
            let section = &raw[start..end];
            if let Some(n) = self
                .nr_running
                .captures(section)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
            {
                out.push((cpu, n));
            }
        }
        out
    }
}

// --- SYSFS PLATFORM ---

pub struct SysfsPlatform {
    sysfs: PathBuf,
    procfs: PathBuf,
    tick_us: u64,
    nr_possible: usize,
    dry_run: bool,
    sched_debug: SchedDebugParser,
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| HotplugError::Read { path: path.to_path_buf(), source })
}

fn read_khz(path: &Path) -> Result<u32> {
    let raw = read(path)?;
    raw.trim().parse().map_err(|_| HotplugError::Parse {
        what: "frequency",
        detail: format!("{}: {:?}", path.display(), raw.trim()),
    })
}

fn clock_ticks_per_sec() -> u64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 { hz as u64 } else { 100 }
}

impl SysfsPlatform {
    pub fn new(dry_run: bool) -> Result<Self> {
        Self::with_roots("/sys", "/proc", dry_run)
    }

    pub fn with_roots(sysfs: impl Into<PathBuf>, procfs: impl Into<PathBuf>, dry_run: bool) -> Result<Self> {
        let sysfs = sysfs.into();
        let procfs = procfs.into();
        let possible = read(&sysfs.join("devices/system/cpu/possible"))?;
        let nr_possible = parse_cpu_list(&possible).into_iter().max().map(|m| m + 1).unwrap_or(1);
        let platform = Self {
            sysfs,
            procfs,
            tick_us: 1_000_000 / clock_ticks_per_sec(),
            nr_possible,
            dry_run,
            sched_debug: SchedDebugParser::new()?,
        };
        if !platform.has_per_cpu_run_queues() {
            warn!("no readable sched debug output: per-cpu run queues read as 0, dwell hold never engages");
        }
        Ok(platform)
    }

    fn sched_debug_sources(&self) -> [PathBuf; 2] {
        [self.procfs.join("sched_debug"), self.sysfs.join("kernel/debug/sched/debug")]
    }

    // FALSE WHEN NEITHER /proc/sched_debug NOR THE DEBUGFS COPY CAN BE READ
    pub fn has_per_cpu_run_queues(&self) -> bool {
        self.sched_debug_sources().iter().any(|p| fs::File::open(p).is_ok())
    }

    pub fn tick_us(&self) -> u64 {
        self.tick_us
    }

    fn cpu_dir(&self) -> PathBuf {
        self.sysfs.join("devices/system/cpu")
    }

    fn cpufreq(&self, file: &str) -> PathBuf {
        self.cpu_dir().join("cpu0/cpufreq").join(file)
    }

    fn set_online(&self, cpu: usize, online: bool) -> Result<()> {
        if cpu == 0 {
            return Err(HotplugError::Cpu0);
        }
        if cpu >= self.nr_possible {
            return Err(HotplugError::NoSuchCpu(cpu));
        }
        let path = self.cpu_dir().join(format!("cpu{}/online", cpu));
        if self.dry_run {
            info!(cpu, online, "dry run: skipping hotplug write");
            return Ok(());
        }
        fs::write(&path, if online { "1" } else { "0" })
            .map_err(|source| HotplugError::Write { path, source })
    }
}

impl CpuSource for SysfsPlatform {
    fn possible_cpus(&self) -> usize {
        self.nr_possible
    }

    fn online_cpus(&self) -> Result<Vec<usize>> {
        let raw = read(&self.cpu_dir().join("online"))?;
        let mut cpus = parse_cpu_list(&raw);
        cpus.retain(|&c| c < self.nr_possible);
        Ok(cpus)
    }

    fn cpu_times(&self, cpus: &[usize]) -> Result<Vec<(usize, CpuTimes)>> {
        let stat = parse_proc_stat(&read(&self.procfs.join("stat"))?);
        Ok(cpus
            .iter()
            .filter_map(|&cpu| {
                stat.cpus.get(&cpu).map(|&(idle, total)| {
                    (cpu, CpuTimes { idle_us: idle * self.tick_us, wall_us: total * self.tick_us })
                })
            })
            .collect())
    }

    fn run_queues(&self) -> Result<RunQueues> {
        let stat = parse_proc_stat(&read(&self.procfs.join("stat"))?);
        let per_cpu = self
            .sched_debug_sources()
            .iter()
            .find_map(|p| fs::read_to_string(p).ok())
            .map(|raw| self.sched_debug.parse(&raw))
            .unwrap_or_default();
        if per_cpu.is_empty() {
            debug!("no sched debug output, per-cpu run queues unknown");
        }
        Ok(RunQueues { per_cpu, total: stat.procs_running })
    }

    fn current_freq_khz(&self) -> Result<u32> {
        read_khz(&self.cpufreq("scaling_cur_freq"))
    }

    fn frequency_table(&self) -> Result<Vec<u32>> {
        let mut table: Vec<u32> = fs::read_to_string(self.cpufreq("scaling_available_frequencies"))
            .map(|raw| raw.split_whitespace().filter_map(|s| s.parse().ok()).collect())
            .unwrap_or_default();
        if table.is_empty() {
            for file in ["cpuinfo_min_freq", "cpuinfo_max_freq"] {
                if let Ok(f) = read_khz(&self.cpufreq(file)) {
                    table.push(f);
                }
            }
        }
        table.retain(|&f| f > 0);
        if table.is_empty() {
            return Err(HotplugError::NoFrequencyTable);
        }
        Ok(table)
    }
}

impl Activation for SysfsPlatform {
    fn bring_online(&self, cpu: usize) -> Result<()> {
        self.set_online(cpu, true)
    }

    fn take_offline(&self, cpu: usize) -> Result<()> {
        self.set_online(cpu, false)
    }
}

// --- FREQUENCY WATCHER ---

// USERSPACE STAND-IN FOR A CPUFREQ TRANSITION NOTIFIER: POLL scaling_cur_freq,
// REPORT (OLD, NEW) ON EVERY CHANGE.
pub struct FrequencyWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrequencyWatcher {
    pub fn spawn<S, F>(source: Arc<S>, period: Duration, mut on_change: F) -> Result<Self>
    where
        S: CpuSource + Send + Sync + ?Sized + 'static,
        F: FnMut(u32, u32) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("hotplugd-freq".into())
            .spawn(move || {
                let mut last = source.current_freq_khz().ok();
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(period);
                    match source.current_freq_khz() {
                        Ok(now) => {
                            if let Some(old) = last {
                                if old != now {
                                    on_change(old, now);
                                }
                            }
                            last = Some(now);
                        }
                        Err(e) => {
                            warn!(error = %e, "frequency read failed");
                            last = None;
                        }
                    }
                }
            })
            .map_err(|e| HotplugError::Spawn("frequency watcher", e))?;
        Ok(Self { stop, handle: Some(handle) })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for FrequencyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
