// HOTPLUGD TUNING TYPES
// PURE-RUST MODULE: NO SYSFS, NO THREADS, NO LOCKS
// THRESHOLD TABLE, CADENCE PRESETS AND THE ADD/REMOVE DECISION ENGINE.
// SHARED BETWEEN THE GOVERNOR (governor.rs) AND THE OFFLINE TESTS.

use std::fmt::Write as _;
use std::time::Duration;

// CADENCE PRESETS

pub const BOOT_DELAY: Duration      = Duration::from_secs(60);    // IGNORE BOOT TRANSIENTS
pub const NORMAL_INTERVAL: Duration = Duration::from_millis(500); // DEFAULT, AND AFTER REMOVE
pub const SETTLE_INTERVAL: Duration = Duration::from_secs(2);     // AFTER ADD: LET THE NEW CORE FILL
pub const HOLD_DURATION: Duration   = Duration::from_secs(8);     // AMBIGUOUS-BAND DWELL BEFORE FORCED REMOVE

// RUN-QUEUE TRANSITION THRESHOLDS

pub const TRANS_RQ: u64      = 1;   // MIN-QUEUE CORE COUNTS AS EMPTY BELOW THIS
pub const TRANS_LOAD_RQ: u32 = 8;   // ... AND AS REMOVABLE BELOW THIS PLAIN LOAD %

// CALIBRATION REFERENCES (KHZ x CORES)
// ONE CORE AT ~624MHZ IS "BUSY ENOUGH TO WANT ANOTHER", ~250MHZ IS "IDLE ENOUGH TO DROP ONE".

pub const MIPS_HIGH: u64 = 624_000;
pub const MIPS_LOW: u64  = 250_000;

// --- THRESHOLD TABLE ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Band {
    pub low: u32,
    pub high: u32,
}

// INDEXED BY (ONLINE CORES - 1). HIGH IS NON-DECREASING, LAST HIGH IS 100.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThresholdTable {
    bands: Vec<Band>,
}

impl ThresholdTable {
    // DERIVE EVERY LEVEL FROM TWO THROUGHPUT REFERENCES.
    // LEVEL K (K+1 CORES ONLINE): LOW = K x MIPS_LOW, HIGH = (K+1) x MIPS_HIGH,
    // BOTH AS A PERCENTAGE OF PEAK (MAX_FREQ x NR_CPUS).
    pub fn calibrate(mips_low: u64, mips_high: u64, peak_throughput: u64, nr_cpus: usize) -> Self {
        let nr_cpus = nr_cpus.max(1);
        let peak = peak_throughput.max(1);
        let pct = |v: u64| (v.saturating_mul(100) / peak).min(100) as u32;

        let mut bands: Vec<Band> = (0..nr_cpus)
            .map(|k| {
                let high = pct(mips_high.saturating_mul(k as u64 + 1));
                let low = pct(mips_low.saturating_mul(k as u64)).min(high);
                Band { low, high }
            })
            .collect();

        if let Some(last) = bands.last_mut() {
            last.high = 100;
        }
        Self { bands }
    }

    pub fn from_bands(bands: Vec<Band>) -> Self {
        let bands = if bands.is_empty() { vec![Band { low: 0, high: 100 }] } else { bands };
        Self { bands }
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    // BAND FOR A GIVEN ONLINE COUNT. CLAMPED SO A STALE COUNT NEVER INDEXES OUT.
    pub fn band(&self, online: usize) -> Band {
        let idx = online.max(1) - 1;
        self.bands[idx.min(self.bands.len() - 1)]
    }

    pub fn set_low(&mut self, level: usize, pct: u32) -> bool {
        match self.bands.get_mut(level) {
            Some(b) => { b.low = pct; true }
            None => false,
        }
    }

    pub fn set_high(&mut self, level: usize, pct: u32) -> bool {
        match self.bands.get_mut(level) {
            Some(b) => { b.high = pct; true }
            None => false,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "--------------------");
        let _ = writeln!(out, "|CPU|LOW(%)|HIGH(%)|");
        for (i, b) in self.bands.iter().enumerate() {
            let _ = writeln!(out, "|{:>3}|{:>6}|{:>7}|", i + 1, b.low, b.high);
        }
        let _ = write!(out, "--------------------");
        out
    }
}

// --- CADENCE ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Intervals {
    pub boot: Duration,
    pub normal: Duration,
    pub settle: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            boot: BOOT_DELAY,
            normal: NORMAL_INTERVAL,
            settle: SETTLE_INTERVAL,
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cadence {
    Boot = 0,
    Normal = 1,
    Settle = 2,
}

impl Cadence {
    pub fn interval(self, iv: &Intervals) -> Duration {
        match self {
            Self::Boot => iv.boot,
            Self::Normal => iv.normal,
            Self::Settle => iv.settle,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::Normal => "NORMAL",
            Self::Settle => "SETTLE",
        }
    }
}

// --- DECISION ENGINE ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    NoAction,
    AddCore(usize),
    RemoveCore(usize),
}

impl Action {
    pub fn label(self) -> &'static str {
        match self {
            Self::NoAction => "NOP",
            Self::AddCore(_) => "IN",
            Self::RemoveCore(_) => "OUT",
        }
    }

    pub fn target(self) -> Option<usize> {
        match self {
            Self::NoAction => None,
            Self::AddCore(c) | Self::RemoveCore(c) => Some(c),
        }
    }
}

// KNOBS THE DECISION READS BESIDES THE TABLE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    pub freq_floor_khz: u32,
    pub trans_rq: u64,
    pub trans_load_rq: u32,
    pub hold: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            freq_floor_khz: 0,
            trans_rq: TRANS_RQ,
            trans_load_rq: TRANS_LOAD_RQ,
            hold: HOLD_DURATION,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecisionInput {
    pub avg_load: u32,             // AGGREGATE FREQUENCY-WEIGHTED LOAD, % OF PEAK
    pub cur_freq_khz: u32,
    pub online: usize,
    pub nr_running: u64,           // RUNNABLE TASKS ACROSS ALL ONLINE CORES
    pub min_rq_len: u64,
    pub min_rq_cpu: usize,
    pub min_rq_load: u32,          // PLAIN (NOT FREQUENCY-WEIGHTED) LOAD OF min_rq_cpu
    pub add_candidate: Option<usize>,
    pub dwell: Duration,
    pub poll_interval: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,
    pub dwell: Duration,
}

fn remove(cpu: usize) -> Action {
    if cpu == 0 { Action::NoAction } else { Action::RemoveCore(cpu) }
}

fn add(candidate: Option<usize>) -> Action {
    match candidate {
        Some(cpu) if cpu != 0 => Action::AddCore(cpu),
        _ => Action::NoAction,
    }
}

fn settle(action: Action) -> Verdict {
    Verdict { action, dwell: Duration::ZERO }
}

// FIRST MATCH WINS:
//   1. BELOW LOW                      -> REMOVE (IF >1 ONLINE)
//   2. ABOVE HIGH                     -> ADD (IF OVERSUBSCRIBED AND ABOVE FREQ FLOOR)
//   3. MIN-QUEUE CORE IS EMPTY + COLD -> REMOVE (IF ONE LEVEL DOWN STILL FITS)
//   4. STABLE ZONE [PREV.HIGH, HIGH]  -> NOP
//      AMBIGUOUS [LOW, PREV.HIGH)     -> ACCUMULATE DWELL, REMOVE ONCE IT REACHES HOLD
// DWELL RESETS EVERYWHERE EXCEPT WHILE THE LOAD SITS IN THE AMBIGUOUS BAND.
pub fn decide(input: &DecisionInput, table: &ThresholdTable, policy: &Policy) -> Verdict {
    let online = input.online.max(1);
    let cur = table.band(online);
    let load = input.avg_load;

    if load < cur.low {
        if online > 1 {
            return settle(remove(input.min_rq_cpu));
        }
        return settle(Action::NoAction);
    }

    if load > cur.high {
        if input.nr_running > online as u64 && input.cur_freq_khz > policy.freq_floor_khz {
            return settle(add(input.add_candidate));
        }
        return settle(Action::NoAction);
    }

    if online == 1 {
        return settle(Action::NoAction);
    }

    let prev = table.band(online - 1);
    let ambiguous = load >= cur.low && load < prev.high;

    if input.min_rq_len < policy.trans_rq {
        if input.min_rq_load < policy.trans_load_rq && load < prev.high {
            return settle(remove(input.min_rq_cpu));
        }
        // EMPTY-QUEUE CORE STILL BUSY: HOLD OFF, BUT KEEP ANY DWELL ALREADY EARNED
        let dwell = if ambiguous { input.dwell } else { Duration::ZERO };
        return Verdict { action: Action::NoAction, dwell };
    }

    if load >= prev.high && load <= cur.high {
        return settle(Action::NoAction);
    }

    if ambiguous {
        let dwell = input.dwell + input.poll_interval;
        if dwell >= policy.hold {
            return settle(remove(input.min_rq_cpu));
        }
        return Verdict { action: Action::NoAction, dwell };
    }

    settle(Action::NoAction)
}

// CADENCE FOLLOWS WHAT ACTUALLY HAPPENED. A FAILED ACTIVATION KEEPS THE OLD CADENCE.
pub fn next_cadence(current: Cadence, action: Action, applied: bool) -> Cadence {
    if !applied {
        return current;
    }
    match action {
        Action::AddCore(_) => Cadence::Settle,
        Action::RemoveCore(_) => Cadence::Normal,
        Action::NoAction => current,
    }
}
