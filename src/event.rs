// HOTPLUGD EVENT LOG
// ONE SNAPSHOT PER CONTROL CYCLE: WHAT WAS SEEN, WHAT WAS DECIDED.
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION WHILE THE GOVERNOR RUNS.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

use crate::tuning::Action;

const MAX_SNAPSHOTS: usize = 8192;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Decided(Action),
    Failed(Action),
    Skipped,
}

#[derive(Clone, Copy)]
pub struct Snapshot {
    pub ts_ns:    u64,
    pub online:   u32,
    pub avg_load: u32,
    pub freq_mhz: u32,
    pub outcome:  Outcome,
}

pub struct EventLog {
    snapshots: Vec<Snapshot>,
    head:      usize,
    len:       usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SNAPSHOTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            snapshots: vec![
                Snapshot { ts_ns: 0, online: 0, avg_load: 0, freq_mhz: 0,
                           outcome: Outcome::Skipped };
                capacity.max(1)
            ],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.snapshots.len()
    }

    // RECORD ONE CYCLE. OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn record(&mut self, online: u32, avg_load: u32, freq_khz: u32, outcome: Outcome) {
        let cap = self.capacity();
        self.snapshots[self.head] = Snapshot {
            ts_ns: now_ns(),
            online,
            avg_load,
            freq_mhz: freq_khz / 1000,
            outcome,
        };
        self.head = (self.head + 1) % cap;
        if self.len < cap {
            self.len += 1;
        }
    }

    // MARK THE NEWEST ENTRY'S ACTION AS FAILED (ACTIVATION REFUSED)
    pub fn mark_last_failed(&mut self) {
        if self.len == 0 {
            return;
        }
        let cap = self.capacity();
        let idx = (self.head + cap - 1) % cap;
        if let Outcome::Decided(a) = self.snapshots[idx].outcome {
            self.snapshots[idx].outcome = Outcome::Failed(a);
        }
    }

    // ITERATE SNAPSHOTS IN CHRONOLOGICAL ORDER
    pub fn iter_chronological(&self) -> impl Iterator<Item = &Snapshot> {
        let cap = self.capacity();
        let start = if self.len < cap { 0 } else { self.head };
        (0..self.len).map(move |i| &self.snapshots[(start + i) % cap])
    }

    // DUMP THE TIME SERIES AFTER EXECUTION
    pub fn dump(&self) {
        let mut iter = self.iter_chronological();
        let Some(first) = iter.next() else { return };
        let base_ts = first.ts_ns;

        println!("\n{:<10} {:<8} {:<10} {:<10} {:<10}",
            "TIME_S", "ONLINE", "AVG_LOAD", "FREQ_MHZ", "ACTION");
        println!("{}", "-".repeat(52));

        for s in std::iter::once(first).chain(iter) {
            let elapsed_s = s.ts_ns.saturating_sub(base_ts) as f64 / 1_000_000_000.0;
            println!("{:<10.1} {:<8} {:<10} {:<10} {:<10}",
                elapsed_s, s.online, s.avg_load, s.freq_mhz, outcome_label(s.outcome));
        }

        if self.len == self.capacity() {
            println!("\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} SNAPSHOTS)", self.len);
        }
        println!("TOTAL SNAPSHOTS: {}", self.len);
    }

    pub fn totals(&self) -> Totals {
        let mut t = Totals::default();
        let mut online_sum = 0u64;
        for s in self.iter_chronological() {
            t.cycles += 1;
            online_sum += s.online as u64;
            match s.outcome {
                Outcome::Decided(Action::AddCore(_)) => t.adds += 1,
                Outcome::Decided(Action::RemoveCore(_)) => t.removes += 1,
                Outcome::Decided(Action::NoAction) => {}
                Outcome::Failed(_) => t.failed += 1,
                Outcome::Skipped => t.skipped += 1,
            }
        }
        if t.cycles > 0 {
            t.mean_online = online_sum as f64 / t.cycles as f64;
        }
        t
    }

    // SUMMARY STATISTICS
    pub fn summary(&self) {
        if self.len < 2 {
            return;
        }
        let t = self.totals();
        println!("\n{}", "=".repeat(50));
        println!("HOTPLUGD SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  CYCLES:            {}", t.cycles);
        println!("  CORES ADDED:       {}", t.adds);
        println!("  CORES REMOVED:     {}", t.removes);
        println!("  FAILED HOTPLUGS:   {}", t.failed);
        println!("  SKIPPED CYCLES:    {}", t.skipped);
        println!("  MEAN ONLINE CORES: {:.2}", t.mean_online);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Totals {
    pub cycles: u64,
    pub adds: u64,
    pub removes: u64,
    pub failed: u64,
    pub skipped: u64,
    pub mean_online: f64,
}

fn outcome_label(o: Outcome) -> String {
    match o {
        Outcome::Decided(a) => match a.target() {
            Some(cpu) => format!("{}:{}", a.label(), cpu),
            None => a.label().to_string(),
        },
        Outcome::Failed(a) => format!("{}!", a.label()),
        Outcome::Skipped => "SKIP".to_string(),
    }
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}
