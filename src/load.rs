// HOTPLUGD LOAD INTEGRATOR
// PER-CORE BUSY TIME, PLAIN AND FREQUENCY-WEIGHTED, INTEGRATED BETWEEN TICKS.
//
// avg_load APPROXIMATES THE INTEGRAL OF (BUSY FRACTION x FREQUENCY) OVER THE
// CYCLE. EVERY FREQUENCY CHANGE CLOSES A SUB-INTERVAL AT THE OLD FREQUENCY,
// THE TICK CLOSES THE TAIL AT THE CURRENT ONE. NORMALIZED AGAINST PEAK
// THROUGHPUT (MAX_FREQ x NR_CPUS) SO PER-CORE VALUES SUM TO A SYSTEM-WIDE %.
//
// 64-BIT TIME, 128-BIT WEIGHTED SUMS: NO PRE-SHIFTING NEEDED TO STAY IN RANGE.

use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle_us: u64,
    pub wall_us: u64,
}

// WALL ADVANCED LESS THAN IDLE: COUNTERS ARE NOT TRUSTWORTHY THIS CYCLE
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cpu{cpu}: wall delta {wall_delta}us < idle delta {idle_delta}us")]
pub struct CounterSkew {
    pub cpu: usize,
    pub wall_delta: u64,
    pub idle_delta: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CoreStat {
    pub prev_idle: u64,
    pub prev_wall: u64,
    pub wall_mark: u64,
    pub load: u64,
    pub avg_load: u128,
    pub primed: bool,
}

impl CoreStat {
    fn prime(&mut self, t: CpuTimes) {
        self.prev_idle = t.idle_us;
        self.prev_wall = t.wall_us;
        self.wall_mark = t.wall_us;
        self.load = 0;
        self.avg_load = 0;
        self.primed = true;
    }
}

// NORMALIZED RESULT OF ONE CYCLE FOR ONE CORE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreLoad {
    pub cpu: usize,
    pub load: u32,      // % OF WALL TIME BUSY
    pub avg_load: u32,  // % OF PEAK THROUGHPUT
}

pub struct CoreStats {
    slots: Vec<CoreStat>,
}

impl CoreStats {
    // ONE SLOT PER POSSIBLE CPU. NEVER GROWS.
    pub fn new(nr_possible: usize) -> Self {
        Self {
            slots: vec![CoreStat::default(); nr_possible.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, cpu: usize) -> Option<&CoreStat> {
        self.slots.get(cpu)
    }

    // RE-BASELINE: DISCARD ANYTHING ACCRUED SO FAR
    pub fn reset(&mut self, readings: &[(usize, CpuTimes)]) {
        for &(cpu, t) in readings {
            if let Some(slot) = self.slots.get_mut(cpu) {
                slot.prime(t);
            }
        }
    }

    pub fn forget(&mut self, cpu: usize) {
        if let Some(slot) = self.slots.get_mut(cpu) {
            *slot = CoreStat::default();
        }
    }

    // FREQUENCY-CHANGE PATH: CLOSE THE SUB-INTERVAL THAT RAN AT old_freq_khz.
    // NO NORMALIZATION, wall_mark UNTOUCHED.
    pub fn account_frequency_change(&mut self, readings: &[(usize, CpuTimes)], old_freq_khz: u32) {
        for &(cpu, t) in readings {
            let Some(slot) = self.slots.get_mut(cpu) else { continue };
            if !slot.primed {
                slot.prime(t);
                continue;
            }
            let idle = t.idle_us.saturating_sub(slot.prev_idle);
            let wall = t.wall_us.saturating_sub(slot.prev_wall);
            let busy = wall.saturating_sub(idle);
            slot.prev_idle = t.idle_us;
            slot.prev_wall = t.wall_us;
            slot.load = slot.load.saturating_add(busy);
            slot.avg_load += busy as u128 * old_freq_khz as u128;
        }
    }

    // TICK PATH. VALIDATE EVERY CORE FIRST; ON SKEW NOTHING IS COMMITTED.
    pub fn integrate(
        &mut self,
        readings: &[(usize, CpuTimes)],
        cur_freq_khz: u32,
        peak_throughput: u64,
    ) -> Result<Vec<CoreLoad>, CounterSkew> {
        for &(cpu, t) in readings {
            let Some(slot) = self.slots.get(cpu) else { continue };
            if !slot.primed {
                continue;
            }
            let idle_delta = t.idle_us.wrapping_sub(slot.prev_idle);
            let wall_delta = t.wall_us.wrapping_sub(slot.prev_wall);
            if t.idle_us < slot.prev_idle || t.wall_us < slot.prev_wall || wall_delta < idle_delta {
                return Err(CounterSkew { cpu, wall_delta, idle_delta });
            }
        }

        let peak = peak_throughput.max(1) as u128;
        let mut loads = Vec::with_capacity(readings.len());

        for &(cpu, t) in readings {
            let Some(slot) = self.slots.get_mut(cpu) else { continue };
            if !slot.primed {
                // FIRST SIGHT SINCE COMING ONLINE: BASELINE ONLY
                slot.prime(t);
                loads.push(CoreLoad { cpu, load: 0, avg_load: 0 });
                continue;
            }

            let busy = (t.wall_us - slot.prev_wall) - (t.idle_us - slot.prev_idle);
            let elapsed = t.wall_us.saturating_sub(slot.wall_mark).max(1);

            slot.prev_idle = t.idle_us;
            slot.prev_wall = t.wall_us;
            slot.wall_mark = t.wall_us;

            let total_busy = slot.load.saturating_add(busy);
            let weighted = slot.avg_load + busy as u128 * cur_freq_khz as u128;

            let load = (total_busy as u128 * 100 / elapsed as u128).min(100) as u32;
            let avg_load = (weighted * 100 / (elapsed as u128 * peak)).min(100) as u32;

            slot.load = 0;
            slot.avg_load = 0;
            loads.push(CoreLoad { cpu, load, avg_load });
        }

        Ok(loads)
    }
}
