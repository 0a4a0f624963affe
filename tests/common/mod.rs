// IN-MEMORY PLATFORM: SCRIPTED COUNTERS, FREQUENCIES AND RUN QUEUES,
// RECORDED ACTIVATIONS. NO SYSFS, NO ROOT.

#![allow(dead_code)]

use std::collections::HashMap;

use parking_lot::Mutex;

use hotplugd::error::{HotplugError, Result};
use hotplugd::load::CpuTimes;
use hotplugd::platform::{Activation, CpuSource, RunQueues};
use hotplugd::tuning::Action;

pub struct FakeState {
    pub online: Vec<usize>,
    pub times: HashMap<usize, CpuTimes>,
    pub per_cpu_rq: Vec<(usize, u64)>,
    pub nr_running: u64,
    pub freq_khz: u32,
    pub activations: Vec<Action>,
    pub fail_activation: bool,
}

pub struct FakePlatform {
    pub nr_possible: usize,
    pub table: Vec<u32>,
    pub state: Mutex<FakeState>,
}

impl FakePlatform {
    // 4 POSSIBLE CORES, 600MHZ-1.2GHZ: PEAK = 4.8M, BANDS {0,13} {5,26} {10,39} {15,100}
    pub fn new(online: &[usize]) -> Self {
        Self {
            nr_possible: 4,
            table: vec![600_000, 1_200_000],
            state: Mutex::new(FakeState {
                online: online.to_vec(),
                times: HashMap::new(),
                per_cpu_rq: Vec::new(),
                nr_running: 0,
                freq_khz: 1_200_000,
                activations: Vec::new(),
                fail_activation: false,
            }),
        }
    }

    // ADVANCE EVERY ONLINE CORE BY wall_us, OF WHICH idle_us IDLE
    pub fn advance(&self, wall_us: u64, idle_us: u64) {
        let mut st = self.state.lock();
        let online = st.online.clone();
        for cpu in online {
            let t = st.times.entry(cpu).or_default();
            t.wall_us += wall_us;
            t.idle_us += idle_us;
        }
    }

    pub fn advance_cpu(&self, cpu: usize, wall_us: u64, idle_us: u64) {
        let mut st = self.state.lock();
        let t = st.times.entry(cpu).or_default();
        t.wall_us += wall_us;
        t.idle_us += idle_us;
    }

    pub fn activations(&self) -> Vec<Action> {
        self.state.lock().activations.clone()
    }
}

impl CpuSource for FakePlatform {
    fn possible_cpus(&self) -> usize {
        self.nr_possible
    }

    fn online_cpus(&self) -> Result<Vec<usize>> {
        Ok(self.state.lock().online.clone())
    }

    fn cpu_times(&self, cpus: &[usize]) -> Result<Vec<(usize, CpuTimes)>> {
        let st = self.state.lock();
        Ok(cpus.iter().map(|&c| (c, st.times.get(&c).copied().unwrap_or_default())).collect())
    }

    fn run_queues(&self) -> Result<RunQueues> {
        let st = self.state.lock();
        Ok(RunQueues { per_cpu: st.per_cpu_rq.clone(), total: st.nr_running })
    }

    fn current_freq_khz(&self) -> Result<u32> {
        Ok(self.state.lock().freq_khz)
    }

    fn frequency_table(&self) -> Result<Vec<u32>> {
        if self.table.is_empty() {
            return Err(HotplugError::NoFrequencyTable);
        }
        Ok(self.table.clone())
    }
}

impl Activation for FakePlatform {
    fn bring_online(&self, cpu: usize) -> Result<()> {
        let mut st = self.state.lock();
        if st.fail_activation {
            return Err(HotplugError::NoSuchCpu(cpu));
        }
        st.activations.push(Action::AddCore(cpu));
        st.online.push(cpu);
        st.online.sort_unstable();
        Ok(())
    }

    fn take_offline(&self, cpu: usize) -> Result<()> {
        let mut st = self.state.lock();
        if st.fail_activation {
            return Err(HotplugError::NoSuchCpu(cpu));
        }
        st.activations.push(Action::RemoveCore(cpu));
        st.online.retain(|&c| c != cpu);
        Ok(())
    }
}
