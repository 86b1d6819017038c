// SPDX-License-Identifier: Apache-2.0

//! A synthetic execution context.
//!
//! Models just enough of an enclave to drive the stepper without hardware:
//! a program of per-instruction cycle costs, a resume latency and a
//! one-shot timer counting down in cycles. Interrupts are recognised on
//! instruction boundaries, so a timer expiring inside an instruction
//! delivers after it retires, while one expiring during the resume latency
//! delivers before anything retired (a zero-step).

use crate::aep::Dispatcher;
use crate::apic::TimerControl;
use crate::error::Result;
use crate::step::Progress;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sgx_step_sys::IrqRecord;
use spin::Mutex;

/// RIP reported for interrupts taken outside the enclave.
pub const HOST_RIP: u64 = 0x0040_1000;

/// Timer shared between the simulated core and the stepper.
#[derive(Clone, Default)]
pub struct SimTimer(Arc<Mutex<Option<u32>>>);

impl SimTimer {
    fn take(&self) -> Option<u32> {
        self.0.lock().take()
    }

    fn put(&self, ticks: u32) {
        *self.0.lock() = Some(ticks);
    }

    pub fn pending(&self) -> Option<u32> {
        *self.0.lock()
    }
}

impl TimerControl for SimTimer {
    fn arm(&mut self, ticks: u32) -> Result<()> {
        self.put(ticks);
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        self.take();
        Ok(())
    }
}

/// Retired-instruction counter standing in for the accessed bits of the
/// enclave's code pages.
#[derive(Clone, Default)]
pub struct SimProgress {
    retired: Arc<AtomicU64>,
    seen: u64,
}

impl Progress for SimProgress {
    fn reset(&mut self) {
        self.seen = self.retired.load(Ordering::SeqCst);
    }

    fn progressed(&mut self) -> bool {
        self.retired.load(Ordering::SeqCst) != self.seen
    }
}

/// One interrupt delivered while running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub tsc: u64,
    /// Instructions retired when the interrupt was taken.
    pub retired: u64,
    pub in_enclave: bool,
}

pub struct SimCpu {
    program: Vec<u32>,
    latency: Vec<u32>,
    aep: u64,
    host_interrupts: BTreeSet<usize>,
    timer: SimTimer,
    retired: Arc<AtomicU64>,
}

impl SimCpu {
    /// `program` holds the cycle cost of every instruction; every resume
    /// takes `resume_cycles` before the next instruction starts.
    pub fn new(program: Vec<u32>, resume_cycles: u32, aep: u64) -> Self {
        Self {
            program,
            latency: vec![resume_cycles],
            aep,
            host_interrupts: BTreeSet::new(),
            timer: SimTimer::default(),
            retired: Arc::default(),
        }
    }

    /// Cycles through `latencies` on successive resumes.
    pub fn jitter(mut self, latencies: Vec<u32>) -> Self {
        if !latencies.is_empty() {
            self.latency = latencies;
        }
        self
    }

    /// Delivers a host interrupt right before instruction `index` resumes.
    pub fn host_interrupt(mut self, index: usize) -> Self {
        self.host_interrupts.insert(index);
        self
    }

    pub fn timer(&self) -> SimTimer {
        self.timer.clone()
    }

    pub fn progress(&self) -> SimProgress {
        SimProgress {
            retired: self.retired.clone(),
            seen: self.retired.load(Ordering::SeqCst),
        }
    }

    pub fn aep(&self) -> u64 {
        self.aep
    }

    /// Runs the program to completion, passing every exit through
    /// `dispatcher`.
    ///
    /// Never terminates if the armed delay is always shorter than the
    /// resume latency.
    pub fn run(&self, dispatcher: &mut Dispatcher) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        let mut hosts = self.host_interrupts.clone();
        let mut cycles = 0u64;
        let mut fired = 0u64;
        let mut resumes = 0usize;
        let mut resumed = false;
        let mut pc = 0usize;

        let mut deliver = |cycles: u64, rip: u64| {
            fired += 1;
            deliveries.push(Delivery {
                tsc: cycles,
                retired: self.retired.load(Ordering::SeqCst),
                in_enclave: rip == self.aep,
            });

            // The context resumes whatever the callback answers.
            let _ = dispatcher.on_exit(IrqRecord {
                fired,
                tsc: cycles,
                rip,
                cpl: 3,
            });
        };

        while pc < self.program.len() {
            if hosts.remove(&pc) {
                deliver(cycles, HOST_RIP);
                resumed = false;
            }

            let latency = match resumed {
                true => 0,
                false => {
                    let latency = self.latency[resumes % self.latency.len()];
                    resumes += 1;
                    latency as u64
                }
            };
            let cost = latency + self.program[pc] as u64;

            match self.timer.take().map(u64::from) {
                Some(t) if t <= latency => {
                    cycles += t;
                    deliver(cycles, self.aep);
                    resumed = false;
                }

                Some(t) if t <= cost => {
                    cycles += cost;
                    self.retired.fetch_add(1, Ordering::SeqCst);
                    pc += 1;
                    deliver(cycles, self.aep);
                    resumed = false;
                }

                pending => {
                    if let Some(t) = pending {
                        self.timer.put((t - cost) as u32);
                    }
                    cycles += cost;
                    self.retired.fetch_add(1, Ordering::SeqCst);
                    pc += 1;
                    resumed = true;
                }
            }
        }

        deliveries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aep::{Exit, InterruptEvent, Resume};
    use crate::step::{Session, State, Stepper};

    const AEP: u64 = 0x7fff_0000;

    fn dispatcher() -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher.configure(AEP, 45);
        dispatcher
    }

    #[test]
    fn unstepped_run() {
        let cpu = SimCpu::new(vec![3; 10], 20, AEP);
        let mut dispatcher = dispatcher();
        assert!(cpu.run(&mut dispatcher).is_empty());
        assert_eq!(dispatcher.exits(), 0);
    }

    #[test]
    fn one_event_per_instruction() {
        for n in [1usize, 2, 17, 100] {
            let program = (0..n).map(|i| 2 + (i % 5) as u32).collect();
            let cpu = SimCpu::new(program, 20, AEP);
            let mut dispatcher = dispatcher();

            let stepper = Stepper::new(cpu.timer(), 21, AEP);
            let session = Session::start(&mut dispatcher, stepper).unwrap();
            let deliveries = cpu.run(&mut dispatcher);
            let report = session.stop(&mut dispatcher).unwrap();

            assert_eq!(deliveries.len(), n);
            assert_eq!(report.steps, n as u64);
            assert!(deliveries.windows(2).all(|w| w[0].tsc <= w[1].tsc));
            assert!(deliveries
                .iter()
                .enumerate()
                .all(|(i, d)| d.in_enclave && d.retired == i as u64 + 1));
        }
    }

    #[test]
    fn multi_step_without_rearm() {
        let cpu = SimCpu::new(vec![5; 10], 20, AEP);
        let mut dispatcher = dispatcher();
        let mut timer = cpu.timer();

        // One shot expiring inside the fourth instruction.
        timer.arm(20 + 5 * 3 + 1).unwrap();
        let deliveries = cpu.run(&mut dispatcher);

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].retired, 4);
        assert_eq!(deliveries[0].tsc, 40);
    }

    #[test]
    fn zero_steps_filtered() {
        let n = 8;
        let cpu = SimCpu::new(vec![4; n], 20, AEP).jitter(vec![20, 25]);
        let mut dispatcher = dispatcher();

        // Every second resume is slower than the delay.
        let stepper = Stepper::new(cpu.timer(), 21, AEP).progress(cpu.progress());
        let session = Session::start(&mut dispatcher, stepper).unwrap();
        let deliveries = cpu.run(&mut dispatcher);
        let report = session.stop(&mut dispatcher).unwrap();

        assert_eq!(deliveries.len(), 2 * n - 1);
        assert_eq!(report.steps, n as u64);
        assert_eq!(report.zero_steps, n as u64 - 1);
    }

    #[test]
    fn host_interrupts_not_counted() {
        let cpu = SimCpu::new(vec![2; 6], 20, AEP).host_interrupt(3);
        let mut dispatcher = dispatcher();

        let stepper = Stepper::new(cpu.timer(), 21, AEP).progress(cpu.progress());
        let session = Session::start(&mut dispatcher, stepper).unwrap();
        let deliveries = cpu.run(&mut dispatcher);
        let report = session.stop(&mut dispatcher).unwrap();

        assert_eq!(deliveries.iter().filter(|d| !d.in_enclave).count(), 1);
        assert_eq!(report.steps, 6);
        assert_eq!(report.ignored, 1);
        assert_eq!(report.zero_steps, 0);
    }

    #[test]
    fn no_events_after_stop() {
        let cpu = SimCpu::new(vec![2; 10], 20, AEP);
        let mut dispatcher = dispatcher();

        let stepper = Stepper::new(cpu.timer(), 21, AEP);
        let session = Session::start(&mut dispatcher, stepper).unwrap();
        assert!(session.stop(&mut dispatcher).is_err());
        assert_eq!(cpu.timer().pending(), None);
        assert!(cpu.run(&mut dispatcher).is_empty());

        // A stopped stepper refuses to re-arm.
        let mut stepper = Stepper::new(cpu.timer(), 21, AEP);
        stepper.start().unwrap();
        stepper.stop().unwrap();
        assert_eq!(stepper.state(), State::Stopped);

        let resume = stepper.on_exit(Exit::Interrupt(InterruptEvent {
            tsc: 1,
            rip: AEP,
            cpl: 3,
            vector: 45,
        }));
        assert_eq!(resume, Resume::Stop);
        assert_eq!(cpu.timer().pending(), None);
        assert!(cpu.run(&mut dispatcher).is_empty());
    }
}
