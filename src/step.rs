// SPDX-License-Identifier: Apache-2.0

//! Single-stepping controller.
//!
//! ```text
//! Idle --start--> Armed --first interrupt--> Stepping --stop--> Stopped
//! ```
//!
//! The stepper lives behind the AEP callback. Every exit while stepping
//! re-arms the timer with the single-step delay, so the enclave executes
//! (at most) one instruction per resume. Only timer interrupts that
//! landed inside the enclave count as steps.

use crate::aep::{Callback, Dispatcher, Exit, InterruptEvent, Origin, Resume};
use crate::apic::TimerControl;
use crate::error::{Error, Result};

use std::num::NonZeroU32;
use std::sync::Arc;

use log::{debug, info};
use spin::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Armed,
    Stepping,
    Stopped,
}

/// Run step hooks every this many counted steps.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cadence(NonZeroU32);

impl Cadence {
    pub const EVERY: Cadence = Cadence(NonZeroU32::MIN);

    pub fn new(every: u32) -> Option<Self> {
        NonZeroU32::new(every).map(Self)
    }

    pub fn every(&self) -> u32 {
        self.0.get()
    }

    pub fn due(&self, step: u64) -> bool {
        step % self.0.get() as u64 == 0
    }
}

impl Default for Cadence {
    fn default() -> Self {
        Self::EVERY
    }
}

/// Called on counted steps, at the stepper's cadence.
///
/// Runs on the host thread before the enclave resumes; it must neither
/// block nor enter the enclave.
pub trait Hook: Send {
    fn on_step(&mut self, step: u64, event: &InterruptEvent);
}

/// A hook still reachable from the host once stepping stopped.
///
/// Steps that find the hook locked are skipped.
impl<H: Hook> Hook for Arc<Mutex<H>> {
    fn on_step(&mut self, step: u64, event: &InterruptEvent) {
        if let Some(mut hook) = self.try_lock() {
            hook.on_step(step, event);
        }
    }
}

/// Detects whether the enclave retired an instruction since the last
/// `reset`.
pub trait Progress: Send {
    fn reset(&mut self);
    fn progressed(&mut self) -> bool;
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Enclave interrupts with progress.
    pub steps: u64,
    /// Enclave interrupts without progress.
    pub zero_steps: u64,
    /// Host or kernel interrupts, resumed without counting.
    pub ignored: u64,
    /// Exits that were not timer interrupts.
    pub other: u64,
}

pub struct Stepper<T: TimerControl> {
    timer: T,
    ticks: u32,
    aep: u64,
    state: State,
    report: StepReport,
    last_tsc: u64,
    cadence: Cadence,
    hooks: Vec<Box<dyn Hook>>,
    progress: Option<Box<dyn Progress>>,
    failure: Option<Error>,
}

impl<T: TimerControl> Stepper<T> {
    /// A stepper re-arming `timer` with `ticks` after every enclave
    /// interrupt. `aep` identifies interrupts taken inside the enclave.
    pub fn new(timer: T, ticks: u32, aep: u64) -> Self {
        Self {
            timer,
            ticks,
            aep,
            state: State::Idle,
            report: StepReport::default(),
            last_tsc: 0,
            cadence: Cadence::default(),
            hooks: Vec::new(),
            progress: None,
            failure: None,
        }
    }

    pub fn cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn hook(mut self, hook: impl Hook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Enables zero-step filtering.
    pub fn progress(mut self, progress: impl Progress + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn report(&self) -> StepReport {
        self.report
    }

    /// Timestamp of the last counted step.
    pub fn last_tsc(&self) -> u64 {
        self.last_tsc
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::State("start requires an idle stepper"));
        }

        if let Some(progress) = self.progress.as_mut() {
            progress.reset();
        }

        self.timer.arm(self.ticks)?;
        self.state = State::Armed;
        Ok(())
    }

    /// Handles one asynchronous exit.
    pub fn on_exit(&mut self, exit: Exit) -> Resume {
        let event = match (self.state, exit) {
            (State::Stopped, _) => return Resume::Stop,
            (State::Idle, _) => return Resume::Continue,
            // The pending one-shot may have expired outside the enclave.
            (_, Exit::Other) => {
                self.report.other += 1;
                return self.rearm();
            }
            (_, Exit::Interrupt(event)) => event,
        };

        match event.origin(self.aep) {
            Origin::Enclave => {
                self.state = State::Stepping;

                let progressed = match self.progress.as_mut() {
                    Some(progress) => progress.progressed(),
                    None => true,
                };

                if progressed {
                    self.report.steps += 1;
                    self.last_tsc = event.tsc;

                    let step = self.report.steps;
                    if self.cadence.due(step) {
                        for hook in self.hooks.iter_mut() {
                            hook.on_step(step, &event);
                        }
                    }
                } else {
                    self.report.zero_steps += 1;
                }

                if let Some(progress) = self.progress.as_mut() {
                    progress.reset();
                }
            }

            Origin::Host | Origin::Kernel => self.report.ignored += 1,
        }

        self.rearm()
    }

    fn rearm(&mut self) -> Resume {
        match self.timer.arm(self.ticks) {
            Ok(()) => Resume::Continue,
            Err(e) => {
                self.failure = Some(e);
                self.state = State::Stopped;
                Resume::Stop
            }
        }
    }

    /// Disarms the timer. Stopping twice is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == State::Stopped {
            return Ok(());
        }

        self.state = State::Stopped;
        self.timer.disarm()
    }

    /// Stops and reports. A run without a single counted step is
    /// `NoProgress`.
    pub fn finish(&mut self) -> Result<StepReport> {
        self.stop()?;

        if let Some(e) = self.failure.take() {
            return Err(e);
        }

        let report = self.report;
        debug!("stepping finished: {:?}", report);

        if report.steps == 0 {
            return Err(Error::NoProgress);
        }

        Ok(report)
    }
}

/// A stepper registered with a dispatcher.
pub struct Session<T: TimerControl> {
    stepper: Arc<Mutex<Stepper<T>>>,
}

impl<T: TimerControl + Send + 'static> Session<T> {
    /// Starts `stepper` and registers it as the exit callback.
    pub fn start(dispatcher: &mut Dispatcher, mut stepper: Stepper<T>) -> Result<Self> {
        if dispatcher.is_registered() {
            return Err(Error::State("a callback is already registered"));
        }

        stepper.start()?;
        info!("single-stepping armed with {} ticks", stepper.ticks);

        let stepper = Arc::new(Mutex::new(stepper));
        let shared = stepper.clone();
        dispatcher.register(Callback::Step(Box::new(move |exit| {
            match shared.try_lock() {
                Some(mut stepper) => stepper.on_exit(exit),
                None => Resume::Continue,
            }
        })));

        Ok(Self { stepper })
    }

    pub fn report(&self) -> StepReport {
        self.stepper.lock().report()
    }

    /// Deregisters the callback, stops the stepper and reports.
    pub fn stop(self, dispatcher: &mut Dispatcher) -> Result<StepReport> {
        dispatcher.deregister();
        let mut stepper = self.stepper.lock();
        let report = stepper.finish();
        if let Ok(report) = &report {
            info!(
                "{} steps, {} zero-steps, {} foreign interrupts",
                report.steps, report.zero_steps, report.ignored
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};

    const AEP: u64 = 0x7000_0000;

    #[derive(Clone, Default)]
    struct Counter {
        armed: Arc<AtomicU64>,
        disarmed: Arc<AtomicU64>,
    }

    impl TimerControl for Counter {
        fn arm(&mut self, _ticks: u32) -> Result<()> {
            self.armed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disarm(&mut self) -> Result<()> {
            self.disarmed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn enclave(tsc: u64) -> Exit {
        Exit::Interrupt(InterruptEvent {
            tsc,
            rip: AEP,
            cpl: 3,
            vector: 45,
        })
    }

    #[test]
    fn transitions() {
        let timer = Counter::default();
        let mut stepper = Stepper::new(timer.clone(), 11, AEP);
        assert_eq!(stepper.state(), State::Idle);

        stepper.start().unwrap();
        assert_eq!(stepper.state(), State::Armed);
        assert_eq!(timer.armed.load(Ordering::SeqCst), 1);
        assert!(matches!(stepper.start(), Err(Error::State(..))));

        assert_eq!(stepper.on_exit(enclave(5)), Resume::Continue);
        assert_eq!(stepper.state(), State::Stepping);
        assert_eq!(timer.armed.load(Ordering::SeqCst), 2);

        stepper.stop().unwrap();
        stepper.stop().unwrap();
        assert_eq!(stepper.state(), State::Stopped);
        assert_eq!(timer.disarmed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn foreign_interrupts() {
        let mut stepper = Stepper::new(Counter::default(), 11, AEP);
        stepper.start().unwrap();

        let host = Exit::Interrupt(InterruptEvent {
            tsc: 1,
            rip: 0x40_1000,
            cpl: 3,
            vector: 45,
        });
        let kernel = Exit::Interrupt(InterruptEvent {
            tsc: 2,
            rip: AEP,
            cpl: 0,
            vector: 45,
        });

        assert_eq!(stepper.on_exit(host), Resume::Continue);
        assert_eq!(stepper.on_exit(kernel), Resume::Continue);
        assert_eq!(stepper.on_exit(Exit::Other), Resume::Continue);
        assert_eq!(stepper.state(), State::Armed);

        let report = stepper.report();
        assert_eq!(report.steps, 0);
        assert_eq!(report.ignored, 2);
        assert_eq!(report.other, 1);
        assert!(matches!(stepper.finish(), Err(Error::NoProgress)));
    }

    #[test]
    fn steps_across_faults() {
        let timer = Counter::default();
        let mut stepper = Stepper::new(timer.clone(), 11, AEP);
        stepper.start().unwrap();
        assert_eq!(stepper.on_exit(enclave(1)), Resume::Continue);

        // A page fault between two steps.
        let armed = timer.armed.load(Ordering::SeqCst);
        assert_eq!(stepper.on_exit(Exit::Other), Resume::Continue);
        assert_eq!(timer.armed.load(Ordering::SeqCst), armed + 1);
        assert_eq!(stepper.state(), State::Stepping);

        assert_eq!(stepper.on_exit(enclave(2)), Resume::Continue);
        assert_eq!(timer.armed.load(Ordering::SeqCst), armed + 2);

        let report = stepper.finish().unwrap();
        assert_eq!(report.steps, 2);
        assert_eq!(report.other, 1);
    }

    #[test]
    fn idle_does_not_arm_on_faults() {
        let timer = Counter::default();
        let mut stepper = Stepper::new(timer.clone(), 11, AEP);
        assert_eq!(stepper.on_exit(Exit::Other), Resume::Continue);
        assert_eq!(timer.armed.load(Ordering::SeqCst), 0);
        assert_eq!(stepper.report().other, 0);
    }

    #[test]
    fn stopped_does_not_rearm() {
        let timer = Counter::default();
        let mut stepper = Stepper::new(timer.clone(), 11, AEP);
        stepper.start().unwrap();
        stepper.on_exit(enclave(1));
        stepper.stop().unwrap();

        let armed = timer.armed.load(Ordering::SeqCst);
        assert_eq!(stepper.on_exit(enclave(2)), Resume::Stop);
        assert_eq!(timer.armed.load(Ordering::SeqCst), armed);
        assert_eq!(stepper.report().steps, 1);
        assert_eq!(stepper.finish().unwrap().steps, 1);
    }

    struct Toggle(bool);

    impl Progress for Toggle {
        fn reset(&mut self) {}

        fn progressed(&mut self) -> bool {
            self.0 = !self.0;
            self.0
        }
    }

    #[test]
    fn zero_steps() {
        let mut stepper = Stepper::new(Counter::default(), 11, AEP).progress(Toggle(false));
        stepper.start().unwrap();
        for tsc in 0..6 {
            stepper.on_exit(enclave(tsc));
        }

        let report = stepper.report();
        assert_eq!(report.steps, 3);
        assert_eq!(report.zero_steps, 3);
    }

    struct Steps(Arc<spin::Mutex<Vec<u64>>>);

    impl Hook for Steps {
        fn on_step(&mut self, step: u64, _event: &InterruptEvent) {
            self.0.lock().push(step);
        }
    }

    #[test]
    fn cadence() {
        assert!(Cadence::new(0).is_none());
        let every3 = Cadence::new(3).unwrap();
        assert!(every3.due(3) && every3.due(6) && !every3.due(4));

        let seen = Arc::new(spin::Mutex::new(Vec::new()));
        let mut stepper = Stepper::new(Counter::default(), 11, AEP)
            .cadence(every3)
            .hook(Steps(seen.clone()));
        stepper.start().unwrap();
        for tsc in 0..7 {
            stepper.on_exit(enclave(tsc));
        }

        assert_eq!(*seen.lock(), vec![3, 6]);
    }

    struct Broken;

    impl TimerControl for Broken {
        fn arm(&mut self, ticks: u32) -> Result<()> {
            match ticks {
                1 => Ok(()),
                _ => Err(Error::Apic("gone")),
            }
        }

        fn disarm(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rearm_failure() {
        let mut stepper = Stepper::new(Broken, 1, AEP);
        stepper.start().unwrap();
        stepper.ticks = 2;

        assert_eq!(stepper.on_exit(enclave(1)), Resume::Stop);
        assert_eq!(stepper.state(), State::Stopped);
        assert!(matches!(stepper.finish(), Err(Error::Apic("gone"))));
    }

    #[test]
    fn session() {
        let timer = Counter::default();
        let mut dispatcher = Dispatcher::new();
        dispatcher.configure(AEP, 45);

        let session = Session::start(&mut dispatcher, Stepper::new(timer.clone(), 11, AEP)).unwrap();
        assert!(dispatcher.is_registered());
        assert!(Session::start(&mut dispatcher, Stepper::new(Counter::default(), 11, AEP)).is_err());

        for fired in 1..=4 {
            dispatcher.on_exit(sgx_step_sys::IrqRecord {
                fired,
                tsc: fired * 100,
                rip: AEP,
                cpl: 3,
            });
        }
        assert_eq!(session.report().steps, 4);

        let report = session.stop(&mut dispatcher).unwrap();
        assert_eq!(report.steps, 4);
        assert!(!dispatcher.is_registered());
        assert_eq!(timer.disarmed.load(Ordering::SeqCst), 1);
    }
}
