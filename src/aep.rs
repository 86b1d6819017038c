// SPDX-License-Identifier: Apache-2.0

//! Asynchronous exit handling.
//!
//! Every AEX lands in the assembly trampoline, which calls [`dispatch`]
//! before resuming the enclave. The dispatcher turns the record written by
//! the timer handler into an [`Exit`] and hands it to the registered
//! callback, if any.

use crate::error::Result;

use log::debug;
use sgx_step_sys::record::{IrqRecord, AEP, IRQ};
use spin::Mutex;

/// Where the interrupted instruction was running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Inside the enclave: the frame's RIP is the AEP.
    Enclave,
    /// Ring 3 outside the enclave.
    Host,
    /// Ring 0.
    Kernel,
}

/// One timer interrupt as seen by the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InterruptEvent {
    pub tsc: u64,
    pub rip: u64,
    pub cpl: u8,
    pub vector: u8,
}

impl InterruptEvent {
    pub fn from_record(record: &IrqRecord, vector: u8) -> Self {
        Self {
            tsc: record.tsc,
            rip: record.rip,
            cpl: record.cpl as u8,
            vector,
        }
    }

    /// An enclave interrupt reports the AEP as RIP since the real
    /// instruction pointer is saved in the SSA.
    pub fn origin(&self, aep: u64) -> Origin {
        match (self.cpl, self.rip) {
            (0, _) => Origin::Kernel,
            (_, rip) if rip == aep => Origin::Enclave,
            _ => Origin::Host,
        }
    }
}

/// Why the enclave exited.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exit {
    /// The timer fired since the previous exit.
    Interrupt(InterruptEvent),
    /// Some other event (fault, foreign interrupt) caused the exit.
    Other,
}

/// What to do once the callback returns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resume {
    Continue,
    /// Resume, and drop the callback for all further exits.
    Stop,
}

pub type StepFn = Box<dyn FnMut(Exit) -> Resume + Send>;

/// The registered exit callback.
#[derive(Default)]
pub enum Callback {
    /// Resume directly.
    #[default]
    None,
    Step(StepFn),
}

impl Callback {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Exit bookkeeping for one enclave.
pub struct Dispatcher {
    callback: Callback,
    aep: u64,
    vector: u8,
    fired: u64,
    exits: u64,
}

impl Dispatcher {
    pub const fn new() -> Self {
        Self {
            callback: Callback::None,
            aep: 0,
            vector: 0,
            fired: 0,
            exits: 0,
        }
    }

    /// Sets the AEP used to classify interrupts and the timer vector
    /// reported in events.
    pub fn configure(&mut self, aep: u64, vector: u8) {
        self.aep = aep;
        self.vector = vector;
    }

    pub fn aep(&self) -> u64 {
        self.aep
    }

    /// Replaces the callback, returning the previous one.
    pub fn register(&mut self, callback: Callback) -> Callback {
        std::mem::replace(&mut self.callback, callback)
    }

    pub fn deregister(&mut self) -> Callback {
        self.register(Callback::None)
    }

    pub fn is_registered(&self) -> bool {
        !self.callback.is_none()
    }

    pub fn exits(&self) -> u64 {
        self.exits
    }

    /// Handles one exit, given the current handler record.
    pub fn on_exit(&mut self, record: IrqRecord) -> Resume {
        self.exits += 1;

        let exit = if record.fired != self.fired {
            self.fired = record.fired;
            Exit::Interrupt(InterruptEvent::from_record(&record, self.vector))
        } else {
            Exit::Other
        };

        let resume = match &mut self.callback {
            Callback::None => Resume::Continue,
            Callback::Step(f) => f(exit),
        };

        if resume == Resume::Stop {
            self.callback = Callback::None;
        }

        resume
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// The dispatcher the trampoline calls into.
pub static DISPATCHER: Mutex<Dispatcher> = Mutex::new(Dispatcher::new());

/// Called by the trampoline on the host thread before every ERESUME.
///
/// Never waits: if the dispatcher is held elsewhere the exit is resumed
/// without a callback.
extern "C" fn dispatch() {
    if let Some(mut dispatcher) = DISPATCHER.try_lock() {
        dispatcher.on_exit(IRQ.get());
    }
}

/// Points the trampoline's dispatch slot at [`dispatch`] and returns the
/// address to register as the enclave's AEP.
pub fn install(vector: u8) -> Result<u64> {
    let aep = sgx_step_sys::isr::trampoline();

    let mut slots = AEP.get();
    slots.dispatch = dispatch as usize;
    AEP.set(slots);

    let mut dispatcher = DISPATCHER.lock();
    dispatcher.configure(aep, vector);
    dispatcher.fired = IRQ.get().fired;

    debug!("AEP trampoline at {:#x}", aep);
    Ok(aep)
}

/// Number of resumes issued by the trampoline.
pub fn resumes() -> u64 {
    AEP.get().resumes
}
