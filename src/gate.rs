// SPDX-License-Identifier: Apache-2.0

//! Interrupt gates that let this process execute privileged instructions.
//!
//! The gate set is written into the IDT of the pinned core once per process.
//! Gates other than the timer are DPL 3, so ring 3 can raise them with
//! `int imm8`; callers reach them through a small executable stub page with
//! one `int vector; ret` sequence per gate.

use crate::config::GateConfig;
use crate::error::{Error, Result};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use mmarinus::{perms, Map};
use primordial::Page;
use sgx_step_sys::idt::{GateType, Handlers, IdtEntry, FIRST_EXTERNAL, VECTORS};

static INSTALLED: AtomicBool = AtomicBool::new(false);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GateKind {
    /// Local APIC timer interrupt.
    Timer,
    /// Calls a function in ring 0.
    SoftwareInterrupt,
    MsrRead,
    MsrWrite,
}

impl GateKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::SoftwareInterrupt => "software interrupt",
            Self::MsrRead => "MSR read",
            Self::MsrWrite => "MSR write",
        }
    }

    fn handler(self, handlers: &Handlers) -> u64 {
        match self {
            Self::Timer => handlers.timer,
            Self::SoftwareInterrupt => handlers.call,
            Self::MsrRead => handlers.rdmsr,
            Self::MsrWrite => handlers.wrmsr,
        }
    }

    /// Only the timer is kept out of reach of user space.
    fn dpl(self) -> u8 {
        match self {
            Self::Timer => 0,
            _ => 3,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GateDescriptor {
    pub vector: u8,
    pub kind: GateKind,
}

impl GateDescriptor {
    /// The full gate set for a timer vector and the configured gate vectors.
    pub fn set(timer: u8, gates: &GateConfig) -> Vec<Self> {
        vec![
            Self {
                vector: timer,
                kind: GateKind::Timer,
            },
            Self {
                vector: gates.call,
                kind: GateKind::SoftwareInterrupt,
            },
            Self {
                vector: gates.rdmsr,
                kind: GateKind::MsrRead,
            },
            Self {
                vector: gates.wrmsr,
                kind: GateKind::MsrWrite,
            },
        ]
    }
}

/// Access to an interrupt descriptor table.
pub trait Idt {
    fn read(&self, vector: u8) -> IdtEntry;
    fn write(&mut self, vector: u8, entry: IdtEntry);

    /// Kernel code segment selector for new gates.
    fn selector(&self) -> u16 {
        self.read(0).selector()
    }
}

/// An IDT held in ordinary memory.
#[derive(Clone, Debug)]
pub struct Table(Vec<IdtEntry>);

impl Default for Table {
    fn default() -> Self {
        Self(vec![IdtEntry::default(); VECTORS])
    }
}

impl Idt for Table {
    fn read(&self, vector: u8) -> IdtEntry {
        self.0[vector as usize]
    }

    fn write(&mut self, vector: u8, entry: IdtEntry) {
        self.0[vector as usize] = entry;
    }
}

/// Whether `vector` must not be overwritten.
///
/// Architectural exceptions are always off limits. Above them, a present
/// gate that ring 3 can already raise belongs to someone else (e.g. a
/// previous run that was not torn down).
pub fn occupied(vector: u8, entry: &IdtEntry) -> bool {
    vector < FIRST_EXTERNAL || (entry.present() && entry.dpl() == 3)
}

/// Writes the gate set into `idt`.
///
/// Fails without touching the table if any vector is duplicated or occupied,
/// and refuses to run twice in one process.
pub fn install(idt: &mut impl Idt, set: &[GateDescriptor], handlers: &Handlers) -> Result<Gates> {
    install_with(idt, set, handlers, Stubs::new)
}

fn install_with(
    idt: &mut impl Idt,
    set: &[GateDescriptor],
    handlers: &Handlers,
    stubs: impl FnOnce(&[GateDescriptor]) -> Result<Stubs>,
) -> Result<Gates> {
    let mut seen = HashSet::new();
    for gate in set {
        if !seen.insert(gate.vector) {
            return Err(Error::DuplicateVector(gate.vector));
        }

        let current = idt.read(gate.vector);
        if occupied(gate.vector, &current) {
            return Err(Error::VectorOccupied(gate.vector));
        }
    }

    if INSTALLED.load(Ordering::SeqCst) {
        return Err(Error::AlreadyInstalled);
    }

    // The gates are useless to ring 3 without their stubs.
    let stubs = stubs(set)?;

    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(Error::AlreadyInstalled);
    }

    let selector = idt.selector();
    for gate in set {
        let handler = gate.kind.handler(handlers);
        let entry = IdtEntry::new(handler, selector, GateType::Interrupt, gate.kind.dpl());
        debug!(
            "installing {} gate at vector {} -> {:#x}",
            gate.kind.name(),
            gate.vector,
            handler
        );
        idt.write(gate.vector, entry);
    }

    info!("installed {} gates", set.len());

    Ok(Gates {
        set: set.to_vec(),
        stubs,
    })
}

#[cfg(test)]
pub(crate) fn reset() {
    INSTALLED.store(false, Ordering::SeqCst);
}

/// Executable page with one `int vector; ret` sequence per user-callable gate.
struct Stubs {
    page: Map<perms::ReadExecute>,
    slots: Vec<(GateKind, usize)>,
}

impl Stubs {
    const SLOT: usize = 8;

    fn new(set: &[GateDescriptor]) -> Result<Self> {
        let mut page = Map::bytes(Page::SIZE)
            .anywhere()
            .anonymously()
            .with(perms::ReadWrite)
            .map_err(|e| e.err)?;

        let mut slots = Vec::new();
        for gate in set.iter().filter(|g| g.kind != GateKind::Timer) {
            let offset = slots.len() * Self::SLOT;
            page[offset..][..3].copy_from_slice(&[0xCD, gate.vector, 0xC3]);
            slots.push((gate.kind, offset));
        }

        let page = page.reprotect(perms::ReadExecute).map_err(|e| e.err)?;
        Ok(Self { page, slots })
    }

    fn entry(&self, kind: GateKind) -> Option<usize> {
        self.slots
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, offset)| self.page.addr() + offset)
    }

    #[cfg(test)]
    fn code(&self, kind: GateKind) -> Option<&[u8]> {
        self.slots
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, offset)| &self.page[*offset..][..3])
    }
}

/// Read and write model specific registers.
pub trait Msr {
    fn read_msr(&self, msr: u32) -> Result<u64>;
    fn write_msr(&self, msr: u32, value: u64) -> Result<()>;
}

/// An installed gate set.
pub struct Gates {
    set: Vec<GateDescriptor>,
    stubs: Stubs,
}

impl Gates {
    pub fn descriptors(&self) -> &[GateDescriptor] {
        &self.set
    }

    pub fn vector(&self, kind: GateKind) -> Option<u8> {
        self.set.iter().find(|g| g.kind == kind).map(|g| g.vector)
    }

    fn stub(&self, kind: GateKind) -> Result<usize> {
        self.stubs
            .entry(kind)
            .ok_or_else(|| Error::GateMissing(kind.name()))
    }

    /// Runs `func(arg)` in ring 0 and returns its result.
    ///
    /// # Safety
    ///
    /// `func` executes with kernel privileges and interrupts disabled. It
    /// must be mapped by the driver, must not fault and must not block.
    pub unsafe fn call(&self, func: extern "C" fn(u64) -> u64, arg: u64) -> Result<u64> {
        let stub = self.stub(GateKind::SoftwareInterrupt)?;
        let func = func as usize as u64;
        let ret: u64;

        core::arch::asm!(
            "call {stub}",
            stub = in(reg) stub,
            inout("rax") func => ret,
            in("rdi") arg,
            clobber_abi("C"),
        );

        Ok(ret)
    }

    /// # Safety
    ///
    /// Reading an unsupported MSR raises #GP in ring 0.
    pub unsafe fn rdmsr(&self, msr: u32) -> Result<u64> {
        let stub = self.stub(GateKind::MsrRead)?;
        let (lo, hi): (u32, u32);

        core::arch::asm!(
            "call {stub}",
            stub = in(reg) stub,
            in("ecx") msr,
            lateout("eax") lo,
            lateout("edx") hi,
        );

        Ok((hi as u64) << 32 | lo as u64)
    }

    /// # Safety
    ///
    /// Writing an MSR changes processor state behind the kernel's back.
    pub unsafe fn wrmsr(&self, msr: u32, value: u64) -> Result<()> {
        let stub = self.stub(GateKind::MsrWrite)?;
        let lo = value as u32;
        let hi = (value >> 32) as u32;

        core::arch::asm!(
            "call {stub}",
            stub = in(reg) stub,
            in("ecx") msr,
            in("eax") lo,
            in("edx") hi,
        );

        Ok(())
    }
}

impl Msr for Gates {
    fn read_msr(&self, msr: u32) -> Result<u64> {
        unsafe { self.rdmsr(msr) }
    }

    fn write_msr(&self, msr: u32, value: u64) -> Result<()> {
        unsafe { self.wrmsr(msr, value) }
    }
}
