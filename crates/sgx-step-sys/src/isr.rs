// SPDX-License-Identifier: Apache-2.0

//! Privileged handlers and the asynchronous exit trampoline.
//!
//! The handlers live in their own `sgx_step_isr_text` section so the driver
//! can map exactly that range (plus the `sgx_step_isr` data it writes) into
//! every address space of the pinned core. None of them take locks or call
//! back into Rust: they run with interrupts disabled on whatever stack the
//! CPU switched to.

use crate::idt::Handlers;
use crate::msr::apic::EOI;
use crate::record::{AepSlots, IrqRecord, AEP, APIC, IRQ};

use core::arch::global_asm;
use core::ptr::addr_of;

// Timer interrupt.
//
// Captures the serialized TSC and the interrupted RIP/CPL, bumps the fired
// counter, acknowledges the local APIC and returns. The interrupt frame
// (no error code) is RIP, CS, RFLAGS, RSP, SS.
global_asm!(
    ".pushsection sgx_step_isr_text, \"ax\", @progbits",
    ".balign 16",
    ".globl sgx_step_timer_handler",
    "sgx_step_timer_handler:",
    "    push rax",
    "    push rdx",
    "    lfence",
    "    rdtsc",
    "    shl  rdx, 32",
    "    or   rax, rdx",
    "    mov  qword ptr [rip + {irq} + {tsc}], rax",
    "    mov  rax, qword ptr [rsp + 16]",
    "    mov  qword ptr [rip + {irq} + {rip}], rax",
    "    mov  rax, qword ptr [rsp + 24]",
    "    and  rax, 3",
    "    mov  qword ptr [rip + {irq} + {cpl}], rax",
    "    lock inc qword ptr [rip + {irq} + {fired}]",
    "    mov  rax, qword ptr [rip + {apic}]",
    "    test rax, rax",
    "    jz   2f",
    "    mov  dword ptr [rax + {eoi}], 0",
    "2:",
    "    pop  rdx",
    "    pop  rax",
    "    iretq",
    "",
    // In: ecx = MSR. Out: edx:eax = value.
    ".balign 16",
    ".globl sgx_step_gate_rdmsr",
    "sgx_step_gate_rdmsr:",
    "    rdmsr",
    "    iretq",
    "",
    // In: ecx = MSR, edx:eax = value.
    ".balign 16",
    ".globl sgx_step_gate_wrmsr",
    "sgx_step_gate_wrmsr:",
    "    wrmsr",
    "    iretq",
    "",
    // In: rax = function, rdi = argument. Out: rax = return value.
    ".balign 16",
    ".globl sgx_step_gate_call",
    "sgx_step_gate_call:",
    "    push rbp",
    "    mov  rbp, rsp",
    "    and  rsp, ~0xf",
    "    call rax",
    "    mov  rsp, rbp",
    "    pop  rbp",
    "    iretq",
    ".popsection",
    irq = sym IRQ,
    apic = sym APIC,
    fired = const IrqRecord::FIRED,
    tsc = const IrqRecord::TSC,
    rip = const IrqRecord::RIP,
    cpl = const IrqRecord::CPL,
    eoi = const EOI,
);

// Asynchronous exit pointer.
//
// On an AEX the CPU leaves rax = ERESUME, rbx = TCS and rcx = AEP. The
// trampoline preserves the latter two, calls the dispatch slot on an
// aligned stack below the red zone, counts the resume and re-enters the
// enclave. A failing ERESUME faults and never reaches the `ud2`.
global_asm!(
    ".pushsection .text.sgx_step_aep, \"ax\", @progbits",
    ".balign 16",
    ".globl sgx_step_aep_trampoline",
    "sgx_step_aep_trampoline:",
    "    lea  rsp, [rsp - 128]",
    "    push rbx",
    "    push rcx",
    "    push rbp",
    "    mov  rbp, rsp",
    "    and  rsp, ~0xf",
    "    mov  rax, qword ptr [rip + {aep} + {dispatch}]",
    "    test rax, rax",
    "    jz   2f",
    "    call rax",
    "2:",
    "    mov  rsp, rbp",
    "    pop  rbp",
    "    lock inc qword ptr [rip + {aep} + {resumes}]",
    "    pop  rcx",
    "    pop  rbx",
    "    lea  rsp, [rsp + 128]",
    "    mov  eax, 3",
    "    enclu",
    "    ud2",
    ".popsection",
    aep = sym AEP,
    dispatch = const AepSlots::DISPATCH,
    resumes = const AepSlots::RESUMES,
);

extern "C" {
    fn sgx_step_timer_handler();
    fn sgx_step_gate_rdmsr();
    fn sgx_step_gate_wrmsr();
    fn sgx_step_gate_call();
    fn sgx_step_aep_trampoline();

    static __start_sgx_step_isr_text: u8;
    static __stop_sgx_step_isr_text: u8;
    static __start_sgx_step_isr: u8;
    static __stop_sgx_step_isr: u8;
}

/// Addresses of the privileged entry points.
pub fn handlers() -> Handlers {
    Handlers {
        timer: sgx_step_timer_handler as usize as u64,
        call: sgx_step_gate_call as usize as u64,
        rdmsr: sgx_step_gate_rdmsr as usize as u64,
        wrmsr: sgx_step_gate_wrmsr as usize as u64,
    }
}

/// Address to register as the enclave's asynchronous exit pointer.
pub fn trampoline() -> u64 {
    sgx_step_aep_trampoline as usize as u64
}

/// Virtual ranges (start, end) the driver has to map for the handlers.
pub fn ranges() -> [(u64, u64); 2] {
    unsafe {
        [
            (
                addr_of!(__start_sgx_step_isr_text) as u64,
                addr_of!(__stop_sgx_step_isr_text) as u64,
            ),
            (
                addr_of!(__start_sgx_step_isr) as u64,
                addr_of!(__stop_sgx_step_isr) as u64,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_inside_section() {
        let handlers = handlers();
        let [(start, stop), (data_start, data_stop)] = ranges();

        for addr in [handlers.timer, handlers.call, handlers.rdmsr, handlers.wrmsr] {
            assert!(start <= addr && addr < stop, "{addr:#x} not in {start:#x}..{stop:#x}");
        }

        let irq = IRQ.as_ptr() as u64;
        assert!(data_start <= irq && irq < data_stop);
    }

    #[test]
    fn trampoline_outside_section() {
        let [(start, stop), _] = ranges();
        let aep = trampoline();
        assert!(aep < start || aep >= stop);
    }
}
