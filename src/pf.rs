// SPDX-License-Identifier: Apache-2.0

//! Page-fault access tracer.
//!
//! Tracked enclave pages are revoked so that the next access faults. On a
//! fault the page joins a small working set of restored pages; the page
//! falling out of the working set is revoked again. With a working set of
//! one, only an access to a *different* tracked page faults next, so runs
//! of accesses to the same page are coalesced into one fault.

use crate::aep::InterruptEvent;
use crate::error::{Error, Result};
use crate::step::Hook;

use std::collections::VecDeque;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use primordial::Page;
use spin::Mutex;

/// Revokes and restores access to enclave pages, by page number relative
/// to the enclave base.
pub trait Protect {
    fn revoke(&mut self, page: usize, count: usize) -> Result<()>;
    fn restore(&mut self, page: usize, count: usize) -> Result<()>;
}

/// Protection through `mprotect(2)`; the kernel driver propagates it to the
/// enclave's page table entries.
pub struct Mprotect {
    base: u64,
}

impl Mprotect {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    fn protect(&self, page: usize, count: usize, prot: libc::c_int) -> Result<()> {
        let addr = self.base as usize + page * Page::SIZE;
        let len = count * Page::SIZE;

        match unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error().into()),
        }
    }
}

impl Protect for Mprotect {
    fn revoke(&mut self, page: usize, count: usize) -> Result<()> {
        self.protect(page, count, libc::PROT_NONE)
    }

    /// Enclave pages refuse permissions beyond those they were built
    /// with, so try the widest first.
    fn restore(&mut self, page: usize, count: usize) -> Result<()> {
        const ATTEMPTS: [libc::c_int; 4] = [
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::PROT_READ | libc::PROT_EXEC,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::PROT_READ,
        ];

        let mut last = Ok(());
        for prot in ATTEMPTS {
            last = self.protect(page, count, prot);
            if last.is_ok() {
                break;
            }
        }
        last
    }
}

pub struct Tracer<P: Protect> {
    protect: P,
    tracked: Vec<Range<usize>>,
    working: VecDeque<usize>,
    working_set: usize,
    faults: u64,
    failure: Option<Error>,
}

impl<P: Protect> Tracer<P> {
    pub fn new(protect: P, working_set: usize) -> Self {
        Self {
            protect,
            tracked: Vec::new(),
            working: VecDeque::new(),
            working_set: working_set.max(1),
            faults: 0,
            failure: None,
        }
    }

    /// The number of faults, or the first error hit while re-arming.
    pub fn finish(&mut self) -> Result<u64> {
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(self.faults),
        }
    }

    pub fn faults(&self) -> u64 {
        self.faults
    }

    pub fn tracked(&self) -> &[Range<usize>] {
        &self.tracked
    }

    pub fn protect(&mut self) -> &mut P {
        &mut self.protect
    }

    fn is_tracked(&self, page: usize) -> bool {
        self.tracked.iter().any(|r| r.contains(&page))
    }

    /// Revokes `ranges` and makes them the tracked set.
    ///
    /// Pages of a previous set that are not in `ranges` keep their
    /// current protection.
    pub fn track(&mut self, ranges: Vec<Range<usize>>) -> Result<()> {
        for range in ranges.iter().filter(|r| !r.is_empty()) {
            self.protect.revoke(range.start, range.len())?;
        }
        self.tracked = ranges;
        Ok(())
    }

    /// Revokes the tracked set again, including the working set.
    pub fn rearm(&mut self) -> Result<()> {
        self.working.clear();
        for i in 0..self.tracked.len() {
            let range = self.tracked[i].clone();
            if !range.is_empty() {
                self.protect.revoke(range.start, range.len())?;
            }
        }
        Ok(())
    }

    /// Handles a fault on `page`: restores it and re-revokes the page
    /// leaving the working set.
    pub fn on_fault(&mut self, page: usize) -> Result<()> {
        self.faults += 1;

        if !self.working.contains(&page) {
            self.working.push_back(page);
        }

        while self.working.len() > self.working_set {
            if let Some(evicted) = self.working.pop_front() {
                if self.is_tracked(evicted) {
                    self.protect.revoke(evicted, 1)?;
                }
            }
        }

        for i in 0..self.working.len() {
            let page = self.working[i];
            self.protect.restore(page, 1)?;
        }

        Ok(())
    }
}

/// Re-arms the tracer at the stepper's cadence. Re-arming stops at the
/// first failed `mprotect`.
impl<P: Protect + Send> Hook for Tracer<P> {
    fn on_step(&mut self, step: u64, _event: &InterruptEvent) {
        if self.failure.is_some() {
            return;
        }

        if let Err(e) = self.rearm() {
            warn!("step {}: failed to re-arm the page tracer: {}", step, e);
            self.failure = Some(e);
        }
    }
}

type FaultFn = Box<dyn FnMut(usize) -> Result<()> + Send>;

static FAULT_HANDLER: Mutex<Option<FaultFn>> = Mutex::new(None);
static FAULT_BASE: AtomicU64 = AtomicU64::new(0);

extern "C" fn on_sigsegv(_signo: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let addr = unsafe { (*info).si_addr() } as u64;
    let page = (addr.wrapping_sub(FAULT_BASE.load(Ordering::Relaxed)) >> 12) as usize;

    let handled = match FAULT_HANDLER.try_lock() {
        Some(mut guard) => match guard.as_mut() {
            Some(handler) => handler(page).is_ok(),
            None => false,
        },

        // Re-entered from within the handler.
        None => false,
    };

    // The faulting access is retried on return; unhandled, it kills us.
    if !handled {
        unsafe {
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
        }
    }
}

/// Installs `handler` for faults on pages relative to `base`.
///
/// The handler runs in signal context with all signals blocked. If it
/// fails, the default action is restored.
pub fn register_fault_handler(
    base: u64,
    handler: impl FnMut(usize) -> Result<()> + Send + 'static,
) -> Result<()> {
    FAULT_BASE.store(base, Ordering::Relaxed);
    *FAULT_HANDLER.lock() = Some(Box::new(handler));

    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = on_sigsegv as usize;
        act.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigfillset(&mut act.sa_mask);

        if libc::sigaction(libc::SIGSEGV, &act, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error().into());
        }
    }

    Ok(())
}

pub fn clear_fault_handler() {
    FAULT_HANDLER.lock().take();
    unsafe {
        libc::signal(libc::SIGSEGV, libc::SIG_DFL);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::collections::BTreeSet;

    /// Records the revoked set.
    #[derive(Default)]
    pub(crate) struct Pages {
        pub revoked: BTreeSet<usize>,
        pub calls: usize,
    }

    impl Protect for Pages {
        fn revoke(&mut self, page: usize, count: usize) -> Result<()> {
            self.calls += 1;
            self.revoked.extend(page..page + count);
            Ok(())
        }

        fn restore(&mut self, page: usize, count: usize) -> Result<()> {
            self.calls += 1;
            for page in page..page + count {
                self.revoked.remove(&page);
            }
            Ok(())
        }
    }

    fn revoked(tracer: &mut Tracer<Pages>) -> Vec<usize> {
        tracer.protect().revoked.iter().copied().collect()
    }

    #[test]
    fn single_page_working_set() {
        let mut tracer = Tracer::new(Pages::default(), 1);
        tracer.track(vec![10..14]).unwrap();
        assert_eq!(revoked(&mut tracer), vec![10, 11, 12, 13]);

        tracer.on_fault(11).unwrap();
        assert_eq!(revoked(&mut tracer), vec![10, 12, 13]);

        // The previous page is revoked again.
        tracer.on_fault(12).unwrap();
        assert_eq!(revoked(&mut tracer), vec![10, 11, 13]);
        assert_eq!(tracer.faults(), 2);
    }

    #[test]
    fn two_page_working_set() {
        let mut tracer = Tracer::new(Pages::default(), 2);
        tracer.track(vec![0..4]).unwrap();

        tracer.on_fault(0).unwrap();
        tracer.on_fault(1).unwrap();
        assert_eq!(revoked(&mut tracer), vec![2, 3]);

        tracer.on_fault(2).unwrap();
        assert_eq!(revoked(&mut tracer), vec![0, 3]);
    }

    #[test]
    fn untracked_pages_stay_restored() {
        let mut tracer = Tracer::new(Pages::default(), 1);
        tracer.track(vec![0..2]).unwrap();
        tracer.on_fault(1).unwrap();

        tracer.track(vec![5..6]).unwrap();
        tracer.on_fault(5).unwrap();
        assert_eq!(revoked(&mut tracer), vec![0]);
    }

    #[test]
    fn rearm() {
        let mut tracer = Tracer::new(Pages::default(), 1);
        tracer.track(vec![3..5, 7..7]).unwrap();
        tracer.on_fault(4).unwrap();
        assert_eq!(revoked(&mut tracer), vec![3]);

        let event = InterruptEvent {
            tsc: 0,
            rip: 0,
            cpl: 3,
            vector: 45,
        };
        tracer.on_step(1, &event);
        assert_eq!(revoked(&mut tracer), vec![3, 4]);
        assert_eq!(tracer.finish().unwrap(), 1);
    }

    /// Refuses to revoke anything.
    #[derive(Default)]
    struct Locked {
        calls: usize,
    }

    impl Protect for Locked {
        fn revoke(&mut self, _page: usize, _count: usize) -> Result<()> {
            self.calls += 1;
            Err(io::Error::from_raw_os_error(libc::EACCES).into())
        }

        fn restore(&mut self, _page: usize, _count: usize) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rearm_failure() {
        let mut tracer = Tracer::new(Locked::default(), 1);
        tracer.tracked = vec![3..5];

        let event = InterruptEvent {
            tsc: 0,
            rip: 0,
            cpl: 3,
            vector: 45,
        };
        tracer.on_step(1, &event);
        tracer.on_step(2, &event);
        assert_eq!(tracer.protect().calls, 1);

        match tracer.finish() {
            Err(Error::Driver(e)) => assert_eq!(e.raw_os_error(), Some(libc::EACCES)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(tracer.finish().unwrap(), 0);
    }
}
