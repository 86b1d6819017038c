// SPDX-License-Identifier: Apache-2.0

//! Direct access to the enclave's page table entries.
//!
//! The driver walks the page tables for us; the last-level table is then
//! mapped through `/dev/mem` so entries can be edited from ring 3. Entries
//! are read and written with volatile accesses since the MMU sets the
//! accessed and dirty bits concurrently.

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::pf::Protect;
use crate::step::Progress;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::ptr::NonNull;

use log::debug;
use mmarinus::{perms, Map, Shared};
use primordial::Page;
use x86_64::structures::paging::page_table::{PageTable, PageTableEntry, PageTableFlags};

/// Physical address bits of a page table entry.
pub(crate) const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One accessed page, as recorded by the MMU.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PageAccess {
    pub page: usize,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl PageAccess {
    /// Whether `other` is the same page with no permission beyond ours.
    pub fn covers(&self, other: &Self) -> bool {
        self.page == other.page
            && (self.read || !other.read)
            && (self.write || !other.write)
            && (self.execute || !other.execute)
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            page: self.page,
            read: self.read || other.read,
            write: self.write || other.write,
            execute: self.execute || other.execute,
        }
    }
}

/// A live page table entry.
pub struct Pte(NonNull<u64>);

// SAFETY: the entry is only touched from the host thread owning it.
unsafe impl Send for Pte {}

impl Pte {
    /// # Safety
    ///
    /// `entry` must stay valid for the lifetime of the returned value.
    pub unsafe fn new(entry: NonNull<PageTableEntry>) -> Self {
        Self(entry.cast())
    }

    pub fn raw(&self) -> u64 {
        unsafe { self.0.as_ptr().read_volatile() }
    }

    pub fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.raw())
    }

    fn update(&self, f: impl FnOnce(&mut PageTableFlags)) {
        let raw = self.raw();
        let mut flags = PageTableFlags::from_bits_truncate(raw);
        f(&mut flags);

        let raw = (raw & !PageTableFlags::all().bits()) | flags.bits();
        unsafe { self.0.as_ptr().write_volatile(raw) }
    }

    pub fn present(&self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    pub fn accessed(&self) -> bool {
        self.flags().contains(PageTableFlags::ACCESSED)
    }

    pub fn dirty(&self) -> bool {
        self.flags().contains(PageTableFlags::DIRTY)
    }

    pub fn executable(&self) -> bool {
        !self.flags().contains(PageTableFlags::NO_EXECUTE)
    }

    pub fn set_present(&self, present: bool) {
        self.update(|flags| flags.set(PageTableFlags::PRESENT, present))
    }

    pub fn mark_not_accessed(&self) {
        self.update(|flags| flags.remove(PageTableFlags::ACCESSED))
    }

    pub fn mark_clean(&self) {
        self.update(|flags| flags.remove(PageTableFlags::DIRTY))
    }
}

/// Invalidates cached translations after an entry changed.
pub trait Tlb {
    fn flush(&mut self, virt: u64) -> Result<()>;
}

/// Last-level page tables mapped through `/dev/mem`.
pub struct PageTables {
    driver: Driver,
    mem: File,
    tables: HashMap<u64, Map<perms::ReadWrite, Shared>>,
}

impl PageTables {
    pub fn open(driver: Driver) -> Result<Self> {
        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/mem")?;

        Ok(Self {
            driver,
            mem,
            tables: HashMap::new(),
        })
    }

    fn table(&mut self, phys: u64) -> Result<NonNull<PageTable>> {
        if !self.tables.contains_key(&phys) {
            // SAFETY: page table pages are never reclaimed while the
            // enclave they map is alive.
            let map = unsafe {
                Map::bytes(Page::SIZE)
                    .anywhere()
                    .from(&mut self.mem, phys as i64)
                    .with_kind(Shared)
                    .with(perms::ReadWrite)
                    .map_err(|e| e.err)?
            };
            debug!("page table {:#x} mapped at {:#x}", phys, map.addr());
            self.tables.insert(phys, map);
        }

        let addr = self.tables[&phys].addr();
        NonNull::new(addr as *mut PageTable).ok_or(Error::Unmapped(phys))
    }

    /// The entry mapping `virt`, which must be a present 4 KiB page.
    pub fn pte(&mut self, virt: u64) -> Result<Pte> {
        let mapping = self.driver.mapping(virt)?;

        let pmd = PageTableFlags::from_bits_truncate(mapping.pmd);
        if !pmd.contains(PageTableFlags::PRESENT) || pmd.contains(PageTableFlags::HUGE_PAGE) {
            return Err(Error::Unmapped(virt));
        }

        let table = self.table(mapping.pmd & ADDR_MASK)?;
        let index = ((virt >> 12) & 0x1ff) as usize;

        // SAFETY: the table stays mapped as long as `self` lives.
        unsafe {
            let entry = &mut (&mut *table.as_ptr())[index];
            Ok(Pte::new(NonNull::from(entry)))
        }
    }
}

impl Tlb for PageTables {
    fn flush(&mut self, virt: u64) -> Result<()> {
        self.driver.invlpg(virt)
    }
}

/// Entries of every page in an enclave range.
///
/// Pages without a 4 KiB entry are left out.
pub struct Ptes<T: Tlb> {
    base: u64,
    entries: Vec<Option<Pte>>,
    tlb: T,
}

impl Ptes<PageTables> {
    /// Locks `base..limit` in memory and looks up all of its entries.
    pub fn map(mut tables: PageTables, base: u64, limit: u64) -> Result<Self> {
        let size = (limit - base) as usize;
        if unsafe { libc::mlock(base as *const libc::c_void, size) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut entries = Vec::with_capacity(size / Page::SIZE);
        for virt in (base..limit).step_by(Page::SIZE) {
            entries.push(match tables.pte(virt) {
                Ok(pte) => Some(pte),
                Err(Error::Unmapped(..)) => None,
                Err(e) => return Err(e),
            });
        }

        let mapped = entries.iter().filter(|e| e.is_some()).count();
        debug!("{} of {} enclave pages have entries", mapped, entries.len());
        Ok(Self::new(base, entries, tables))
    }
}

impl<T: Tlb> Ptes<T> {
    pub fn new(base: u64, entries: Vec<Option<Pte>>, tlb: T) -> Self {
        Self { base, entries, tlb }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, page: usize) -> Option<&Pte> {
        self.entries.get(page).and_then(Option::as_ref)
    }

    pub fn clear_accessed(&mut self) {
        for pte in self.entries.iter().flatten() {
            pte.mark_not_accessed();
            pte.mark_clean();
        }
    }

    /// Pages the MMU marked accessed since the last clear.
    pub fn accesses(&self) -> Vec<PageAccess> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(page, pte)| pte.as_ref().map(|pte| (page, pte)))
            .filter(|(_, pte)| pte.accessed() && pte.present())
            .map(|(page, pte)| PageAccess {
                page,
                read: true,
                write: pte.dirty(),
                execute: false,
            })
            .collect()
    }

    fn set_present(&mut self, page: usize, count: usize, present: bool) -> Result<()> {
        for page in page..page + count {
            if let Some(pte) = self.entries.get(page).and_then(Option::as_ref) {
                pte.set_present(present);
                self.tlb.flush(self.base + (page * Page::SIZE) as u64)?;
            }
        }
        Ok(())
    }
}

/// Revokes by clearing the present bit.
impl<T: Tlb> Protect for Ptes<T> {
    fn revoke(&mut self, page: usize, count: usize) -> Result<()> {
        self.set_present(page, count, false)
    }

    fn restore(&mut self, page: usize, count: usize) -> Result<()> {
        self.set_present(page, count, true)
    }
}

/// Progress is any accessed bit set since the last reset.
impl<T: Tlb + Send> Progress for Ptes<T> {
    fn reset(&mut self) {
        self.clear_accessed()
    }

    fn progressed(&mut self) -> bool {
        self.entries.iter().flatten().any(Pte::accessed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Entries backed by plain memory.
    struct Backing(Box<[PageTableEntry]>);

    impl Backing {
        pub fn new(flags: &[PageTableFlags]) -> Self {
            let entries = flags
                .iter()
                .map(|f| {
                    let mut entry = PageTableEntry::new();
                    entry.set_addr(x86_64::PhysAddr::new(0x1000), *f);
                    entry
                })
                .collect();
            Self(entries)
        }

        pub fn ptes<T: Tlb>(&mut self, tlb: T) -> Ptes<T> {
            let entries = self
                .0
                .iter_mut()
                .map(|e| Some(unsafe { Pte::new(NonNull::from(e)) }))
                .collect();
            Ptes::new(0x10_0000, entries, tlb)
        }
    }

    #[derive(Default)]
    struct Flushes(Vec<u64>);

    impl Tlb for Flushes {
        fn flush(&mut self, virt: u64) -> Result<()> {
            self.0.push(virt);
            Ok(())
        }
    }

    impl Tlb for &mut Flushes {
        fn flush(&mut self, virt: u64) -> Result<()> {
            self.0.push(virt);
            Ok(())
        }
    }

    use PageTableFlags as F;

    #[test]
    fn access() {
        let read = PageAccess {
            page: 3,
            read: true,
            ..Default::default()
        };
        let write = PageAccess {
            page: 3,
            write: true,
            ..Default::default()
        };

        assert!(read.covers(&read));
        assert!(!read.covers(&write));

        let both = read.union(&write);
        assert!(both.covers(&read) && both.covers(&write));
        assert!(!both.covers(&PageAccess { page: 4, ..read }));
    }

    #[test]
    fn flags() {
        let mut backing = Backing::new(&[F::PRESENT | F::ACCESSED | F::DIRTY | F::NO_EXECUTE]);
        let ptes = backing.ptes(Flushes::default());
        let pte = ptes.get(0).unwrap();

        assert!(pte.present() && pte.accessed() && pte.dirty() && !pte.executable());

        pte.mark_not_accessed();
        pte.mark_clean();
        assert!(!pte.accessed() && !pte.dirty());
        assert!(pte.present());
        assert_eq!(pte.raw() & ADDR_MASK, 0x1000);

        pte.set_present(false);
        assert!(!pte.present());
        assert_eq!(pte.raw() & ADDR_MASK, 0x1000);
    }

    #[test]
    fn scan() {
        let mut backing = Backing::new(&[
            F::PRESENT,
            F::PRESENT | F::ACCESSED,
            F::PRESENT | F::ACCESSED | F::DIRTY,
            F::ACCESSED,
        ]);
        let mut ptes = backing.ptes(Flushes::default());

        let accesses = ptes.accesses();
        assert_eq!(accesses.len(), 2);
        assert_eq!(accesses[0].page, 1);
        assert!(accesses[0].read && !accesses[0].write);
        assert_eq!(accesses[1].page, 2);
        assert!(accesses[1].write);

        assert!(ptes.progressed());
        ptes.reset();
        assert!(!ptes.progressed());
        assert!(ptes.accesses().is_empty());
    }

    #[test]
    fn protect() {
        let mut backing = Backing::new(&[F::PRESENT; 4]);
        let mut flushes = Flushes::default();
        {
            let mut ptes = backing.ptes(&mut flushes);
            ptes.revoke(1, 2).unwrap();
            assert!(ptes.get(0).unwrap().present());
            assert!(!ptes.get(1).unwrap().present());
            assert!(!ptes.get(2).unwrap().present());

            ptes.restore(2, 1).unwrap();
            assert!(ptes.get(2).unwrap().present());

            // Out of range pages are ignored.
            ptes.revoke(3, 5).unwrap();
        }
        assert_eq!(flushes.0, vec![0x10_1000, 0x10_2000, 0x10_2000, 0x10_3000]);
    }
}
