// SPDX-License-Identifier: Apache-2.0

//! Fault-driven phase machine for the libjpeg decoder.
//!
//! Each phase is entered by touching one of its code or data pages. Only the
//! pages of the phases reachable from the current one are tracked, so the
//! fault sequence walks the decoder's control flow:
//!
//! ```text
//! PreStart -> Start -> StartRow -> Idct -> DataCount(1) -> DataCount(2) ...
//!                          ^                  |
//!                          |                  +-> PreIdct -> Idct
//!                        NextRow <------------+------+
//! ```
//!
//! The number of data page faults between two IDCT invocations is the
//! block's observation.

use super::Collector;
use crate::config::{range, PhaseConfig};

use std::ops::Range;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    PreStart,
    Start,
    NextRow,
    StartRow,
    PreIdct,
    Idct,
    DataCount(u32),
}

/// Page ranges entering each phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pages {
    start: Range<usize>,
    next_row: Range<usize>,
    start_row: Range<usize>,
    pre_idct: Range<usize>,
    idct: Range<usize>,
    data: Range<usize>,
}

impl Pages {
    pub fn new(config: &PhaseConfig, aexnotify: bool) -> Self {
        Self {
            start: range(config.start),
            next_row: range(config.next_row),
            start_row: range(config.start_row),
            pre_idct: range(config.pre_idct),
            idct: range(config.idct),
            data: range(match aexnotify {
                true => config.data_aexnotify,
                false => config.data,
            }),
        }
    }
}

impl Pages {
    /// Every range that is ever tracked.
    pub fn all(&self) -> [Range<usize>; 6] {
        [
            self.start.clone(),
            self.next_row.clone(),
            self.start_row.clone(),
            self.pre_idct.clone(),
            self.idct.clone(),
            self.data.clone(),
        ]
    }
}

impl Phase {
    pub fn pages(self, pages: &Pages) -> Range<usize> {
        match self {
            Self::PreStart => 0..0,
            Self::Start => pages.start.clone(),
            Self::NextRow => pages.next_row.clone(),
            Self::StartRow => pages.start_row.clone(),
            Self::PreIdct => pages.pre_idct.clone(),
            Self::Idct => pages.idct.clone(),
            Self::DataCount(_) => pages.data.clone(),
        }
    }

    /// Phases reachable with one fault, in priority order.
    pub fn successors(self) -> Vec<Self> {
        match self {
            Self::PreStart => vec![Self::Start],
            Self::Start | Self::NextRow => vec![Self::StartRow],
            Self::StartRow => vec![Self::Idct],
            Self::PreIdct => vec![Self::Idct, Self::NextRow],
            Self::Idct => vec![Self::DataCount(1)],
            Self::DataCount(n) => vec![
                Self::DataCount(n.saturating_add(1)),
                Self::PreIdct,
                Self::NextRow,
            ],
        }
    }

    /// The first successor entered by `page`, or `self`.
    pub fn next(self, page: usize, pages: &Pages) -> Self {
        self.successors()
            .into_iter()
            .find(|phase| phase.pages(pages).contains(&page))
            .unwrap_or(self)
    }

    /// Pages to revoke while in this phase.
    pub fn next_pages(self, pages: &Pages) -> Vec<Range<usize>> {
        self.successors()
            .into_iter()
            .map(|phase| phase.pages(pages))
            .collect()
    }
}

pub struct PhaseMachine {
    phase: Phase,
    pages: Pages,
    transitions: u64,
}

impl PhaseMachine {
    pub fn new(config: &PhaseConfig, aexnotify: bool) -> Self {
        Self {
            phase: Phase::PreStart,
            pages: Pages::new(config, aexnotify),
            transitions: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn next_pages(&self) -> Vec<Range<usize>> {
        self.phase.next_pages(&self.pages)
    }

    pub fn pages(&self) -> &Pages {
        &self.pages
    }

    /// Feeds one page access, reporting completed blocks and rows to
    /// `collector`. Returns the phase left, if any.
    pub fn on_page(&mut self, page: usize, collector: &mut Collector) -> Option<Phase> {
        let prev = self.phase;
        let next = prev.next(page, &self.pages);
        if next == prev {
            return None;
        }

        match (prev, next) {
            (Phase::DataCount(_), Phase::DataCount(_)) => {}
            (Phase::DataCount(n), _) => collector.record(n),
            (Phase::NextRow, Phase::StartRow) => collector.on_row_advance(),
            _ => {}
        }

        self.phase = next;
        self.transitions += 1;
        Some(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Geometry, Traversal};

    fn machine() -> PhaseMachine {
        PhaseMachine::new(&PhaseConfig::default(), false)
    }

    #[test]
    fn transitions() {
        let pages = Pages::new(&PhaseConfig::default(), false);

        assert_eq!(Phase::PreStart.next(54, &pages), Phase::Start);
        assert_eq!(Phase::PreStart.next(58, &pages), Phase::PreStart);
        assert_eq!(Phase::Start.next(58, &pages), Phase::StartRow);
        assert_eq!(Phase::StartRow.next(63, &pages), Phase::Idct);
        assert_eq!(Phase::Idct.next(200, &pages), Phase::DataCount(1));
        assert_eq!(Phase::DataCount(1).next(151, &pages), Phase::DataCount(2));
        assert_eq!(Phase::DataCount(2).next(59, &pages), Phase::PreIdct);
        assert_eq!(Phase::DataCount(2).next(45, &pages), Phase::NextRow);
        assert_eq!(Phase::PreIdct.next(64, &pages), Phase::Idct);
        assert_eq!(Phase::NextRow.next(58, &pages), Phase::StartRow);
    }

    #[test]
    fn aexnotify_data_range() {
        let pages = Pages::new(&PhaseConfig::default(), true);
        assert_eq!(Phase::Idct.next(4337, &pages), Phase::Idct);

        let pages = Pages::new(&PhaseConfig::default(), false);
        assert_eq!(Phase::Idct.next(4337, &pages), Phase::DataCount(1));
    }

    #[test]
    fn next_pages() {
        let pages = Pages::new(&PhaseConfig::default(), false);
        assert_eq!(Phase::PreStart.next_pages(&pages), vec![54..55]);
        assert_eq!(
            Phase::DataCount(3).next_pages(&pages),
            vec![150..4340, 59..60, 44..46]
        );
    }

    #[test]
    fn reconstructs_blocks() {
        let geometry = Geometry {
            planes: 1,
            width_blocks: 2,
            height_blocks: 2,
        };
        let mut collector = Collector::new(geometry, Traversal::Interleaved);
        let mut machine = machine();

        // Row 0: block with 3 data faults, block with 1.
        let trace = [
            54, 58, 63, 150, 151, 152, 59, 63, 160, 44, //
            58, 63, 170, 171, 59,
        ];
        for page in trace {
            machine.on_page(page, &mut collector);
        }

        assert_eq!(machine.phase(), Phase::PreIdct);
        assert_eq!(collector.counts(), vec![vec![3, 1, 2, 0]]);
        assert!(collector.flags().is_empty());
    }

    #[test]
    fn ignores_unrelated_pages() {
        let mut collector = Collector::new(Geometry::from_pixels(8, 8, 1), Traversal::Interleaved);
        let mut machine = machine();

        for page in [1, 2, 3, 4000] {
            assert_eq!(machine.on_page(page, &mut collector), None);
        }
        assert_eq!(machine.phase(), Phase::PreStart);
        assert_eq!(machine.transitions(), 0);
    }
}
