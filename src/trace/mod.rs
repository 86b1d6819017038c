// SPDX-License-Identifier: Apache-2.0

//! Trace collection.
//!
//! The collector turns payload instrumentation (or the fault-driven phase
//! machine) into one ordered sequence of [`TraceEvent`]s per colour plane.
//! Which plane a block belongs to is decided by a [`Traversal`] policy.

pub mod phase;
pub mod vcd;

use crate::error::Error;

use log::debug;
use serde::{Deserialize, Serialize};

/// Side-channel observation for one block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Observation {
    /// Number of all-zero coefficient paths taken.
    ZeroCount(u32),
    /// Faulting address, as an offset into the enclave.
    Fault(u64),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub block: usize,
    pub plane: usize,
    pub observation: Observation,
}

/// Order in which the decoder emits blocks of different planes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Traversal {
    /// A row of blocks per plane, then the next plane.
    RowMajor { blocks_per_row: usize },
    /// Every block of a plane, then the next plane.
    SinglePass { blocks_per_plane: usize },
    /// One block per plane, round robin.
    Interleaved,
}

impl Traversal {
    /// Number of consecutive blocks emitted for one plane.
    pub fn run_length(&self) -> usize {
        match *self {
            Self::RowMajor { blocks_per_row } => blocks_per_row.max(1),
            Self::SinglePass { blocks_per_plane } => blocks_per_plane.max(1),
            Self::Interleaved => 1,
        }
    }
}

/// Image size in 8x8 blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub planes: usize,
    pub width_blocks: usize,
    pub height_blocks: usize,
}

impl Geometry {
    pub const BLOCK: usize = 8;

    /// Partial blocks at the right and bottom edge count as whole blocks.
    pub fn from_pixels(width: usize, height: usize, planes: usize) -> Self {
        Self {
            planes,
            width_blocks: (width + Self::BLOCK - 1) / Self::BLOCK,
            height_blocks: (height + Self::BLOCK - 1) / Self::BLOCK,
        }
    }

    pub fn blocks_per_plane(&self) -> usize {
        self.width_blocks * self.height_blocks
    }
}

/// An event that could not be attributed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flag {
    OutOfOrder {
        plane: usize,
        expected: usize,
        got: usize,
    },
    Overflow {
        plane: usize,
        block: usize,
    },
    /// The decoder left a row before it completed.
    ShortRow {
        plane: usize,
        row: usize,
        missing: usize,
    },
}

impl From<Flag> for Error {
    fn from(flag: Flag) -> Self {
        match flag {
            Flag::OutOfOrder {
                plane,
                expected,
                got,
            } => Error::OutOfOrder {
                plane,
                expected,
                got,
            },
            Flag::Overflow { plane, block } => Error::Overflow { plane, block },
            Flag::ShortRow {
                plane,
                row,
                missing,
            } => Error::ShortRow {
                plane,
                row,
                missing,
            },
        }
    }
}

/// Called with every block attributed to its plane.
pub type BlockFn = Box<dyn FnMut(&TraceEvent) + Send>;

pub struct Collector {
    geometry: Geometry,
    traversal: Traversal,
    events: Vec<Vec<TraceEvent>>,
    next: Vec<usize>,
    faults: Vec<TraceEvent>,
    flags: Vec<Flag>,
    zeros: u32,
    plane: usize,
    run: usize,
    rows: usize,
    on_block: Option<BlockFn>,
}

impl Collector {
    pub fn new(geometry: Geometry, traversal: Traversal) -> Self {
        let planes = geometry.planes.max(1);
        Self {
            geometry: Geometry { planes, ..geometry },
            traversal,
            events: vec![Vec::new(); planes],
            next: vec![0; planes],
            faults: Vec::new(),
            flags: Vec::new(),
            zeros: 0,
            plane: 0,
            run: 0,
            rows: 0,
            on_block: None,
        }
    }

    /// Reports every attributed block to `f`, e.g. to drive a progress bar.
    pub fn on_block(mut self, f: impl FnMut(&TraceEvent) + Send + 'static) -> Self {
        self.on_block = Some(Box::new(f));
        self
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Number of blocks in a complete trace.
    pub fn total_blocks(&self) -> usize {
        self.geometry.blocks_per_plane() * self.geometry.planes
    }

    /// The decoder took an all-zero coefficient path in the current block.
    pub fn on_zero_coefficient(&mut self) {
        self.zeros = self.zeros.saturating_add(1);
    }

    /// The decoder finished the current block.
    pub fn on_block_processed(&mut self) {
        let zeros = std::mem::take(&mut self.zeros);
        self.record(zeros);
    }

    /// Completes the current block with `count` observations.
    pub fn record(&mut self, count: u32) {
        let plane = self.plane;
        let block = self.next[plane];

        let event = TraceEvent {
            block,
            plane,
            observation: Observation::ZeroCount(count),
        };
        if let Err(flag) = self.push(event) {
            debug!("dropped block: {}", Error::from(flag));
        }

        self.run += 1;
        if self.run >= self.traversal.run_length() {
            self.run = 0;
            self.plane = (self.plane + 1) % self.geometry.planes;
        }
    }

    /// The decoder moved on to the next row of blocks.
    ///
    /// Blocks left in the finished row stay missing and are flagged, and
    /// the next block is attributed to the start of the new row.
    pub fn on_row_advance(&mut self) {
        let width = self.geometry.width_blocks.max(1);

        if let Traversal::SinglePass { .. } = self.traversal {
            // Only the plane being decoded has a row in flight.
            let plane = self.plane;
            let next = self.next[plane];
            let start = (next + width - 1) / width * width;
            self.skip_to(plane, start, next / width);

            self.run = self.next[plane];
            if self.run >= self.traversal.run_length() {
                self.run = 0;
                self.plane = (plane + 1) % self.geometry.planes;
            }
            return;
        }

        let row = self.rows;
        self.rows += 1;
        for plane in 0..self.geometry.planes {
            self.skip_to(plane, self.rows * width, row);
        }
        self.plane = 0;
        self.run = 0;
    }

    fn skip_to(&mut self, plane: usize, start: usize, row: usize) {
        let next = self.next[plane];
        if next >= start {
            return;
        }

        let flag = Flag::ShortRow {
            plane,
            row,
            missing: start - next,
        };
        debug!("{}", Error::from(flag));
        self.flags.push(flag);
        self.next[plane] = start;
    }

    /// Logs a raw fault against the block currently being decoded.
    ///
    /// Faults past the end of the plane are dropped; the block they belong
    /// to is flagged once it completes.
    pub fn on_fault(&mut self, addr: u64) {
        let plane = self.plane;
        let block = self.next[plane];
        if block >= self.geometry.blocks_per_plane() {
            return;
        }

        self.faults.push(TraceEvent {
            block,
            plane,
            observation: Observation::Fault(addr),
        });
    }

    /// Appends `event` if it is the next block of its plane.
    pub fn push(&mut self, event: TraceEvent) -> Result<(), Flag> {
        let flag = if event.plane >= self.geometry.planes
            || event.block >= self.geometry.blocks_per_plane()
        {
            Some(Flag::Overflow {
                plane: event.plane,
                block: event.block,
            })
        } else if event.block != self.next[event.plane] {
            Some(Flag::OutOfOrder {
                plane: event.plane,
                expected: self.next[event.plane],
                got: event.block,
            })
        } else {
            None
        };

        if let Some(flag) = flag {
            self.flags.push(flag);
            return Err(flag);
        }

        self.events[event.plane].push(event);
        self.next[event.plane] += 1;
        if let Some(f) = self.on_block.as_mut() {
            f(&event);
        }
        Ok(())
    }

    pub fn events(&self, plane: usize) -> &[TraceEvent] {
        self.events.get(plane).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn faults(&self) -> &[TraceEvent] {
        &self.faults
    }

    pub fn flags(&self) -> &[Flag] {
        &self.flags
    }

    /// Per-plane block-indexed counts; blocks never observed are zero.
    pub fn counts(&self) -> Vec<Vec<u32>> {
        let blocks = self.geometry.blocks_per_plane();
        self.events
            .iter()
            .map(|events| {
                let mut counts = vec![0; blocks];
                for event in events {
                    if let Observation::ZeroCount(count) = event.observation {
                        counts[event.block] = count;
                    }
                }
                counts
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(blocks: usize) -> Geometry {
        Geometry {
            planes: 1,
            width_blocks: blocks,
            height_blocks: 1,
        }
    }

    fn zero(block: usize, plane: usize, count: u32) -> TraceEvent {
        TraceEvent {
            block,
            plane,
            observation: Observation::ZeroCount(count),
        }
    }

    #[test]
    fn geometry() {
        let geometry = Geometry::from_pixels(1600, 1067, 3);
        assert_eq!(geometry.width_blocks, 200);
        assert_eq!(geometry.height_blocks, 134);
        assert_eq!(Geometry::from_pixels(8, 8, 1).blocks_per_plane(), 1);
    }

    #[test]
    fn out_of_order() {
        let mut collector = Collector::new(gray(8), Traversal::Interleaved);
        for block in 0..4 {
            collector.push(zero(block, 0, 1)).unwrap();
        }

        let flag = collector.push(zero(5, 0, 1)).unwrap_err();
        assert_eq!(
            flag,
            Flag::OutOfOrder {
                plane: 0,
                expected: 4,
                got: 5
            }
        );
        assert_eq!(collector.flags(), &[flag]);
        assert_eq!(collector.events(0).len(), 4);

        // Not attributed: block 4 is still expected.
        collector.push(zero(4, 0, 1)).unwrap();
        assert!(matches!(Error::from(flag), Error::OutOfOrder { got: 5, .. }));
    }

    #[test]
    fn overflow() {
        let mut collector = Collector::new(gray(2), Traversal::Interleaved);
        for _ in 0..3 {
            collector.on_block_processed();
        }

        assert_eq!(collector.events(0).len(), 2);
        assert_eq!(collector.flags(), &[Flag::Overflow { plane: 0, block: 2 }]);
        assert_eq!(collector.counts(), vec![vec![0, 0]]);
    }

    #[test]
    fn instrumentation() {
        let mut collector = Collector::new(gray(3), Traversal::Interleaved);
        collector.on_zero_coefficient();
        collector.on_zero_coefficient();
        collector.on_block_processed();
        collector.on_block_processed();
        collector.on_zero_coefficient();
        collector.on_block_processed();

        assert_eq!(collector.counts(), vec![vec![2, 0, 1]]);
        assert!(collector.flags().is_empty());
    }

    #[test]
    fn traversals() {
        let geometry = Geometry {
            planes: 3,
            width_blocks: 2,
            height_blocks: 2,
        };

        let policies = [
            (Traversal::Interleaved, [0, 1, 2, 0, 1, 2]),
            (Traversal::RowMajor { blocks_per_row: 2 }, [0, 0, 1, 1, 2, 2]),
            (
                Traversal::SinglePass {
                    blocks_per_plane: 4,
                },
                [0, 0, 0, 0, 1, 1],
            ),
        ];

        for (traversal, planes) in policies {
            let mut collector = Collector::new(geometry, traversal);
            for count in 0..6 {
                collector.record(count);
            }

            let mut seen = Vec::new();
            for plane in 0..3 {
                for event in collector.events(plane) {
                    if let Observation::ZeroCount(count) = event.observation {
                        seen.push((count, plane));
                    }
                }
            }
            seen.sort();

            let expected: Vec<_> = (0..6).zip(planes).collect();
            assert_eq!(seen, expected, "{traversal:?}");
        }
    }

    #[test]
    fn row_advance() {
        let geometry = Geometry {
            planes: 1,
            width_blocks: 4,
            height_blocks: 2,
        };
        let mut collector = Collector::new(geometry, Traversal::Interleaved);

        collector.record(3);
        collector.record(5);
        collector.on_row_advance();
        collector.record(7);

        assert_eq!(collector.counts(), vec![vec![3, 5, 0, 0, 7, 0, 0, 0]]);
        assert_eq!(
            collector.flags(),
            &[Flag::ShortRow {
                plane: 0,
                row: 0,
                missing: 2
            }]
        );
    }

    #[test]
    fn short_row_realigns_planes() {
        let geometry = Geometry {
            planes: 3,
            width_blocks: 2,
            height_blocks: 2,
        };
        let mut collector = Collector::new(geometry, Traversal::RowMajor { blocks_per_row: 2 });

        // The third plane's row is one block short.
        for count in [1, 1, 2, 2, 3] {
            collector.record(count);
        }
        collector.on_row_advance();
        for count in [10, 10, 20, 20, 30, 30] {
            collector.record(count);
        }

        assert_eq!(
            collector.counts(),
            vec![vec![1, 1, 10, 10], vec![2, 2, 20, 20], vec![3, 0, 30, 30]]
        );
        assert_eq!(
            collector.flags(),
            &[Flag::ShortRow {
                plane: 2,
                row: 0,
                missing: 1
            }]
        );
        assert!(matches!(
            Error::from(collector.flags()[0]),
            Error::ShortRow { plane: 2, .. }
        ));
    }

    #[test]
    fn complete_rows_are_not_flagged() {
        let geometry = Geometry {
            planes: 3,
            width_blocks: 2,
            height_blocks: 2,
        };
        let mut collector = Collector::new(geometry, Traversal::RowMajor { blocks_per_row: 2 });
        for count in 0..6 {
            collector.record(count);
        }
        collector.on_row_advance();
        collector.record(6);

        assert!(collector.flags().is_empty());
        assert_eq!(collector.counts()[0], vec![0, 1, 6, 0]);
    }

    #[test]
    fn single_pass_short_row() {
        let geometry = Geometry {
            planes: 2,
            width_blocks: 2,
            height_blocks: 2,
        };
        let traversal = Traversal::SinglePass {
            blocks_per_plane: 4,
        };
        let mut collector = Collector::new(geometry, traversal);

        collector.record(1);
        collector.record(2);
        collector.record(3);
        collector.on_row_advance();
        collector.record(4);

        assert_eq!(collector.counts(), vec![vec![1, 2, 3, 0], vec![4, 0, 0, 0]]);
        assert_eq!(
            collector.flags(),
            &[Flag::ShortRow {
                plane: 0,
                row: 1,
                missing: 1
            }]
        );
    }

    #[test]
    fn faults() {
        let mut collector = Collector::new(gray(4), Traversal::Interleaved);
        collector.record(1);
        collector.on_fault(0x7000_1234);

        assert_eq!(
            collector.faults(),
            &[TraceEvent {
                block: 1,
                plane: 0,
                observation: Observation::Fault(0x7000_1234)
            }]
        );
    }

    #[test]
    fn faults_stay_within_the_plane() {
        let mut collector = Collector::new(gray(1), Traversal::Interleaved);
        collector.on_fault(0x1000);
        collector.record(1);
        collector.on_fault(0x2000);

        assert_eq!(collector.faults().len(), 1);
        assert_eq!(collector.faults()[0].block, 0);
    }

    #[test]
    fn reports_attributed_blocks() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mut collector = Collector::new(gray(2), Traversal::Interleaved).on_block(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(collector.total_blocks(), 2);

        for count in 0..3 {
            collector.record(count);
        }

        // The overflowing block is not reported.
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(collector.flags().len(), 1);
    }

    #[test]
    fn empty() {
        let collector = Collector::new(gray(5), Traversal::Interleaved);
        assert_eq!(collector.counts(), vec![vec![0; 5]]);
        assert!(collector.flags().is_empty());
    }
}
