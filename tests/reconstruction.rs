// SPDX-License-Identifier: Apache-2.0

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use sgx_step::config::PhaseConfig;
use sgx_step::pte::PageAccess;
use sgx_step::reconstruct::{self, pnm, Counts, Scale};
use sgx_step::trace::phase::{Phase, PhaseMachine};
use sgx_step::trace::vcd::{self, Dumper};
use sgx_step::trace::{Collector, Geometry, Observation, TraceEvent, Traversal};

/// Two rows of two blocks: counts 3 and 1, a row advance, then 2.
const DECODE: [usize; 15] = [
    54, 58, 63, 150, 151, 152, 59, 63, 160, 44, //
    58, 63, 170, 171, 59,
];

fn gray() -> Collector {
    let geometry = Geometry {
        planes: 1,
        width_blocks: 2,
        height_blocks: 2,
    };
    Collector::new(geometry, Traversal::Interleaved)
}

fn dump(path: &Path, pages: &[usize]) {
    let out = BufWriter::new(File::create(path).unwrap());
    let mut dumper = Dumper::new(out, 4400, false).unwrap();

    for &page in pages {
        let access = PageAccess {
            page,
            read: true,
            ..Default::default()
        };
        dumper.step(&[access], None).unwrap();
    }
    assert_eq!(dumper.steps(), pages.len() as u64);
}

fn header(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == b'\n').unwrap();
    std::str::from_utf8(&bytes[..end]).unwrap()
}

#[test]
fn replay_recorded_trace() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("decode.vcd");
    dump(&trace, &DECODE);

    let mut machine = PhaseMachine::new(&PhaseConfig::default(), false);
    let mut collector = gray();
    let input = BufReader::new(File::open(&trace).unwrap());
    let accesses = vcd::replay(input, &mut machine, &mut collector).unwrap();

    assert_eq!(accesses, DECODE.len() as u64);
    assert_eq!(machine.phase(), Phase::PreIdct);
    assert!(collector.flags().is_empty());
    assert_eq!(collector.counts(), vec![vec![3, 1, 2, 0]]);

    let counts = Counts::from_collector(&collector);
    let image = reconstruct::reconstruct(&counts, Scale::Max);
    assert_eq!(image.planes[0].data, vec![255, 85, 170, 0]);

    let written = pnm::save(dir.path(), "decode", &image).unwrap();
    assert_eq!(written.len(), 1);
    assert!(written[0].ends_with("decode-reconstruct-channel-0-gray.pgm"));

    let bytes = fs::read(&written[0]).unwrap();
    assert_eq!(header(&bytes), "P5 2 2 255");
    assert_eq!(&bytes[bytes.len() - 4..], &[255, 85, 170, 0]);
}

#[test]
fn trace_without_page_wires() {
    let text = "$timescale 1 ms $end\n$scope module trace $end\n$upscope $end\n$enddefinitions $end\n";
    let mut machine = PhaseMachine::new(&PhaseConfig::default(), false);
    let mut collector = gray();

    assert!(vcd::replay(text.as_bytes(), &mut machine, &mut collector).is_err());
    assert_eq!(machine.transitions(), 0);
}

#[test]
fn color_from_events() {
    let geometry = Geometry::from_pixels(16, 8, 3);
    let mut collector = Collector::new(geometry, Traversal::Interleaved);

    // One block per plane, round robin; the last one repeats a block.
    let events = [(0, 0, 4), (0, 1, 2), (0, 2, 0), (1, 0, 1), (1, 1, 0), (1, 2, 2), (1, 2, 9)];
    for (block, plane, count) in events {
        let _ = collector.push(TraceEvent {
            block,
            plane,
            observation: Observation::ZeroCount(count),
        });
    }
    assert_eq!(collector.flags().len(), 1);

    let counts = Counts::from_collector(&collector);
    assert_eq!(counts.planes, vec![vec![4, 1], vec![2, 0], vec![0, 2]]);

    let image = reconstruct::reconstruct(&counts, Scale::Max);
    let dir = tempfile::tempdir().unwrap();
    let written = pnm::save(dir.path(), "color", &image).unwrap();
    assert_eq!(written.len(), 4);

    let color = dir.path().join("color-reconstruct-color.ppm");
    let bytes = fs::read(color).unwrap();
    assert_eq!(header(&bytes), "P6 2 1 255");
    assert_eq!(&bytes[bytes.len() - 6..], &[255, 128, 0, 64, 0, 128]);
}
