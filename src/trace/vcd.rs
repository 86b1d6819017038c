// SPDX-License-Identifier: Apache-2.0

//! Page-access traces in Value Change Dump format.
//!
//! The profiler writes one single-bit wire `_N` per enclave page in the
//! `trace` scope (and optionally a 64-bit `erip` wire); every timestamp is
//! one single step. A rising edge on a page wire is one access, which is
//! what the replay feeds into the phase machine.

use super::phase::PhaseMachine;
use super::Collector;
use crate::error::{Error, Result};
use crate::pte::PageAccess;

use std::collections::HashMap;
use std::io::{BufRead, Write};

use vcd::{Command, IdCode, ScopeItem, TimescaleUnit, Value};

const SCOPE: &str = "trace";

fn trace_error(e: impl std::fmt::Display) -> Error {
    Error::Trace(e.to_string())
}

/// Replays a recorded trace through `machine`, reporting blocks to
/// `collector`. Returns the number of page accesses seen.
pub fn replay(
    input: impl BufRead,
    machine: &mut PhaseMachine,
    collector: &mut Collector,
) -> Result<u64> {
    let mut parser = vcd::Parser::new(input);
    let header = parser.parse_header().map_err(trace_error)?;

    let scope = header
        .find_scope(&[SCOPE])
        .ok_or_else(|| Error::Trace(format!("no `{SCOPE}` scope")))?;

    let wires: HashMap<IdCode, usize> = scope
        .items
        .iter()
        .filter_map(|item| match item {
            ScopeItem::Var(var) => var
                .reference
                .strip_prefix('_')
                .and_then(|page| page.parse().ok())
                .map(|page| (var.code, page)),
            _ => None,
        })
        .collect();

    if wires.is_empty() {
        return Err(Error::Trace("no page wires".into()));
    }

    let mut accesses = 0;
    for command in parser {
        if let Command::ChangeScalar(code, Value::V1) = command.map_err(trace_error)? {
            if let Some(&page) = wires.get(&code) {
                accesses += 1;
                machine.on_page(page, collector);
            }
        }
    }

    Ok(accesses)
}

/// Writes one timestamp per step, with a wire per enclave page.
pub struct Dumper<W: Write> {
    writer: vcd::Writer<W>,
    wires: Vec<IdCode>,
    state: Vec<bool>,
    erip: Option<IdCode>,
    time: u64,
}

impl<W: Write> Dumper<W> {
    pub fn new(output: W, pages: usize, erip: bool) -> Result<Self> {
        let mut writer = vcd::Writer::new(output);
        writer.timescale(1, TimescaleUnit::MS)?;
        writer.add_module(SCOPE)?;

        let wires = (0..pages)
            .map(|page| writer.add_wire(1, &format!("_{page}")))
            .collect::<std::io::Result<Vec<_>>>()?;

        let erip = match erip {
            true => Some(writer.add_wire(64, "erip")?),
            false => None,
        };

        writer.upscope()?;
        writer.enddefinitions()?;

        writer.timestamp(0)?;
        for &wire in &wires {
            writer.change_scalar(wire, Value::V0)?;
        }

        Ok(Self {
            writer,
            wires,
            state: vec![false; pages],
            erip,
            time: 0,
        })
    }

    /// Records the pages accessed during one step and advances time.
    ///
    /// Only wires whose value changed are written.
    pub fn step(&mut self, accesses: &[PageAccess], erip: Option<u64>) -> Result<()> {
        let mut now = vec![false; self.state.len()];
        for access in accesses.iter().filter(|a| a.read) {
            if let Some(slot) = now.get_mut(access.page) {
                *slot = true;
            }
        }

        for (page, (&was, &is)) in self.state.iter().zip(&now).enumerate() {
            if was != is {
                let value = if is { Value::V1 } else { Value::V0 };
                self.writer.change_scalar(self.wires[page], value)?;
            }
        }
        self.state = now;

        if let (Some(wire), Some(rip)) = (self.erip, erip) {
            let bits = (0..64)
                .rev()
                .map(|n| if (rip >> n) & 1 != 0 { Value::V1 } else { Value::V0 });
            self.writer.change_vector(wire, bits)?;
        }

        self.time += 1;
        self.writer.timestamp(self.time)?;
        Ok(())
    }

    pub fn steps(&self) -> u64 {
        self.time
    }
}
