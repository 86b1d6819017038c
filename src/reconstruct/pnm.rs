// SPDX-License-Identifier: Apache-2.0

//! Netpbm output: `P5` for one grey plane, `P6` for interleaved colour.

use super::{Image, Plane};
use crate::error::Result;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

pub const MAX: u8 = 255;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Gray,
    Color,
}

impl Format {
    pub fn magic(self) -> &'static str {
        match self {
            Self::Gray => "P5",
            Self::Color => "P6",
        }
    }
}

pub fn write(
    mut out: impl Write,
    format: Format,
    width: usize,
    height: usize,
    data: &[u8],
) -> Result<()> {
    writeln!(out, "{} {} {} {}", format.magic(), width, height, MAX)?;
    out.write_all(data)?;
    out.flush()?;
    Ok(())
}

pub fn write_plane(out: impl Write, plane: &Plane) -> Result<()> {
    write(out, Format::Gray, plane.width, plane.height, &plane.data)
}

/// Writes the interleaved colour image; needs exactly three planes.
pub fn write_color(out: impl Write, image: &Image) -> Result<()> {
    write(
        out,
        Format::Color,
        image.width(),
        image.height(),
        &image.interleave(),
    )
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path)?))
}

/// Writes `{name}-reconstruct-channel-{i}-gray.pgm` per plane, and
/// `{name}-reconstruct-color.ppm` for a three-plane image, into `dir`.
pub fn save(dir: &Path, name: &str, image: &Image) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    for (i, plane) in image.planes.iter().enumerate() {
        let path = dir.join(format!("{name}-reconstruct-channel-{i}-gray.pgm"));
        write_plane(create(&path)?, plane)?;
        written.push(path);
    }

    if image.planes.len() == 3 {
        let path = dir.join(format!("{name}-reconstruct-color.ppm"));
        write_color(create(&path)?, image)?;
        written.push(path);
    }

    for path in &written {
        info!("wrote {}", path.display());
    }

    Ok(written)
}
