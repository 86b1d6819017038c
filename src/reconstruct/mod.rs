// SPDX-License-Identifier: Apache-2.0

//! Image reconstruction from per-block observations.
//!
//! Every block becomes one pixel. A block's intensity is its zero count
//! scaled against the largest count of the whole image, so brightness is
//! comparable across colour planes.

pub mod pnm;

use crate::trace::{Collector, Geometry, TraceEvent};

use serde::{Deserialize, Serialize};

/// `round(count * 255 / max)`, rounding halves up. A zero `max` maps every
/// block to zero.
pub fn intensity(count: u32, max: u32) -> u8 {
    if max == 0 {
        return 0;
    }

    let count = count.min(max) as u64;
    let max = max as u64;
    ((count * 255 + max / 2) / max) as u8
}

/// How counts are mapped onto the byte range.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Scale {
    /// `0..=max` onto `0..=255`.
    #[default]
    Max,
    /// `min..=max` onto `0..=255`.
    MinMax,
    /// `min..=max` onto `255..=0`.
    InvertedMinMax,
}

/// Block-indexed pixels of one colour plane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

/// Raw per-plane counts, as dumped for offline analysis.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub width: usize,
    pub height: usize,
    pub planes: Vec<Vec<u32>>,
    /// Raw faults, attributed to the block being decoded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faults: Vec<TraceEvent>,
}

impl Counts {
    pub fn from_collector(collector: &Collector) -> Self {
        let Geometry {
            width_blocks,
            height_blocks,
            ..
        } = collector.geometry();

        Self {
            width: width_blocks,
            height: height_blocks,
            planes: collector.counts(),
            faults: collector.faults().to_vec(),
        }
    }

    pub fn max(&self) -> u32 {
        self.planes.iter().flatten().copied().max().unwrap_or(0)
    }

    pub fn min(&self) -> u32 {
        self.planes.iter().flatten().copied().min().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    pub planes: Vec<Plane>,
}

impl Image {
    pub fn width(&self) -> usize {
        self.planes.first().map(|p| p.width).unwrap_or(0)
    }

    pub fn height(&self) -> usize {
        self.planes.first().map(|p| p.height).unwrap_or(0)
    }

    /// Channel bytes of every block, plane by plane.
    pub fn interleave(&self) -> Vec<u8> {
        let pixels = self.width() * self.height();
        let mut out = Vec::with_capacity(pixels * self.planes.len());
        for i in 0..pixels {
            for plane in &self.planes {
                out.push(plane.data.get(i).copied().unwrap_or(0));
            }
        }
        out
    }
}

/// Scales `counts` into an image with a single maximum across planes.
pub fn reconstruct(counts: &Counts, scale: Scale) -> Image {
    let (min, max) = match scale {
        Scale::Max => (0, counts.max()),
        Scale::MinMax | Scale::InvertedMinMax => (counts.min(), counts.max()),
    };

    let pixels = counts.width * counts.height;
    let planes = counts
        .planes
        .iter()
        .map(|plane| {
            let mut data: Vec<u8> = plane
                .iter()
                .take(pixels)
                .map(|&count| intensity(count.saturating_sub(min), max - min))
                .collect();
            data.resize(pixels, 0);

            if scale == Scale::InvertedMinMax {
                data.iter_mut().for_each(|v| *v = 255 - *v);
            }

            Plane {
                width: counts.width,
                height: counts.height,
                data,
            }
        })
        .collect();

    Image { planes }
}
