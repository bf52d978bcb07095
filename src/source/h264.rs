//! H.264 Annex-B parsing
//!
//! Encoders hand us H.264 as an Annex-B elementary stream: NAL units
//! separated by `00 00 01` or `00 00 00 01` start codes. Frames are
//! distributed as whole access units (one coded picture plus any parameter
//! sets, SEI and delimiter preceding it), start codes included.
//!
//! NAL header:
//! ```text
//! +---+-------+----------+
//! | F |  NRI  |   Type   |
//! | 1 |   2   |    5     |
//! +---+-------+----------+
//! ```

use bytes::Bytes;

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice = 1,
    /// Slice data partition A
    SlicePartA = 2,
    /// Slice data partition B
    SlicePartB = 3,
    /// Slice data partition C
    SlicePartC = 4,
    /// IDR slice (keyframe)
    Idr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
    /// End of sequence
    EndSeq = 10,
    /// End of stream
    EndStream = 11,
    /// Filler data
    Filler = 12,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            2 => Some(NaluType::SlicePartA),
            3 => Some(NaluType::SlicePartB),
            4 => Some(NaluType::SlicePartC),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            10 => Some(NaluType::EndSeq),
            11 => Some(NaluType::EndStream),
            12 => Some(NaluType::Filler),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NaluType::Idr)
    }

    /// Coded slice data
    pub fn is_vcl(&self) -> bool {
        matches!(
            self,
            NaluType::Slice
                | NaluType::SlicePartA
                | NaluType::SlicePartB
                | NaluType::SlicePartC
                | NaluType::Idr
        )
    }

    /// NAL types that may only appear before the first slice of an
    /// access unit
    fn starts_access_unit(&self) -> bool {
        matches!(self, NaluType::Sei | NaluType::Sps | NaluType::Pps | NaluType::Aud)
    }
}

/// A NAL unit located in an Annex-B buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluSpan {
    /// Offset of the start code
    pub start: usize,
    /// Offset of the NAL header byte
    pub payload: usize,
    /// End of the NAL unit (exclusive)
    pub end: usize,
}

/// Iterates over the NAL units of an Annex-B buffer
pub struct AnnexBIterator<'a> {
    data: &'a [u8],
    next: Option<(usize, usize)>,
}

impl<'a> AnnexBIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next: find_start_code(data, 0),
        }
    }
}

impl<'a> Iterator for AnnexBIterator<'a> {
    type Item = NaluSpan;

    fn next(&mut self) -> Option<Self::Item> {
        let (start, payload) = self.next?;
        self.next = find_start_code(self.data, payload);

        let end = match self.next {
            Some((next_start, _)) => next_start,
            None => self.data.len(),
        };

        Some(NaluSpan {
            start,
            payload,
            end,
        })
    }
}

/// Find the next start code at or after `from`: (start code offset, NAL offset)
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                // Fold a preceding zero into a 4-byte start code
                let start = if i > from && data[i - 1] == 0 { i - 1 } else { i };
                return Some((start, i + 3));
            }
            if data[i + 2] == 0 {
                i += 1;
                continue;
            }
        }
        i += 1;
    }
    None
}

/// One coded picture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Annex-B bytes, start codes included
    pub data: Bytes,
    pub keyframe: bool,
}

/// Split an Annex-B stream into access units
///
/// A new unit starts at an AUD/SPS/PPS/SEI, or at a slice whose
/// `first_mb_in_slice` is zero, once the current unit already holds a
/// slice. Leading bytes before the first start code are discarded.
pub fn split_access_units(stream: &Bytes) -> Vec<AccessUnit> {
    let mut units = Vec::new();
    let mut unit_start: Option<usize> = None;
    let mut has_vcl = false;
    let mut keyframe = false;

    for nalu in AnnexBIterator::new(stream) {
        let Some(kind) = stream.get(nalu.payload).copied().and_then(NaluType::from_byte) else {
            unit_start.get_or_insert(nalu.start);
            continue;
        };

        let new_picture = kind.is_vcl() && first_mb_is_zero(&stream[nalu.payload..nalu.end]);
        if has_vcl && (kind.starts_access_unit() || new_picture) {
            if let Some(start) = unit_start {
                units.push(AccessUnit {
                    data: stream.slice(start..nalu.start),
                    keyframe,
                });
            }
            unit_start = None;
            has_vcl = false;
            keyframe = false;
        }

        unit_start.get_or_insert(nalu.start);
        if kind.is_vcl() {
            has_vcl = true;
            keyframe |= kind.is_keyframe();
        }
    }

    if let (Some(start), true) = (unit_start, has_vcl) {
        units.push(AccessUnit {
            data: stream.slice(start..),
            keyframe,
        });
    }
    units
}

/// `first_mb_in_slice` is ue(v); a value of zero encodes as a single 1 bit
fn first_mb_is_zero(nalu: &[u8]) -> bool {
    nalu.get(1).is_some_and(|b| b & 0x80 != 0)
}
