// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A bit reader for coded video bitstreams. It properly handles
//! emulation-prevention bytes and stop bits, and every read operation
//! returns a typed error on range or marker-bit violations instead of
//! panicking or silently truncating.

use std::io::Cursor;

use bytes::Buf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NaluReaderError>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NaluReaderError {
    #[error("reading past the end of the bitstream")]
    OutOfBits,
    #[error("more than 31 bits requested at once")]
    Overflow,
    #[error("value does not fit the requested type")]
    Conversion,
    #[error("invalid Exp-Golomb coding")]
    InvalidExpGolomb,
    #[error("marker bit was not set")]
    MissingMarkerBit,
}

/// A bit reader over one NAL unit payload (or, with emulation prevention
/// disabled, any start-code-delimited payload).
pub struct NaluReader<T> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<T>,
    /// Contents of the current byte. First unread bit starting at position
    /// 8 - num_remaining_bits_in_curr_byte.
    curr_byte: u32,
    /// Number of bits remaining in `curr_byte`.
    num_remaining_bits_in_curr_byte: usize,
    /// Used in emulation-prevention-byte detection.
    prev_two_bytes: u32,
    /// Number of emulation-prevention bytes (i.e. 0x000003) found.
    num_epb: usize,
    /// Whether 0x000003 sequences are unescaped while reading. MPEG-2
    /// payloads carry no emulation prevention.
    strip_emulation_bytes: bool,
}

impl<T: AsRef<[u8]>> NaluReader<T> {
    pub fn new(data: T) -> Self {
        Self::with_emulation_prevention(data, true)
    }

    pub fn with_emulation_prevention(data: T, strip_emulation_bytes: bool) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: 0,
            num_remaining_bits_in_curr_byte: 0,
            prev_two_bytes: 0xffff,
            num_epb: 0,
            strip_emulation_bytes,
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U> {
        if num_bits > 31 {
            return Err(NaluReaderError::Overflow);
        }

        let mut bits_left = num_bits;
        let mut out = 0u32;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        U::try_from(out).map_err(|_| NaluReaderError::Conversion)
    }

    /// Skip up to 31 bits from the stream.
    pub fn skip_bits(&mut self, num_bits: usize) -> Result<()> {
        self.read_bits::<u32>(num_bits)?;
        Ok(())
    }

    /// Read a bit that the syntax requires to be set.
    pub fn read_marker_bit(&mut self) -> Result<()> {
        if self.read_bit()? {
            Ok(())
        } else {
            Err(NaluReaderError::MissingMarkerBit)
        }
    }

    /// Returns the amount of bits left in the stream.
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Returns the number of emulation-prevention bytes read so far.
    pub fn num_epb(&self) -> usize {
        self.num_epb
    }

    /// Whether the stream still has RBSP data, implementing
    /// more_rbsp_data(): everything before the stop bit counts.
    pub fn has_more_rbsp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            return false;
        }

        // If the next bit is the stop bit, only unset bits may follow until
        // the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        let data = self.data.chunk();
        for byte in &data[0..self.data.remaining()] {
            if *byte != 0 {
                return true;
            }
        }

        self.data.advance(self.data.remaining());
        false
    }

    /// Read an unsigned Exp-Golomb coded value (ue(v)).
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> Result<U> {
        let mut num_bits = 0;

        while !self.read_bit()? {
            num_bits += 1;
            if num_bits > 31 {
                return Err(NaluReaderError::InvalidExpGolomb);
            }
        }

        if num_bits == 31 {
            // The all-ones value does not fit an u32.
            return Err(NaluReaderError::InvalidExpGolomb);
        }

        let rest: u32 = self.read_bits(num_bits)?;
        let value = (1u32 << num_bits) - 1 + rest;
        U::try_from(value).map_err(|_| NaluReaderError::Conversion)
    }

    /// Read a ue(v) value, checking it lies within `range`.
    pub fn read_ue_bounded(&mut self, min: u32, max: u32) -> Result<u32> {
        let value: u32 = self.read_ue()?;
        if value < min || value > max {
            Err(NaluReaderError::Conversion)
        } else {
            Ok(value)
        }
    }

    /// Read a signed Exp-Golomb coded value (se(v)).
    pub fn read_se(&mut self) -> Result<i32> {
        let ue: u32 = self.read_ue()?;

        if ue % 2 == 0 {
            Ok(-((ue / 2) as i32))
        } else {
            Ok((ue / 2) as i32 + 1)
        }
    }

    fn update_curr_byte(&mut self) -> Result<()> {
        if self.data.remaining() == 0 {
            return Err(NaluReaderError::OutOfBits);
        }

        let mut byte = self.data.get_u8();

        if self.strip_emulation_bytes {
            if self.prev_two_bytes & 0xffff == 0 && byte == 0x03 {
                // We found an epb: skip it and read the next byte instead.
                if self.data.remaining() == 0 {
                    return Err(NaluReaderError::OutOfBits);
                }
                self.num_epb += 1;
                byte = self.data.get_u8();
                self.prev_two_bytes = 0xffff;
            }
            self.prev_two_bytes = (self.prev_two_bytes << 8) | u32::from(byte);
        }

        self.curr_byte = u32::from(byte);
        self.num_remaining_bits_in_curr_byte = 8;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_bits_and_bit() {
        // 0b1010_1100 0b0101_0011
        let mut reader = NaluReader::new([0xac, 0x53]);
        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_bits::<u32>(3).unwrap(), 0b010);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0b1100_0101);
        assert_eq!(reader.read_bits::<u32>(4).unwrap(), 0b0011);
        assert_eq!(reader.read_bits::<u32>(1), Err(NaluReaderError::OutOfBits));
    }

    #[test]
    fn read_ue_codings() {
        // ue codewords: 1 -> 0, 010 -> 1, 011 -> 2, 00100 -> 3.
        // 1 010 011 00100 -> 0b1010_0110_0100_0000
        let mut reader = NaluReader::new([0b1010_0110, 0b0100_0000]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 1);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 2);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 3);
    }

    #[test]
    fn read_se_codings() {
        // se mapping of ue values: 0->0, 1->1, 2->-1, 3->2, 4->-2.
        let mut reader = NaluReader::new([0b1010_0110, 0b0100_0010, 0b1000_0000]);
        assert_eq!(reader.read_se().unwrap(), 0);
        assert_eq!(reader.read_se().unwrap(), 1);
        assert_eq!(reader.read_se().unwrap(), -1);
        assert_eq!(reader.read_se().unwrap(), 2);
        assert_eq!(reader.read_se().unwrap(), -2);
    }

    #[test]
    fn emulation_prevention_bytes_are_stripped() {
        let mut reader = NaluReader::new([0x00, 0x00, 0x03, 0x01]);
        assert_eq!(reader.read_bits::<u32>(16).unwrap(), 0);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 1);
        assert_eq!(reader.num_epb(), 1);

        let mut raw = NaluReader::with_emulation_prevention([0x00, 0x00, 0x03, 0x01], false);
        assert_eq!(raw.read_bits::<u32>(16).unwrap(), 0);
        assert_eq!(raw.read_bits::<u32>(8).unwrap(), 3);
    }

    #[test]
    fn more_rbsp_data_sees_the_stop_bit() {
        // One ue(0) followed by the stop bit and alignment zeros.
        let mut reader = NaluReader::new([0b1100_0000]);
        assert!(reader.has_more_rbsp_data());
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert!(!reader.has_more_rbsp_data());
    }

    #[test]
    fn marker_bit_violation() {
        let mut reader = NaluReader::new([0b0100_0000]);
        assert_eq!(reader.read_marker_bit(), Err(NaluReaderError::MissingMarkerBit));
        assert!(reader.read_marker_bit().is_ok());
    }
}
