// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use crate::error::Error;
use std::convert::From;
use std::fmt::{Debug, Display, Formatter};

/// Type for interpreting `Block1` and `Block2` option values.
///
/// The wrapped value packs the block number (`NUM`), the more flag (`M`),
/// and the block size exponent (`SZX`, block size `2^(SZX+4)` bytes) as
/// `NUM << 4 | M << 3 | SZX`.
#[derive(Copy, Clone, Eq, Ord, Hash, PartialOrd, PartialEq)]
pub struct BlockInfo(pub u32);

impl BlockInfo {
    const MORE_FLAG: u32 = 0b1000;

    /// Maximum legal value for `num`.
    pub const NUM_MAX: u32 = (1 << 20) - 1;

    const SZX_RESERVED: u8 = 0b0111;

    /// Maximum legal value for `szx`.
    pub const SZX_MAX: u8 = Self::SZX_RESERVED - 1;

    /// Constructs a new `BlockInfo` from the number, more flag, and size exponent.
    pub fn new(num: u32, m: bool, szx: u8) -> Option<BlockInfo> {
        if num > Self::NUM_MAX || szx > Self::SZX_MAX {
            None
        } else {
            Some(BlockInfo((num << 4) + ((m as u32) << 3) + szx as u32))
        }
    }

    /// Block number value.
    #[inline]
    pub fn num(&self) -> u32 {
        self.0 >> 4
    }

    /// More flag value. If set, there are more blocks to follow.
    #[inline]
    pub fn more_flag(&self) -> bool {
        (self.0 & Self::MORE_FLAG) == Self::MORE_FLAG
    }

    /// Block size exponent field value.
    #[inline]
    pub fn szx(&self) -> u8 {
        self.0 as u8 & 0b111
    }

    /// The offset (in bytes) that this block starts at.
    #[inline]
    pub fn offset(&self) -> usize {
        let val = self.0 as usize;
        (val & !0xF) << (val & 0b0111)
    }

    /// The length of this block, in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        1 << (self.szx() as usize + 4)
    }

    /// Checks the validity of the contained value.
    pub fn is_invalid(&self) -> bool {
        (self.num() > Self::NUM_MAX) || self.szx() == Self::SZX_RESERVED
    }

    /// Checks the contained value for validity and, if valid, returns it in an `Option`.
    pub fn valid(self) -> Option<BlockInfo> {
        if self.is_invalid() {
            None
        } else {
            Some(self)
        }
    }

    /// Calculates what the next block will be, if any.
    pub fn next(&self) -> Option<BlockInfo> {
        if self.num() < Self::NUM_MAX {
            BlockInfo(self.0 + 0x10).valid()
        } else {
            None
        }
    }

    /// Calculates a smaller block size that maintains this block's offset.
    pub fn smaller(&self) -> Option<BlockInfo> {
        let szx = self.szx();
        if szx != Self::SZX_RESERVED && szx > 0 {
            Self::new(self.num() * 2, self.more_flag(), szx - 1)
        } else {
            None
        }
    }

    /// Returns the block covering this block's offset at a (valid) smaller
    /// size exponent.
    pub fn at_szx(&self, szx: u8) -> Option<BlockInfo> {
        if szx > Self::SZX_MAX || szx > self.szx() {
            return None;
        }
        let num = (self.offset() >> (szx as usize + 4)) as u32;
        Self::new(num, self.more_flag(), szx)
    }

    /// Returns this `BlockInfo`'s value *with* the more flag set.
    pub fn with_more_flag(&self) -> BlockInfo {
        BlockInfo(self.0 | Self::MORE_FLAG)
    }

    /// Returns this `BlockInfo`'s value *without* the more flag set.
    pub fn without_more_flag(&self) -> BlockInfo {
        BlockInfo(self.0 & !Self::MORE_FLAG)
    }
}

impl From<u32> for BlockInfo {
    fn from(x: u32) -> Self {
        BlockInfo(x)
    }
}

impl Default for BlockInfo {
    /// Returns a block info with an offset of zero and a block size of 1024.
    fn default() -> Self {
        BlockInfo(6)
    }
}

impl Display for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}/{}/{}", self.num(), self.more_flag() as u8, self.len())?;
        if self.is_invalid() {
            f.write_str("(!)")
        } else {
            Ok(())
        }
    }
}

impl Debug for BlockInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "BlockInfo(0x{:06X}/", self.0)?;
        Display::fmt(self, f)?;
        f.write_str(")")
    }
}

/// Slices one block out of a complete payload for the sending side.
///
/// Returns the slice for the given block along with the more flag that
/// belongs on its Block option, or `None` when the block's offset lies past
/// the end of the payload.
pub fn block_slice(payload: &[u8], block: BlockInfo) -> Option<(&[u8], bool)> {
    let start = block.offset();
    if start >= payload.len() && !(start == 0 && payload.is_empty()) {
        return None;
    }
    let end = payload.len().min(start + block.len());
    Some((&payload[start..end], end < payload.len()))
}

/// Accumulator for reassembling a block-wise transfer.
///
/// Works for both `Block1` (request payload) and `Block2` (response payload)
/// directions: blocks are fed in order and the assembled payload is taken
/// out once the block without the more flag has arrived.
#[derive(Debug, Default)]
pub struct BlockAssembler {
    buffer: Vec<u8>,
    next_num: u32,
    szx: Option<u8>,
    is_finished: bool,
}

impl BlockAssembler {
    /// Creates a new, empty assembler.
    pub fn new() -> BlockAssembler {
        Default::default()
    }

    /// The block this assembler wants next.
    pub fn next_block(&self) -> BlockInfo {
        BlockInfo::new(self.next_num, false, self.szx.unwrap_or(BlockInfo::SZX_MAX))
            .expect("next block number out of range")
    }

    /// Returns true if the final block has been fed.
    pub fn is_finished(&self) -> bool {
        self.is_finished
    }

    /// Number of payload bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true when nothing has been fed yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Feeds one block. Returns `Ok(true)` once the transfer is complete.
    ///
    /// Every block except the last must carry exactly `2^(SZX+4)` bytes, the
    /// size exponent may not change mid-transfer, and blocks must arrive in
    /// order; duplicates of already-assembled blocks are ignored.
    pub fn feed(&mut self, block: BlockInfo, payload: &[u8]) -> Result<bool, Error> {
        if self.is_finished {
            return Ok(true);
        }

        match self.szx {
            None => self.szx = Some(block.szx()),
            Some(szx) if szx != block.szx() => return Err(Error::Format),
            Some(_) => {}
        }

        if block.num() < self.next_num {
            // A retransmission of a block we already have.
            return Ok(false);
        }

        if block.num() > self.next_num {
            return Err(Error::Format);
        }

        if block.more_flag() {
            if payload.len() != block.len() {
                return Err(Error::Format);
            }
            self.next_num += 1;
            if self.next_num > BlockInfo::NUM_MAX {
                return Err(Error::Format);
            }
        } else {
            if payload.len() > block.len() {
                return Err(Error::Format);
            }
            self.is_finished = true;
        }

        self.buffer.extend_from_slice(payload);

        Ok(self.is_finished)
    }

    /// Consumes the assembler and returns the accumulated payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let block = BlockInfo::default();
        assert_eq!(false, block.more_flag());
        assert_eq!(6, block.szx());
        assert_eq!(0, block.num());
        assert_eq!(1024, block.len());
        assert_eq!(0, block.offset());
        assert_eq!(false, block.is_invalid());
    }

    #[test]
    fn next() {
        let block = BlockInfo::default().next().unwrap();
        assert_eq!(6, block.szx());
        assert_eq!(1, block.num());
        assert_eq!(1024, block.offset());
    }

    #[test]
    fn smaller() {
        let block = BlockInfo::default().next().unwrap().smaller().unwrap();
        assert_eq!(5, block.szx());
        assert_eq!(2, block.num());
        assert_eq!(512, block.len());
        assert_eq!(1024, block.offset());

        let smaller = block.smaller().unwrap();
        assert_eq!(256, smaller.len());
        assert_eq!(block.offset(), smaller.offset());
    }

    #[test]
    fn at_szx_keeps_offset() {
        let block = BlockInfo::new(2, false, 6).unwrap();
        let renegotiated = block.at_szx(4).unwrap();
        assert_eq!(renegotiated.offset(), block.offset());
        assert_eq!(renegotiated.num(), 32);
        assert_eq!(block.at_szx(7), None);
    }

    #[test]
    fn validity() {
        assert_eq!(BlockInfo(0).valid(), Some(BlockInfo(0)));
        assert_eq!(BlockInfo(!0).valid(), None);
        assert_eq!(BlockInfo(BlockInfo::SZX_RESERVED as u32).valid(), None);

        let block = BlockInfo::new(BlockInfo::NUM_MAX, true, 6).unwrap();
        assert_eq!(block.next(), None);
    }

    #[test]
    fn slicing() {
        let payload: Vec<u8> = (0..100u8).collect();

        let (chunk, more) = block_slice(&payload, BlockInfo::new(0, false, 2).unwrap()).unwrap();
        assert_eq!(chunk, &payload[..64]);
        assert!(more);

        let (chunk, more) = block_slice(&payload, BlockInfo::new(1, false, 2).unwrap()).unwrap();
        assert_eq!(chunk, &payload[64..]);
        assert!(!more);

        assert!(block_slice(&payload, BlockInfo::new(2, false, 2).unwrap()).is_none());
    }

    #[test]
    fn assemble_in_order() {
        // A 1000-byte payload at SZX=2 (64-byte blocks) splits into fifteen
        // full blocks and a 40-byte tail.
        let payload: Vec<u8> = (0..1000u32).map(|x| x as u8).collect();
        let mut assembler = BlockAssembler::new();

        for num in 0..16u32 {
            let block = BlockInfo::new(num, false, 2).unwrap();
            let (chunk, more) = block_slice(&payload, block).unwrap();
            assert_eq!(more, num < 15);
            let block = if more { block.with_more_flag() } else { block };
            let done = assembler.feed(block, chunk).unwrap();
            assert_eq!(done, num == 15);
        }

        assert_eq!(assembler.into_payload(), payload);
    }

    #[test]
    fn assemble_rejects_gaps_and_mixed_szx() {
        let mut assembler = BlockAssembler::new();
        assembler
            .feed(BlockInfo::new(0, true, 2).unwrap(), &[0; 64])
            .unwrap();

        // Skipping ahead is an error.
        assert_eq!(
            assembler.feed(BlockInfo::new(2, true, 2).unwrap(), &[0; 64]),
            Err(Error::Format)
        );

        // Changing the size exponent mid-transfer is an error.
        assert_eq!(
            assembler.feed(BlockInfo::new(1, true, 3).unwrap(), &[0; 128]),
            Err(Error::Format)
        );

        // Retransmits of already-assembled blocks are ignored.
        assert_eq!(
            assembler.feed(BlockInfo::new(0, true, 2).unwrap(), &[0; 64]),
            Ok(false)
        );

        // A short intermediate block is an error.
        assert_eq!(
            assembler.feed(BlockInfo::new(1, true, 2).unwrap(), &[0; 10]),
            Err(Error::Format)
        );
    }
}
