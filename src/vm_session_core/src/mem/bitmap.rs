/*
Copyright 2024 The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

// Contains various helper functions for dealing with bitmaps.

/// Returns a new bitmap able to hold `num_bits` bits. If `init_set` is true, all bits are set,
/// otherwise all bits are clear.
pub(crate) fn new_bitmap(num_bits: usize, init_set: bool) -> Vec<u64> {
    let num_blocks = num_bits.div_ceil(64);
    match init_set {
        false => vec![0; num_blocks],
        true => {
            let mut bitmap = vec![!0u64; num_blocks];
            let num_unused_bits = num_blocks * 64 - num_bits;
            // bits past the end must stay clear
            if let Some(last_block) = bitmap.last_mut() {
                *last_block >>= num_unused_bits;
            }
            bitmap
        }
    }
}

/// Whether bit `idx` is set. Bits beyond the bitmap read as clear.
pub(crate) fn is_bit_set(bitmap: &[u64], idx: usize) -> bool {
    bitmap
        .get(idx / 64)
        .is_some_and(|block| block & (1 << (idx % 64)) != 0)
}

/// Sets bit `idx`. Returns false if it was already set or out of range.
pub(crate) fn set_bit(bitmap: &mut [u64], idx: usize) -> bool {
    match bitmap.get_mut(idx / 64) {
        Some(block) if *block & (1 << (idx % 64)) == 0 => {
            *block |= 1 << (idx % 64);
            true
        }
        _ => false,
    }
}

/// Clears bit `idx`. Returns false if it was already clear or out of range.
pub(crate) fn clear_bit(bitmap: &mut [u64], idx: usize) -> bool {
    match bitmap.get_mut(idx / 64) {
        Some(block) if *block & (1 << (idx % 64)) != 0 => {
            *block &= !(1 << (idx % 64));
            true
        }
        _ => false,
    }
}

/// Returns the lowest clear bit below `num_bits`.
pub(crate) fn first_clear_bit(bitmap: &[u64], num_bits: usize) -> Option<usize> {
    bitmap
        .iter()
        .enumerate()
        .find(|(_, block)| **block != !0u64)
        .map(|(block_index, block)| block_index * 64 + block.trailing_ones() as usize)
        .filter(|idx| *idx < num_bits)
}

// Used as a helper struct to implement an iterator on.
struct SetBitIndices<'a> {
    bitmap: &'a [u64],
    block_index: usize, // one block is 1 u64, which is 64 bits
    current: u64,       // the current block we are iterating over, or 0 if first iteration
}

/// Iterates over the zero-based indices of the set bits in the given bitmap.
pub(crate) fn bit_index_iterator(bitmap: &[u64]) -> impl Iterator<Item = usize> + '_ {
    SetBitIndices {
        bitmap,
        block_index: 0,
        current: 0,
    }
}

impl Iterator for SetBitIndices<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current == 0 {
            // will always enter this on first iteration because current is initialized to 0
            if self.block_index >= self.bitmap.len() {
                return None;
            }
            self.current = self.bitmap[self.block_index];
            self.block_index += 1;
        }
        let trailing_zeros = self.current.trailing_zeros();
        self.current &= self.current - 1; // Clear the least significant set bit
        Some((self.block_index - 1) * 64 + trailing_zeros as usize) // block_index guaranteed to be > 0 at this point
    }
}
