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

use vm_session_common::mem::{PAGE_SIZE, PAGE_SIZE_USIZE};

use crate::mem::bitmap::{bit_index_iterator, clear_bit, first_clear_bit, is_bit_set, new_bitmap, set_bit};

/// Entries per translation table, identical for both formats.
pub const ENTRIES: usize = PAGE_SIZE_USIZE / 8;

/// One translation table.
pub type Table = [u64; ENTRIES];

/// Fixed-capacity array of translation tables at consecutive physical
/// pages starting at `phys_base`. Never grows.
pub struct TableArray {
    phys_base: u64,
    capacity: usize,
    tables: Vec<Option<Box<Table>>>,
    used: Vec<u64>,
}

impl TableArray {
    /// An array of `capacity` tables, all free
    pub fn new(phys_base: u64, capacity: usize) -> Self {
        Self {
            phys_base,
            capacity,
            tables: (0..capacity).map(|_| None).collect(),
            used: new_bitmap(capacity, false),
        }
    }

    /// Hands out a zeroed table and returns its physical address
    pub fn alloc(&mut self) -> Option<u64> {
        let idx = first_clear_bit(&self.used, self.capacity)?;
        set_bit(&mut self.used, idx);
        let slot = &mut self.tables[idx];
        match slot {
            Some(table) => table.fill(0),
            None => *slot = Some(Box::new([0; ENTRIES])),
        }
        Some(self.phys_base + idx as u64 * PAGE_SIZE)
    }

    /// Returns the table at `phys` to the array. Returns false if `phys`
    /// does not name an allocated table.
    pub fn free(&mut self, phys: u64) -> bool {
        match self.index(phys) {
            Some(idx) => clear_bit(&mut self.used, idx),
            None => false,
        }
    }

    /// The allocated table at `phys`
    pub fn get(&self, phys: u64) -> Option<&Table> {
        let idx = self.index(phys)?;
        self.tables[idx].as_deref()
    }

    /// The allocated table at `phys`
    pub fn get_mut(&mut self, phys: u64) -> Option<&mut Table> {
        let idx = self.index(phys)?;
        self.tables[idx].as_deref_mut()
    }

    /// Number of allocated tables
    pub fn in_use(&self) -> usize {
        bit_index_iterator(&self.used).count()
    }

    /// Maximum number of tables
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index(&self, phys: u64) -> Option<usize> {
        let offset = phys.checked_sub(self.phys_base)?;
        if offset % PAGE_SIZE != 0 {
            return None;
        }
        let idx = usize::try_from(offset / PAGE_SIZE).ok()?;
        (idx < self.capacity && is_bit_set(&self.used, idx)).then_some(idx)
    }
}

impl std::fmt::Debug for TableArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableArray")
            .field("phys_base", &format_args!("{:#x}", self.phys_base))
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}
