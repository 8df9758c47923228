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

use std::marker::PhantomData;

use vm_session_common::kernel::DEFAULT_TRANSLATION_TABLE_MAX;
use vm_session_common::mem::{is_page_aligned, PAGE_SHIFT, PAGE_SIZE};

use super::allocator::{Table, TableArray, ENTRIES};
use super::{PageFlags, PageTableAdapter, Translation, TranslationError};

/// Number of table levels walked for a guest-physical address.
pub const LEVELS: usize = 4;

/// Highest level whose entries may be leaves (1 GiB).
const MAX_LEAF_LEVEL: usize = 2;

/// End of the guest-physical range four levels can translate.
pub const ADDRESS_SPACE_END: u64 = 1 << 48;

/// End of the host-physical range an entry can reference.
const PHYS_ADDRESS_END: u64 = 1 << 52;

/// Address bits of an entry.
pub const ADDRESS_MASK: u64 = (PHYS_ADDRESS_END - 1) & !(PAGE_SIZE - 1);

const INDEX_BITS: u64 = ENTRIES.trailing_zeros() as u64;

/// Bytes translated by one entry at `level`
pub const fn level_size(level: usize) -> u64 {
    PAGE_SIZE << (INDEX_BITS * level as u64)
}

fn index(addr: u64, level: usize) -> usize {
    ((addr >> (PAGE_SHIFT + INDEX_BITS * level as u64)) & (ENTRIES as u64 - 1)) as usize
}

/// Encoding of the entries of one page-table format.
pub trait EntryFormat: Send + Sync + 'static {
    /// Short name used in diagnostics
    const NAME: &'static str;

    /// Entry referencing the next-level table at `phys`
    fn table(phys: u64) -> u64;

    /// Leaf entry mapping `phys`. `large` is set for leaves above the last
    /// level.
    fn leaf(phys: u64, flags: PageFlags, large: bool) -> u64;

    /// Whether the entry is in use
    fn present(entry: u64) -> bool;

    /// Whether an entry above the last level is a leaf
    fn large(entry: u64) -> bool;

    /// Attributes of a leaf entry
    fn flags(entry: u64) -> PageFlags;

    /// Physical address referenced by the entry
    fn address(entry: u64) -> u64 {
        entry & ADDRESS_MASK
    }
}

/// A four-level translation table in format `F`.
///
/// The root lives at the start of the physical storage handed to
/// [`TranslationTable::new`]; all further tables come from a fixed array
/// directly behind it.
pub struct TranslationTable<F: EntryFormat> {
    root: Box<Table>,
    root_phys: u64,
    nodes: TableArray,
    _format: PhantomData<F>,
}

impl<F: EntryFormat> TranslationTable<F> {
    /// An empty table with room for `capacity` tables below the root
    pub fn with_capacity(phys_base: u64, capacity: usize) -> Self {
        Self {
            root: Box::new([0; ENTRIES]),
            root_phys: phys_base,
            nodes: TableArray::new(phys_base + PAGE_SIZE, capacity),
            _format: PhantomData,
        }
    }

    fn table(&self, phys: u64) -> Option<&Table> {
        if phys == self.root_phys {
            Some(&self.root)
        } else {
            self.nodes.get(phys)
        }
    }

    fn table_mut(&mut self, phys: u64) -> Option<&mut Table> {
        if phys == self.root_phys {
            Some(&mut self.root)
        } else {
            self.nodes.get_mut(phys)
        }
    }

    fn entry(&self, table: u64, idx: usize) -> Option<u64> {
        self.table(table).map(|t| t[idx])
    }

    fn set_entry(&mut self, table: u64, idx: usize, value: u64) {
        if let Some(t) = self.table_mut(table) {
            t[idx] = value;
        }
    }

    /// Inserts one leaf, or accepts an existing one, for `va` and returns
    /// how many bytes of the request it covers.
    fn insert_leaf(
        &mut self,
        va: u64,
        pa: u64,
        remaining: u64,
        flags: PageFlags,
    ) -> Result<u64, TranslationError> {
        let mut table = self.root_phys;
        let mut level = LEVELS - 1;
        loop {
            let size = level_size(level);
            let idx = index(va, level);
            let entry = self
                .entry(table, idx)
                .ok_or(TranslationError::InvalidMapping)?;
            let present = F::present(entry);

            if present && (level == 0 || F::large(entry)) {
                let offset = va & (size - 1);
                let same_target = F::address(entry) + offset == pa;
                let same_flags = F::flags(entry) == F::flags(F::leaf(0, flags, level > 0));
                if same_target && same_flags {
                    return Ok((size - offset).min(remaining));
                }
                return Err(TranslationError::InvalidMapping);
            }

            let fits = level == 0
                || (level <= MAX_LEAF_LEVEL
                    && va % size == 0
                    && pa % size == 0
                    && remaining >= size);
            if fits && !present {
                self.set_entry(table, idx, F::leaf(pa, flags, level > 0));
                return Ok(size);
            }

            table = if present {
                F::address(entry)
            } else {
                let child = self.nodes.alloc().ok_or(TranslationError::OutOfTables)?;
                self.set_entry(table, idx, F::table(child));
                child
            };
            level = level
                .checked_sub(1)
                .ok_or(TranslationError::InvalidMapping)?;
        }
    }

    fn remove_range(&mut self, table: u64, level: usize, start: u64, end: u64) {
        let size = level_size(level);
        let mut va = start;
        while va < end {
            let idx = index(va, level);
            let chunk_end = ((va & !(size - 1)) + size).min(end);
            if let Some(entry) = self.entry(table, idx).filter(|e| F::present(*e)) {
                if level == 0 || F::large(entry) {
                    // large leaves go as a whole
                    self.set_entry(table, idx, 0);
                } else {
                    let child = F::address(entry);
                    self.remove_range(child, level - 1, va, chunk_end);
                    let empty = self
                        .nodes
                        .get(child)
                        .is_some_and(|t| t.iter().all(|e| *e == 0));
                    if empty {
                        self.set_entry(table, idx, 0);
                        self.nodes.free(child);
                    }
                }
            }
            va = chunk_end;
        }
    }
}

impl<F: EntryFormat> PageTableAdapter for TranslationTable<F> {
    fn new(phys_base: u64) -> Self {
        Self::with_capacity(phys_base, DEFAULT_TRANSLATION_TABLE_MAX)
    }

    /// Uses 1 GiB and 2 MiB leaves where alignment and size allow. On
    /// failure the translations inserted so far stay in place.
    fn insert_translation(
        &mut self,
        vm_addr: u64,
        phys_addr: u64,
        size: u64,
        flags: PageFlags,
    ) -> Result<(), TranslationError> {
        let aligned = [vm_addr, phys_addr, size].into_iter().all(is_page_aligned);
        let in_range = vm_addr
            .checked_add(size)
            .is_some_and(|end| end <= ADDRESS_SPACE_END)
            && phys_addr
                .checked_add(size)
                .is_some_and(|end| end <= PHYS_ADDRESS_END);
        if !aligned || !in_range {
            return Err(TranslationError::InvalidMapping);
        }

        let mut done = 0;
        while done < size {
            done += self.insert_leaf(vm_addr + done, phys_addr + done, size - done, flags)?;
        }
        Ok(())
    }

    fn remove_translation(&mut self, vm_addr: u64, size: u64) {
        let end = vm_addr.saturating_add(size).min(ADDRESS_SPACE_END);
        if vm_addr < end {
            self.remove_range(self.root_phys, LEVELS - 1, vm_addr, end);
        }
    }

    fn lookup(&self, vm_addr: u64) -> Option<Translation> {
        if vm_addr >= ADDRESS_SPACE_END {
            return None;
        }
        let mut table = self.root_phys;
        for level in (0..LEVELS).rev() {
            let entry = self.entry(table, index(vm_addr, level))?;
            if !F::present(entry) {
                return None;
            }
            if level == 0 || F::large(entry) {
                let size = level_size(level);
                return Some(Translation {
                    phys_addr: F::address(entry) + (vm_addr & (size - 1)),
                    leaf_size: size,
                    flags: F::flags(entry),
                });
            }
            table = F::address(entry);
        }
        None
    }

    fn root_phys(&self) -> u64 {
        self.root_phys
    }

    fn tables_in_use(&self) -> usize {
        self.nodes.in_use()
    }
}

impl<F: EntryFormat> std::fmt::Debug for TranslationTable<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(F::NAME)
            .field("root_phys", &format_args!("{:#x}", self.root_phys))
            .field("nodes", &self.nodes)
            .finish()
    }
}
