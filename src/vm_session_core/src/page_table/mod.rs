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

use std::fmt::Debug;

use bitflags::bitflags;
use thiserror::Error;
use vm_session_common::kernel::DEFAULT_TRANSLATION_TABLE_MAX;
use vm_session_common::mem::PAGE_SIZE;

/// Fixed-capacity storage for translation tables
pub mod allocator;
/// Extended page tables (Intel VMX)
pub mod ept;
/// Host page tables used as nested page tables (AMD SVM)
pub mod hpt;
/// Format-independent four-level table walker
pub mod table;

pub use ept::Ept;
pub use hpt::Hpt;

bitflags! {
    /// Attributes of a guest-physical translation
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// allow guest to write
        const WRITE = 1;
        /// allow guest to execute
        const EXECUTE = 2;
        /// accessible from guest user mode
        const USER = 4;
        /// global translation
        const GLOBAL = 8;
        /// device memory rather than RAM
        const DEVICE = 16;
        /// uncached access
        const UNCACHED = 32;
    }
}

impl PageFlags {
    /// Flags used for all guest RAM: read-write, executable, user,
    /// non-global, RAM, cached.
    pub const GUEST_RAM: PageFlags = PageFlags::WRITE
        .union(PageFlags::EXECUTE)
        .union(PageFlags::USER);
}

impl std::fmt::Display for PageFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "READ");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, " | ")?;
            }
            write!(f, "{}", name)?;
            first = false;
        }
        Ok(())
    }
}

/// Failure of a page-table operation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationError {
    /// The fixed table storage is exhausted
    #[error("out of translation tables")]
    OutOfTables,
    /// The request violates the table format, e.g. it overlaps an existing
    /// translation of a different size or target
    #[error("invalid mapping")]
    InvalidMapping,
}

/// One resolved translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Host-physical address the looked-up guest address maps to
    pub phys_addr: u64,
    /// Size of the leaf holding the translation
    pub leaf_size: u64,
    /// Attributes of the leaf, as far as the format can express them
    pub flags: PageFlags,
}

/// A nested page table together with the storage of its tables.
pub trait PageTableAdapter: Debug + Send {
    /// Bytes of physically contiguous storage a table needs: its root plus
    /// [`DEFAULT_TRANSLATION_TABLE_MAX`] further tables.
    const STORAGE_SIZE: u64 = (1 + DEFAULT_TRANSLATION_TABLE_MAX as u64) * PAGE_SIZE;

    /// Creates an empty table whose storage starts at `phys_base`
    fn new(phys_base: u64) -> Self;

    /// Maps `[vm_addr, vm_addr + size)` to `[phys_addr, phys_addr + size)`
    fn insert_translation(
        &mut self,
        vm_addr: u64,
        phys_addr: u64,
        size: u64,
        flags: PageFlags,
    ) -> Result<(), TranslationError>;

    /// Removes all translations in `[vm_addr, vm_addr + size)`. Absent
    /// translations are skipped.
    fn remove_translation(&mut self, vm_addr: u64, size: u64);

    /// Resolves one guest-physical address
    fn lookup(&self, vm_addr: u64) -> Option<Translation>;

    /// Physical address of the root table
    fn root_phys(&self) -> u64;

    /// Number of tables allocated below the root
    fn tables_in_use(&self) -> usize;
}
