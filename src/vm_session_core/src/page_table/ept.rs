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

//! Intel extended page tables, walked by VMX.

use super::table::{EntryFormat, TranslationTable};
use super::PageFlags;

const READ: u64 = 1 << 0;
const WRITE: u64 = 1 << 1;
const EXECUTE: u64 = 1 << 2;
const MEMORY_TYPE_SHIFT: u64 = 3;
const MEMORY_TYPE_MASK: u64 = 0b111 << MEMORY_TYPE_SHIFT;
const MEMORY_TYPE_UC: u64 = 0;
const MEMORY_TYPE_WB: u64 = 6;
const LARGE_PAGE: u64 = 1 << 7;

/// Entry format of Intel extended page tables
#[derive(Debug)]
pub enum EptFormat {}

impl EntryFormat for EptFormat {
    const NAME: &'static str = "Ept";

    fn table(phys: u64) -> u64 {
        Self::address(phys) | READ | WRITE | EXECUTE
    }

    fn leaf(phys: u64, flags: PageFlags, large: bool) -> u64 {
        let mut entry = Self::address(phys) | READ;
        if flags.contains(PageFlags::WRITE) {
            entry |= WRITE;
        }
        if flags.contains(PageFlags::EXECUTE) {
            entry |= EXECUTE;
        }
        let memory_type = if flags.intersects(PageFlags::UNCACHED | PageFlags::DEVICE) {
            MEMORY_TYPE_UC
        } else {
            MEMORY_TYPE_WB
        };
        entry |= memory_type << MEMORY_TYPE_SHIFT;
        if large {
            entry |= LARGE_PAGE;
        }
        entry
    }

    fn present(entry: u64) -> bool {
        entry & (READ | WRITE | EXECUTE) != 0
    }

    fn large(entry: u64) -> bool {
        entry & LARGE_PAGE != 0
    }

    // EPT knows neither user nor global translations
    fn flags(entry: u64) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::WRITE, entry & WRITE != 0);
        flags.set(PageFlags::EXECUTE, entry & EXECUTE != 0);
        flags.set(
            PageFlags::UNCACHED,
            (entry & MEMORY_TYPE_MASK) >> MEMORY_TYPE_SHIFT == MEMORY_TYPE_UC,
        );
        flags
    }
}

/// Extended page table of a VMX guest
pub type Ept = TranslationTable<EptFormat>;
