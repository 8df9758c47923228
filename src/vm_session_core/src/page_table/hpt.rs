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

//! x86-64 long-mode page tables, walked by SVM nested paging.

use super::table::{EntryFormat, TranslationTable};
use super::PageFlags;

const PRESENT: u64 = 1 << 0;
const READ_WRITE: u64 = 1 << 1;
const USER: u64 = 1 << 2;
const WRITE_THROUGH: u64 = 1 << 3;
const CACHE_DISABLE: u64 = 1 << 4;
const PAGE_SIZE_BIT: u64 = 1 << 7;
const GLOBAL: u64 = 1 << 8;
const NO_EXECUTE: u64 = 1 << 63;

/// Entry format of x86-64 long-mode page tables
#[derive(Debug)]
pub enum HptFormat {}

impl EntryFormat for HptFormat {
    const NAME: &'static str = "Hpt";

    fn table(phys: u64) -> u64 {
        Self::address(phys) | PRESENT | READ_WRITE | USER
    }

    fn leaf(phys: u64, flags: PageFlags, large: bool) -> u64 {
        let mut entry = Self::address(phys) | PRESENT;
        if flags.contains(PageFlags::WRITE) {
            entry |= READ_WRITE;
        }
        if flags.contains(PageFlags::USER) {
            entry |= USER;
        }
        if flags.contains(PageFlags::GLOBAL) {
            entry |= GLOBAL;
        }
        if flags.intersects(PageFlags::UNCACHED | PageFlags::DEVICE) {
            entry |= WRITE_THROUGH | CACHE_DISABLE;
        }
        if !flags.contains(PageFlags::EXECUTE) {
            entry |= NO_EXECUTE;
        }
        if large {
            entry |= PAGE_SIZE_BIT;
        }
        entry
    }

    fn present(entry: u64) -> bool {
        entry & PRESENT != 0
    }

    fn large(entry: u64) -> bool {
        entry & PAGE_SIZE_BIT != 0
    }

    fn flags(entry: u64) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::WRITE, entry & READ_WRITE != 0);
        flags.set(PageFlags::USER, entry & USER != 0);
        flags.set(PageFlags::GLOBAL, entry & GLOBAL != 0);
        flags.set(PageFlags::UNCACHED, entry & CACHE_DISABLE != 0);
        flags.set(PageFlags::EXECUTE, entry & NO_EXECUTE == 0);
        flags
    }
}

/// Nested page table of an SVM guest
pub type Hpt = TranslationTable<HptFormat>;
