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

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << 12;
pub const PAGE_SIZE_USIZE: usize = 1 << 12;
/// Mask of the offset bits within a page.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Size covered by one 2 MiB leaf (page-directory level).
pub const LARGE_PAGE_SIZE: u64 = 1 << 21;
/// Size covered by one 1 GiB leaf (page-directory-pointer level).
pub const HUGE_PAGE_SIZE: u64 = 1 << 30;

/// Returns true if `value` has none of the low page-offset bits set.
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}

/// Rounds `value` up to the next page boundary, returning `None` on overflow.
#[inline]
pub const fn align_page_up(value: u64) -> Option<u64> {
    match value.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}
