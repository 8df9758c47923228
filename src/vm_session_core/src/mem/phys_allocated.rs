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

use crate::mem::quota::ConstrainedRamAllocator;
use crate::platform::{AllocError, Cache, RamDataspace};

/// A physically contiguous RAM dataspace held on behalf of a session.
///
/// Backs the nested page table of a session. The dataspace is returned to
/// its allocator either explicitly via [`PhysAllocated::release`] or when
/// the value is dropped, whichever comes first.
#[derive(Debug)]
pub struct PhysAllocated {
    ram: ConstrainedRamAllocator,
    ds: Option<RamDataspace>,
}

impl PhysAllocated {
    /// Allocates `size` bytes of cached RAM
    pub fn new(ram: ConstrainedRamAllocator, size: u64) -> Result<Self, AllocError> {
        let ds = ram.alloc(size, Cache::Cached)?;
        Ok(Self { ram, ds: Some(ds) })
    }

    /// Host-physical base address, 0 once released
    pub fn phys_addr(&self) -> u64 {
        self.ds.map_or(0, |ds| ds.phys_addr)
    }

    /// Size in bytes, 0 once released
    pub fn size(&self) -> u64 {
        self.ds.map_or(0, |ds| ds.size)
    }

    /// Frees the dataspace. Later calls do nothing.
    pub fn release(&mut self) {
        if let Some(ds) = self.ds.take() {
            self.ram.free(ds);
        }
    }
}

impl Drop for PhysAllocated {
    fn drop(&mut self) {
        self.release();
    }
}
