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

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Weak};

use crate::capability::DataspaceCap;
use crate::platform::Dataspace;

/// Attributes of an attach request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachAttr {
    /// Offset into the dataspace, page-aligned
    pub offset: u64,
    /// Size of the window, page-aligned; 0 selects the rest of the dataspace
    pub size: u64,
    /// Map the window writeable, if the dataspace allows it
    pub writeable: bool,
    /// Map the window executable
    pub executable: bool,
}

/// The guest-visible description of an attached region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionAttr {
    /// Guest-physical base address
    pub base: u64,
    /// Size in bytes
    pub size: u64,
    /// Offset into the backing dataspace
    pub offset: u64,
    /// Writeable for the guest
    pub write: bool,
    /// Executable for the guest
    pub exec: bool,
    /// Reachable by DMA
    pub dma: bool,
}

impl RegionAttr {
    /// The guest-physical range covered by this region
    pub fn guest_range(&self) -> Range<u64> {
        self.base..self.base + self.size
    }

    /// Whether `addr` lies within this region
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

/// Bookkeeping entry of one attached guest-physical range.
pub(crate) struct Region {
    pub(crate) attr: RegionAttr,
    pub(crate) ds_cap: DataspaceCap,
    dataspace: Weak<dyn Dataspace>,
    /// Hardware mapping flushed, entry pending release
    pub(crate) reserved: bool,
}

impl Region {
    pub(crate) fn new(attr: RegionAttr, dataspace: &Arc<dyn Dataspace>) -> Self {
        Self {
            attr,
            ds_cap: dataspace.cap(),
            dataspace: Arc::downgrade(dataspace),
            reserved: false,
        }
    }

    /// Calls `f` with the backing dataspace, if it still exists
    pub(crate) fn with_dataspace(&self, f: impl FnOnce(&dyn Dataspace)) {
        if let Some(ds) = self.dataspace.upgrade() {
            f(ds.as_ref())
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#x}", self.attr.base))
            .field("size", &format_args!("{:#x}", self.attr.size))
            .field("ds", &self.ds_cap)
            .field("reserved", &self.reserved)
            .finish()
    }
}
