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

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{instrument, Span};
use vm_session_common::mem::{is_page_aligned, PAGE_SIZE};

use super::quota::SharedQuota;
use super::region::{AttachAttr, Region, RegionAttr};
use crate::page_table::TranslationError;
use crate::platform::{AllocError, Dataspace};

/// Number of region entries that share one metadata block.
pub const REGIONS_PER_METADATA_BLOCK: usize = 32;

/// Why an attach request failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    /// Managed dataspace, misaligned arguments or an out-of-range window
    #[error("invalid dataspace")]
    InvalidDataspace,
    /// No RAM quota left for the region metadata
    #[error("out of RAM quota")]
    OutOfRam,
    /// No capability quota left for the region metadata
    #[error("out of capability quota")]
    OutOfCaps,
    /// The window overlaps an incompatible region
    #[error("region conflict")]
    RegionConflict,
    /// The map callback failed. `new_region` tells whether a new region was
    /// registered before the failure; it stays registered either way.
    #[error("mapping failed: {error}")]
    Translation {
        /// What the page table reported
        error: TranslationError,
        /// Whether this attach created the region
        new_region: bool,
    },
}

impl From<AllocError> for AttachError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfRam => AttachError::OutOfRam,
            AllocError::OutOfCaps => AttachError::OutOfCaps,
        }
    }
}

/// Guest-physical address space of one VM: non-overlapping regions, each
/// backed by a window of a client dataspace.
///
/// Hardware mappings are established and removed through the callbacks
/// passed to each operation, so the same bookkeeping serves every
/// page-table format.
#[derive(Debug)]
pub struct GuestMemory {
    regions: BTreeMap<u64, Region>,
    quota: SharedQuota,
    metadata_blocks: usize,
}

impl GuestMemory {
    /// An empty guest-physical address space charging its metadata to `quota`
    pub fn new(quota: SharedQuota) -> Self {
        Self {
            regions: BTreeMap::new(),
            quota,
            metadata_blocks: 0,
        }
    }

    /// Attaches a window of `ds` at `guest_phys` and calls
    /// `map_fn(guest_phys, host_phys, size)` once for it.
    #[instrument(err(Debug), skip(self, ds, map_fn), parent = Span::current(), level = "Trace")]
    pub fn attach<F>(
        &mut self,
        ds: &Arc<dyn Dataspace>,
        guest_phys: u64,
        attr: AttachAttr,
        map_fn: F,
    ) -> Result<(), AttachError>
    where
        F: FnOnce(u64, u64, u64) -> Result<(), TranslationError>,
    {
        if ds.managed() {
            log::error!("cannot attach managed dataspace");
            return Err(AttachError::InvalidDataspace);
        }

        let aligned = [guest_phys, attr.offset, attr.size]
            .into_iter()
            .all(is_page_aligned);
        if !aligned {
            return Err(AttachError::InvalidDataspace);
        }

        let (offset, size) = window(ds.size(), attr.offset, attr.size)?;
        let end = guest_phys
            .checked_add(size)
            .ok_or(AttachError::InvalidDataspace)?;
        let host_phys = ds
            .phys_addr()
            .checked_add(offset)
            .ok_or(AttachError::InvalidDataspace)?;

        if self.overlaps(guest_phys, end) {
            // a window of the dataspace that already backs this range is
            // mapped again without new bookkeeping
            let reattach = self.region_containing(guest_phys).is_some_and(|region| {
                region.ds_cap == ds.cap() && end - region.attr.base <= region.attr.size
            });
            if !reattach {
                return Err(AttachError::RegionConflict);
            }
            return map_fn(guest_phys, host_phys, size).map_err(|error| {
                AttachError::Translation {
                    error,
                    new_region: false,
                }
            });
        }

        self.reserve_metadata()?;

        let region_attr = RegionAttr {
            base: guest_phys,
            size,
            offset,
            write: ds.writeable() && attr.writeable,
            exec: attr.executable,
            dma: false,
        };
        self.regions
            .insert(guest_phys, Region::new(region_attr, ds));
        ds.attached_to(&region_attr);

        map_fn(guest_phys, host_phys, size).map_err(|error| AttachError::Translation {
            error,
            new_region: true,
        })
    }

    /// Detaches every region that intersects `[guest_phys, guest_phys + size)`.
    ///
    /// Malformed requests are logged and ignored.
    #[instrument(skip(self, unmap_fn), parent = Span::current(), level = "Trace")]
    pub fn detach<F>(&mut self, guest_phys: u64, size: u64, mut unmap_fn: F)
    where
        F: FnMut(u64, u64),
    {
        let well_formed = size != 0 && is_page_aligned(guest_phys) && is_page_aligned(size);
        let last = match guest_phys.checked_add(size.wrapping_sub(1)) {
            Some(last) if well_formed => last,
            _ => {
                log::warn!(
                    "skipping invalid memory detach addr={:#x} size={:#x}",
                    guest_phys,
                    size
                );
                return;
            }
        };

        let mut addr = guest_phys;
        while addr <= last {
            let next = match self.region_containing(addr).map(|r| r.attr) {
                Some(region) => {
                    self.detach_at(region.base, &mut unmap_fn);
                    region.base.checked_add(region.size)
                }
                // skip the hole up to the next region
                None => self
                    .regions
                    .range(addr..)
                    .next()
                    .map(|(base, _)| *base)
                    .or_else(|| last.checked_add(PAGE_SIZE)),
            };
            match next {
                Some(next) => addr = next,
                None => break,
            }
        }
    }

    /// Detaches the region containing `addr`, if any.
    pub fn detach_at<F>(&mut self, addr: u64, mut unmap_fn: F)
    where
        F: FnMut(u64, u64),
    {
        let Some(base) = self.region_containing(addr).map(|r| r.attr.base) else {
            return;
        };
        self.reserve_and_flush(base, &mut unmap_fn);
        if self.regions.remove(&base).is_some() {
            self.release_metadata();
        }
    }

    /// Removes the hardware mapping of the region containing `addr` but
    /// keeps its bookkeeping, marking it reserved. The dataspace learns
    /// about the detach only the first time.
    pub fn reserve_and_flush<F>(&mut self, addr: u64, mut unmap_fn: F)
    where
        F: FnMut(u64, u64),
    {
        let Some(region) = self.region_containing_mut(addr) else {
            return;
        };
        if !region.reserved {
            region.with_dataspace(|ds| ds.detached_from(&region.attr));
            region.reserved = true;
        }
        unmap_fn(region.attr.base, region.attr.size);
    }

    /// Detaches every region in ascending address order.
    pub fn detach_all<F>(&mut self, mut unmap_fn: F)
    where
        F: FnMut(u64, u64),
    {
        let bases: Vec<u64> = self.regions.keys().copied().collect();
        for base in bases {
            self.detach_at(base, &mut unmap_fn);
        }
    }

    /// Attributes of the region containing `addr`
    pub fn region_at(&self, addr: u64) -> Option<RegionAttr> {
        self.region_containing(addr).map(|region| region.attr)
    }

    /// Whether the region containing `addr` is reserved
    pub fn is_reserved(&self, addr: u64) -> Option<bool> {
        self.region_containing(addr).map(|region| region.reserved)
    }

    /// All regions in ascending address order
    pub fn regions(&self) -> impl Iterator<Item = RegionAttr> + '_ {
        self.regions.values().map(|region| region.attr)
    }

    /// Number of regions
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn region_containing(&self, addr: u64) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.attr.contains(addr))
    }

    fn region_containing_mut(&mut self, addr: u64) -> Option<&mut Region> {
        self.regions
            .range_mut(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.attr.contains(addr))
    }

    // Regions never overlap, so ends ascend with bases and the last region
    // starting below `end` is the only candidate.
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.regions
            .range(..end)
            .next_back()
            .is_some_and(|(base, region)| base + region.attr.size > start)
    }

    fn reserve_metadata(&mut self) -> Result<(), AttachError> {
        if self.regions.len() < self.metadata_blocks * REGIONS_PER_METADATA_BLOCK {
            return Ok(());
        }
        self.quota.withdraw(PAGE_SIZE, 1)?;
        self.metadata_blocks += 1;
        Ok(())
    }

    fn release_metadata(&mut self) {
        if self.metadata_blocks > 0
            && self.regions.len() <= (self.metadata_blocks - 1) * REGIONS_PER_METADATA_BLOCK
        {
            self.metadata_blocks -= 1;
            self.quota.replenish(PAGE_SIZE, 1);
        }
    }
}

/// Resolves the `(offset, size)` window of a dataspace of `ds_size` bytes.
///
/// A zero `size` selects everything from `offset` to the end, and larger
/// sizes are clamped to the end of the dataspace.
pub fn window(ds_size: u64, offset: u64, size: u64) -> Result<(u64, u64), AttachError> {
    if offset >= ds_size {
        return Err(AttachError::InvalidDataspace);
    }
    let avail = ds_size - offset;
    let size = match size {
        0 => avail,
        size => size.min(avail),
    };
    Ok((offset, size))
}
