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

use std::sync::Mutex;

use tracing::{instrument, Span};
use vm_session_common::kernel::VMID_SLOTS;

use crate::error::VmSessionError;
use crate::mem::bitmap::{bit_index_iterator, clear_bit, first_clear_bit, is_bit_set, new_bitmap, set_bit};
use crate::Result;

/// Hands out the small integer identities the kernel uses to tell VMs apart.
///
/// Identity 0 is reserved at construction and never handed to a guest. One
/// allocator is shared by all sessions of a virtualization type, so every
/// access goes through a lock.
#[derive(Debug)]
pub struct VmidAllocator {
    slots: Mutex<Vec<u64>>,
}

impl VmidAllocator {
    /// An allocator with all identities but 0 free
    pub fn new() -> Self {
        let mut slots = new_bitmap(VMID_SLOTS, false);
        set_bit(&mut slots, 0);
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Returns the lowest free identity
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn alloc(&self) -> Result<u8> {
        let mut slots = self.slots.lock()?;
        let id = first_clear_bit(&slots, VMID_SLOTS).ok_or(VmSessionError::OutOfVmIds)?;
        set_bit(&mut slots, id);
        u8::try_from(id).map_err(|_| VmSessionError::OutOfVmIds)
    }

    /// Returns `id` to the free set. Freeing 0 or an identity that is not
    /// allocated is logged and ignored.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn free(&self, id: u8) -> Result<()> {
        if id == 0 {
            log::warn!("refusing to free reserved VM id 0");
            return Ok(());
        }
        let mut slots = self.slots.lock()?;
        if !clear_bit(&mut slots, id as usize) {
            log::warn!("freeing VM id {} which is not allocated", id);
        }
        Ok(())
    }

    /// Whether `id` is currently handed out. Identity 0 always is.
    pub fn is_allocated(&self, id: u8) -> Result<bool> {
        let slots = self.slots.lock()?;
        Ok(is_bit_set(&slots, id as usize))
    }

    /// Identities currently held by guests, in ascending order
    pub fn allocated(&self) -> Result<Vec<u8>> {
        let slots = self.slots.lock()?;
        Ok(bit_index_iterator(&slots)
            .filter(|id| *id != 0)
            .filter_map(|id| u8::try_from(id).ok())
            .collect())
    }
}

impl Default for VmidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
