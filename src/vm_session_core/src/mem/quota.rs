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

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{instrument, Span};
use vm_session_common::mem::align_page_up;

use crate::platform::{AllocError, Cache, RamAllocator, RamDataspace};

/// Accounts one client-visible resource against a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaGuard {
    limit: u64,
    used: u64,
}

impl QuotaGuard {
    /// A guard with nothing withdrawn yet
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    /// Withdraws `amount` if the remaining quota covers it
    pub fn try_withdraw(&mut self, amount: u64) -> bool {
        if amount > self.avail() {
            return false;
        }
        self.used += amount;
        true
    }

    /// Gives back a previous withdrawal
    pub fn replenish(&mut self, amount: u64) {
        debug_assert!(amount <= self.used, "replenishing more than was withdrawn");
        self.used = self.used.saturating_sub(amount);
    }

    /// Raises the ceiling, as done by a session upgrade
    pub fn upgrade(&mut self, amount: u64) {
        self.limit = self.limit.saturating_add(amount);
    }

    /// The ceiling
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Amount currently withdrawn
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Amount still available
    pub fn avail(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// The RAM and capability guards of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionQuota {
    /// RAM bytes
    pub ram: QuotaGuard,
    /// Capability slots
    pub caps: QuotaGuard,
}

/// Session quota shared by the session, its guest memory and its vCPUs.
#[derive(Debug, Clone)]
pub struct SharedQuota(Arc<Mutex<SessionQuota>>);

impl SharedQuota {
    /// Creates guards with the given ceilings
    pub fn new(ram: u64, caps: u64) -> Self {
        Self(Arc::new(Mutex::new(SessionQuota {
            ram: QuotaGuard::new(ram),
            caps: QuotaGuard::new(caps),
        })))
    }

    // Every update is a single step under the lock, so a poisoned guard
    // still holds consistent numbers.
    fn lock(&self) -> MutexGuard<'_, SessionQuota> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Withdraws `ram` bytes and `caps` capabilities, either both or none.
    pub fn withdraw(&self, ram: u64, caps: u64) -> Result<(), AllocError> {
        let mut quota = self.lock();
        if caps > quota.caps.avail() {
            return Err(AllocError::OutOfCaps);
        }
        if !quota.ram.try_withdraw(ram) {
            return Err(AllocError::OutOfRam);
        }
        quota.caps.try_withdraw(caps);
        Ok(())
    }

    /// Gives back a withdrawal made with [`SharedQuota::withdraw`]
    pub fn replenish(&self, ram: u64, caps: u64) {
        let mut quota = self.lock();
        quota.ram.replenish(ram);
        quota.caps.replenish(caps);
    }

    /// Raises both ceilings
    pub fn upgrade(&self, ram: u64, caps: u64) {
        let mut quota = self.lock();
        quota.ram.upgrade(ram);
        quota.caps.upgrade(caps);
    }

    /// A copy of the current state of both guards
    pub fn snapshot(&self) -> SessionQuota {
        *self.lock()
    }
}

/// Allocates RAM on behalf of a session, charging the dataspace size and
/// one capability per allocation to the session's quota.
#[derive(Clone)]
pub struct ConstrainedRamAllocator {
    backing: Arc<dyn RamAllocator>,
    quota: SharedQuota,
}

impl ConstrainedRamAllocator {
    /// Wraps `backing`, charging allocations to `quota`
    pub fn new(backing: Arc<dyn RamAllocator>, quota: SharedQuota) -> Self {
        Self { backing, quota }
    }

    /// Allocates at least `size` bytes, rounded up to whole pages
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn alloc(&self, size: u64, cache: Cache) -> Result<RamDataspace, AllocError> {
        let size = align_page_up(size).ok_or(AllocError::OutOfRam)?;
        self.quota.withdraw(size, 1)?;
        self.backing.alloc(size, cache).inspect_err(|_| {
            self.quota.replenish(size, 1);
        })
    }

    /// Frees a dataspace and returns its charge to the quota
    pub fn free(&self, ds: RamDataspace) {
        let size = ds.size;
        self.backing.free(ds);
        self.quota.replenish(size, 1);
    }
}

impl std::fmt::Debug for ConstrainedRamAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstrainedRamAllocator")
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}
