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

//! The narrow interfaces through which a VM session reaches the rest of the
//! core: the entrypoint's capability space, RAM and region-map services,
//! and the kernel.

use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;
use vm_session_common::kernel::VmIdentity;

use crate::capability::{DataspaceCap, KernelVcpuCap, SignalCap, ThreadCap, VcpuCap};
use crate::mem::region::{AttachAttr, RegionAttr};

/// Cache attribute of a RAM allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cache {
    /// Normal write-back memory
    Cached,
    /// Uncached memory, as used for state shared with the kernel
    Uncached,
}

/// Placement of a thread on the CPU grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityLocation {
    /// Horizontal position, the CPU index on x86
    pub xpos: u32,
    /// Vertical position
    pub ypos: u32,
    /// Width of the location
    pub width: u32,
    /// Height of the location
    pub height: u32,
}

impl AffinityLocation {
    /// The CPU a vCPU bound to this location executes on
    pub fn cpu(&self) -> u32 {
        self.xpos
    }
}

impl Default for AffinityLocation {
    fn default() -> Self {
        Self {
            xpos: 0,
            ypos: 0,
            width: 1,
            height: 1,
        }
    }
}

/// A client dataspace as seen by the VM session.
pub trait Dataspace: Debug + Send + Sync {
    /// The capability naming this dataspace
    fn cap(&self) -> DataspaceCap;
    /// Size in bytes
    fn size(&self) -> u64;
    /// Host-physical base address
    fn phys_addr(&self) -> u64;
    /// Whether this is a managed dataspace, i.e. a region map posing as a
    /// dataspace
    fn managed(&self) -> bool;
    /// Whether the dataspace may be mapped writeable
    fn writeable(&self) -> bool;
    /// Called once a guest-memory region starts to reference this dataspace
    fn attached_to(&self, region: &RegionAttr);
    /// Called once a guest-memory region stops referencing this dataspace
    fn detached_from(&self, region: &RegionAttr);
}

/// The capability space of the entrypoint that serves the session.
pub trait Entrypoint: Send + Sync {
    /// Resolves a dataspace capability
    fn lookup_dataspace(&self, cap: DataspaceCap) -> Option<Arc<dyn Dataspace>>;
    /// Resolves the CPU affinity of a client thread
    fn thread_affinity(&self, cap: ThreadCap) -> Option<AffinityLocation>;
    /// Creates the capability a client uses to address a new vCPU, invalid
    /// if the capability space is exhausted
    fn manage_vcpu(&self) -> VcpuCap;
    /// Revokes a capability created by [`Entrypoint::manage_vcpu`]
    fn dissolve_vcpu(&self, cap: VcpuCap);
}

impl dyn Entrypoint {
    /// Calls `f` with the dataspace `cap` resolves to, or with `None`.
    pub fn apply_dataspace<R>(
        &self,
        cap: DataspaceCap,
        f: impl FnOnce(Option<&Arc<dyn Dataspace>>) -> R,
    ) -> R {
        let ds = self.lookup_dataspace(cap);
        f(ds.as_ref())
    }
}

/// A RAM dataspace handed out by a [`RamAllocator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamDataspace {
    /// The capability naming the dataspace
    pub cap: DataspaceCap,
    /// Size in bytes, a multiple of the page size
    pub size: u64,
    /// Host-physical base address
    pub phys_addr: u64,
}

/// Failure of a RAM allocation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Not enough RAM quota or physical memory
    #[error("out of RAM")]
    OutOfRam,
    /// Not enough capability quota
    #[error("out of capabilities")]
    OutOfCaps,
}

/// Hands out physically contiguous RAM dataspaces.
pub trait RamAllocator: Send + Sync {
    /// Allocates `size` bytes with the given cache attribute
    fn alloc(&self, size: u64, cache: Cache) -> Result<RamDataspace, AllocError>;
    /// Releases a dataspace obtained from [`RamAllocator::alloc`]
    fn free(&self, ds: RamDataspace);
}

/// Failure of attaching a dataspace to a region map
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMapError {
    /// Not enough RAM quota for the bookkeeping
    #[error("out of RAM")]
    OutOfRam,
    /// Not enough capability quota for the bookkeeping
    #[error("out of capabilities")]
    OutOfCaps,
    /// No free virtual range is large enough
    #[error("region conflict")]
    RegionConflict,
    /// The dataspace cannot be attached
    #[error("invalid dataspace")]
    InvalidDataspace,
}

/// Core's own address space.
pub trait RegionMap: Send + Sync {
    /// Attaches a dataspace and returns the local start address
    fn attach(&self, ds: DataspaceCap, attr: AttachAttr) -> Result<u64, RegionMapError>;
    /// Detaches whatever was attached at `addr`
    fn detach(&self, addr: u64);
}

/// The kernel's VM interface.
pub trait KernelVm: Send + Sync {
    /// Creates the kernel object that executes a vCPU. `state_addr` is the
    /// core-local address of the shared vCPU state page.
    fn create_vcpu(
        &self,
        cpu: u32,
        state_addr: u64,
        signal: SignalCap,
        identity: &VmIdentity,
    ) -> Option<KernelVcpuCap>;
    /// Destroys a kernel vCPU object
    fn destroy_vcpu(&self, vcpu: KernelVcpuCap);
}

/// Everything a VM session needs from its surroundings.
#[derive(Clone)]
pub struct Platform {
    /// The entrypoint serving the session
    pub ep: Arc<dyn Entrypoint>,
    /// RAM on behalf of the session, used for vCPU state
    pub ram: Arc<dyn RamAllocator>,
    /// Core-local RAM, used for nested page-table storage
    pub core_ram: Arc<dyn RamAllocator>,
    /// Core's own address space
    pub region_map: Arc<dyn RegionMap>,
    /// The kernel
    pub kernel: Arc<dyn KernelVm>,
}

impl Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
