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

use std::sync::Arc;

use tracing::{instrument, Span};
use vm_session_common::kernel::{VmIdentity, VCPU_DATA_SIZE, VCPU_MAX, VCPU_STATE_SIZE};

use crate::capability::{DataspaceCap, ThreadCap, VcpuCap};
use crate::error::VmSessionError;
use crate::mem::guest_memory::{AttachError, GuestMemory};
use crate::mem::phys_allocated::PhysAllocated;
use crate::mem::quota::{ConstrainedRamAllocator, SessionQuota, SharedQuota};
use crate::mem::region::{AttachAttr, RegionAttr};
use crate::metrics::{METRIC_ATTACH_FAILURES, METRIC_ATTACH_FAILURES_LABEL_REASON, METRIC_VCPUS_CREATED};
use crate::page_table::{Ept, Hpt, PageFlags, PageTableAdapter, Translation};
use crate::platform::{Cache, Dataspace, Platform};
use crate::vcpu::{Vcpu, VcpuEnv, VcpuResources};
use crate::{new_error, Result, VmidAllocator};

/// Parsing of session argument strings
pub mod args;
/// Configuration of a VM session
pub mod config;
/// The session factory
pub mod root;
/// Detection of hardware virtualization support
pub mod virt;

use config::VmSessionConfiguration;
use virt::VirtType;

/// The VM session of one client, generic over the nested page-table format.
///
/// Keeps the guest-physical bookkeeping and the nested page table in sync
/// and owns the vCPUs of the VM. Dropping the session detaches all regions,
/// destroys the vCPUs, releases the page-table storage and finally returns
/// the VM identity, in that order.
pub struct VmSession<P: PageTableAdapter> {
    config: VmSessionConfiguration,
    identity: VmIdentity,
    vmids: Arc<VmidAllocator>,
    quota: SharedQuota,
    memory: GuestMemory,
    table: P,
    table_store: PhysAllocated,
    vcpus: Vec<Vcpu>,
    vcpu_env: VcpuEnv,
}

impl<P: PageTableAdapter> VmSession<P> {
    /// Creates a session, charging the page-table storage to the quota the
    /// configuration donates and taking a VM identity from `vmids`.
    #[instrument(err(Debug), skip(platform, vmids), parent = Span::current(), level = "Trace")]
    pub fn new(
        config: VmSessionConfiguration,
        platform: Platform,
        vmids: Arc<VmidAllocator>,
    ) -> Result<Self> {
        let quota = SharedQuota::new(config.ram_quota(), config.cap_quota());
        let table_store = PhysAllocated::new(
            ConstrainedRamAllocator::new(platform.core_ram.clone(), quota.clone()),
            P::STORAGE_SIZE,
        )?;
        let table = P::new(table_store.phys_addr());
        let identity = VmIdentity {
            id: vmids.alloc()?,
            page_table_root: table.root_phys(),
        };

        let vcpu_env = VcpuEnv {
            ep: platform.ep,
            region_map: platform.region_map,
            kernel: platform.kernel,
            ram: ConstrainedRamAllocator::new(platform.ram, quota.clone()),
            quota: quota.clone(),
        };

        Ok(Self {
            memory: GuestMemory::new(quota.clone()),
            config,
            identity,
            vmids,
            quota,
            table,
            table_store,
            vcpus: Vec::new(),
            vcpu_env,
        })
    }

    /// Attaches a window of the dataspace `ds_cap` names at `guest_phys`
    /// and maps it into the nested page table.
    ///
    /// A failing page-table insertion is reported as `OutOfRam` or
    /// `InvalidDataspace`. The region stays registered unless the session
    /// was configured to roll back failed mappings.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn attach(&mut self, ds_cap: DataspaceCap, guest_phys: u64, attr: AttachAttr) -> Result<()> {
        let ep = self.vcpu_env.ep.clone();
        let result = ep.apply_dataspace(ds_cap, |ds| match ds {
            Some(ds) => self.attach_dataspace(ds, guest_phys, attr),
            None => Err(VmSessionError::InvalidDataspace),
        });
        if let Err(e) = &result {
            metrics::counter!(
                METRIC_ATTACH_FAILURES,
                METRIC_ATTACH_FAILURES_LABEL_REASON => e.kind()
            )
            .increment(1);
        }
        result
    }

    fn attach_dataspace(
        &mut self,
        ds: &Arc<dyn Dataspace>,
        guest_phys: u64,
        attr: AttachAttr,
    ) -> Result<()> {
        let table = &mut self.table;
        let result = self.memory.attach(ds, guest_phys, attr, |vm_addr, phys_addr, size| {
            table.insert_translation(vm_addr, phys_addr, size, PageFlags::GUEST_RAM)
        });
        match result {
            Err(AttachError::Translation { error, new_region }) => {
                if new_region && self.config.rollback_failed_mappings() {
                    self.memory.detach_at(guest_phys, |base, size| {
                        self.table.remove_translation(base, size)
                    });
                }
                Err(error.into())
            }
            result => result.map_err(VmSessionError::from),
        }
    }

    /// Detaches every region intersecting `[guest_phys, guest_phys + size)`.
    /// Malformed requests are logged and ignored.
    #[instrument(skip(self), parent = Span::current(), level = "Trace")]
    pub fn detach(&mut self, guest_phys: u64, size: u64) {
        self.memory.detach(guest_phys, size, |base, size| {
            self.table.remove_translation(base, size)
        });
    }

    /// Detaches the region containing `addr`, if any
    #[instrument(skip(self), parent = Span::current(), level = "Trace")]
    pub fn detach_at(&mut self, addr: u64) {
        self.memory.detach_at(addr, |base, size| {
            self.table.remove_translation(base, size)
        });
    }

    /// Unmaps the region containing `addr` but keeps it registered
    #[instrument(skip(self), parent = Span::current(), level = "Trace")]
    pub fn reserve_and_flush(&mut self, addr: u64) {
        self.memory.reserve_and_flush(addr, |base, size| {
            self.table.remove_translation(base, size)
        });
    }

    /// Unmapping part of a region without detaching it is not supported.
    pub fn unmap_region(&mut self, addr: u64, size: u64) -> Result<()> {
        log::error!("unmap_region not implemented addr={:#x} size={:#x}", addr, size);
        Err(VmSessionError::NotImplemented("unmap_region"))
    }

    /// Interrupt-controller hook, accepted and ignored.
    pub fn attach_pic(&mut self, _addr: u64) {}

    /// Creates a vCPU placed where `thread` runs.
    ///
    /// Returns an invalid capability if the vCPU limit is reached or any
    /// resource is exhausted. Nothing is left allocated in that case.
    #[instrument(skip(self), parent = Span::current(), level = "Trace")]
    pub fn create_vcpu(&mut self, thread: ThreadCap) -> VcpuCap {
        match self.try_create_vcpu(thread) {
            Ok(cap) => {
                metrics::counter!(METRIC_VCPUS_CREATED).increment(1);
                cap
            }
            Err(e) => {
                log::warn!("cannot create vCPU for VM {}: {}", self.identity.id, e);
                VcpuCap::invalid()
            }
        }
    }

    fn try_create_vcpu(&mut self, thread: ThreadCap) -> Result<VcpuCap> {
        if self.vcpus.len() >= VCPU_MAX {
            return Err(new_error!("limit of {} vCPUs reached", VCPU_MAX));
        }

        let env = &self.vcpu_env;
        env.quota.withdraw(VCPU_DATA_SIZE, 0)?;
        let location = env.ep.thread_affinity(thread).unwrap_or_default();

        let state = match env.ram.alloc(VCPU_STATE_SIZE, Cache::Uncached) {
            Ok(state) => state,
            Err(e) => {
                env.quota.replenish(VCPU_DATA_SIZE, 0);
                return Err(e.into());
            }
        };

        let attr = AttachAttr {
            offset: 0,
            size: state.size,
            writeable: true,
            executable: false,
        };
        let state_addr = match env.region_map.attach(state.cap, attr) {
            Ok(addr) => addr,
            Err(e) => {
                env.ram.free(state);
                env.quota.replenish(VCPU_DATA_SIZE, 0);
                return Err(e.into());
            }
        };

        let cap = env.ep.manage_vcpu();
        if !cap.is_valid() {
            env.region_map.detach(state_addr);
            env.ram.free(state);
            env.quota.replenish(VCPU_DATA_SIZE, 0);
            return Err(VmSessionError::OutOfCaps);
        }

        let resources = VcpuResources {
            cap,
            state,
            state_addr,
            location,
        };
        self.vcpus
            .push(Vcpu::new(self.identity, resources, env.clone()));
        Ok(cap)
    }

    /// The vCPU `cap` names
    pub fn vcpu(&self, cap: VcpuCap) -> Option<&Vcpu> {
        self.vcpus.iter().find(|vcpu| vcpu.cap() == cap)
    }

    /// Calls `f` with the vCPU `cap` names, if it exists
    pub fn with_vcpu<R>(&mut self, cap: VcpuCap, f: impl FnOnce(&mut Vcpu) -> R) -> Option<R> {
        self.vcpus.iter_mut().find(|vcpu| vcpu.cap() == cap).map(f)
    }

    /// Number of vCPUs
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    /// Raises the session's RAM and capability quota
    #[instrument(skip(self), parent = Span::current(), level = "Trace")]
    pub fn upgrade(&mut self, ram: u64, caps: u64) {
        self.quota.upgrade(ram, caps);
    }

    /// The session's quota as of now
    pub fn quota(&self) -> SessionQuota {
        self.quota.snapshot()
    }

    /// The VM identity handed to the kernel
    pub fn identity(&self) -> VmIdentity {
        self.identity
    }

    /// The clamped priority of the session's vCPUs
    pub fn priority(&self) -> u32 {
        self.config.priority()
    }

    /// The client's label
    pub fn label(&self) -> &str {
        self.config.label()
    }

    /// The configuration the session was created with
    pub fn config(&self) -> &VmSessionConfiguration {
        &self.config
    }

    /// Resolves `guest_phys` through the nested page table
    pub fn lookup_translation(&self, guest_phys: u64) -> Option<Translation> {
        self.table.lookup(guest_phys)
    }

    /// Number of page tables in use below the root
    pub fn tables_in_use(&self) -> usize {
        self.table.tables_in_use()
    }

    /// All attached regions in ascending address order
    pub fn regions(&self) -> impl Iterator<Item = RegionAttr> + '_ {
        self.memory.regions()
    }

    /// The region containing `guest_phys`
    pub fn region_at(&self, guest_phys: u64) -> Option<RegionAttr> {
        self.memory.region_at(guest_phys)
    }

    /// Whether the region containing `guest_phys` is reserved
    pub fn is_reserved(&self, guest_phys: u64) -> Option<bool> {
        self.memory.is_reserved(guest_phys)
    }
}

impl<P: PageTableAdapter> Drop for VmSession<P> {
    fn drop(&mut self) {
        self.memory.detach_all(|base, size| {
            self.table.remove_translation(base, size)
        });
        self.vcpus.clear();
        self.table_store.release();
        if let Err(e) = self.vmids.free(self.identity.id) {
            log::error!("cannot release VM id {}: {}", self.identity.id, e);
        }
    }
}

impl<P: PageTableAdapter> std::fmt::Debug for VmSession<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmSession")
            .field("identity", &self.identity)
            .field("label", &self.config.label())
            .field("memory", &self.memory)
            .field("table", &self.table)
            .field("vcpus", &self.vcpus)
            .finish_non_exhaustive()
    }
}

/// A VM session for whichever virtualization extension the CPU provides.
#[derive(Debug)]
pub enum AnySession {
    /// AMD-V session with a long-mode nested page table
    Svm(VmSession<Hpt>),
    /// Intel VT-x session with an extended page table
    Vmx(VmSession<Ept>),
}

macro_rules! delegate {
    ($self:ident, $session:ident => $body:expr) => {
        match $self {
            AnySession::Svm($session) => $body,
            AnySession::Vmx($session) => $body,
        }
    };
}

impl AnySession {
    /// The virtualization extension of this session
    pub fn virt_type(&self) -> VirtType {
        match self {
            AnySession::Svm(_) => VirtType::Svm,
            AnySession::Vmx(_) => VirtType::Vmx,
        }
    }

    /// See [`VmSession::attach`]
    pub fn attach(&mut self, ds_cap: DataspaceCap, guest_phys: u64, attr: AttachAttr) -> Result<()> {
        delegate!(self, session => session.attach(ds_cap, guest_phys, attr))
    }

    /// See [`VmSession::detach`]
    pub fn detach(&mut self, guest_phys: u64, size: u64) {
        delegate!(self, session => session.detach(guest_phys, size))
    }

    /// See [`VmSession::detach_at`]
    pub fn detach_at(&mut self, addr: u64) {
        delegate!(self, session => session.detach_at(addr))
    }

    /// See [`VmSession::reserve_and_flush`]
    pub fn reserve_and_flush(&mut self, addr: u64) {
        delegate!(self, session => session.reserve_and_flush(addr))
    }

    /// See [`VmSession::unmap_region`]
    pub fn unmap_region(&mut self, addr: u64, size: u64) -> Result<()> {
        delegate!(self, session => session.unmap_region(addr, size))
    }

    /// See [`VmSession::attach_pic`]
    pub fn attach_pic(&mut self, addr: u64) {
        delegate!(self, session => session.attach_pic(addr))
    }

    /// See [`VmSession::create_vcpu`]
    pub fn create_vcpu(&mut self, thread: ThreadCap) -> VcpuCap {
        delegate!(self, session => session.create_vcpu(thread))
    }

    /// See [`VmSession::with_vcpu`]
    pub fn with_vcpu<R>(&mut self, cap: VcpuCap, f: impl FnOnce(&mut Vcpu) -> R) -> Option<R> {
        delegate!(self, session => session.with_vcpu(cap, f))
    }

    /// See [`VmSession::vcpu_count`]
    pub fn vcpu_count(&self) -> usize {
        delegate!(self, session => session.vcpu_count())
    }

    /// See [`VmSession::upgrade`]
    pub fn upgrade(&mut self, ram: u64, caps: u64) {
        delegate!(self, session => session.upgrade(ram, caps))
    }

    /// See [`VmSession::quota`]
    pub fn quota(&self) -> SessionQuota {
        delegate!(self, session => session.quota())
    }

    /// See [`VmSession::identity`]
    pub fn identity(&self) -> VmIdentity {
        delegate!(self, session => session.identity())
    }

    /// See [`VmSession::priority`]
    pub fn priority(&self) -> u32 {
        delegate!(self, session => session.priority())
    }

    /// See [`VmSession::label`]
    pub fn label(&self) -> &str {
        delegate!(self, session => session.label())
    }

    /// See [`VmSession::lookup_translation`]
    pub fn lookup_translation(&self, guest_phys: u64) -> Option<Translation> {
        delegate!(self, session => session.lookup_translation(guest_phys))
    }

    /// All attached regions in ascending address order
    pub fn regions(&self) -> Vec<RegionAttr> {
        delegate!(self, session => session.regions().collect())
    }
}
