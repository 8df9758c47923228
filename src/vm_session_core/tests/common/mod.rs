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
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vm_session_common::kernel::VmIdentity;
use vm_session_core::capability::{DataspaceCap, KernelVcpuCap, SignalCap, ThreadCap, VcpuCap};
use vm_session_core::mem::region::{AttachAttr, RegionAttr};
use vm_session_core::platform::{
    AffinityLocation, AllocError, Cache, Dataspace, Entrypoint, KernelVm, Platform,
    RamAllocator, RamDataspace, RegionMap, RegionMapError,
};
use vm_session_core::VmidAllocator;

/// What the platform observed, and which VM ids were held at the time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub what: String,
    pub vmids: Vec<u8>,
}

/// Plays every collaborator of a VM session and records what it is asked
/// to do.
pub struct RecordingPlatform {
    pub vmids: Arc<VmidAllocator>,
    steps: Mutex<Vec<Step>>,
    dataspaces: Mutex<HashMap<u64, Arc<dyn Dataspace>>>,
    next: AtomicU64,
}

impl RecordingPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            vmids: Arc::new(VmidAllocator::new()),
            steps: Mutex::new(Vec::new()),
            dataspaces: Mutex::new(HashMap::new()),
            next: AtomicU64::new(0x100),
        })
    }

    pub fn platform(self: &Arc<Self>) -> Platform {
        Platform {
            ep: self.clone(),
            ram: self.clone(),
            core_ram: self.clone(),
            region_map: self.clone(),
            kernel: self.clone(),
        }
    }

    pub fn add_dataspace(self: &Arc<Self>, cap: u64, size: u64, phys: u64) -> DataspaceCap {
        let ds = Arc::new(ClientDataspace {
            platform: Arc::downgrade(self),
            cap,
            size,
            phys,
        });
        self.dataspaces.lock().unwrap().insert(cap, ds);
        DataspaceCap::new(cap)
    }

    pub fn record(&self, what: String) {
        let vmids = self.vmids.allocated().unwrap();
        self.steps.lock().unwrap().push(Step { what, vmids });
    }

    pub fn steps(&self) -> Vec<Step> {
        self.steps.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.steps.lock().unwrap().clear();
    }

    fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Entrypoint for RecordingPlatform {
    fn lookup_dataspace(&self, cap: DataspaceCap) -> Option<Arc<dyn Dataspace>> {
        self.dataspaces.lock().unwrap().get(&cap.raw()).cloned()
    }

    fn thread_affinity(&self, _cap: ThreadCap) -> Option<AffinityLocation> {
        None
    }

    fn manage_vcpu(&self) -> VcpuCap {
        VcpuCap::new(self.next())
    }

    fn dissolve_vcpu(&self, cap: VcpuCap) {
        self.record(format!("dissolve vcpu {:#x}", cap.raw()));
    }
}

impl RamAllocator for RecordingPlatform {
    fn alloc(&self, size: u64, cache: Cache) -> Result<RamDataspace, AllocError> {
        let cap = self.next();
        self.record(format!("alloc {:?} {:#x}", cache, cap));
        Ok(RamDataspace {
            cap: DataspaceCap::new(cap),
            size,
            phys_addr: cap << 24,
        })
    }

    fn free(&self, ds: RamDataspace) {
        self.record(format!("free {:#x}", ds.cap.raw()));
    }
}

impl RegionMap for RecordingPlatform {
    fn attach(&self, ds: DataspaceCap, _attr: AttachAttr) -> Result<u64, RegionMapError> {
        Ok(ds.raw() << 20)
    }

    fn detach(&self, addr: u64) {
        self.record(format!("core detach {:#x}", addr));
    }
}

impl KernelVm for RecordingPlatform {
    fn create_vcpu(
        &self,
        _cpu: u32,
        _state_addr: u64,
        _signal: SignalCap,
        _identity: &VmIdentity,
    ) -> Option<KernelVcpuCap> {
        Some(KernelVcpuCap::new(self.next()))
    }

    fn destroy_vcpu(&self, vcpu: KernelVcpuCap) {
        self.record(format!("destroy vcpu {:#x}", vcpu.raw()));
    }
}

#[derive(Debug)]
struct ClientDataspace {
    platform: std::sync::Weak<RecordingPlatform>,
    cap: u64,
    size: u64,
    phys: u64,
}

impl Dataspace for ClientDataspace {
    fn cap(&self) -> DataspaceCap {
        DataspaceCap::new(self.cap)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn phys_addr(&self) -> u64 {
        self.phys
    }

    fn managed(&self) -> bool {
        false
    }

    fn writeable(&self) -> bool {
        true
    }

    fn attached_to(&self, _region: &RegionAttr) {}

    fn detached_from(&self, region: &RegionAttr) {
        if let Some(platform) = self.platform.upgrade() {
            platform.record(format!(
                "unmap {:#x}..{:#x}",
                region.base,
                region.base + region.size
            ));
        }
    }
}
