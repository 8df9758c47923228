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

// Not every test reads every recorded field.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vm_session_common::kernel::VmIdentity;
use vm_session_common::mem::{align_page_up, PAGE_SIZE};

use crate::capability::{DataspaceCap, KernelVcpuCap, SignalCap, ThreadCap, VcpuCap};
use crate::mem::region::{AttachAttr, RegionAttr};
use crate::platform::{
    AffinityLocation, AllocError, Cache, Dataspace, Entrypoint, KernelVm, Platform,
    RamAllocator, RamDataspace, RegionMap, RegionMapError,
};
use crate::VmidAllocator;

static NEXT_CAP: AtomicU64 = AtomicU64::new(0x1000);

fn next_cap() -> u64 {
    NEXT_CAP.fetch_add(1, Ordering::Relaxed)
}

/// Something a fake collaborator was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    DataspaceAttached { cap: u64, base: u64, size: u64 },
    DataspaceDetached { cap: u64, base: u64, size: u64 },
    RamAlloc { allocator: &'static str, cap: u64, size: u64, cache: Cache },
    RamFree { allocator: &'static str, cap: u64 },
    CoreAttach { cap: u64, addr: u64, writeable: bool },
    CoreDetach { addr: u64 },
    VcpuManaged { cap: u64 },
    VcpuDissolved { cap: u64 },
    KernelVcpuCreated { cap: u64, cpu: u32, state_addr: u64, signal: u64, vm: u8 },
    KernelVcpuDestroyed { cap: u64 },
}

/// Ordered record of events, shared by all fakes of a test. When watching a
/// [`VmidAllocator`], each event also captures the ids allocated at the time.
#[derive(Clone, Default)]
pub(crate) struct EventLog {
    records: Arc<Mutex<Vec<(Event, Vec<u8>)>>>,
    vmids: Option<Arc<VmidAllocator>>,
}

impl EventLog {
    pub(crate) fn watching(vmids: Arc<VmidAllocator>) -> Self {
        Self {
            records: Default::default(),
            vmids: Some(vmids),
        }
    }

    pub(crate) fn record(&self, event: Event) {
        let vmids = self
            .vmids
            .as_ref()
            .map(|vmids| vmids.allocated().unwrap())
            .unwrap_or_default();
        self.records.lock().unwrap().push((event, vmids));
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub(crate) fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(event, _)| f(event))
            .count()
    }

    /// Whether `vm` was allocated when each event matching `f` happened
    pub(crate) fn vmid_held_during(&self, vm: u8, f: impl Fn(&Event) -> bool) -> Vec<bool> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(event, _)| f(event))
            .map(|(_, vmids)| vmids.contains(&vm))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.events()).finish()
    }
}

/// A client dataspace reporting region notifications to its log
#[derive(Debug)]
pub(crate) struct FakeDataspace {
    log: EventLog,
    cap: u64,
    size: u64,
    phys: u64,
    managed: bool,
    writeable: bool,
}

impl FakeDataspace {
    pub(crate) fn new(log: &EventLog, cap: u64, size: u64, phys: u64) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            cap,
            size,
            phys,
            managed: false,
            writeable: true,
        })
    }

    pub(crate) fn managed(log: &EventLog, cap: u64, size: u64) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            cap,
            size,
            phys: 0,
            managed: true,
            writeable: true,
        })
    }

    pub(crate) fn read_only(log: &EventLog, cap: u64, size: u64, phys: u64) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            cap,
            size,
            phys,
            managed: false,
            writeable: false,
        })
    }
}

impl Dataspace for FakeDataspace {
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
        self.managed
    }

    fn writeable(&self) -> bool {
        self.writeable
    }

    fn attached_to(&self, region: &RegionAttr) {
        self.log.record(Event::DataspaceAttached {
            cap: self.cap,
            base: region.base,
            size: region.size,
        });
    }

    fn detached_from(&self, region: &RegionAttr) {
        self.log.record(Event::DataspaceDetached {
            cap: self.cap,
            base: region.base,
            size: region.size,
        });
    }
}

/// A bump allocator over a fake physical range
pub(crate) struct FakeRam {
    name: &'static str,
    log: EventLog,
    next_phys: AtomicU64,
    live: Mutex<HashSet<u64>>,
    frees: AtomicUsize,
    fail_next: AtomicBool,
}

impl FakeRam {
    pub(crate) fn new(name: &'static str, phys_base: u64) -> Arc<Self> {
        Self::logged(&EventLog::default(), name, phys_base)
    }

    pub(crate) fn logged(log: &EventLog, name: &'static str, phys_base: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            log: log.clone(),
            next_phys: AtomicU64::new(phys_base),
            live: Mutex::new(HashSet::new()),
            frees: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        })
    }

    /// Makes the next allocation fail with `OutOfRam`
    pub(crate) fn fail_next_alloc(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of dataspaces allocated and not yet freed
    pub(crate) fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Number of frees, including bogus ones
    pub(crate) fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

impl RamAllocator for FakeRam {
    fn alloc(&self, size: u64, cache: Cache) -> Result<RamDataspace, AllocError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AllocError::OutOfRam);
        }
        let size = align_page_up(size).ok_or(AllocError::OutOfRam)?;
        let phys_addr = self.next_phys.fetch_add(size, Ordering::SeqCst);
        let cap = next_cap();
        self.live.lock().unwrap().insert(cap);
        self.log.record(Event::RamAlloc {
            allocator: self.name,
            cap,
            size,
            cache,
        });
        Ok(RamDataspace {
            cap: DataspaceCap::new(cap),
            size,
            phys_addr,
        })
    }

    fn free(&self, ds: RamDataspace) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        assert!(
            self.live.lock().unwrap().remove(&ds.cap.raw()),
            "{} freed unknown dataspace {:?}",
            self.name,
            ds.cap
        );
        self.log.record(Event::RamFree {
            allocator: self.name,
            cap: ds.cap.raw(),
        });
    }
}

/// Resolves dataspaces and thread affinities registered by the test and
/// hands out vCPU capabilities
pub(crate) struct FakeEntrypoint {
    log: EventLog,
    dataspaces: Mutex<HashMap<u64, Arc<dyn Dataspace>>>,
    affinities: Mutex<HashMap<u64, AffinityLocation>>,
    vcpus: Mutex<HashSet<u64>>,
    exhausted: AtomicBool,
}

impl FakeEntrypoint {
    pub(crate) fn new(log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            dataspaces: Mutex::new(HashMap::new()),
            affinities: Mutex::new(HashMap::new()),
            vcpus: Mutex::new(HashSet::new()),
            exhausted: AtomicBool::new(false),
        })
    }

    pub(crate) fn add_dataspace(&self, ds: Arc<dyn Dataspace>) {
        self.dataspaces.lock().unwrap().insert(ds.cap().raw(), ds);
    }

    pub(crate) fn remove_dataspace(&self, cap: u64) {
        self.dataspaces.lock().unwrap().remove(&cap);
    }

    pub(crate) fn set_affinity(&self, thread: ThreadCap, location: AffinityLocation) {
        self.affinities
            .lock()
            .unwrap()
            .insert(thread.raw(), location);
    }

    /// Makes every further `manage_vcpu` return an invalid capability
    pub(crate) fn exhaust_caps(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn live_vcpus(&self) -> usize {
        self.vcpus.lock().unwrap().len()
    }
}

impl Entrypoint for FakeEntrypoint {
    fn lookup_dataspace(&self, cap: DataspaceCap) -> Option<Arc<dyn Dataspace>> {
        self.dataspaces.lock().unwrap().get(&cap.raw()).cloned()
    }

    fn thread_affinity(&self, cap: ThreadCap) -> Option<AffinityLocation> {
        self.affinities.lock().unwrap().get(&cap.raw()).copied()
    }

    fn manage_vcpu(&self) -> VcpuCap {
        if self.exhausted.load(Ordering::SeqCst) {
            return VcpuCap::invalid();
        }
        let cap = next_cap();
        self.vcpus.lock().unwrap().insert(cap);
        self.log.record(Event::VcpuManaged { cap });
        VcpuCap::new(cap)
    }

    fn dissolve_vcpu(&self, cap: VcpuCap) {
        assert!(
            self.vcpus.lock().unwrap().remove(&cap.raw()),
            "dissolved unknown vCPU {:?}",
            cap
        );
        self.log.record(Event::VcpuDissolved { cap: cap.raw() });
    }
}

/// Core's address space, handing out ascending local addresses
pub(crate) struct FakeRegionMap {
    log: EventLog,
    next_addr: AtomicU64,
    attached: Mutex<HashMap<u64, u64>>,
    fail_next: AtomicBool,
}

impl FakeRegionMap {
    pub(crate) fn new(log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            next_addr: AtomicU64::new(0xa000_0000),
            attached: Mutex::new(HashMap::new()),
            fail_next: AtomicBool::new(false),
        })
    }

    /// Makes the next attach fail with `RegionConflict`
    pub(crate) fn fail_next_attach(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn live(&self) -> usize {
        self.attached.lock().unwrap().len()
    }
}

impl RegionMap for FakeRegionMap {
    fn attach(&self, ds: DataspaceCap, attr: AttachAttr) -> Result<u64, RegionMapError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RegionMapError::RegionConflict);
        }
        let size = align_page_up(attr.size.max(PAGE_SIZE)).ok_or(RegionMapError::InvalidDataspace)?;
        let addr = self.next_addr.fetch_add(size, Ordering::SeqCst);
        self.attached.lock().unwrap().insert(addr, ds.raw());
        self.log.record(Event::CoreAttach {
            cap: ds.raw(),
            addr,
            writeable: attr.writeable,
        });
        Ok(addr)
    }

    fn detach(&self, addr: u64) {
        assert!(
            self.attached.lock().unwrap().remove(&addr).is_some(),
            "detached unknown address {:#x}",
            addr
        );
        self.log.record(Event::CoreDetach { addr });
    }
}

/// The kernel's VM interface, refusing vCPU objects on request
pub(crate) struct FakeKernel {
    log: EventLog,
    live: Mutex<HashSet<u64>>,
    refuse: AtomicBool,
}

impl FakeKernel {
    pub(crate) fn new(log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            live: Mutex::new(HashSet::new()),
            refuse: AtomicBool::new(false),
        })
    }

    /// Makes every further `create_vcpu` fail
    pub(crate) fn refuse_vcpus(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub(crate) fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl KernelVm for FakeKernel {
    fn create_vcpu(
        &self,
        cpu: u32,
        state_addr: u64,
        signal: SignalCap,
        identity: &VmIdentity,
    ) -> Option<KernelVcpuCap> {
        if self.refuse.load(Ordering::SeqCst) {
            return None;
        }
        let cap = next_cap();
        self.live.lock().unwrap().insert(cap);
        self.log.record(Event::KernelVcpuCreated {
            cap,
            cpu,
            state_addr,
            signal: signal.raw(),
            vm: identity.id,
        });
        Some(KernelVcpuCap::new(cap))
    }

    fn destroy_vcpu(&self, vcpu: KernelVcpuCap) {
        assert!(self.live.lock().unwrap().remove(&vcpu.raw()));
        self.log.record(Event::KernelVcpuDestroyed { cap: vcpu.raw() });
    }
}

/// One fake of every collaborator, sharing a log that watches `vmids`
pub(crate) struct Fakes {
    pub(crate) log: EventLog,
    pub(crate) vmids: Arc<VmidAllocator>,
    pub(crate) ep: Arc<FakeEntrypoint>,
    pub(crate) ram: Arc<FakeRam>,
    pub(crate) core_ram: Arc<FakeRam>,
    pub(crate) region_map: Arc<FakeRegionMap>,
    pub(crate) kernel: Arc<FakeKernel>,
}

impl Default for Fakes {
    fn default() -> Self {
        let vmids = Arc::new(VmidAllocator::new());
        let log = EventLog::watching(vmids.clone());
        Self {
            ep: FakeEntrypoint::new(&log),
            ram: FakeRam::logged(&log, "ram", 0x1000_0000),
            core_ram: FakeRam::logged(&log, "core_ram", 0x8000_0000),
            region_map: FakeRegionMap::new(&log),
            kernel: FakeKernel::new(&log),
            vmids,
            log,
        }
    }
}

impl Fakes {
    pub(crate) fn platform(&self) -> Platform {
        Platform {
            ep: self.ep.clone(),
            ram: self.ram.clone(),
            core_ram: self.core_ram.clone(),
            region_map: self.region_map.clone(),
            kernel: self.kernel.clone(),
        }
    }

    /// Creates a client dataspace the entrypoint resolves
    pub(crate) fn add_dataspace(&self, cap: u64, size: u64, phys: u64) -> Arc<FakeDataspace> {
        let ds = FakeDataspace::new(&self.log, cap, size, phys);
        self.ep.add_dataspace(ds.clone());
        ds
    }
}
