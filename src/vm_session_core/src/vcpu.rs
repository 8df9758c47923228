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
use vm_session_common::kernel::{VmIdentity, VCPU_DATA_SIZE};

use crate::capability::{DataspaceCap, KernelVcpuCap, SignalCap, VcpuCap};
use crate::mem::quota::{ConstrainedRamAllocator, SharedQuota};
use crate::platform::{AffinityLocation, Entrypoint, KernelVm, RamDataspace, RegionMap};

/// Resources a session set up for a new vCPU, handed over to [`Vcpu::new`].
#[derive(Debug)]
pub(crate) struct VcpuResources {
    pub(crate) cap: VcpuCap,
    pub(crate) state: RamDataspace,
    pub(crate) state_addr: u64,
    pub(crate) location: AffinityLocation,
}

/// Handles of the collaborators a vCPU releases its resources to.
#[derive(Clone)]
pub(crate) struct VcpuEnv {
    pub(crate) ep: Arc<dyn Entrypoint>,
    pub(crate) region_map: Arc<dyn RegionMap>,
    pub(crate) kernel: Arc<dyn KernelVm>,
    pub(crate) ram: ConstrainedRamAllocator,
    pub(crate) quota: SharedQuota,
}

/// One virtual CPU of a VM session.
///
/// Owns the page of state shared with the kernel and, once an exception
/// handler is registered, the kernel object executing it. Everything is
/// released when the vCPU is dropped.
pub struct Vcpu {
    identity: VmIdentity,
    cap: VcpuCap,
    state: RamDataspace,
    state_addr: u64,
    location: AffinityLocation,
    kobj: Option<KernelVcpuCap>,
    env: VcpuEnv,
}

impl Vcpu {
    pub(crate) fn new(identity: VmIdentity, resources: VcpuResources, env: VcpuEnv) -> Self {
        Self {
            identity,
            cap: resources.cap,
            state: resources.state,
            state_addr: resources.state_addr,
            location: resources.location,
            kobj: None,
            env,
        }
    }

    /// Binds `signal` as the target of VM exits and creates the kernel
    /// object executing this vCPU.
    ///
    /// Registration happens at most once. An invalid signal or a second
    /// registration is logged and ignored.
    #[instrument(skip(self), parent = Span::current(), level = "Trace")]
    pub fn exception_handler(&mut self, signal: SignalCap) {
        if !signal.is_valid() {
            log::warn!("no valid signal handler for vCPU {:?}", self.cap);
            return;
        }
        if self.kobj.is_some() {
            log::warn!("cannot register vCPU {:?} exception handler twice", self.cap);
            return;
        }
        match self.env.kernel.create_vcpu(
            self.location.cpu(),
            self.state_addr,
            signal,
            &self.identity,
        ) {
            Some(kobj) => self.kobj = Some(kobj),
            None => log::warn!(
                "cannot instantiate kernel vCPU object for {:?}, invalid signal context?",
                self.cap
            ),
        }
    }

    /// The dataspace holding the state shared with the kernel
    pub fn state(&self) -> DataspaceCap {
        self.state.cap
    }

    /// The kernel object executing this vCPU, once a handler is registered
    pub fn native_vcpu(&self) -> Option<KernelVcpuCap> {
        self.kobj
    }

    /// The capability clients address this vCPU with
    pub fn cap(&self) -> VcpuCap {
        self.cap
    }

    /// Where this vCPU executes
    pub fn location(&self) -> AffinityLocation {
        self.location
    }

    /// Core-local address of the state page
    pub fn state_addr(&self) -> u64 {
        self.state_addr
    }

    /// Host-physical address of the state page
    pub fn state_phys(&self) -> u64 {
        self.state.phys_addr
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        if let Some(kobj) = self.kobj.take() {
            self.env.kernel.destroy_vcpu(kobj);
        }
        self.env.ep.dissolve_vcpu(self.cap);
        self.env.region_map.detach(self.state_addr);
        self.env.ram.free(self.state);
        self.env.quota.replenish(VCPU_DATA_SIZE, 0);
    }
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("cap", &self.cap)
            .field("vm", &self.identity.id)
            .field("cpu", &self.location.cpu())
            .field("state", &self.state.cap)
            .field("kobj", &self.kobj)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use vm_session_common::kernel::VCPU_STATE_SIZE;
    use vm_session_testing::logger::{Logger, LOGGER};

    use super::*;
    use crate::capability::ThreadCap;
    use crate::page_table::Ept;
    use crate::testing::{Event, Fakes};
    use crate::{VmSession, VmSessionConfiguration};

    fn session(fakes: &Fakes) -> VmSession<Ept> {
        VmSession::new(
            VmSessionConfiguration::default(),
            fakes.platform(),
            fakes.vmids.clone(),
        )
        .unwrap()
    }

    #[test]
    fn state_is_shared_uncached_memory() {
        let fakes = Fakes::default();
        let mut vm = session(&fakes);
        let cap = vm.create_vcpu(ThreadCap::invalid());
        let vcpu = vm.vcpu(cap).unwrap();

        assert_eq!(vcpu.cap(), cap);
        assert!(vcpu.native_vcpu().is_none());
        assert_eq!(vcpu.location(), AffinityLocation::default());
        assert_eq!(vcpu.state_phys(), 0x1000_0000);
        assert!(fakes.log.events().contains(&Event::RamAlloc {
            allocator: "ram",
            cap: vcpu.state().raw(),
            size: VCPU_STATE_SIZE,
            cache: crate::platform::Cache::Uncached,
        }));
        assert!(fakes.log.events().contains(&Event::CoreAttach {
            cap: vcpu.state().raw(),
            addr: vcpu.state_addr(),
            writeable: true,
        }));
    }

    #[test]
    fn handler_registration_creates_kernel_object_once() {
        let fakes = Fakes::default();
        let mut vm = session(&fakes);
        let cap = vm.create_vcpu(ThreadCap::invalid());

        vm.with_vcpu(cap, |vcpu| {
            vcpu.exception_handler(SignalCap::new(0x40));
            let kobj = vcpu.native_vcpu();
            assert!(kobj.is_some());
            vcpu.exception_handler(SignalCap::new(0x41));
            assert_eq!(vcpu.native_vcpu(), kobj);
        });
        assert_eq!(
            fakes
                .log
                .count(|e| matches!(e, Event::KernelVcpuCreated { .. })),
            1
        );
        assert_eq!(fakes.kernel.live(), 1);

        drop(vm);
        assert_eq!(fakes.kernel.live(), 0);
    }

    #[test]
    #[serial]
    fn misuse_is_logged_and_ignored() {
        Logger::initialize_test_logger();
        LOGGER.set_max_level(log::LevelFilter::Warn);

        let fakes = Fakes::default();
        let mut vm = session(&fakes);
        let cap = vm.create_vcpu(ThreadCap::invalid());
        LOGGER.clear_log_calls();

        vm.with_vcpu(cap, |vcpu| {
            vcpu.exception_handler(SignalCap::invalid());
            assert!(vcpu.native_vcpu().is_none());

            fakes.kernel.refuse_vcpus();
            vcpu.exception_handler(SignalCap::new(0x40));
            assert!(vcpu.native_vcpu().is_none());
        });

        LOGGER.test_log_records(|log_calls| {
            assert_eq!(log_calls.len(), 2);
            assert!(log_calls[0].args.starts_with("no valid signal handler"));
            assert!(log_calls[1]
                .args
                .starts_with("cannot instantiate kernel vCPU object"));
            assert!(log_calls.iter().all(|call| call.level == log::Level::Warn));
        });
        LOGGER.set_max_level(log::LevelFilter::Off);
    }

    #[test]
    fn dropping_releases_everything() {
        let fakes = Fakes::default();
        let mut vm = session(&fakes);
        let cap = vm.create_vcpu(ThreadCap::invalid());
        vm.with_vcpu(cap, |vcpu| vcpu.exception_handler(SignalCap::new(0x40)));
        fakes.log.clear();

        drop(vm);
        let events = fakes.log.events();
        assert!(matches!(
            events.as_slice(),
            [
                Event::KernelVcpuDestroyed { .. },
                Event::VcpuDissolved { .. },
                Event::CoreDetach { .. },
                Event::RamFree { allocator: "ram", .. },
                Event::RamFree { allocator: "core_ram", .. },
            ]
        ));
        assert_eq!(fakes.ep.live_vcpus(), 0);
        assert_eq!(fakes.ram.live(), 0);
    }
}
