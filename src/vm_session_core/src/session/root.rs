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

use super::args;
use super::config::VmSessionConfiguration;
use super::virt::VirtType;
use super::{AnySession, VmSession};
use crate::error::VmSessionError;
use crate::metrics::{METRIC_SESSIONS_CREATED, METRIC_SESSIONS_CREATED_LABEL_VIRT};
use crate::platform::Platform;
use crate::{log_then_return, Result, VmidAllocator};

/// Creates VM sessions for the virtualization extension of the CPU.
///
/// All sessions of a root share one [`VmidAllocator`].
#[derive(Debug)]
pub struct VmRoot {
    platform: Platform,
    vmids: Arc<VmidAllocator>,
    virt: Option<VirtType>,
}

impl VmRoot {
    /// A root for the virtualization extension the CPU reports
    pub fn new(platform: Platform, vmids: Arc<VmidAllocator>) -> Self {
        Self::with_virt_type(platform, vmids, *VirtType::probe())
    }

    /// A root for `virt`, or one denying every session for `None`
    pub fn with_virt_type(
        platform: Platform,
        vmids: Arc<VmidAllocator>,
        virt: Option<VirtType>,
    ) -> Self {
        Self {
            platform,
            vmids,
            virt,
        }
    }

    /// The virtualization extension sessions are created for
    pub fn virt_type(&self) -> Option<VirtType> {
        self.virt
    }

    /// Creates a session from an argument string such as
    /// `label="vmm", ram_quota=8M, cap_quota=20, priority=3`.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn create_session(&self, args: &str) -> Result<AnySession> {
        let config = VmSessionConfiguration::from_args(args)?;
        self.create_session_with_config(config)
    }

    /// Creates a session from a configuration
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn create_session_with_config(&self, config: VmSessionConfiguration) -> Result<AnySession> {
        let Some(virt) = self.virt else {
            log_then_return!(VmSessionError::ServiceDenied);
        };
        let platform = self.platform.clone();
        let vmids = self.vmids.clone();
        let session = match virt {
            VirtType::Svm => AnySession::Svm(VmSession::new(config, platform, vmids)?),
            VirtType::Vmx => AnySession::Vmx(VmSession::new(config, platform, vmids)?),
        };
        metrics::counter!(
            METRIC_SESSIONS_CREATED,
            METRIC_SESSIONS_CREATED_LABEL_VIRT => virt.name()
        )
        .increment(1);
        Ok(session)
    }

    /// Adds the `ram_quota` and `cap_quota` given in `args` to a session.
    #[instrument(err(Debug), skip(self, session), parent = Span::current(), level = "Trace")]
    pub fn upgrade_session(&self, session: &mut AnySession, args: &str) -> Result<()> {
        let ram = args::ulong_value(args, "ram_quota", 0)?;
        let caps = args::ulong_value(args, "cap_quota", 0)?;
        session.upgrade(ram, caps);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use vm_session_testing::logger::{Logger, LOGGER};

    use super::*;
    use crate::testing::Fakes;

    fn root(fakes: &Fakes, virt: Option<VirtType>) -> VmRoot {
        VmRoot::with_virt_type(fakes.platform(), fakes.vmids.clone(), virt)
    }

    #[test]
    fn creates_session_for_virt_type() {
        let fakes = Fakes::default();

        let session = root(&fakes, Some(VirtType::Svm))
            .create_session(r#"label="a""#)
            .unwrap();
        assert!(matches!(session, AnySession::Svm(_)));
        assert_eq!(session.virt_type(), VirtType::Svm);
        assert_eq!(session.label(), "a");

        let session = root(&fakes, Some(VirtType::Vmx))
            .create_session("")
            .unwrap();
        assert!(matches!(session, AnySession::Vmx(_)));
        assert_eq!(session.identity().id, 2);
    }

    #[test]
    #[serial]
    fn denied_without_virtualization() {
        Logger::initialize_test_logger();
        LOGGER.set_max_level(log::LevelFilter::Error);
        LOGGER.clear_log_calls();

        let fakes = Fakes::default();
        let err = root(&fakes, None).create_session("").unwrap_err();
        assert_eq!(err, VmSessionError::ServiceDenied);
        assert!(fakes.vmids.allocated().unwrap().is_empty());
        assert_eq!(fakes.core_ram.live(), 0);

        LOGGER.test_log_records(|log_calls| {
            assert!(log_calls
                .iter()
                .any(|call| call.args.contains("Service denied")));
        });
        LOGGER.set_max_level(log::LevelFilter::Off);
    }

    #[test]
    fn priority_and_quota_from_args() {
        let fakes = Fakes::default();
        let root = root(&fakes, Some(VirtType::Vmx));
        let session = root
            .create_session("priority=100000, ram_quota=2M, cap_quota=40")
            .unwrap();
        assert_eq!(session.priority(), VmSessionConfiguration::MAX_PRIORITY);
        assert_eq!(session.quota().ram.limit(), 2 << 20);
        assert_eq!(session.quota().caps.limit(), 40);
    }

    #[test]
    fn malformed_args_are_rejected() {
        let fakes = Fakes::default();
        let root = root(&fakes, Some(VirtType::Svm));
        assert!(matches!(
            root.create_session("ram_quota=plenty"),
            Err(VmSessionError::InvalidSessionArgs(_))
        ));
        assert!(fakes.vmids.allocated().unwrap().is_empty());
    }

    #[test]
    fn quota_too_small_for_page_tables() {
        let fakes = Fakes::default();
        let root = root(&fakes, Some(VirtType::Svm));
        assert_eq!(
            root.create_session("ram_quota=64K").unwrap_err(),
            VmSessionError::OutOfRam
        );
        assert_eq!(
            root.create_session("cap_quota=0").unwrap_err(),
            VmSessionError::OutOfCaps
        );
        assert!(fakes.vmids.allocated().unwrap().is_empty());
        assert_eq!(fakes.core_ram.live(), 0);
    }

    #[test]
    fn identity_exhaustion_releases_storage() {
        let fakes = Fakes::default();
        while fakes.vmids.alloc().is_ok() {}
        let root = root(&fakes, Some(VirtType::Vmx));
        assert_eq!(
            root.create_session("").unwrap_err(),
            VmSessionError::OutOfVmIds
        );
        assert_eq!(fakes.core_ram.live(), 0);
    }

    #[test]
    fn upgrade_adds_quota() {
        let fakes = Fakes::default();
        let root = root(&fakes, Some(VirtType::Svm));
        let mut session = root.create_session("ram_quota=1M, cap_quota=8").unwrap();
        root.upgrade_session(&mut session, "ram_quota=64K, cap_quota=2")
            .unwrap();
        assert_eq!(session.quota().ram.limit(), (1 << 20) + (64 << 10));
        assert_eq!(session.quota().caps.limit(), 10);

        root.upgrade_session(&mut session, "label=\"x\"").unwrap();
        assert_eq!(session.quota().caps.limit(), 10);
        assert!(root.upgrade_session(&mut session, "cap_quota=x").is_err());
    }
}
