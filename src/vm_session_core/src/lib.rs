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

#![deny(dead_code, missing_docs, unused_mut)]
//! Guest-memory management and second-level address translation for a
//! hypervisor VM session service.
//!
//! A [`session::root::VmRoot`] hands out one [`session::VmSession`] per
//! client. Each session tracks which host dataspaces back which
//! guest-physical ranges, keeps the nested page table (EPT on VMX, NPT on
//! SVM) in sync with that bookkeeping, and owns the virtual CPUs of the VM.

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

/// Typed capability handles
pub mod capability;
/// Dealing with errors
pub mod error;
/// Guest-physical memory bookkeeping and session quota accounting
pub mod mem;
/// Metric definitions and helpers
pub mod metrics;
/// Nested page tables for SVM (Hpt) and VMX (Ept)
pub mod page_table;
/// Interfaces of the collaborators this core is driven against
pub mod platform;
/// VM sessions and the factory that creates them
pub mod session;
/// Virtual CPUs
pub mod vcpu;
/// Allocation of VM identities
pub mod vmid;
/// Recording fakes for the collaborator interfaces
#[cfg(test)]
pub(crate) mod testing;

/// The re-export for the `VmSessionError` type
pub use error::VmSessionError;
/// The re-export for the `VmRoot` type
pub use session::root::VmRoot;
/// The re-export for the `AnySession` type
pub use session::AnySession;
/// The re-export for the `VmSession` type
pub use session::VmSession;
/// The re-export for the `VmSessionConfiguration` type
pub use session::config::VmSessionConfiguration;
/// The re-export for the `VmidAllocator` type
pub use vmid::VmidAllocator;

/// The universal `Result` type used throughout this crate.
pub type Result<T> = core::result::Result<T, error::VmSessionError>;

/// Logs an error then returns with it, more or less equivalent to the bail! macro in anyhow
/// but for VmSessionError instead of anyhow::Error
#[macro_export]
macro_rules! log_then_return {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        let __err = $crate::VmSessionError::Error(__err_msg);
        log::error!("{}", __err);
        return Err(__err);
    }};
    ($err:expr $(,)?) => {
        log::error!("{}", $err);
        return Err($err);
    };
    ($fmtstr:expr, $($arg:tt)*) => {
           let __err_msg = std::format!($fmtstr, $($arg)*);
           let __err = $crate::error::VmSessionError::Error(__err_msg);
           log::error!("{}", __err);
           return Err(__err);
    };
}
