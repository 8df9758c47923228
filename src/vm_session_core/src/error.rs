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

use std::error::Error;
use std::sync::{MutexGuard, PoisonError};

use thiserror::Error;

use crate::mem::guest_memory::AttachError;
use crate::page_table::TranslationError;
use crate::platform::{AllocError, RegionMapError};

/// The error type for VM session operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmSessionError {
    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// The dataspace reference is unusable, or the address, size or offset
    /// of a request is malformed
    #[error("Invalid dataspace")]
    InvalidDataspace,

    /// Session arguments could not be parsed
    #[error("Invalid session arguments: {0}")]
    InvalidSessionArgs(String),

    /// Failure to acquire a lock
    #[error("Unable to lock resource: {0}")]
    LockAttemptFailed(String),

    /// The requested operation is not supported
    #[error("Operation not implemented: {0}")]
    NotImplemented(&'static str),

    /// The session ran out of capability quota
    #[error("Out of capability quota")]
    OutOfCaps,

    /// The session ran out of RAM quota, including nested page-table storage
    #[error("Out of RAM quota")]
    OutOfRam,

    /// All VM identities are in use
    #[error("No free VM identity left")]
    OutOfVmIds,

    /// The request overlaps an existing, incompatible guest-memory region
    #[error("Guest-physical region conflict")]
    RegionConflict,

    /// No hardware virtualization support was found
    #[error("Service denied: no hardware virtualization support")]
    ServiceDenied,
}

impl VmSessionError {
    /// A short, stable name of the error kind, suitable as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            VmSessionError::Error(_) => "error",
            VmSessionError::InvalidDataspace => "invalid_dataspace",
            VmSessionError::InvalidSessionArgs(_) => "invalid_session_args",
            VmSessionError::LockAttemptFailed(_) => "lock_attempt_failed",
            VmSessionError::NotImplemented(_) => "not_implemented",
            VmSessionError::OutOfCaps => "out_of_caps",
            VmSessionError::OutOfRam => "out_of_ram",
            VmSessionError::OutOfVmIds => "out_of_vm_ids",
            VmSessionError::RegionConflict => "region_conflict",
            VmSessionError::ServiceDenied => "service_denied",
        }
    }
}

impl From<&str> for VmSessionError {
    fn from(s: &str) -> Self {
        VmSessionError::Error(s.to_string())
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for VmSessionError {
    // PoisonError borrows the guard, so only its message can be carried over
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => e.to_string(),
        };
        VmSessionError::LockAttemptFailed(source)
    }
}

impl From<TranslationError> for VmSessionError {
    fn from(e: TranslationError) -> Self {
        match e {
            // table storage is carved from the session's RAM quota
            TranslationError::OutOfTables => VmSessionError::OutOfRam,
            TranslationError::InvalidMapping => VmSessionError::InvalidDataspace,
        }
    }
}

impl From<AttachError> for VmSessionError {
    fn from(e: AttachError) -> Self {
        match e {
            AttachError::InvalidDataspace => VmSessionError::InvalidDataspace,
            AttachError::OutOfRam => VmSessionError::OutOfRam,
            AttachError::OutOfCaps => VmSessionError::OutOfCaps,
            AttachError::RegionConflict => VmSessionError::RegionConflict,
            AttachError::Translation { error, .. } => error.into(),
        }
    }
}

impl From<AllocError> for VmSessionError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfRam => VmSessionError::OutOfRam,
            AllocError::OutOfCaps => VmSessionError::OutOfCaps,
        }
    }
}

impl From<RegionMapError> for VmSessionError {
    fn from(e: RegionMapError) -> Self {
        match e {
            RegionMapError::OutOfRam => VmSessionError::OutOfRam,
            RegionMapError::OutOfCaps => VmSessionError::OutOfCaps,
            RegionMapError::RegionConflict => VmSessionError::RegionConflict,
            RegionMapError::InvalidDataspace => VmSessionError::InvalidDataspace,
        }
    }
}

/// Creates a `VmSessionError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::VmSessionError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::VmSessionError::Error(__err_msg)
    }};
}
