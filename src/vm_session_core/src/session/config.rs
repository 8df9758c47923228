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

use std::cmp::{max, min};

use tracing::{instrument, Span};
use vm_session_common::kernel::PRIORITY_LIMIT;

use super::args;
use crate::Result;

/// The complete set of configuration needed to create a VM session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmSessionConfiguration {
    /// Scheduling priority of the session's vCPUs, below `PRIORITY_LIMIT`
    priority: u32,
    /// RAM quota donated by the client, in bytes. Covers the nested page
    /// table, region metadata and vCPU state.
    ram_quota: u64,
    /// Capability quota donated by the client
    cap_quota: u64,
    /// Label of the client
    label: String,
    /// Whether a region whose hardware mapping failed is detached again
    /// before the error is returned
    rollback_failed_mappings: bool,
}

impl VmSessionConfiguration {
    /// The default priority
    pub const DEFAULT_PRIORITY: u32 = 0;
    /// The highest priority
    pub const MAX_PRIORITY: u32 = PRIORITY_LIMIT - 1;
    /// The default RAM quota
    pub const DEFAULT_RAM_QUOTA: u64 = 1 << 20;
    /// The default capability quota
    pub const DEFAULT_CAP_QUOTA: u64 = 32;

    /// Creates a configuration from session arguments. Keys that are absent
    /// fall back to their defaults.
    #[instrument(err(Debug), skip(args), parent = Span::current(), level = "Trace")]
    pub fn from_args(args: &str) -> Result<Self> {
        let mut config = Self::default();
        let priority = args::long_value(args, "priority", Self::DEFAULT_PRIORITY as i64)?;
        config.set_priority(u32::try_from(max(priority, 0)).unwrap_or(u32::MAX));
        config.set_ram_quota(args::ulong_value(args, "ram_quota", Self::DEFAULT_RAM_QUOTA)?);
        config.set_cap_quota(args::ulong_value(args, "cap_quota", Self::DEFAULT_CAP_QUOTA)?);
        if let Some(label) = args::string_value(args, "label") {
            config.set_label(label);
        }
        Ok(config)
    }

    /// Sets the priority, clamped to `MAX_PRIORITY`
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_priority(&mut self, priority: u32) {
        self.priority = min(priority, Self::MAX_PRIORITY);
    }

    /// Sets the RAM quota
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_ram_quota(&mut self, ram_quota: u64) {
        self.ram_quota = ram_quota;
    }

    /// Sets the capability quota
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_cap_quota(&mut self, cap_quota: u64) {
        self.cap_quota = cap_quota;
    }

    /// Sets the label
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    /// Chooses whether a region whose hardware mapping failed is rolled back
    pub fn set_rollback_failed_mappings(&mut self, rollback: bool) {
        self.rollback_failed_mappings = rollback;
    }

    /// The priority
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// The RAM quota
    pub fn ram_quota(&self) -> u64 {
        self.ram_quota
    }

    /// The capability quota
    pub fn cap_quota(&self) -> u64 {
        self.cap_quota
    }

    /// The label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether failed mappings are rolled back
    pub fn rollback_failed_mappings(&self) -> bool {
        self.rollback_failed_mappings
    }
}

impl Default for VmSessionConfiguration {
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    fn default() -> Self {
        Self {
            priority: Self::DEFAULT_PRIORITY,
            ram_quota: Self::DEFAULT_RAM_QUOTA,
            cap_quota: Self::DEFAULT_CAP_QUOTA,
            label: String::new(),
            rollback_failed_mappings: false,
        }
    }
}
