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

//! Limits the core shares with the kernel it runs on.

/// Maximum number of virtual CPUs a single VM session may create.
pub const VCPU_MAX: usize = 16;

/// Number of translation tables a single nested page table may allocate
/// below its root.
pub const DEFAULT_TRANSLATION_TABLE_MAX: usize = 128;

/// Number of VM-identity slots. Slot 0 is never handed to a guest.
pub const VMID_SLOTS: usize = 256;

/// Exclusive upper bound of scheduler priorities.
pub const PRIORITY_LIMIT: u32 = 1 << 16;

/// Size of the kernel-side per-vCPU virtualization area (VMCS/VMCB plus host
/// save area) that each vCPU charges against the session's RAM quota.
pub const VCPU_DATA_SIZE: u64 = 2 * crate::mem::PAGE_SIZE;

/// Size of the vCPU state page shared between the kernel and the VMM.
pub const VCPU_STATE_SIZE: u64 = crate::mem::PAGE_SIZE;

/// Names one guest VM towards the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmIdentity {
    /// Small integer handle, never 0
    pub id: u8,
    /// Physical address of the root of the nested page table
    pub page_table_root: u64,
}
