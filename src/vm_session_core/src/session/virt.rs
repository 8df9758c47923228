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

use std::fmt;
use std::sync::OnceLock;

static AVAILABLE_VIRT_TYPE: OnceLock<Option<VirtType>> = OnceLock::new();

/// The hardware virtualization extension sessions are created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtType {
    /// Intel VT-x, nested translation through an EPT
    Vmx,
    /// AMD-V, nested translation through long-mode page tables
    Svm,
}

impl VirtType {
    /// Detects the virtualization extension of the CPU we run on.
    ///
    /// The result is cached after the first call. VMX takes precedence when
    /// a CPU reports both.
    ///
    /// ```no_run
    /// use vm_session_core::session::virt::VirtType;
    ///
    /// match VirtType::probe() {
    ///     Some(virt) => println!("sessions use {}", virt),
    ///     None => println!("no hardware virtualization"),
    /// }
    /// ```
    pub fn probe() -> &'static Option<VirtType> {
        AVAILABLE_VIRT_TYPE.get_or_init(|| {
            cfg_if::cfg_if! {
                if #[cfg(target_arch = "x86_64")] {
                    if cpuid::has_vmx() {
                        Some(VirtType::Vmx)
                    } else if cpuid::has_svm() {
                        Some(VirtType::Svm)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        })
    }

    /// Short lowercase name, used as a metric label
    pub fn name(&self) -> &'static str {
        match self {
            VirtType::Vmx => "vmx",
            VirtType::Svm => "svm",
        }
    }
}

impl fmt::Display for VirtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(target_arch = "x86_64")]
mod cpuid {
    use core::arch::x86_64::__cpuid;

    const FEATURE_LEAF: u32 = 1;
    const EXTENDED_MAX_LEAF: u32 = 0x8000_0000;
    const EXTENDED_FEATURE_LEAF: u32 = 0x8000_0001;
    const ECX_VMX: u32 = 1 << 5;
    const ECX_SVM: u32 = 1 << 2;

    #[allow(unused_unsafe)]
    pub(super) fn has_vmx() -> bool {
        // SAFETY: CPUID exists on every x86_64 CPU and leaf 1 is always valid
        let leaf = unsafe { __cpuid(FEATURE_LEAF) };
        leaf.ecx & ECX_VMX != 0
    }

    #[allow(unused_unsafe)]
    pub(super) fn has_svm() -> bool {
        // SAFETY: CPUID exists on every x86_64 CPU, extended leaves are only
        // read after checking the highest supported one
        let max = unsafe { __cpuid(EXTENDED_MAX_LEAF) }.eax;
        if max < EXTENDED_FEATURE_LEAF {
            return false;
        }
        // SAFETY: the extended feature leaf is within the supported range
        let leaf = unsafe { __cpuid(EXTENDED_FEATURE_LEAF) };
        leaf.ecx & ECX_SVM != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_cached() {
        let first = VirtType::probe();
        let second = VirtType::probe();
        assert!(std::ptr::eq(first, second));
        assert_eq!(first, second);
    }

    #[test]
    fn names() {
        assert_eq!(VirtType::Vmx.to_string(), "vmx");
        assert_eq!(VirtType::Svm.name(), "svm");
    }
}
