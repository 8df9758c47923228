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
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// A kernel capability naming an object of kind `T`.
///
/// The raw value 0 is the invalid capability.
pub struct Capability<T> {
    raw: u64,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Capability<T> {
    /// Wraps a raw capability selector
    pub const fn new(raw: u64) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    /// The invalid capability
    pub const fn invalid() -> Self {
        Self::new(0)
    }

    /// Whether this capability names an object at all
    pub const fn is_valid(&self) -> bool {
        self.raw != 0
    }

    /// The raw selector
    pub const fn raw(&self) -> u64 {
        self.raw
    }
}

impl<T> Clone for Capability<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Capability<T> {}

impl<T> PartialEq for Capability<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Capability<T> {}

impl<T> Hash for Capability<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> Default for Capability<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T> fmt::Debug for Capability<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Capability({:#x})", self.raw)
        } else {
            write!(f, "Capability(invalid)")
        }
    }
}

/// Marker for dataspace capabilities
#[derive(Debug)]
pub enum DataspaceObject {}
/// Marker for thread capabilities
#[derive(Debug)]
pub enum ThreadObject {}
/// Marker for signal-context capabilities
#[derive(Debug)]
pub enum SignalObject {}
/// Marker for the capabilities handed to clients for their vCPUs
#[derive(Debug)]
pub enum VcpuObject {}
/// Marker for kernel vCPU objects
#[derive(Debug)]
pub enum KernelVcpuObject {}

/// Names a dataspace
pub type DataspaceCap = Capability<DataspaceObject>;
/// Names a client thread
pub type ThreadCap = Capability<ThreadObject>;
/// Names a signal context
pub type SignalCap = Capability<SignalObject>;
/// Names a vCPU of a session
pub type VcpuCap = Capability<VcpuObject>;
/// Names the kernel object executing a vCPU
pub type KernelVcpuCap = Capability<KernelVcpuObject>;
