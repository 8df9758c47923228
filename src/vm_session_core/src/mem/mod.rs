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

/// Bitmap helpers shared by the identity and table allocators
pub(crate) mod bitmap;
/// Guest-physical region bookkeeping
pub mod guest_memory;
/// RAM dataspaces held for the lifetime of a session
pub mod phys_allocated;
/// Quota guards and the quota-bounded RAM allocator
pub mod quota;
/// Guest-memory regions and their attributes
pub mod region;
