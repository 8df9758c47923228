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

// Counter metric that counts the VM sessions created, labelled by virtualization extension
pub(crate) static METRIC_SESSIONS_CREATED: &str = "vm_sessions_created_total";
pub(crate) static METRIC_SESSIONS_CREATED_LABEL_VIRT: &str = "virt";

// Counter metric that counts failed guest-memory attach requests, labelled by error kind
pub(crate) static METRIC_ATTACH_FAILURES: &str = "guest_memory_attach_failures_total";
pub(crate) static METRIC_ATTACH_FAILURES_LABEL_REASON: &str = "reason";

// Counter metric that counts the vCPUs created
pub(crate) static METRIC_VCPUS_CREATED: &str = "vcpus_created_total";
