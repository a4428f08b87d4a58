// Copyright 2025 itscheems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shardsnap Engine
//!
//! Distributed snapshot coordination for a partitioned in-memory database.
//! A snapshot captures every table of every partition replica at a
//! per-partition point in time, written as one checksummed data file per
//! partition × table plus one digest per host.
//!
//! Architecture:
//! - Coordinator broadcasts requests and aggregates host status rows
//! - One worker thread per host accepts or rejects requests
//! - One site processor thread per local partition × table
//! - A per-host registry tracks partition claims, the end-of-cycle
//!   callback queue and the status history
//! - Data targets write chunks strictly in order, durable before the next

pub mod auto;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod host;
pub mod logging;
pub mod registry;
pub mod site;
pub mod source;
pub mod target;

pub use auto::AutoSnapshotScheduler;
pub use cluster::{
	ClusterTransport, CommandLog, DispatchError, Hashinator, InMemoryCommandLog, LocalCluster,
	Membership, StaticHashinator,
};
pub use config::EngineConfig;
pub use coordinator::{CoordinatorError, PollPolicy, SnapshotCoordinator, SnapshotHandle};
pub use host::{HostError, HostSettings, HostSpec, ProcessFatal, SnapshotHost};
pub use registry::SnapshotRegistry;
pub use site::{SiteError, SnapshotSiteProcessor, TaskState};
pub use source::{MemoryTableStore, TableSource};
pub use target::{InjectedFaults, NoFaults, SnapshotDataTarget, TargetError, WriteFaultPolicy};
