// Offline Core - download orchestration for a mobile media client
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Optimization server job API
//!
//! Thin request layer over the remote transcoding service. The orchestrator
//! only talks to it through the [`JobApi`] trait so tests and other hosts can
//! swap the transport.

pub mod client;
pub mod models;

// Re-export commonly used types
pub use client::{JobApi, OptimizeClient, ServerAccess};
pub use models::{CreateJobRequest, Job, JobStatus, MediaItem, MediaSource};
