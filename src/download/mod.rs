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


//! Local downloads
//!
//! - `backend`: the byte-moving primitive ([`TransferBackend`])
//! - `transfer`: per-job transfer tasks, events and catalog bookkeeping
//! - `queue`: FIFO scheduler bounding concurrent local downloads
//! - `progress`: throttled progress and speed tracking

pub mod backend;
pub mod progress;
pub mod queue;
pub mod transfer;

// Re-export commonly used types
pub use backend::{FetchRequest, HttpTransferBackend, TransferBackend};
pub use progress::TransferProgress;
pub use queue::{JobQueue, QueueEntry, QueueSnapshot};
pub use transfer::{TransferEvent, TransferHandle, TransferManager, TransferRequest};
