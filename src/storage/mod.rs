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


//! Local persistence
//!
//! A single SQLite table of JSON documents keyed by name. The stored keys are:
//! - `downloadedItems`: the local catalog
//! - `deviceId`: generated once per install
//! - `downloadQueue`: local download requests still pending
//! - `acknowledgedJobs`: completed job ids already surfaced
//!
//! # Usage Example
//! ```no_run
//! use offline_core::storage::{Database, SqliteKeyValueStore, get_or_create_device_id};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new("./offline.db").await?;
//! let store = SqliteKeyValueStore::new(db);
//! let device_id = get_or_create_device_id(&store).await?;
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod device;
pub mod kv;
pub mod migrations;

// Re-export commonly used types
pub use database::Database;
pub use device::get_or_create_device_id;
pub use kv::{load_json, load_json_or_default, save_json, KeyValueStore, SqliteKeyValueStore};
