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


//! Transfer progress tracking and reporting
//!
//! # Progress Information
//! - Job and item id for identification
//! - Bytes downloaded / total bytes (total unknown until the server says)
//! - Percentage complete
//! - Current speed (bytes/s) with moving average
//!
//! Updates are throttled to one every 200ms; the final update is always sent.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum interval between progress updates
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Progress snapshot for one transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub job_id: String,
    pub item_id: String,

    /// Bytes written so far
    pub bytes_downloaded: u64,

    /// Total bytes if the server sent a length
    pub bytes_total: Option<u64>,

    /// Percentage complete (0.0 - 100.0)
    pub percent: f64,

    /// Moving-average speed in bytes per second
    pub speed: f64,
}

impl TransferProgress {
    pub fn new(job_id: String, item_id: String) -> Self {
        Self {
            job_id,
            item_id,
            bytes_downloaded: 0,
            bytes_total: None,
            percent: 0.0,
            speed: 0.0,
        }
    }

    /// `bytes_downloaded / bytes_total * 100`, 0 while the total is unknown
    pub fn calculate_percentage(&mut self) {
        self.percent = match self.bytes_total {
            Some(total) if total > 0 => {
                ((self.bytes_downloaded as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        };
    }

    /// Format download speed as human-readable string (e.g., "2.5 MB/s")
    pub fn speed_string(&self) -> String {
        format!("{:.1} MB/s", self.speed / 1_000_000.0)
    }
}

/// Speed tracker with moving average
///
/// Keeps position samples inside a sliding window to smooth out network
/// fluctuations.
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<SpeedSample>,
    window_duration: Duration,
}

#[derive(Debug, Clone)]
struct SpeedSample {
    timestamp: Instant,
    /// Total bytes at this point in time
    position: u64,
}

impl SpeedTracker {
    /// Create new speed tracker with default 10-second window
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(10))
    }

    pub fn with_window(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window_duration,
        }
    }

    /// Add a position sample (total bytes downloaded so far)
    pub fn add_position(&mut self, position: u64) {
        let now = Instant::now();

        self.samples.push_back(SpeedSample {
            timestamp: now,
            position,
        });

        while let Some(sample) = self.samples.front() {
            if now.duration_since(sample.timestamp) > self.window_duration {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current average speed in bytes per second
    pub fn average_speed(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };

        let bytes_delta = last.position.saturating_sub(first.position);
        let time_delta = last.timestamp.duration_since(first.timestamp).as_secs_f64();

        if time_delta > 0.0 {
            bytes_delta as f64 / time_delta
        } else {
            0.0
        }
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress state of one transfer plus the update throttle
#[derive(Debug)]
pub struct ProgressTracker {
    progress: TransferProgress,
    speed_tracker: SpeedTracker,
    last_update: Option<Instant>,
    update_interval: Duration,
}

impl ProgressTracker {
    pub fn new(job_id: String, item_id: String) -> Self {
        Self {
            progress: TransferProgress::new(job_id, item_id),
            speed_tracker: SpeedTracker::new(),
            last_update: None,
            update_interval: PROGRESS_INTERVAL,
        }
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        self.progress.bytes_total = total.filter(|t| *t > 0);
        self.progress.calculate_percentage();
    }

    /// Record a new position
    ///
    /// Returns true if an update is due. The first update is always due.
    pub fn update(&mut self, bytes_downloaded: u64) -> bool {
        self.progress.bytes_downloaded = bytes_downloaded;
        self.speed_tracker.add_position(bytes_downloaded);
        self.progress.speed = self.speed_tracker.average_speed();
        self.progress.calculate_percentage();

        let now = Instant::now();
        match self.last_update {
            Some(last) if now.duration_since(last) < self.update_interval => false,
            _ => {
                self.last_update = Some(now);
                true
            }
        }
    }

    /// Final update after the last byte, sent regardless of the throttle
    pub fn finish(&mut self, bytes_downloaded: u64) -> TransferProgress {
        if self.progress.bytes_total.is_none() {
            self.progress.bytes_total = Some(bytes_downloaded);
        }
        self.update(bytes_downloaded);
        self.last_update = Some(Instant::now());
        self.snapshot()
    }

    /// Current progress snapshot
    pub fn snapshot(&self) -> TransferProgress {
        self.progress.clone()
    }
}
