// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Process memory measurement for pressure-based eviction

use parking_lot::Mutex;
use std::collections::HashMap;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::warn;

/// Source of the broker's current memory footprint
pub trait MemoryProbe: Send + Sync {
    /// Resident memory in megabytes, or `None` if it cannot be measured
    fn usage_mb(&self) -> Option<u64>;
}

/// Resident memory of this process plus every descendant (the runtime children)
pub struct ProcessMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot determine own pid, memory probe disabled: {}", e);
                None
            }
        };
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn usage_mb(&self) -> Option<u64> {
        let root = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );

        let parents: HashMap<Pid, Pid> = system
            .processes()
            .iter()
            .filter_map(|(pid, process)| process.parent().map(|parent| (*pid, parent)))
            .collect();

        let bytes: u64 = system
            .processes()
            .iter()
            .filter(|(pid, _)| descends_from(**pid, root, &parents))
            .map(|(_, process)| process.memory())
            .sum();
        Some(bytes / (1024 * 1024))
    }
}

fn descends_from(mut pid: Pid, root: Pid, parents: &HashMap<Pid, Pid>) -> bool {
    // bounded walk; pid reuse can create cycles in a stale table
    for _ in 0..64 {
        if pid == root {
            return true;
        }
        match parents.get(&pid) {
            Some(parent) => pid = *parent,
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descends_from_walks_parent_chain() {
        let p = Pid::from_u32;
        let parents: HashMap<Pid, Pid> = [(p(3), p(2)), (p(2), p(1)), (p(9), p(8))].into_iter().collect();
        assert!(descends_from(p(3), p(1), &parents));
        assert!(descends_from(p(1), p(1), &parents));
        assert!(!descends_from(p(9), p(1), &parents));
    }

    #[test]
    fn test_cyclic_table_terminates() {
        let p = Pid::from_u32;
        let parents: HashMap<Pid, Pid> = [(p(4), p(5)), (p(5), p(4))].into_iter().collect();
        assert!(!descends_from(p(4), p(1), &parents));
    }

    #[test]
    fn test_own_process_is_measured() {
        let probe = ProcessMemoryProbe::new();
        assert!(probe.usage_mb().is_some());
    }
}
