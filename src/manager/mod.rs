// Copyright (c) 2018 The supervisord maintainers and/or applicable contributors
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

//! The keyed collection of supervised processes.

pub mod reaper;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread;

use glob::Pattern;

use crate::config::Entry;
use crate::process::Process;

#[derive(Default)]
pub struct Manager {
    procs: Mutex<HashMap<String, Process>>,
}

impl Manager {
    pub fn new() -> Manager {
        Manager::default()
    }

    /// Create the process for a config entry, or hand back the existing one.
    /// The entry snapshot is captured here; a changed entry takes effect
    /// when the process is removed and recreated on reload.
    pub fn create_process(&self, supervisor_id: &str, entry: &Entry) -> Process {
        let mut procs = self.lock();
        procs
            .entry(entry.name.clone())
            .or_insert_with(|| {
                debug!("create process {}", entry.name);
                Process::new(supervisor_id, entry.clone())
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Process> {
        self.lock().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Process> {
        let removed = self.lock().remove(name);
        if removed.is_some() {
            info!("remove process {}", name);
        }
        removed
    }

    /// All processes whose `name` or `group:name` matches the pattern,
    /// literally or by glob.
    pub fn find_match(&self, pattern: &str) -> Vec<Process> {
        let glob = Pattern::new(pattern).ok();
        let matches = |candidate: &str| {
            candidate == pattern
                || glob
                    .as_ref()
                    .map(|p| p.matches(candidate))
                    .unwrap_or(false)
        };
        self.lock()
            .values()
            .filter(|proc| {
                matches(proc.get_name())
                    || matches(&format!("{}:{}", proc.get_group(), proc.get_name()))
            })
            .cloned()
            .collect()
    }

    /// Snapshot the map under the lock, then visit each process without it,
    /// so `f` is free to take the process's own lock.
    pub fn for_each_process<F: FnMut(&Process)>(&self, mut f: F) {
        let snapshot: Vec<Process> = self.lock().values().cloned().collect();
        for proc in &snapshot {
            f(proc);
        }
    }

    pub fn process_count(&self) -> usize {
        self.lock().len()
    }

    /// Start every autostart program, ascending priority order.
    pub fn start_auto_start_programs(&self) {
        let mut snapshot: Vec<Process> = self.lock().values().cloned().collect();
        snapshot.sort_by_key(|p| (p.get_priority(), p.entry().load_index));
        for proc in snapshot {
            if proc.is_auto_start() {
                proc.start(false);
            }
        }
    }

    /// Stop everything concurrently and wait for all of it to reach a
    /// terminal state. No inter-process ordering is promised.
    pub fn stop_all_processes(&self) {
        let snapshot: Vec<Process> = self.lock().values().cloned().collect();
        let mut joiners = Vec::with_capacity(snapshot.len());
        for proc in snapshot {
            let handle = thread::Builder::new()
                .name(format!("stop-{}", proc.get_name()))
                .spawn(move || proc.stop(true));
            match handle {
                Ok(handle) => joiners.push(handle),
                Err(err) => warn!("unable to spawn stop thread: {}", err),
            }
        }
        for handle in joiners {
            let _ = handle.join();
        }
    }

    fn lock(&self) -> MutexGuard<HashMap<String, Process>> {
        match self.procs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::Config;
    use crate::process::State;

    fn load_manager(body: &str, dir: &std::path::Path) -> (Manager, Config) {
        let path = dir.join("m.conf");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        let mut config = Config::new(&path);
        config.load().unwrap();
        let manager = Manager::new();
        for entry in config.get_programs() {
            manager.create_process("supervisor", entry);
        }
        (manager, config)
    }

    #[test]
    fn find_match_covers_name_group_and_glob() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _config) = load_manager(
            "[program:web1]\ncommand = /bin/true\n\
             [program:web2]\ncommand = /bin/true\n\
             [program:db]\ncommand = /bin/true\n\
             [group:frontend]\nprograms = web1,web2\n",
            dir.path(),
        );
        assert_eq!(manager.find_match("db").len(), 1);
        assert_eq!(manager.find_match("web*").len(), 2);
        assert_eq!(manager.find_match("frontend:web1").len(), 1);
        assert_eq!(manager.find_match("frontend:*").len(), 2);
        assert_eq!(manager.find_match("w?b1").len(), 1);
        assert!(manager.find_match("nothing").is_empty());
    }

    #[test]
    fn create_process_is_idempotent_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, config) = load_manager(
            "[program:solo]\ncommand = /bin/true\n",
            dir.path(),
        );
        let entry = config.get_program("solo").unwrap();
        let first = manager.create_process("supervisor", entry);
        let second = manager.create_process("supervisor", entry);
        assert_eq!(manager.process_count(), 1);
        // Same underlying state machine.
        assert_eq!(first.get_state(), second.get_state());
    }

    #[test]
    fn stop_all_reaches_terminal_states() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _config) = load_manager(
            "[program:a]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautorestart = false\n\
             [program:b]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautorestart = false\n",
            dir.path(),
        );
        manager.for_each_process(|p| p.start(true));
        manager.stop_all_processes();
        manager.for_each_process(|p| {
            assert_eq!(p.get_state(), State::Stopped);
            assert_eq!(p.get_pid(), 0);
        });
    }

    #[test]
    fn autostart_honors_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _config) = load_manager(
            "[program:late]\ncommand = /bin/sh -c \"sleep 5\"\nstartsecs = 0\npriority = 900\nautostart = false\n\
             [program:early]\ncommand = /bin/sh -c \"sleep 5\"\nstartsecs = 0\npriority = 1\nautostart = false\n",
            dir.path(),
        );
        // Nothing is autostarted when every program opts out.
        manager.start_auto_start_programs();
        manager.for_each_process(|p| assert_eq!(p.get_state(), State::Stopped));
    }

    #[test]
    fn removed_process_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _config) = load_manager(
            "[program:gone]\ncommand = /bin/true\n",
            dir.path(),
        );
        assert!(manager.remove("gone").is_some());
        assert!(manager.remove("gone").is_none());
        assert!(manager.get("gone").is_none());
        assert_eq!(manager.process_count(), 0);
    }
}
