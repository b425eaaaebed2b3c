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

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::process::Process;

/// The program status row served by `/program/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub group: String,
    pub description: String,
    pub start: i64,
    pub stop: i64,
    pub now: i64,
    pub state: i32,
    pub statename: String,
    pub spawnerr: String,
    pub exitstatus: i32,
    pub logfile: String,
    pub stdout_logfile: String,
    pub stderr_logfile: String,
    pub pid: i32,
}

impl ProcessInfo {
    pub fn from_process(proc: &Process) -> ProcessInfo {
        let state = proc.get_state();
        ProcessInfo {
            name: proc.get_name().to_string(),
            group: proc.get_group().to_string(),
            description: proc.get_description(),
            start: proc.get_start_time(),
            stop: proc.get_stop_time(),
            now: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            state: state.code(),
            statename: state.name().to_string(),
            spawnerr: String::new(),
            exitstatus: proc.get_exit_status(),
            logfile: proc.get_stdout_logfile(),
            stdout_logfile: proc.get_stdout_logfile(),
            stderr_logfile: proc.get_stderr_logfile(),
            pid: proc.get_pid(),
        }
    }
}

/// Order rows by (group, name) for stable listings.
pub fn sort_process_infos(infos: &mut Vec<ProcessInfo>) {
    infos.sort_by(|a, b| (&a.group, &a.name).cmp(&(&b.group, &b.name)));
}
