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

//! Prometheus view over the process manager. The collector walks the live
//! process table at scrape time, so gauges never go stale.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntGaugeVec, Opts, Registry};

use crate::manager::Manager;
use crate::supervisor::Supervisor;

pub struct ProcCollector {
    manager: Arc<Manager>,
    state: IntGaugeVec,
    pid: IntGaugeVec,
    uptime: IntGaugeVec,
    exit_status: IntGaugeVec,
}

const LABELS: &[&str] = &["name", "group"];

impl ProcCollector {
    pub fn new(manager: Arc<Manager>) -> prometheus::Result<ProcCollector> {
        Ok(ProcCollector {
            manager,
            state: IntGaugeVec::new(
                Opts::new("supervisord_process_state", "Process state code"),
                LABELS,
            )?,
            pid: IntGaugeVec::new(
                Opts::new("supervisord_process_pid", "Pid of the child, 0 when down"),
                LABELS,
            )?,
            uptime: IntGaugeVec::new(
                Opts::new(
                    "supervisord_process_uptime_seconds",
                    "Seconds since the child was started",
                ),
                LABELS,
            )?,
            exit_status: IntGaugeVec::new(
                Opts::new(
                    "supervisord_process_exit_status",
                    "Exit status of the last completed run",
                ),
                LABELS,
            )?,
        })
    }
}

impl Collector for ProcCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.state
            .desc()
            .into_iter()
            .chain(self.pid.desc())
            .chain(self.uptime.desc())
            .chain(self.exit_status.desc())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.state.reset();
        self.pid.reset();
        self.uptime.reset();
        self.exit_status.reset();

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.manager.for_each_process(|proc| {
            let labels = [proc.get_name(), proc.get_group()];
            let state = proc.get_state();
            self.state
                .with_label_values(&labels)
                .set(i64::from(state.code()));
            self.pid
                .with_label_values(&labels)
                .set(i64::from(proc.get_pid()));
            let start = proc.get_start_time();
            let uptime = if proc.get_pid() != 0 && start > 0 {
                (now - start).max(0)
            } else {
                0
            };
            self.uptime.with_label_values(&labels).set(uptime);
            self.exit_status
                .with_label_values(&labels)
                .set(i64::from(proc.get_exit_status()));
        });

        let mut families = self.state.collect();
        families.extend(self.pid.collect());
        families.extend(self.uptime.collect());
        families.extend(self.exit_status.collect());
        families
    }
}

/// A registry with the process collector already mounted.
pub fn process_registry(supervisor: &Arc<Supervisor>) -> Registry {
    let registry = Registry::new();
    match ProcCollector::new(supervisor.proc_mgr.clone()) {
        Ok(collector) => {
            if let Err(err) = registry.register(Box::new(collector)) {
                error!("unable to register process metrics: {}", err);
            }
        }
        Err(err) => error!("unable to build process metrics: {}", err),
    }
    registry
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use prometheus::{Encoder, TextEncoder};

    use super::*;
    use crate::config::Config;

    #[test]
    fn collector_exports_per_process_gauges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.conf");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"[program:metric]\ncommand = /bin/true\nautostart = false\n")
            .unwrap();
        let mut config = Config::new(&path);
        config.load().unwrap();

        let manager = Arc::new(Manager::new());
        for entry in config.get_programs() {
            manager.create_process("supervisor", entry);
        }
        let registry = Registry::new();
        registry
            .register(Box::new(ProcCollector::new(manager).unwrap()))
            .unwrap();

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("supervisord_process_state"));
        assert!(text.contains("name=\"metric\""));
    }
}
