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

//! The reload coordinator. Ties the config model, the process manager and
//! the HTTP surface together and owns the supervisor-wide lock.

use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events;
use crate::http::HttpServers;
use crate::logger;
use crate::manager::Manager;
use crate::process::State;
use crate::sys::signals::{self, SignalEvent};
use crate::types::{self, ProcessInfo};
use crate::util;

pub struct Supervisor {
    config: Mutex<Config>,
    pub proc_mgr: Arc<Manager>,
    http: HttpServers,
    /// Coarse lock serializing reloads.
    reload_lock: Mutex<()>,
    /// Back-handle to ourselves for the HTTP handlers; weak so the cycle
    /// cannot keep the supervisor alive.
    me: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new<P: Into<std::path::PathBuf>>(config_file: P) -> Arc<Supervisor> {
        let config_file = config_file.into();
        Arc::new_cyclic(|me| Supervisor {
            config: Mutex::new(Config::new(config_file)),
            proc_mgr: Arc::new(Manager::new()),
            http: HttpServers::new(),
            reload_lock: Mutex::new(()),
            me: me.clone(),
        })
    }

    pub fn get_supervisor_id(&self) -> String {
        self.config_guard()
            .get_supervisord()
            .map(|e| e.get_string("identifier", "supervisor"))
            .unwrap_or_else(|| "supervisor".to_string())
    }

    /// Reload the configuration: diff the program set, create/remove
    /// processes, (re)bind HTTP listeners when `restart` is set, and kick
    /// autostart. Returns the `(added, changed, removed)` group diff.
    ///
    /// On a load error the previous state is fully retained. Process
    /// operations stay callable throughout; removed processes are stopped
    /// asynchronously.
    pub fn reload(&self, restart: bool) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
        let _serialize = match self.reload_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let (prev_programs, prev_groups, loaded) = {
            let mut config = self.config_guard();
            let prev_programs = config.get_program_names();
            let prev_groups = config.program_group.clone();
            let loaded = config.load()?;
            (prev_programs, prev_groups, loaded)
        };

        self.check_required_resources();
        self.set_supervisord_info();
        events::set_server_id(&self.get_supervisor_id());
        self.start_event_listeners();
        self.create_programs();
        if restart {
            self.start_http_servers();
        }

        for removed in util::sub(&prev_programs, &loaded) {
            info!("program {} removed, stopping it", removed);
            self.config_guard().remove_program(&removed);
            if let Some(proc) = self.proc_mgr.remove(&removed) {
                proc.stop(false);
            }
        }

        self.proc_mgr.start_auto_start_programs();

        let diff = self.config_guard().program_group.sub(&prev_groups);
        Ok(diff)
    }

    /// Start every program matching `name` (exact, glob, or `group:name`).
    /// Success means no matched process is observed FATAL after its wait
    /// window.
    pub fn start_process(&self, name: &str, wait: bool) -> Result<bool> {
        let procs = self.proc_mgr.find_match(name);
        if procs.is_empty() {
            return Err(Error::ProcessNotFound(name.to_string()));
        }
        for proc in &procs {
            proc.start(wait);
        }
        Ok(procs.iter().all(|p| p.get_state() != State::Fatal))
    }

    /// Stop every program matching `name`. Success means every matched
    /// process reached a terminal state.
    pub fn stop_process(&self, name: &str, wait: bool) -> Result<bool> {
        info!("stop process {}", name);
        let procs = self.proc_mgr.find_match(name);
        if procs.is_empty() {
            return Err(Error::ProcessNotFound(name.to_string()));
        }
        for proc in &procs {
            proc.stop(wait);
        }
        Ok(procs.iter().all(|p| p.get_state().is_terminal()))
    }

    pub fn get_all_process_info(&self) -> Vec<ProcessInfo> {
        let mut infos = Vec::new();
        self.proc_mgr
            .for_each_process(|proc| infos.push(ProcessInfo::from_process(proc)));
        types::sort_process_infos(&mut infos);
        infos
    }

    pub fn get_program_conf_file(&self, name: &str) -> Option<std::path::PathBuf> {
        self.config_guard()
            .get_program(name)
            .map(|e| e.conf_file.clone())
    }

    /// Directory that holds a program's stdout log, for the log file
    /// browser endpoint.
    pub fn get_program_log_dir(&self, name: &str) -> Option<std::path::PathBuf> {
        let logfile = self.proc_mgr.get(name)?.get_stdout_logfile();
        if logfile.is_empty() || logfile.starts_with("/dev/") {
            return None;
        }
        Path::new(&logfile).parent().map(|p| p.to_path_buf())
    }

    /// Stop everything, then exit shortly after so the reply still gets
    /// flushed to the caller.
    pub fn shutdown(&self) {
        info!("received rpc request to stop all processes & exit");
        self.proc_mgr.stop_all_processes();
        thread::spawn(|| {
            thread::sleep(Duration::from_secs(1));
            process::exit(0);
        });
    }

    /// Main loop: sleep, honoring terminal signals. SIGINT/SIGTERM stop all
    /// processes and exit -1; SIGHUP reloads in place.
    pub fn wait_for_exit(&self) {
        loop {
            match signals::check_for_signal() {
                Some(SignalEvent::Shutdown) => {
                    info!("receive a signal to stop all process & exit");
                    self.proc_mgr.stop_all_processes();
                    self.http.stop_all();
                    process::exit(-1);
                }
                Some(SignalEvent::Reload) => {
                    if let Err(err) = self.reload(false) {
                        error!("reload on SIGHUP failed: {}", err);
                    }
                }
                None => {}
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    /// Create or refresh a process per current program entry. Removal of
    /// dropped programs is owned by the reload loop, which also stops them.
    fn create_programs(&self) {
        let supervisor_id = self.get_supervisor_id();
        let entries: Vec<crate::config::Entry> = self
            .config_guard()
            .get_programs()
            .into_iter()
            .cloned()
            .collect();
        for entry in &entries {
            self.proc_mgr.create_process(&supervisor_id, entry);
        }
    }

    fn start_event_listeners(&self) {
        let supervisor_id = self.get_supervisor_id();
        let listeners: Vec<crate::config::Entry> = self
            .config_guard()
            .get_event_listeners()
            .into_iter()
            .cloned()
            .collect();
        let any = !listeners.is_empty();
        for entry in &listeners {
            let proc = self.proc_mgr.create_process(&supervisor_id, entry);
            proc.start(false);
        }
        if any {
            // Give listeners a moment to come up before events start flowing.
            thread::sleep(Duration::from_secs(1));
        }
    }

    fn start_http_servers(&self) {
        self.http.stop_all();
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };

        let (inet, unix) = {
            let config = self.config_guard();
            let inet = config.get_inet_http_server().map(|e| {
                (
                    e.get_string("port", ""),
                    e.get_string("username", ""),
                    e.get_string("password", ""),
                )
            });
            let unix = config.get_unix_http_server().map(|e| {
                (
                    e.get_string("file", "/tmp/supervisord.sock"),
                    e.get_string("username", ""),
                    e.get_string("password", ""),
                )
            });
            (inet, unix)
        };

        if let Some((addr, username, password)) = inet {
            if !addr.is_empty() {
                if let Err(err) = self.http.start_inet(me.clone(), &addr, username, password) {
                    error!("{}", err);
                }
            }
        }
        if let Some((file, username, password)) = unix {
            if let Err(err) = self.http.start_unix(me, &file, username, password) {
                error!("{}", err);
            }
        }
    }

    /// Required-resource verification ahead of applying a new config: every
    /// configured log location must be usable. A violation is fatal.
    fn check_required_resources(&self) {
        let mut violations = Vec::new();
        {
            let config = self.config_guard();
            let mut check_dir = |value: &str| {
                // A logfile value may fan out to several destinations.
                for raw in value.split(',').map(str::trim) {
                    if raw.is_empty() || raw.starts_with("/dev/") || raw == "none" || raw == "NONE"
                    {
                        continue;
                    }
                    if let Some(parent) = Path::new(raw).parent() {
                        if !parent.as_os_str().is_empty() && !parent.is_dir() {
                            violations
                                .push(format!("log directory {} does not exist", parent.display()));
                        }
                    }
                }
            };
            if let Some(entry) = config.get_supervisord() {
                check_dir(&entry.get_string("logfile", ""));
            }
            for entry in config.get_programs() {
                check_dir(&entry.get_string("stdout_logfile", ""));
                check_dir(&entry.get_string("stderr_logfile", ""));
            }
        }
        if !violations.is_empty() {
            for violation in &violations {
                error!("{}", violation);
            }
            process::exit(1);
        }
    }

    /// Apply `[supervisord]`: route the root log to the configured rotating
    /// file and write the pidfile.
    fn set_supervisord_info(&self) {
        let (logfile, max_bytes, backups, loglevel, pidfile) = {
            let config = self.config_guard();
            match config.get_supervisord() {
                Some(entry) => (
                    entry.get_string("logfile", ""),
                    entry.get_bytes("logfile_maxbytes", 50 * 1024 * 1024),
                    entry.get_int("logfile_backups", 10),
                    entry.get_string("loglevel", "info"),
                    entry.get_string("pidfile", "supervisord.pid"),
                ),
                None => return,
            }
        };

        if !logfile.is_empty() && logfile != "/dev/stdout" && logfile != "/dev/stderr" {
            let level = logger::supervisord_level(&loglevel);
            if let Err(err) = logger::set_supervisord_logfile(&logfile, max_bytes, backups, level)
            {
                error!("fail to open supervisord log {}: {}", logfile, err);
            }
        }

        // Best effort, per the persistence contract.
        if let Err(err) = std::fs::write(&pidfile, format!("{}", process::id())) {
            warn!("unable to write pid file {}: {}", pidfile, err);
        }
    }

    fn config_guard(&self) -> MutexGuard<Config> {
        match self.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::process::State;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("supervisord.conf");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn reload_diff_creates_and_removes_programs() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "[program:p1]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\n\
             [program:p2]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\n\
             [program:p3]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\n\
             [group:a]\nprograms = p1,p2\n\
             [group:b]\nprograms = p3\n",
        );
        let supervisor = Supervisor::new(&path);
        let (added, changed, removed) = supervisor.reload(false).unwrap();
        assert_eq!(added, vec!["a".to_string(), "b".to_string()]);
        assert!(changed.is_empty());
        assert!(removed.is_empty());
        assert_eq!(supervisor.proc_mgr.process_count(), 3);

        // New config: a loses p2, b gains p4, c appears.
        write_config(
            dir.path(),
            "[program:p1]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\n\
             [program:p3]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\n\
             [program:p4]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\n\
             [program:p5]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\n\
             [group:a]\nprograms = p1\n\
             [group:b]\nprograms = p3,p4\n\
             [group:c]\nprograms = p5\n",
        );
        let (added, changed, removed) = supervisor.reload(false).unwrap();
        assert_eq!(added, vec!["c".to_string()]);
        assert_eq!(changed, vec!["a".to_string(), "b".to_string()]);
        assert!(removed.is_empty());
        assert!(supervisor.proc_mgr.get("p2").is_none());
        assert!(supervisor.proc_mgr.get("p4").is_some());
    }

    #[test]
    fn reload_error_keeps_prior_programs() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "[program:keep]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\n",
        );
        let supervisor = Supervisor::new(&path);
        supervisor.reload(false).unwrap();
        assert_eq!(supervisor.proc_mgr.process_count(), 1);

        write_config(dir.path(), "[program:keep\nbroken");
        assert!(supervisor.reload(false).is_err());
        assert_eq!(supervisor.proc_mgr.process_count(), 1);
        assert!(supervisor.proc_mgr.get("keep").is_some());
    }

    #[test]
    fn autostart_programs_start_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "[program:auto]\ncommand = /bin/sh -c \"sleep 5\"\nstartsecs = 0\nautostart = true\nautorestart = false\n",
        );
        let supervisor = Supervisor::new(&path);
        supervisor.reload(false).unwrap();
        let proc = supervisor.proc_mgr.get("auto").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while proc.get_state() != State::Running && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(proc.get_state(), State::Running);
        proc.stop(true);
    }

    #[test]
    fn start_and_stop_process_by_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "[program:svc1]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\nautorestart = false\n\
             [program:svc2]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\nautorestart = false\n",
        );
        let supervisor = Supervisor::new(&path);
        supervisor.reload(false).unwrap();

        assert!(supervisor.start_process("svc*", true).unwrap());
        assert_eq!(
            supervisor.proc_mgr.get("svc1").unwrap().get_state(),
            State::Running
        );
        assert!(supervisor.stop_process("svc*", true).unwrap());
        assert_eq!(
            supervisor.proc_mgr.get("svc2").unwrap().get_state(),
            State::Stopped
        );
        assert!(supervisor.start_process("missing", true).is_err());
    }
}
