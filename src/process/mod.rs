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

//! The per-program state machine.
//!
//! A `Process` owns at most one OS child at a time. A worker thread drives
//! the spawn/monitor/retry loop; `Start` and `Stop` mutate shared state
//! under the process mutex and wake waiters through the condvar. State
//! transitions are totally ordered under the mutex, and the pid/state
//! coupling is only ever changed with the mutex held.

mod pdeathsig;

use std::fmt;
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::Entry;
use crate::error::{Error, Result};
use crate::events::{self, Event};
use crate::logger::{self, Logger, SharedLogger};
use crate::manager::reaper;
use crate::sys::process::{signal, Pid, Signal};

const MONITOR_TICK: Duration = Duration::from_millis(100);
const MAX_BACKOFF_SECS: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl State {
    /// Supervisor wire codes.
    pub fn code(self) -> i32 {
        match self {
            State::Stopped => 0,
            State::Starting => 10,
            State::Running => 20,
            State::Backoff => 30,
            State::Stopping => 40,
            State::Exited => 100,
            State::Fatal => 200,
            State::Unknown => 1000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Stopped => "STOPPED",
            State::Starting => "STARTING",
            State::Running => "RUNNING",
            State::Backoff => "BACKOFF",
            State::Stopping => "STOPPING",
            State::Exited => "EXITED",
            State::Fatal => "FATAL",
            State::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Stopped | State::Exited | State::Fatal)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

struct StateData {
    state: State,
    pid: Pid,
    start_time: Option<SystemTime>,
    stop_time: Option<SystemTime>,
    exit_status: i32,
    stop_by_user: bool,
    retries: i64,
    worker_active: bool,
}

struct Inner {
    supervisor_id: String,
    entry: Entry,
    data: Mutex<StateData>,
    cond: Condvar,
    stdout_log: Mutex<Option<SharedLogger>>,
    stderr_log: Mutex<Option<SharedLogger>>,
}

/// Handle to one supervised program. Cheap to clone; all clones share the
/// same state machine.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

enum ChildWatch {
    /// We reap our own child with waitpid on its pid.
    Direct(Child),
    /// The global reaper owns wait-any; statuses arrive on a channel.
    Reaped(Receiver<i32>),
}

impl ChildWatch {
    /// Wait up to `timeout` for the child to exit.
    fn poll(&mut self, timeout: Duration) -> Option<ExitStatus> {
        match self {
            ChildWatch::Direct(child) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => return Some(status),
                        Ok(None) => {}
                        // A wait error means the status can no longer be
                        // observed; synthesize a failure exit.
                        Err(_) => return Some(ExitStatus::from_raw(1 << 8)),
                    }
                    if Instant::now() >= deadline {
                        return None;
                    }
                    thread::sleep(Duration::from_millis(20));
                }
            }
            ChildWatch::Reaped(rx) => match rx.recv_timeout(timeout) {
                Ok(raw) => Some(ExitStatus::from_raw(raw)),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(ExitStatus::from_raw(1 << 8)),
            },
        }
    }
}

enum Attempt {
    Spawned(ChildWatch),
    Retry,
    Done,
}

enum ExitOutcome {
    Respawn,
    Done,
}

impl Process {
    /// A process starts life STOPPED; nothing is spawned until `start`.
    pub fn new(supervisor_id: &str, entry: Entry) -> Process {
        Process {
            inner: Arc::new(Inner {
                supervisor_id: supervisor_id.to_string(),
                entry,
                data: Mutex::new(StateData {
                    state: State::Stopped,
                    pid: 0,
                    start_time: None,
                    stop_time: None,
                    exit_status: 0,
                    stop_by_user: false,
                    retries: 0,
                    worker_active: false,
                }),
                cond: Condvar::new(),
                stdout_log: Mutex::new(None),
                stderr_log: Mutex::new(None),
            }),
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.inner.entry
    }

    pub fn get_name(&self) -> &str {
        &self.inner.entry.name
    }

    pub fn get_group(&self) -> &str {
        &self.inner.entry.group
    }

    pub fn get_state(&self) -> State {
        self.lock().state
    }

    pub fn get_pid(&self) -> Pid {
        self.lock().pid
    }

    pub fn get_start_time(&self) -> i64 {
        self.lock().start_time.map(epoch_secs).unwrap_or(0)
    }

    pub fn get_stop_time(&self) -> i64 {
        self.lock().stop_time.map(epoch_secs).unwrap_or(0)
    }

    pub fn get_exit_status(&self) -> i32 {
        self.lock().exit_status
    }

    pub fn get_stdout_logfile(&self) -> String {
        self.inner.entry.get_string("stdout_logfile", "")
    }

    pub fn get_stderr_logfile(&self) -> String {
        self.inner.entry.get_string("stderr_logfile", "")
    }

    pub fn get_priority(&self) -> i64 {
        self.inner.entry.get_int("priority", 999)
    }

    pub fn is_auto_start(&self) -> bool {
        self.inner.entry.get_bool("autostart", true)
    }

    pub fn get_description(&self) -> String {
        let data = self.lock();
        match data.state {
            State::Running | State::Stopping => {
                let uptime = data
                    .start_time
                    .and_then(|t| t.elapsed().ok())
                    .unwrap_or_default()
                    .as_secs();
                format!(
                    "pid {}, uptime {}:{:02}:{:02}",
                    data.pid,
                    uptime / 3600,
                    (uptime % 3600) / 60,
                    uptime % 60
                )
            }
            State::Stopped if data.stop_time.is_none() => "Not started".to_string(),
            State::Stopped | State::Exited => data
                .stop_time
                .map(|t| logger::format_epoch(epoch_secs(t)))
                .unwrap_or_default(),
            State::Backoff | State::Fatal => {
                "Exited too quickly (process log may have details)".to_string()
            }
            _ => String::new(),
        }
    }

    /// Request a transition to RUNNING. With `wait`, blocks until the
    /// process leaves the starting loop: RUNNING, or a terminal state once
    /// retries are exhausted. Idempotent while a start is in flight.
    pub fn start(&self, wait: bool) {
        {
            let mut data = self.lock();
            if !data.worker_active && !matches!(data.state, State::Starting | State::Running) {
                data.worker_active = true;
                data.stop_by_user = false;
                data.retries = 0;
                let me = self.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-worker", self.get_name()))
                    .spawn(move || me.run_worker());
                if let Err(err) = spawned {
                    error!("unable to spawn worker for {}: {}", self.get_name(), err);
                    data.worker_active = false;
                    return;
                }
            }
        }
        if wait {
            let mut data = self.lock();
            while data.worker_active
                && data.state != State::Running
                && data.state != State::Stopping
            {
                data = self.wait_on(data);
            }
        }
    }

    /// Request a transition to STOPPED. Cancels a pending BACKOFF retry,
    /// signals a live child and escalates to SIGKILL after `stopwaitsecs`.
    /// No-op when already terminal.
    pub fn stop(&self, wait: bool) {
        let entry = &self.inner.entry;
        {
            let mut data = self.lock();
            data.stop_by_user = true;
            match data.state {
                State::Backoff => {
                    // The worker observes the state change and bails out of
                    // its retry sleep.
                    data.stop_time = Some(SystemTime::now());
                    self.change_state(&mut data, State::Stopped);
                    self.inner.cond.notify_all();
                }
                State::Starting | State::Running => {
                    data.stop_time = Some(SystemTime::now());
                    self.change_state(&mut data, State::Stopping);
                    let pid = data.pid;
                    let sig: Signal = entry
                        .get_string("stopsignal", "TERM")
                        .split_whitespace()
                        .next()
                        .unwrap_or("TERM")
                        .parse()
                        .unwrap_or(Signal::TERM);
                    let stop_as_group = entry.get_bool("stopasgroup", false);
                    let kill_as_group = entry.get_bool("killasgroup", stop_as_group);
                    let wait_secs = entry.get_int("stopwaitsecs", 10).max(0) as u64;
                    drop(data);

                    let target = if stop_as_group { -pid } else { pid };
                    info!(
                        "stopping {} with signal {} to pid {}",
                        self.get_name(),
                        sig,
                        target
                    );
                    if let Err(err) = signal(target, sig) {
                        // Proceed as if delivered; the escalation below
                        // still fires if the child lingers.
                        warn!("{}", err);
                    }

                    let me = self.clone();
                    let escalate = thread::Builder::new()
                        .name(format!("{}-stop", self.get_name()))
                        .spawn(move || me.escalate_kill(pid, kill_as_group, wait_secs));
                    if escalate.is_err() {
                        warn!("unable to spawn stop escalation for {}", self.get_name());
                    }
                }
                _ => {}
            }
        }
        if wait {
            let mut data = self.lock();
            while !data.state.is_terminal() {
                data = self.wait_on(data);
            }
        }
    }

    fn escalate_kill(&self, pid: Pid, kill_as_group: bool, wait_secs: u64) {
        let deadline = Instant::now() + Duration::from_secs(wait_secs);
        let mut data = self.lock();
        while data.state == State::Stopping && data.pid == pid {
            let now = Instant::now();
            if now >= deadline {
                let target = if kill_as_group { -pid } else { pid };
                warn!(
                    "{} did not stop within {}s, sending SIGKILL to {}",
                    self.get_name(),
                    wait_secs,
                    target
                );
                if let Err(err) = signal(target, Signal::KILL) {
                    warn!("{}", err);
                }
                return;
            }
            let (next, _) = self
                .inner
                .cond
                .wait_timeout(data, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            data = next;
        }
    }

    /// The worker drives spawn attempts until the program settles.
    fn run_worker(&self) {
        loop {
            match self.attempt_spawn() {
                Attempt::Spawned(watch) => {
                    let status = self.monitor(watch);
                    match self.handle_exit(status) {
                        ExitOutcome::Respawn => continue,
                        ExitOutcome::Done => break,
                    }
                }
                Attempt::Retry => continue,
                Attempt::Done => break,
            }
        }
        let mut data = self.lock();
        data.worker_active = false;
        self.inner.cond.notify_all();
    }

    /// Spawn protocol: transition to STARTING and fork/exec with the
    /// configured attributes, all under the lock so observers never see the
    /// pid/state coupling mid-change. A spawn failure is consumed here and
    /// counted as a retry.
    fn attempt_spawn(&self) -> Attempt {
        match self.spawn_prepared() {
            Ok(Some(watch)) => Attempt::Spawned(watch),
            // A stop raced the respawn; the process is already STOPPED.
            Ok(None) => Attempt::Done,
            Err(err) => {
                error!("fail to start program {}: {}", self.get_name(), err);
                let data = self.lock();
                if data.stop_by_user {
                    let mut data = data;
                    if !data.state.is_terminal() {
                        data.stop_time = Some(SystemTime::now());
                        self.change_state(&mut data, State::Stopped);
                    }
                    self.inner.cond.notify_all();
                    return Attempt::Done;
                }
                match self.retry_or_fatal(data) {
                    ExitOutcome::Respawn => Attempt::Retry,
                    ExitOutcome::Done => Attempt::Done,
                }
            }
        }
    }

    fn spawn_prepared(&self) -> Result<Option<ChildWatch>> {
        let entry = &self.inner.entry;
        let command_line = entry.get_string("command", "");
        let argv = shell_words::split(&command_line)
            .map_err(|e| Error::BadCommand(command_line.clone(), e.to_string()))?;
        if argv.is_empty() {
            return Err(Error::BadCommand(command_line, "empty command".to_string()));
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(if entry.is_event_listener() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let directory = entry.get_string("directory", "");
        if !directory.is_empty() {
            cmd.current_dir(&directory);
        }

        for (key, val) in entry.get_env() {
            cmd.env(key, val);
        }
        cmd.env("SUPERVISOR_ENABLED", "1")
            .env("SUPERVISOR_PROCESS_NAME", &entry.name)
            .env("SUPERVISOR_GROUP_NAME", &entry.group)
            .env(
                "SUPERVISOR_SERVER_URL",
                entry.get_string("serverurl", "http://localhost:9001"),
            );

        let user = entry.get_string("user", "");
        if !user.is_empty() {
            match users::get_user_by_name(&user) {
                Some(u) => {
                    cmd.uid(u.uid());
                    cmd.gid(u.primary_group_id());
                }
                None => return Err(Error::UserNotFound(user)),
            }
        }

        let umask = entry.get_string("umask", "");
        let umask = if umask.is_empty() {
            None
        } else {
            i64::from_str_radix(&umask, 8).ok()
        };
        unsafe {
            cmd.pre_exec(move || {
                // A child must not share the supervisor's process group, or
                // a group-wide signal from the child would take us down.
                libc::setpgid(0, 0);
                if let Some(mask) = umask {
                    libc::umask(mask as libc::mode_t);
                }
                Ok(())
            });
        }
        pdeathsig::set_death_signal(&mut cmd);

        let mut data = self.lock();
        if data.stop_by_user {
            if !data.state.is_terminal() {
                data.stop_time = Some(SystemTime::now());
                self.change_state(&mut data, State::Stopped);
            }
            self.inner.cond.notify_all();
            return Ok(None);
        }
        data.exit_status = 0;
        data.start_time = Some(SystemTime::now());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return Err(Error::Spawn(err)),
        };
        data.pid = child.id() as Pid;
        self.change_state(&mut data, State::Starting);
        info!("program {} started with pid {}", self.get_name(), data.pid);
        let pid = data.pid;
        self.inner.cond.notify_all();
        drop(data);

        self.pump_output(&mut child);
        if entry.is_event_listener() {
            self.attach_listener_stdin(&mut child);
        }

        Ok(Some(match reaper::watch(pid) {
            Some(rx) => ChildWatch::Reaped(rx),
            None => ChildWatch::Direct(child),
        }))
    }

    /// Poll for exit on a tick; flip STARTING to RUNNING once the child has
    /// stayed up `startsecs`.
    fn monitor(&self, mut watch: ChildWatch) -> ExitStatus {
        let start_secs = self.inner.entry.get_int("startsecs", 1).max(0) as u64;
        let started_at = Instant::now();
        loop {
            if let Some(status) = watch.poll(MONITOR_TICK) {
                return status;
            }
            let mut data = self.lock();
            if data.state == State::Starting && started_at.elapsed().as_secs() >= start_secs {
                self.change_state(&mut data, State::Running);
                info!("success to start program {}", self.get_name());
                self.inner.cond.notify_all();
            }
        }
    }

    /// Exit handling per state: a reap while STARTING counts against
    /// startretries, a reap while RUNNING consults autorestart, a reap
    /// while STOPPING completes the stop.
    fn handle_exit(&self, status: ExitStatus) -> ExitOutcome {
        let entry = &self.inner.entry;
        let code = exit_code(&status);
        let mut data = self.lock();
        let prior = data.state;
        data.exit_status = code;
        data.stop_time = Some(SystemTime::now());

        if prior == State::Stopping {
            self.change_state(&mut data, State::Stopped);
            data.pid = 0;
            info!("program {} stopped", self.get_name());
            self.inner.cond.notify_all();
            self.deregister_listener();
            return ExitOutcome::Done;
        }

        self.change_state(&mut data, State::Exited);
        data.pid = 0;
        info!("program {} exited with status {}", self.get_name(), code);
        self.inner.cond.notify_all();
        if data.stop_by_user {
            self.deregister_listener();
            return ExitOutcome::Done;
        }

        if prior == State::Starting {
            // Died before the watchdog promoted it; that is a failed start.
            return self.retry_or_fatal(data);
        }

        let expected = entry.get_exit_codes().contains(&code);
        let restart = match entry.get_string("autorestart", "unexpected").as_str() {
            "true" => true,
            "false" => false,
            _ => !expected,
        };
        if restart {
            data.retries = 0;
            ExitOutcome::Respawn
        } else {
            self.deregister_listener();
            ExitOutcome::Done
        }
    }

    /// BACKOFF with a `min(retries, 10)`-second delay, or FATAL once the
    /// budget is spent. The delay is cancellable by `stop`.
    fn retry_or_fatal(&self, mut data: MutexGuard<StateData>) -> ExitOutcome {
        let max_retries = self.inner.entry.get_int("startretries", 3).max(0);
        if data.retries >= max_retries {
            self.change_state(&mut data, State::Fatal);
            error!(
                "give up to restart program {} after {} retries",
                self.get_name(),
                data.retries
            );
            self.inner.cond.notify_all();
            self.deregister_listener();
            return ExitOutcome::Done;
        }
        data.retries += 1;
        self.change_state(&mut data, State::Backoff);
        self.inner.cond.notify_all();
        let delay = Duration::from_secs((data.retries as u64).min(MAX_BACKOFF_SECS));
        debug!(
            "program {} retry {} in {:?}",
            self.get_name(),
            data.retries,
            delay
        );
        let deadline = Instant::now() + delay;
        while data.state == State::Backoff {
            let now = Instant::now();
            if now >= deadline {
                return ExitOutcome::Respawn;
            }
            let (next, _) = self
                .inner
                .cond
                .wait_timeout(data, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            data = next;
        }
        // Stop cancelled the retry and already moved us to STOPPED.
        ExitOutcome::Done
    }

    fn pump_output(&self, child: &mut Child) {
        let entry = &self.inner.entry;
        let stdout_sink = self.sink(
            &self.inner.stdout_log,
            &entry.get_string("stdout_logfile", ""),
            entry.get_bytes("stdout_logfile_maxbytes", 50 * 1024 * 1024),
            entry.get_int("stdout_logfile_backups", 10),
            "stdout",
        );
        if let Some(stdout) = child.stdout.take() {
            spawn_pump(
                &format!("{}-out", self.get_name()),
                stdout,
                stdout_sink.clone(),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = if entry.get_bool("redirect_stderr", false) {
                stdout_sink
            } else {
                self.sink(
                    &self.inner.stderr_log,
                    &entry.get_string("stderr_logfile", ""),
                    entry.get_bytes("stderr_logfile_maxbytes", 50 * 1024 * 1024),
                    entry.get_int("stderr_logfile_backups", 10),
                    "stderr",
                )
            };
            spawn_pump(&format!("{}-err", self.get_name()), stderr, sink);
        }
    }

    /// Sinks are created on first spawn and reused across respawns so
    /// rotation state survives restarts.
    fn sink(
        &self,
        slot: &Mutex<Option<SharedLogger>>,
        logfile: &str,
        max_bytes: i64,
        backups: i64,
        channel: &str,
    ) -> SharedLogger {
        let mut slot = match slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(sink) = slot.as_ref() {
            return sink.clone();
        }
        let logger = logger::new_logger(
            logfile,
            max_bytes,
            backups,
            Some((self.get_name(), self.get_group(), channel)),
        )
        .unwrap_or_else(|err| {
            error!(
                "fail to create log file {} for {}: {}",
                logfile,
                self.get_name(),
                err
            );
            Box::new(logger::NullLogger)
        });
        let shared: SharedLogger = Arc::new(Mutex::new(logger));
        *slot = Some(shared.clone());
        shared
    }

    fn attach_listener_stdin(&self, child: &mut Child) {
        let rx = events::register_listener(self.get_name());
        if let Some(mut stdin) = child.stdin.take() {
            let name = self.get_name().to_string();
            let writer = thread::Builder::new()
                .name(format!("{}-events", name))
                .spawn(move || {
                    use std::io::Write;
                    for framed in rx {
                        if stdin.write_all(framed.as_bytes()).is_err() {
                            debug!("event listener {} closed its stdin", name);
                            break;
                        }
                    }
                });
            if writer.is_err() {
                warn!("unable to spawn event writer for {}", self.get_name());
            }
        }
    }

    fn deregister_listener(&self) {
        if self.inner.entry.is_event_listener() {
            events::deregister_listener(self.get_name());
        }
    }

    fn change_state(&self, data: &mut StateData, next: State) {
        if data.state == next {
            return;
        }
        let from = data.state;
        data.state = next;
        debug!(
            "program {} state {} -> {}",
            self.get_name(),
            from.name(),
            next.name()
        );
        events::emit(&Event::process_state(
            next.name(),
            self.get_name(),
            self.get_group(),
            from.name(),
            data.pid,
        ));
    }

    fn lock(&self) -> MutexGuard<StateData> {
        match self.inner.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait_on<'a>(&'a self, guard: MutexGuard<'a, StateData>) -> MutexGuard<'a, StateData> {
        match self.inner.cond.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn supervisor_id(&self) -> &str {
        &self.inner.supervisor_id
    }
}

fn spawn_pump<R: Read + Send + 'static>(name: &str, mut source: R, sink: SharedLogger) {
    let spawned = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match source.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut sink = match sink.lock() {
                            Ok(sink) => sink,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        if let Err(err) = sink.write(&buf[..n]) {
                            error!("log write failed: {}", err);
                        }
                    }
                }
            }
        });
    if spawned.is_err() {
        warn!("unable to spawn output pump {}", name);
    }
}

/// Exit code as reported upstream: the code when the child exited, the
/// shell convention 128+signal when it was killed.
fn exit_code(status: &ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

fn epoch_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
