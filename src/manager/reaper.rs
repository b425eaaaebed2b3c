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

//! Wait-any zombie reaping for PID-1 duty.
//!
//! When the supervisor is init on its host (or `SUPERVISORD_REAP=1` forces
//! it), a dedicated worker owns `waitpid(-1, ...)` and routes each reaped
//! status to the process that registered the pid. Statuses for pids nobody
//! claimed yet are parked briefly so a spawner that loses the race to a
//! fast-exiting child still gets its exit. Unknown pids are discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::sys::process::{current_pid, Pid};

static ACTIVE: AtomicBool = AtomicBool::new(false);

struct Registry {
    watchers: HashMap<Pid, Sender<i32>>,
    unclaimed: HashMap<Pid, i32>,
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
        watchers: HashMap::new(),
        unclaimed: HashMap::new(),
    });
}

/// Start the reaper if this process has init duty. Call once at startup,
/// before any child is spawned.
pub fn reap_zombies() {
    let forced = std::env::var("SUPERVISORD_REAP").map(|v| v == "1").unwrap_or(false);
    if current_pid() != 1 && !forced {
        return;
    }
    if ACTIVE.swap(true, Ordering::SeqCst) {
        return;
    }
    info!("running as pid 1, starting zombie reaper");
    let spawned = thread::Builder::new()
        .name("reaper".to_string())
        .spawn(run_loop);
    if spawned.is_err() {
        error!("unable to start zombie reaper");
        ACTIVE.store(false, Ordering::SeqCst);
    }
}

pub fn active() -> bool {
    ACTIVE.load(Ordering::SeqCst)
}

/// Subscribe to the exit of `pid`. Returns `None` when the reaper is not
/// running and the caller should waitpid directly.
pub fn watch(pid: Pid) -> Option<Receiver<i32>> {
    if !active() {
        return None;
    }
    let (tx, rx) = mpsc::channel();
    let mut registry = match REGISTRY.lock() {
        Ok(registry) => registry,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(status) = registry.unclaimed.remove(&pid) {
        let _ = tx.send(status);
    } else {
        registry.watchers.insert(pid, tx);
    }
    Some(rx)
}

fn run_loop() {
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid > 0 {
            deliver(pid, status);
            continue;
        }
        // ECHILD: nothing to wait for right now.
        thread::sleep(Duration::from_secs(1));
    }
}

fn deliver(pid: Pid, status: i32) {
    let mut registry = match REGISTRY.lock() {
        Ok(registry) => registry,
        Err(poisoned) => poisoned.into_inner(),
    };
    match registry.watchers.remove(&pid) {
        Some(sender) => {
            if sender.send(status).is_err() {
                debug!("owner of pid {} went away before its exit", pid);
            }
        }
        None => {
            debug!("reaped unowned pid {} with status {}", pid, status);
            registry.unclaimed.insert(pid, status);
            // Parked statuses for children nobody claims (double-forked
            // daemons and the like) must not pile up forever.
            if registry.unclaimed.len() > 128 {
                registry.unclaimed.clear();
            }
        }
    }
}
