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

//! Fan-out of supervisor events to `[eventlistener:NAME]` programs.
//!
//! Listeners consume events on their stdin using the supervisor framing: a
//! header line `ver:3.0 server:<id> serial:<n> pool:<name> poolserial:<n>
//! eventname:<NAME> len:<payload bytes>` followed by the payload. Producers
//! publish through `emit`; each listener drains its own channel, so a stuck
//! listener never blocks a state transition.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: String,
}

impl Event {
    pub fn process_state(
        state_name: &str,
        process: &str,
        group: &str,
        from_state: &str,
        pid: i32,
    ) -> Event {
        Event {
            name: format!("PROCESS_STATE_{}", state_name),
            payload: format!(
                "processname:{} groupname:{} from_state:{} pid:{}",
                process, group, from_state, pid
            ),
        }
    }

    pub fn process_log(channel: &str, process: &str, group: &str, data: &[u8]) -> Event {
        Event {
            name: format!("PROCESS_LOG_{}", channel.to_ascii_uppercase()),
            payload: format!(
                "processname:{} groupname:{}\n{}",
                process,
                group,
                String::from_utf8_lossy(data)
            ),
        }
    }
}

struct Pool {
    server_id: String,
    serial: u64,
    listeners: HashMap<String, Sender<String>>,
}

lazy_static! {
    static ref POOL: Mutex<Pool> = Mutex::new(Pool {
        server_id: "supervisor".to_string(),
        serial: 0,
        listeners: HashMap::new(),
    });
}

pub fn set_server_id(id: &str) {
    if let Ok(mut pool) = POOL.lock() {
        pool.server_id = id.to_string();
    }
}

/// Register an event listener under its program name, returning the channel
/// its stdin writer should drain. Re-registering replaces the prior channel.
pub fn register_listener(name: &str) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    if let Ok(mut pool) = POOL.lock() {
        pool.listeners.insert(name.to_string(), tx);
    }
    rx
}

pub fn deregister_listener(name: &str) {
    if let Ok(mut pool) = POOL.lock() {
        pool.listeners.remove(name);
    }
}

/// Publish an event to every registered listener.
pub fn emit(event: &Event) {
    let mut pool = match POOL.lock() {
        Ok(pool) => pool,
        Err(_) => return,
    };
    pool.serial += 1;
    let framed = format!(
        "ver:3.0 server:{} serial:{} pool:{} poolserial:{} eventname:{} len:{}\n{}",
        pool.server_id,
        pool.serial,
        pool.server_id,
        pool.serial,
        event.name,
        event.payload.len(),
        event.payload
    );
    pool.listeners
        .retain(|_, sender| sender.send(framed.clone()).is_ok());
}
