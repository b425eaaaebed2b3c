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

//! Traps the terminal signals the supervisor cares about. Handlers only flip
//! atomic flags; a polling loop consumes them via `check_for_signal`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use libc;

static INIT: Once = Once::new();

static CAUGHT_SHUTDOWN: AtomicBool = AtomicBool::new(false);
static CAUGHT_HUP: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGINT or SIGTERM: stop all processes and exit.
    Shutdown,
    /// SIGHUP: reload the configuration in place.
    Reload,
}

extern "C" fn handle_shutdown(_: libc::c_int) {
    CAUGHT_SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn handle_hup(_: libc::c_int) {
    CAUGHT_HUP.store(true, Ordering::SeqCst);
}

pub fn init() {
    INIT.call_once(|| unsafe {
        set_handler(libc::SIGINT, handle_shutdown as libc::sighandler_t);
        set_handler(libc::SIGTERM, handle_shutdown as libc::sighandler_t);
        set_handler(libc::SIGHUP, handle_hup as libc::sighandler_t);
        // A dying HTTP client must not take the supervisor down with it.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

unsafe fn set_handler(signum: libc::c_int, handler: libc::sighandler_t) {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handler;
    libc::sigemptyset(&mut action.sa_mask);
    libc::sigaction(signum, &action, std::ptr::null_mut());
}

/// Consume a pending signal event, if any. Shutdown wins over reload when
/// both arrived since the last poll.
pub fn check_for_signal() -> Option<SignalEvent> {
    if CAUGHT_SHUTDOWN.swap(false, Ordering::SeqCst) {
        Some(SignalEvent::Shutdown)
    } else if CAUGHT_HUP.swap(false, Ordering::SeqCst) {
        Some(SignalEvent::Reload)
    } else {
        None
    }
}
