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

use std::fmt::{self, Display, Formatter};
use std::io;
use std::str::FromStr;

use libc;

use crate::error::{Error, Result};

pub type Pid = libc::pid_t;

#[allow(non_snake_case)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    INT,
    ILL,
    ABRT,
    FPE,
    KILL,
    SEGV,
    TERM,
    HUP,
    QUIT,
    ALRM,
    USR1,
    USR2,
}

impl From<Signal> for i32 {
    fn from(value: Signal) -> i32 {
        match value {
            Signal::HUP => libc::SIGHUP,
            Signal::INT => libc::SIGINT,
            Signal::QUIT => libc::SIGQUIT,
            Signal::ILL => libc::SIGILL,
            Signal::ABRT => libc::SIGABRT,
            Signal::FPE => libc::SIGFPE,
            Signal::KILL => libc::SIGKILL,
            Signal::USR1 => libc::SIGUSR1,
            Signal::SEGV => libc::SIGSEGV,
            Signal::USR2 => libc::SIGUSR2,
            Signal::ALRM => libc::SIGALRM,
            Signal::TERM => libc::SIGTERM,
        }
    }
}

impl FromStr for Signal {
    type Err = Error;

    /// Accepts both `TERM` and `SIGTERM` spellings.
    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim_start_matches("SIG");
        match name {
            "ABRT" => Ok(Signal::ABRT),
            "ALRM" => Ok(Signal::ALRM),
            "FPE" => Ok(Signal::FPE),
            "HUP" => Ok(Signal::HUP),
            "ILL" => Ok(Signal::ILL),
            "INT" => Ok(Signal::INT),
            "KILL" => Ok(Signal::KILL),
            "QUIT" => Ok(Signal::QUIT),
            "SEGV" => Ok(Signal::SEGV),
            "TERM" => Ok(Signal::TERM),
            "USR1" => Ok(Signal::USR1),
            "USR2" => Ok(Signal::USR2),
            _ => Err(Error::ConfigLoad(
                Default::default(),
                format!("unknown signal name {:?}", s),
            )),
        }
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match *self {
            Signal::ABRT => "ABRT",
            Signal::ALRM => "ALRM",
            Signal::FPE => "FPE",
            Signal::HUP => "HUP",
            Signal::ILL => "ILL",
            Signal::INT => "INT",
            Signal::KILL => "KILL",
            Signal::QUIT => "QUIT",
            Signal::SEGV => "SEGV",
            Signal::TERM => "TERM",
            Signal::USR1 => "USR1",
            Signal::USR2 => "USR2",
        };
        write!(f, "{}", s)
    }
}

/// Send `sig` to `pid`. A negative `pid` addresses the whole process group,
/// per kill(2).
pub fn signal(pid: Pid, sig: Signal) -> Result<()> {
    match unsafe { libc::kill(pid, sig.into()) } {
        0 => Ok(()),
        _ => Err(Error::SignalFailed(pid, io::Error::last_os_error())),
    }
}

/// Check if a process with the given pid exists (signal 0 probe).
pub fn is_alive(pid: Pid) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

pub fn current_pid() -> Pid {
    unsafe { libc::getpid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_name_round_trip() {
        for name in &["TERM", "KILL", "HUP", "USR2"] {
            let sig: Signal = name.parse().unwrap();
            assert_eq!(&sig.to_string(), name);
        }
        let sig: Signal = "SIGINT".parse().unwrap();
        assert_eq!(sig, Signal::INT);
        assert!("NOSUCH".parse::<Signal>().is_err());
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(is_alive(current_pid()));
        // No live process should exist way up in pid space on a test box.
        assert!(!is_alive(999_999_999));
    }
}
