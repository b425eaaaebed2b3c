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

use std::error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::result;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The configuration file could not be parsed. The offending file and a
    /// human-readable reason are carried along.
    ConfigLoad(PathBuf, String),
    /// A `%(name)s` expansion referenced a key that is not defined.
    UndefinedExpansion(String),
    /// A resource the supervisor requires at startup (log directory,
    /// configured user, ...) is missing or unusable.
    ResourcePrecondition(String),
    /// The configured command could not be split into an argv.
    BadCommand(String, String),
    /// No configuration file was found in any of the candidate locations.
    ConfigNotFound,
    /// The named program is not known to the manager.
    ProcessNotFound(String),
    UserNotFound(String),
    Spawn(io::Error),
    SignalFailed(i32, io::Error),
    LoggerIo(io::Error),
    NetListen(String, io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ConfigLoad(ref path, ref reason) => {
                write!(f, "failed to load {}: {}", path.display(), reason)
            }
            Error::UndefinedExpansion(ref key) => {
                write!(f, "undefined expansion variable %({})s", key)
            }
            Error::ResourcePrecondition(ref what) => {
                write!(f, "required resource unavailable: {}", what)
            }
            Error::BadCommand(ref cmd, ref reason) => {
                write!(f, "cannot parse command {:?}: {}", cmd, reason)
            }
            Error::ConfigNotFound => write!(f, "fail to find supervisord.conf"),
            Error::ProcessNotFound(ref name) => write!(f, "fail to find process {}", name),
            Error::UserNotFound(ref user) => write!(f, "no such user: {}", user),
            Error::Spawn(ref err) => write!(f, "unable to spawn child process: {}", err),
            Error::SignalFailed(pid, ref err) => {
                write!(f, "unable to signal process {}: {}", pid, err)
            }
            Error::LoggerIo(ref err) => write!(f, "log write failed: {}", err),
            Error::NetListen(ref addr, ref err) => {
                write!(f, "fail to listen on {}: {}", addr, err)
            }
        }
    }
}

impl error::Error for Error {}
