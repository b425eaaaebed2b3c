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

//! An init-like process supervisor: starts, monitors and restarts a
//! configured set of child programs on a single host, and exposes a remote
//! control and observability surface over HTTP.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod logger;
pub mod manager;
pub mod process;
pub mod supervisor;
pub mod sys;
pub mod types;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
