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

//! HTTP listener lifecycle. One server per protocol (tcp, unix socket),
//! each on its own thread with its own runtime. Binding happens in the
//! caller so bind errors surface synchronously, and the server handle comes
//! back over a one-shot channel as the readiness signal; `stop_all` closes
//! the old listeners before a rebind.

pub mod auth;
pub mod metrics;
pub mod rest;

use std::collections::HashMap;
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use prometheus::Registry;

use crate::error::{Error, Result};
use crate::supervisor::Supervisor;

/// Shared state every handler sees.
#[derive(Clone)]
pub struct AppCtx {
    pub supervisor: Arc<Supervisor>,
    pub username: String,
    pub password: String,
    pub registry: Registry,
}

pub struct HttpServers {
    handles: Mutex<HashMap<&'static str, ServerHandle>>,
}

enum Bound {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl HttpServers {
    pub fn new() -> HttpServers {
        HttpServers {
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn start_inet(
        &self,
        supervisor: Arc<Supervisor>,
        addr: &str,
        username: String,
        password: String,
    ) -> Result<()> {
        let listener =
            TcpListener::bind(addr).map_err(|e| Error::NetListen(addr.to_string(), e))?;
        info!("start to serve http on {}", addr);
        self.serve("tcp", Bound::Tcp(listener), supervisor, username, password)
    }

    pub fn start_unix(
        &self,
        supervisor: Arc<Supervisor>,
        path: &str,
        username: String,
        password: String,
    ) -> Result<()> {
        // A previous run may have left the socket file behind.
        let _ = std::fs::remove_file(path);
        let listener =
            UnixListener::bind(path).map_err(|e| Error::NetListen(path.to_string(), e))?;
        info!("start to serve http on unix socket {}", path);
        self.serve("unix", Bound::Unix(listener), supervisor, username, password)
    }

    fn serve(
        &self,
        protocol: &'static str,
        bound: Bound,
        supervisor: Arc<Supervisor>,
        username: String,
        password: String,
    ) -> Result<()> {
        let registry = metrics::process_registry(&supervisor);
        let ctx = AppCtx {
            supervisor,
            username,
            password,
            registry,
        };
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("http-{}", protocol))
            .spawn(move || {
                let sys = actix_web::rt::System::new();
                let served = sys.block_on(async move {
                    let server = HttpServer::new(move || {
                        App::new()
                            .app_data(web::Data::new(ctx.clone()))
                            .configure(rest::routes)
                    })
                    .workers(1)
                    .client_request_timeout(Duration::from_secs(5))
                    .disable_signals();
                    let server = match bound {
                        Bound::Tcp(listener) => server.listen(listener),
                        Bound::Unix(listener) => server.listen_uds(listener),
                    };
                    match server {
                        Ok(server) => {
                            let running = server.run();
                            let _ = tx.send(running.handle());
                            running.await
                        }
                        Err(err) => Err(err),
                    }
                });
                if let Err(err) = served {
                    error!("http server on {} stopped serving: {}", protocol, err);
                }
            });
        if spawned.is_err() {
            return Err(Error::ResourcePrecondition(format!(
                "unable to spawn http server thread for {}",
                protocol
            )));
        }

        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(handle) => {
                let mut handles = self.lock();
                handles.insert(protocol, handle);
                Ok(())
            }
            Err(_) => Err(Error::ResourcePrecondition(format!(
                "http server for {} never became ready",
                protocol
            ))),
        }
    }

    /// Close every listener. Forced, not graceful: a rebind triggered over
    /// HTTP would otherwise wait on the request that triggered it.
    pub fn stop_all(&self) {
        let drained: Vec<(&'static str, ServerHandle)> = {
            let mut handles = self.lock();
            handles.drain().collect()
        };
        for (protocol, handle) in drained {
            info!("stop listening on {}", protocol);
            futures::executor::block_on(handle.stop(false));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<HashMap<&'static str, ServerHandle>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for HttpServers {
    fn default() -> Self {
        HttpServers::new()
    }
}
