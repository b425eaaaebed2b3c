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

//! End-to-end checks of the HTTP surface against a live supervisor: basic
//! auth with the `{SHA}` scheme, the program endpoints, and listener
//! rebinding on reload.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;

use supervisord::supervisor::Supervisor;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn write_config(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
}

/// Tiny HTTP/1.0 client; enough for request/response assertions without
/// pulling a client stack into the dev-dependencies.
fn http_request(port: u16, method: &str, path: &str, auth: Option<(&str, &str)>) -> Option<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).ok()?;
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let auth_header = auth
        .map(|(user, pass)| {
            format!(
                "Authorization: Basic {}\r\n",
                base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass))
            )
        })
        .unwrap_or_default();
    let request = format!(
        "{} {} HTTP/1.0\r\nHost: 127.0.0.1\r\n{}Connection: close\r\n\r\n",
        method, path, auth_header
    );
    stream.write_all(request.as_bytes()).ok()?;
    let mut response = String::new();
    stream.read_to_string(&mut response).ok()?;
    Some(response)
}

fn wait_until_serving(port: u16) {
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("server on port {} never came up", port);
}

fn config_body(port: u16, auth_lines: &str) -> String {
    format!(
        "[supervisord]\nidentifier = test-supervisor\npidfile = %(here)s/supervisord.pid\n\
         [inet_http_server]\nport = 127.0.0.1:{}\n{}\
         [program:webproc]\ncommand = /bin/sh -c \"sleep 30\"\nstartsecs = 0\nautostart = false\nautorestart = false\n",
        port, auth_lines
    )
}

#[test]
fn rest_surface_auth_and_rebind() {
    let dir = tempfile::tempdir().unwrap();
    let conf: PathBuf = dir.path().join("supervisord.conf");
    let port = free_port();
    // hex(sha1("secret")) behind the {SHA} marker.
    write_config(
        &conf,
        &config_body(
            port,
            "username = admin\npassword = {SHA}e5e9fa1ba31ecd1ae84f75caaa474f3a663f05f4\n",
        ),
    );

    let supervisor = Supervisor::new(&conf);
    supervisor.reload(true).unwrap();
    wait_until_serving(port);

    // Missing credentials: 401 with the exact challenge header.
    let response = http_request(port, "GET", "/program/list", None).unwrap();
    assert!(response.contains(" 401 "));
    // Header names are case-insensitive on the wire; the value must be the
    // canonical challenge.
    assert!(response
        .to_ascii_lowercase()
        .contains("www-authenticate: basic realm=\"supervisor\""));

    // Wrong password: still 401.
    let response = http_request(port, "GET", "/program/list", Some(("admin", "wrong"))).unwrap();
    assert!(response.contains(" 401 "));

    // Right password against the {SHA} digest: 200 with the program row.
    let response = http_request(port, "GET", "/program/list", Some(("admin", "secret"))).unwrap();
    assert!(response.contains(" 200 "));
    assert!(response.contains("\"name\":\"webproc\""));
    assert!(response.contains("\"statename\":\"STOPPED\""));

    // Start it, observe RUNNING, stop it again.
    let response =
        http_request(port, "POST", "/program/start/webproc", Some(("admin", "secret"))).unwrap();
    assert!(response.contains("{\"success\":true}"));
    let response = http_request(port, "GET", "/program/list", Some(("admin", "secret"))).unwrap();
    assert!(response.contains("\"statename\":\"RUNNING\""));
    let response =
        http_request(port, "POST", "/program/stop/webproc", Some(("admin", "secret"))).unwrap();
    assert!(response.contains("{\"success\":true}"));

    // Metrics are exposed without credentials.
    let response = http_request(port, "GET", "/metrics", None).unwrap();
    assert!(response.contains(" 200 "));
    assert!(response.contains("supervisord_process_state"));

    // The per-program config endpoint serves the raw file bytes.
    let response = http_request(port, "GET", "/conf/webproc", Some(("admin", "secret"))).unwrap();
    assert!(response.contains(" 200 "));
    assert!(response.contains("[program:webproc]"));
    let response = http_request(port, "GET", "/conf/nosuch", Some(("admin", "secret"))).unwrap();
    assert!(response.contains(" 404 "));

    // The stdout log stub answers 200 with an empty body.
    let response = http_request(
        port,
        "GET",
        "/program/log/webproc/stdout",
        Some(("admin", "secret")),
    )
    .unwrap();
    assert!(response.contains(" 200 "));

    // Rebind: a new config moves the listener to a fresh port. The old
    // port stops accepting and the new one serves within the readiness
    // window.
    let new_port = free_port();
    write_config(&conf, &config_body(new_port, ""));
    supervisor.reload(true).unwrap();
    wait_until_serving(new_port);

    let response = http_request(new_port, "GET", "/program/list", None).unwrap();
    assert!(response.contains(" 200 "));
    std::thread::sleep(Duration::from_millis(200));
    match http_request(port, "GET", "/program/list", None) {
        None => {}
        Some(response) => {
            assert!(
                !response.contains(" 200 "),
                "old listener still answering: {}",
                response
            );
        }
    }
}

#[test]
fn start_programs_batch_reports_aggregate_result() {
    let dir = tempfile::tempdir().unwrap();
    let conf: PathBuf = dir.path().join("supervisord.conf");
    let port = free_port();
    write_config(&conf, &config_body(port, ""));

    let supervisor = Supervisor::new(&conf);
    supervisor.reload(true).unwrap();
    wait_until_serving(port);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let body = "[\"webproc\"]";
    let request = format!(
        "POST /program/startPrograms HTTP/1.0\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.contains("Success to start the programs"));

    // A malformed body is a 400 with the canonical message.
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let bad = "not-json";
    let request = format!(
        "POST /program/stopPrograms HTTP/1.0\r\nHost: x\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        bad.len(),
        bad
    );
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.contains(" 400 "));
    assert!(response.contains("not a valid request"));

    supervisor.proc_mgr.stop_all_processes();
}
