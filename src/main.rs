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

#[macro_use]
extern crate log;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Arg, ArgAction, ArgMatches, Command};
use daemonize::Daemonize;

use supervisord::config::{ini::Ini, StringExpression};
use supervisord::error::Error;
use supervisord::manager::reaper;
use supervisord::supervisor::Supervisor;
use supervisord::sys::signals;
use supervisord::{logger, VERSION};

fn main() {
    logger::init();
    reaper::reap_zombies();

    let matches = match cli().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            use clap::error::ErrorKind;
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            process::exit(code);
        }
    };

    match matches.subcommand() {
        Some(("version", _)) => sub_version(),
        Some(("service", m)) => sub_service(m),
        Some(("init", m)) => sub_init(m),
        _ => run_server(&matches),
    }
}

fn cli() -> Command {
    Command::new("supervisord")
        .about("A process supervisor with an HTTP control surface")
        .version(VERSION)
        .arg(
            Arg::new("configuration")
                .short('c')
                .long("configuration")
                .value_name("PATH")
                .help("the configuration file"),
        )
        .arg(
            Arg::new("env-file")
                .long("env-file")
                .value_name("PATH")
                .help("the environment file"),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .action(ArgAction::SetTrue)
                .help("run as daemon"),
        )
        .subcommand(Command::new("version").about("show the version of supervisor"))
        .subcommand(
            Command::new("service")
                .about("install/uninstall/start/stop the OS service")
                .arg(
                    Arg::new("action")
                        .required(true)
                        .value_parser(["install", "uninstall", "start", "stop"]),
                ),
        )
        .subcommand(
            Command::new("init")
                .about("write a configuration template")
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("PATH")
                        .default_value("supervisord.conf"),
                ),
        )
}

fn run_server(matches: &ArgMatches) {
    if let Some(env_file) = matches.get_one::<String>("env-file") {
        apply_env_file(Path::new(env_file));
    }

    let config_file = match find_supervisord_conf(matches.get_one::<String>("configuration")) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    if matches.get_flag("daemon") {
        daemonize(&config_file);
    }

    signals::init();
    let supervisor = Supervisor::new(&config_file);
    if let Err(err) = supervisor.reload(true) {
        error!("{}", err);
        eprintln!("{}", err);
        process::exit(1);
    }
    supervisor.wait_for_exit();
}

/// Candidate configuration paths, most specific first. The `-c` value wins
/// outright when given.
fn conf_candidates(explicit: Option<&String>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(PathBuf::from(path));
    }
    candidates.push(PathBuf::from("./supervisord.ini"));
    candidates.push(PathBuf::from("./etc/supervisord.conf"));
    candidates.push(PathBuf::from("/etc/supervisord.conf"));
    candidates.push(PathBuf::from("/etc/supervisor/supervisord.conf"));
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("../etc/supervisord.conf"));
            candidates.push(dir.join("../supervisord.conf"));
        }
    }
    candidates
}

fn find_supervisord_conf(explicit: Option<&String>) -> supervisord::error::Result<PathBuf> {
    match first_existing(&conf_candidates(explicit)) {
        Some(path) => Ok(path),
        None => Err(Error::ConfigNotFound),
    }
}

fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates
        .iter()
        .find(|path| path.exists())
        .map(|path| path.canonicalize().unwrap_or_else(|_| path.clone()))
}

/// One KEY=VALUE per line; `#` comments and blank lines are skipped, and a
/// leading `export ` is stripped.
fn apply_env_file(path: &Path) {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => {
            error!("Fail to open environment file {}", path.display());
            return;
        }
    };
    for line in contents.lines() {
        if let Some((key, value)) = parse_env_line(line) {
            std::env::set_var(key, value);
        }
    }
}

fn parse_env_line(line: &str) -> Option<(&str, &str)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Some(rest) = line.strip_prefix("export") {
        if rest.starts_with(char::is_whitespace) {
            line = rest.trim_start();
        }
    }
    let (key, value) = line.split_once('=')?;
    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}

/// The supervisor log file for daemon mode, read ahead of the full config
/// load so the detached process has somewhere to put its output.
fn supervisord_log_file(config_file: &Path) -> PathBuf {
    let here = config_file
        .parent()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    let fallback = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("supervisord.log");
    let raw = match Ini::load(config_file) {
        Ok(ini) => match ini.section("supervisord").and_then(|s| s.get("logfile")) {
            Some(logfile) => logfile.to_string(),
            None => return fallback,
        },
        Err(_) => return fallback,
    };
    match StringExpression::new("here", here).eval(&raw) {
        Ok(expanded) => PathBuf::from(expanded),
        Err(_) => fallback,
    }
}

fn daemonize(config_file: &Path) {
    let log_file = supervisord_log_file(config_file);
    let open = |path: &Path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
    };
    let daemon = Daemonize::new().pid_file("supervisord.pid");
    let daemon = match (open(&log_file), open(&log_file)) {
        (Ok(out), Ok(err)) => daemon.stdout(out).stderr(err),
        _ => daemon,
    };
    if let Err(err) = daemon.start() {
        eprintln!("Unable to run as daemon: {}", err);
        process::exit(1);
    }
}

fn sub_version() {
    println!("{}", VERSION);
}

const SYSTEMD_UNIT_PATH: &str = "/etc/systemd/system/supervisord.service";

fn sub_service(matches: &ArgMatches) {
    let action = matches
        .get_one::<String>("action")
        .map(String::as_str)
        .unwrap_or("");
    let result = match action {
        "install" => service_install(),
        "uninstall" => service_uninstall(),
        "start" => systemctl(&["start", "supervisord"]),
        "stop" => systemctl(&["stop", "supervisord"]),
        _ => Err("unknown service action".to_string()),
    };
    if let Err(err) = result {
        eprintln!("{}", err);
        process::exit(1);
    }
}

fn service_install() -> Result<(), String> {
    let exe = std::env::current_exe().map_err(|e| e.to_string())?;
    let unit = format!(
        "[Unit]\n\
         Description=supervisord process supervisor\n\
         After=network.target\n\
         \n\
         [Service]\n\
         ExecStart={} -c /etc/supervisord.conf\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exe.display()
    );
    std::fs::write(SYSTEMD_UNIT_PATH, unit).map_err(|e| e.to_string())?;
    systemctl(&["daemon-reload"])?;
    systemctl(&["enable", "supervisord"])
}

fn service_uninstall() -> Result<(), String> {
    systemctl(&["disable", "supervisord"])?;
    std::fs::remove_file(SYSTEMD_UNIT_PATH).map_err(|e| e.to_string())?;
    systemctl(&["daemon-reload"])
}

fn systemctl(args: &[&str]) -> Result<(), String> {
    let status = process::Command::new("systemctl")
        .args(args)
        .status()
        .map_err(|e| format!("unable to run systemctl: {}", e))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("systemctl {} failed: {}", args.join(" "), status))
    }
}

const CONF_TEMPLATE: &str = "\
; supervisord configuration template

[supervisord]
logfile = %(here)s/supervisord.log
logfile_maxbytes = 50MB
logfile_backups = 10
loglevel = info
pidfile = %(here)s/supervisord.pid

[inet_http_server]
port = 127.0.0.1:9001
; username = admin
; password = {SHA}e5e9fa1ba31ecd1ae84f75caaa474f3a663f05f4

; [unix_http_server]
; file = /tmp/supervisord.sock

[program:example]
command = /bin/cat
autostart = true
autorestart = unexpected
startsecs = 1
startretries = 3
exitcodes = 0,2
stopsignal = TERM
stopwaitsecs = 10
stdout_logfile = %(here)s/example_stdout.log
stdout_logfile_maxbytes = 50MB
stdout_logfile_backups = 10
";

fn sub_init(matches: &ArgMatches) {
    let output = matches
        .get_one::<String>("output")
        .map(String::as_str)
        .unwrap_or("supervisord.conf");
    if Path::new(output).exists() {
        eprintln!("{} already exists, not overwriting", output);
        process::exit(1);
    }
    if let Err(err) = std::fs::write(output, CONF_TEMPLATE) {
        eprintln!("unable to write {}: {}", output, err);
        process::exit(1);
    }
    println!("wrote configuration template to {}", output);
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use super::*;

    #[test]
    fn env_lines_parse_per_the_contract() {
        assert_eq!(parse_env_line("KEY=value"), Some(("KEY", "value")));
        assert_eq!(
            parse_env_line("export KEY = spaced out"),
            Some(("KEY", "spaced out"))
        );
        assert_eq!(parse_env_line("# comment"), None);
        assert_eq!(parse_env_line(""), None);
        assert_eq!(parse_env_line("exported=1"), Some(("exported", "1")));
        assert_eq!(parse_env_line("NOVALUE="), None);
        assert_eq!(parse_env_line("=nokey"), None);
    }

    #[test]
    fn missing_config_error_has_the_canonical_text() {
        assert_eq!(
            Error::ConfigNotFound.to_string(),
            "fail to find supervisord.conf"
        );
    }

    #[test]
    fn first_existing_honors_candidate_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("supervisord.ini");
        let second = dir.path().join("etc-supervisord.conf");
        let mut candidates = vec![
            dir.path().join("missing.conf"),
            first.clone(),
            second.clone(),
        ];

        assert_eq!(first_existing(&candidates), None);

        File::create(&second).unwrap();
        assert_eq!(
            first_existing(&candidates).unwrap(),
            second.canonicalize().unwrap()
        );

        File::create(&first).unwrap();
        assert_eq!(
            first_existing(&candidates).unwrap(),
            first.canonicalize().unwrap()
        );

        candidates.remove(0);
        assert_eq!(
            first_existing(&candidates).unwrap(),
            first.canonicalize().unwrap()
        );
    }

    #[test]
    fn daemon_log_file_is_read_from_the_raw_ini() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisord.conf");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"[supervisord]\nlogfile = %(here)s/sup.log\n")
            .unwrap();
        assert_eq!(
            supervisord_log_file(&path),
            dir.path().join("sup.log")
        );
    }
}
