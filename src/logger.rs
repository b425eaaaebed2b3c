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

//! Log sinks for captured child output and for the supervisor itself.
//!
//! Variants: a null sink, stdout/stderr passthrough, a size-rotating file
//! sink with N backups, and a composite fan-out. The supervisor's own `log`
//! macro output goes through [`SupLog`], whose sink can be swapped after the
//! configuration is loaded.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::error::{Error, Result};
use crate::events::{self, Event};

pub type SharedLogger = Arc<Mutex<Box<dyn Logger>>>;

pub trait Logger: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn close(&mut self) {}
    /// Path of the backing file, when there is one.
    fn file_path(&self) -> Option<&PathBuf> {
        None
    }
}

pub struct NullLogger;

impl Logger for NullLogger {
    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Passthrough to the supervisor's own stdout or stderr.
pub struct StdLogger {
    to_stderr: bool,
}

impl StdLogger {
    pub fn stdout() -> StdLogger {
        StdLogger { to_stderr: false }
    }

    pub fn stderr() -> StdLogger {
        StdLogger { to_stderr: true }
    }
}

impl Logger for StdLogger {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let res = if self.to_stderr {
            io::stderr().write_all(data)
        } else {
            io::stdout().write_all(data)
        };
        res.map_err(Error::LoggerIo)
    }
}

/// Append-only file sink with size-based rotation.
///
/// When a write would push the file past `max_bytes`, the sink rotates
/// first: `path.N-1` becomes `path.N` for N = backups..1, `path` becomes
/// `path.1`, then a fresh `path` is opened (a plain truncate when
/// `backups == 0`). The incoming record always lands whole in exactly one
/// file.
pub struct FileLogger {
    path: PathBuf,
    max_bytes: i64,
    backups: i64,
    file: Option<File>,
    file_size: i64,
    event: Option<(String, String, String)>,
}

impl FileLogger {
    pub fn new<P: Into<PathBuf>>(path: P, max_bytes: i64, backups: i64) -> Result<FileLogger> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::LoggerIo)?;
        let file_size = file.metadata().map_err(Error::LoggerIo)?.len() as i64;
        Ok(FileLogger {
            path,
            max_bytes,
            backups,
            file: Some(file),
            file_size,
            event: None,
        })
    }

    /// Publish a PROCESS_LOG event per write, tagged with the owning
    /// process, its group and the channel name (stdout/stderr).
    pub fn with_events(mut self, process: &str, group: &str, channel: &str) -> FileLogger {
        self.event = Some((
            process.to_string(),
            group.to_string(),
            channel.to_string(),
        ));
        self
    }

    fn rotate(&mut self) -> Result<()> {
        if self.backups == 0 {
            let file = File::create(&self.path).map_err(Error::LoggerIo)?;
            self.file = Some(file);
            self.file_size = 0;
            return Ok(());
        }
        self.file = None;
        for n in (1..self.backups).rev() {
            let from = backup_path(&self.path, n);
            if from.exists() {
                fs::rename(&from, backup_path(&self.path, n + 1)).map_err(Error::LoggerIo)?;
            }
        }
        if self.path.exists() {
            fs::rename(&self.path, backup_path(&self.path, 1)).map_err(Error::LoggerIo)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(Error::LoggerIo)?;
        self.file = Some(file);
        self.file_size = 0;
        Ok(())
    }
}

impl Logger for FileLogger {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.max_bytes > 0
            && self.file_size > 0
            && self.file_size + data.len() as i64 > self.max_bytes
        {
            self.rotate()?;
        }
        match self.file.as_mut() {
            Some(file) => {
                file.write_all(data).map_err(Error::LoggerIo)?;
                self.file_size += data.len() as i64;
            }
            None => return Err(Error::LoggerIo(io::Error::from(io::ErrorKind::NotFound))),
        }
        if let Some((process, group, channel)) = &self.event {
            events::emit(&Event::process_log(channel, process, group, data));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn file_path(&self) -> Option<&PathBuf> {
        Some(&self.path)
    }
}

fn backup_path(path: &PathBuf, n: i64) -> PathBuf {
    let mut os = path.clone().into_os_string();
    os.push(format!(".{}", n));
    PathBuf::from(os)
}

/// Ordered fan-out to several sinks; the first error wins but every sink
/// still sees the write.
pub struct CompositeLogger(Vec<Box<dyn Logger>>);

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn Logger>>) -> CompositeLogger {
        CompositeLogger(loggers)
    }
}

impl Logger for CompositeLogger {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut first_err = None;
        for logger in &mut self.0 {
            if let Err(e) = logger.write(data) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        for logger in &mut self.0 {
            logger.close();
        }
    }
}

/// Build a sink for a configured `*_logfile` value, honoring the magic
/// paths the configuration may carry. A comma-separated value fans out to
/// every listed destination through a `CompositeLogger`; the event stream
/// is published once, from the first destination.
pub fn new_logger(
    logfile: &str,
    max_bytes: i64,
    backups: i64,
    event: Option<(&str, &str, &str)>,
) -> Result<Box<dyn Logger>> {
    let destinations: Vec<&str> = logfile
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .collect();
    match destinations.len() {
        0 => Ok(Box::new(NullLogger)),
        1 => single_logger(destinations[0], max_bytes, backups, event),
        _ => {
            let mut sinks = Vec::with_capacity(destinations.len());
            for (i, destination) in destinations.into_iter().enumerate() {
                let event = if i == 0 { event } else { None };
                sinks.push(single_logger(destination, max_bytes, backups, event)?);
            }
            Ok(Box::new(CompositeLogger::new(sinks)))
        }
    }
}

fn single_logger(
    logfile: &str,
    max_bytes: i64,
    backups: i64,
    event: Option<(&str, &str, &str)>,
) -> Result<Box<dyn Logger>> {
    match logfile {
        "none" | "/dev/null" | "NONE" => Ok(Box::new(NullLogger)),
        "/dev/stdout" => Ok(Box::new(StdLogger::stdout())),
        "/dev/stderr" => Ok(Box::new(StdLogger::stderr())),
        path => {
            let logger = FileLogger::new(path, max_bytes, backups)?;
            Ok(match event {
                Some((process, group, channel)) => {
                    Box::new(logger.with_events(process, group, channel))
                }
                None => Box::new(logger),
            })
        }
    }
}

enum SupSink {
    Env(env_logger::Logger),
    File { sink: FileLogger, level: LevelFilter },
}

/// The process-wide `log::Log` implementation. Starts out delegating to an
/// `env_logger`-built logger on stderr; `set_supervisord_logfile` swaps in a
/// rotating file sink once `[supervisord]` has been read.
pub struct SupLog {
    sink: RwLock<SupSink>,
}

lazy_static! {
    static ref SUP_LOG: SupLog = SupLog {
        sink: RwLock::new(SupSink::Env(
            env_logger::Builder::from_default_env().build()
        )),
    };
}

/// Install the supervisor logger as the `log` crate sink. Safe to call more
/// than once; only the first call takes effect.
pub fn init() {
    if log::set_logger(&*SUP_LOG).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Route subsequent `log` output to a rotating file sink.
pub fn set_supervisord_logfile(
    logfile: &str,
    max_bytes: i64,
    backups: i64,
    level: LevelFilter,
) -> Result<()> {
    let sink = FileLogger::new(logfile, max_bytes, backups)?;
    if let Ok(mut current) = SUP_LOG.sink.write() {
        *current = SupSink::File { sink, level };
    }
    log::set_max_level(level);
    Ok(())
}

pub fn supervisord_level(loglevel: &str) -> LevelFilter {
    match loglevel.to_ascii_lowercase().as_str() {
        "critical" | "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

impl Log for SupLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match self.sink.read() {
            Ok(sink) => match &*sink {
                SupSink::Env(env) => env.enabled(metadata),
                SupSink::File { level, .. } => metadata.level() <= *level,
            },
            Err(_) => false,
        }
    }

    fn log(&self, record: &Record) {
        let mut sink = match self.sink.write() {
            Ok(sink) => sink,
            Err(_) => return,
        };
        match &mut *sink {
            SupSink::Env(env) => env.log(record),
            SupSink::File { sink, level } => {
                if record.level() > *level {
                    return;
                }
                let line = format!(
                    "{} [{}] {}\n",
                    timestamp(),
                    level_tag(record.level()),
                    record.args()
                );
                let _ = sink.write(line.as_bytes());
            }
        }
    }

    fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERRO",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBU",
        Level::Trace => "TRAC",
    }
}

/// Seconds-resolution UTC timestamp without pulling in a time crate.
fn timestamp() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format_epoch(secs as i64)
}

/// Render an epoch-seconds value as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_epoch(secs: i64) -> String {
    let secs = secs.max(0) as u64;
    let days = secs / 86_400;
    let (year, month, day) = civil_from_days(days as i64);
    let rem = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

// Howard Hinnant's civil-from-days algorithm.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn rotation_preserves_every_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut logger = FileLogger::new(&path, 100, 3).unwrap();

        let record = vec![b'x'; 40];
        let mut written = 0usize;
        for _ in 0..10 {
            logger.write(&record).unwrap();
            written += record.len();
        }
        logger.close();

        let mut on_disk = fs::read(&path).unwrap().len();
        let mut backups = 0;
        for n in 1..=3 {
            let backup = dir.path().join(format!("out.log.{}", n));
            if backup.exists() {
                on_disk += fs::read(&backup).unwrap().len();
                backups += 1;
            }
        }
        // 10 * 40 bytes at 100 max and 3 backups: one backup is evicted, so
        // disk holds a 160-byte tail... unless nothing was evicted yet.
        assert!(backups <= 3);
        assert!(on_disk <= written);
        assert_eq!(on_disk % record.len(), 0);
        // Live file respects the cap after any write.
        assert!(fs::read(&path).unwrap().len() <= 100);
    }

    #[test]
    fn rotation_under_cap_loses_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut logger = FileLogger::new(&path, 100, 5).unwrap();

        let mut written = 0usize;
        for i in 0..6 {
            let record = vec![b'a' + i as u8; 30];
            logger.write(&record).unwrap();
            written += 30;
        }
        logger.close();

        let mut on_disk = fs::read(&path).unwrap().len();
        for n in 1..=5 {
            let backup = dir.path().join(format!("out.log.{}", n));
            if backup.exists() {
                on_disk += fs::read(&backup).unwrap().len();
            }
        }
        assert_eq!(on_disk, written);
    }

    #[test]
    fn zero_backups_truncates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut logger = FileLogger::new(&path, 50, 0).unwrap();
        logger.write(&vec![b'x'; 40]).unwrap();
        logger.write(&vec![b'y'; 40]).unwrap();
        logger.close();
        assert_eq!(fs::read(&path).unwrap(), vec![b'y'; 40]);
        assert!(!dir.path().join("out.log.1").exists());
    }

    #[test]
    fn composite_writes_to_all_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        let mut logger = CompositeLogger::new(vec![
            Box::new(FileLogger::new(&a, 0, 0).unwrap()),
            Box::new(FileLogger::new(&b, 0, 0).unwrap()),
            Box::new(NullLogger),
        ]);
        logger.write(b"fan out").unwrap();
        logger.close();
        assert_eq!(fs::read(&a).unwrap(), b"fan out");
        assert_eq!(fs::read(&b).unwrap(), b"fan out");
    }

    #[test]
    fn magic_paths_select_variants() {
        assert!(new_logger("", 0, 0, None).is_ok());
        assert!(new_logger("/dev/stdout", 0, 0, None).is_ok());
        assert!(new_logger("/dev/null", 0, 0, None).is_ok());
    }

    #[test]
    fn comma_separated_logfile_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        let value = format!(
            "{}, {},/dev/null",
            a.to_string_lossy(),
            b.to_string_lossy()
        );
        let mut logger = new_logger(&value, 0, 0, None).unwrap();
        logger.write(b"to everyone").unwrap();
        logger.close();
        assert_eq!(fs::read(&a).unwrap(), b"to everyone");
        assert_eq!(fs::read(&b).unwrap(), b"to everyone");
    }
}
