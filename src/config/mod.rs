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

//! Typed view over the layered INI configuration: `[supervisord]`,
//! `[program:NAME]`, `[group:NAME]`, `[eventlistener:NAME]`,
//! `[inet_http_server]`, `[unix_http_server]` and `[include]` sections.

pub mod ini;

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};

use glob::glob;

use self::ini::Ini;
use crate::error::{Error, Result};

/// `%(name)s` substitution against a fixed key set plus `ENV_*` fallbacks
/// drawn from the process environment. `%%` escapes a literal percent sign.
#[derive(Debug, Default, Clone)]
pub struct StringExpression {
    values: HashMap<String, String>,
}

impl StringExpression {
    pub fn new<S: Into<String>>(key: &str, value: S) -> StringExpression {
        let mut expr = StringExpression::default();
        expr.add(key, value);
        expr
    }

    pub fn add<S: Into<String>>(&mut self, key: &str, value: S) -> &mut Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn eval(&self, s: &str) -> Result<String> {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        loop {
            match rest.find('%') {
                None => {
                    out.push_str(rest);
                    return Ok(out);
                }
                Some(pos) => {
                    out.push_str(&rest[..pos]);
                    rest = &rest[pos..];
                    if rest.starts_with("%%") {
                        out.push('%');
                        rest = &rest[2..];
                        continue;
                    }
                    let close = match rest.strip_prefix("%(").and_then(|r| r.find(')')) {
                        Some(close) if rest[close + 2..].starts_with(")s") => close,
                        _ => {
                            return Err(Error::UndefinedExpansion(truncated(rest)));
                        }
                    };
                    let key = &rest[2..close + 2];
                    out.push_str(&self.lookup(key)?);
                    rest = &rest[close + 4..];
                }
            }
        }
    }

    fn lookup(&self, key: &str) -> Result<String> {
        if let Some(v) = self.values.get(key) {
            return Ok(v.clone());
        }
        if let Some(var) = key.strip_prefix("ENV_") {
            if let Ok(v) = env::var(var) {
                return Ok(v);
            }
        }
        Err(Error::UndefinedExpansion(key.to_string()))
    }
}

fn truncated(s: &str) -> String {
    s.chars().take(16).collect()
}

/// One configuration section, post-expansion. Program entries are the
/// immutable snapshot the process manager captures at CreateProcess time.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Full section name, e.g. `program:web`.
    pub section: String,
    /// Program name for `program:`/`eventlistener:` sections, otherwise the
    /// section name itself.
    pub name: String,
    /// Group the program belongs to; defaults to the program name.
    pub group: String,
    /// File this section was read from (differs from the main config when
    /// pulled in via `[include]`).
    pub conf_file: PathBuf,
    /// Position in load order, used to break priority ties.
    pub load_index: usize,
    key_values: Vec<(String, String)>,
}

impl Entry {
    fn new(section: &str, conf_file: &Path, load_index: usize) -> Entry {
        let name = match section.split_once(':') {
            Some((_, name)) => name.to_string(),
            None => section.to_string(),
        };
        Entry {
            section: section.to_string(),
            group: name.clone(),
            name,
            conf_file: conf_file.to_path_buf(),
            load_index,
            key_values: Vec::new(),
        }
    }

    pub fn is_program(&self) -> bool {
        self.section.starts_with("program:")
    }

    pub fn is_event_listener(&self) -> bool {
        self.section.starts_with("eventlistener:")
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.key_values.iter().any(|(k, _)| k == key)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.key_values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.key_values.iter().find(|(k, _)| k == key) {
            Some((_, v)) => v.trim().parse().unwrap_or(default),
            None => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.key_values.iter().find(|(k, _)| k == key) {
            Some((_, v)) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => true,
                "false" | "no" | "off" | "0" => false,
                _ => default,
            },
            None => default,
        }
    }

    /// Byte counts accept KB/MB/GB suffixes; a bare number is bytes.
    pub fn get_bytes(&self, key: &str, default: i64) -> i64 {
        let value = match self.key_values.iter().find(|(k, _)| k == key) {
            Some((_, v)) => v.trim().to_string(),
            None => return default,
        };
        let (digits, multiplier) = if let Some(d) = value.strip_suffix("KB") {
            (d, 1024)
        } else if let Some(d) = value.strip_suffix("MB") {
            (d, 1024 * 1024)
        } else if let Some(d) = value.strip_suffix("GB") {
            (d, 1024 * 1024 * 1024)
        } else {
            (value.as_str(), 1)
        };
        match digits.trim().parse::<i64>() {
            Ok(n) => n * multiplier,
            Err(_) => default,
        }
    }

    /// The `environment` key: ordered `KEY="value",KEY2=value2` overrides.
    pub fn get_env(&self) -> Vec<(String, String)> {
        let raw = self.get_string("environment", "");
        let mut env = Vec::new();
        for item in raw.split(',') {
            if let Some((k, v)) = item.split_once('=') {
                let k = k.trim();
                if !k.is_empty() {
                    env.push((k.to_string(), unquote(v.trim()).to_string()));
                }
            }
        }
        env
    }

    /// Exit codes regarded as expected, default `0,2`.
    pub fn get_exit_codes(&self) -> Vec<i32> {
        let raw = self.get_string("exitcodes", "0,2");
        let codes: Vec<i32> = raw
            .split(',')
            .filter_map(|c| c.trim().parse().ok())
            .collect();
        if codes.is_empty() {
            vec![0, 2]
        } else {
            codes
        }
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Group membership: group name to member program names.
#[derive(Debug, Default, Clone)]
pub struct ProgramGroup {
    groups: BTreeMap<String, Vec<String>>,
}

impl ProgramGroup {
    pub fn add(&mut self, group: &str, program: &str) {
        let members = self.groups.entry(group.to_string()).or_default();
        if !members.iter().any(|m| m == program) {
            members.push(program.to_string());
        }
    }

    pub fn remove_program(&mut self, program: &str) {
        self.groups.retain(|_, members| {
            members.retain(|m| m != program);
            !members.is_empty()
        });
    }

    pub fn group_of(&self, program: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, members)| members.iter().any(|m| m == program))
            .map(|(g, _)| g.as_str())
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Diff against a previous snapshot: `(added, changed, removed)` group
    /// name lists. A group is changed when present on both sides with a
    /// different membership set (order-insensitive).
    pub fn sub(&self, prev: &ProgramGroup) -> (Vec<String>, Vec<String>, Vec<String>) {
        let mut added = Vec::new();
        let mut changed = Vec::new();
        let mut removed = Vec::new();
        for (group, members) in &self.groups {
            match prev.groups.get(group) {
                None => added.push(group.clone()),
                Some(prev_members) => {
                    if !crate::util::is_same_string_set(members, prev_members) {
                        changed.push(group.clone());
                    }
                }
            }
        }
        for group in prev.groups.keys() {
            if !self.groups.contains_key(group) {
                removed.push(group.clone());
            }
        }
        (added, changed, removed)
    }
}

#[derive(Debug)]
pub struct Config {
    config_file: PathBuf,
    entries: Vec<Entry>,
    pub program_group: ProgramGroup,
}

impl Config {
    pub fn new<P: Into<PathBuf>>(config_file: P) -> Config {
        Config {
            config_file: config_file.into(),
            entries: Vec::new(),
            program_group: ProgramGroup::default(),
        }
    }

    /// (Re)read the configuration. On success the previous state is replaced
    /// wholesale and the loaded program names are returned; on any error the
    /// previous state is retained untouched.
    pub fn load(&mut self) -> Result<Vec<String>> {
        let mut entries: Vec<Entry> = Vec::new();
        let mut groups = ProgramGroup::default();
        let main = self.config_file.clone();

        let mut files = vec![main.clone()];
        let main_ini = Ini::load(&main)?;
        if let Some(include) = main_ini.section("include") {
            let patterns = include.get("files").unwrap_or("");
            for pattern in patterns.split_whitespace() {
                let expr = StringExpression::new("here", self.config_file_dir());
                let pattern = expr.eval(pattern)?;
                let absolute = if Path::new(&pattern).is_absolute() {
                    PathBuf::from(&pattern)
                } else {
                    Path::new(&self.config_file_dir()).join(&pattern)
                };
                let matches = glob(&absolute.to_string_lossy()).map_err(|e| {
                    Error::ConfigLoad(main.clone(), format!("bad include pattern: {}", e))
                })?;
                for path in matches.filter_map(|m| m.ok()) {
                    if !files.contains(&path) {
                        files.push(path);
                    }
                }
            }
        }

        // First pass: gather raw sections from every file in order.
        let mut group_sections: Vec<(String, String)> = Vec::new();
        for file in &files {
            let ini = Ini::load(file)?;
            for section in ini.sections {
                match section.name.split_once(':') {
                    Some(("group", group)) => {
                        let programs = section.get("programs").unwrap_or("").to_string();
                        group_sections.push((group.to_string(), programs));
                        continue;
                    }
                    Some(("program", _)) | Some(("eventlistener", _)) => {}
                    Some(_) => {
                        debug!("ignoring unknown section [{}]", section.name);
                        continue;
                    }
                    None => match section.name.as_str() {
                        "supervisord" | "inet_http_server" | "unix_http_server" | "include" => {}
                        other => {
                            debug!("ignoring unknown section [{}]", other);
                            continue;
                        }
                    },
                }
                let mut entry = Entry::new(&section.name, file, entries.len());
                entry.key_values = section.keys;
                if entries.iter().any(|e| e.section == entry.section) {
                    return Err(Error::ConfigLoad(
                        file.clone(),
                        format!("duplicate section [{}]", entry.section),
                    ));
                }
                entries.push(entry);
            }
        }

        // Resolve group membership before expansion so %(group_name)s sees
        // the final group.
        for (group, programs) in &group_sections {
            for program in programs.split(',') {
                let program = program.trim();
                if program.is_empty() {
                    continue;
                }
                match entries
                    .iter_mut()
                    .find(|e| e.is_program() && e.name == program)
                {
                    Some(entry) => entry.group = group.clone(),
                    None => {
                        return Err(Error::ConfigLoad(
                            main.clone(),
                            format!("group {} references unknown program {}", group, program),
                        ));
                    }
                }
            }
        }

        // Second pass: expand every value.
        let here = self.config_file_dir();
        for entry in &mut entries {
            let mut expr = StringExpression::new("here", here.clone());
            if entry.is_program() || entry.is_event_listener() {
                expr.add("program_name", entry.name.clone())
                    .add("group_name", entry.group.clone());
            }
            for (_, value) in &mut entry.key_values {
                *value = expr.eval(value)?;
            }
        }

        let mut program_names = Vec::new();
        for entry in &entries {
            if entry.is_program() {
                groups.add(&entry.group, &entry.name);
                program_names.push(entry.name.clone());
            }
        }

        self.entries = entries;
        self.program_group = groups;
        Ok(program_names)
    }

    pub fn get_program(&self, name: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.is_program() && e.name == name)
    }

    /// Program entries sorted by ascending priority, load order breaking
    /// ties.
    pub fn get_programs(&self) -> Vec<&Entry> {
        let mut programs: Vec<&Entry> = self.entries.iter().filter(|e| e.is_program()).collect();
        programs.sort_by_key(|e| (e.get_int("priority", 999), e.load_index));
        programs
    }

    pub fn get_program_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.is_program())
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn get_event_listeners(&self) -> Vec<&Entry> {
        self.entries
            .iter()
            .filter(|e| e.is_event_listener())
            .collect()
    }

    pub fn get_supervisord(&self) -> Option<&Entry> {
        self.entries.iter().find(|e| e.section == "supervisord")
    }

    pub fn get_inet_http_server(&self) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.section == "inet_http_server")
    }

    pub fn get_unix_http_server(&self) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.section == "unix_http_server")
    }

    pub fn remove_program(&mut self, name: &str) {
        self.entries
            .retain(|e| !(e.is_program() && e.name == name));
        self.program_group.remove_program(name);
    }

    pub fn get_config_file_dir(&self) -> String {
        self.config_file_dir()
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    fn config_file_dir(&self) -> String {
        self.config_file
            .parent()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use super::*;

    fn write_config(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn load_returns_program_names_and_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "supervisord.conf",
            "[supervisord]\nlogfile = %(here)s/supervisord.log\n\
             [program:web]\ncommand = /bin/sleep 60\npriority = 1\n\
             [program:worker]\ncommand = /bin/sleep 60\n\
             [group:backend]\nprograms = worker\n",
        );
        let mut config = Config::new(&path);
        let names = config.load().unwrap();
        assert_eq!(names, vec!["web".to_string(), "worker".to_string()]);
        assert_eq!(config.get_program("worker").unwrap().group, "backend");
        assert_eq!(
            config.program_group.groups(),
            vec!["backend".to_string(), "web".to_string()]
        );
        let logfile = config
            .get_supervisord()
            .unwrap()
            .get_string("logfile", "");
        assert_eq!(
            logfile,
            format!("{}/supervisord.log", dir.path().to_string_lossy())
        );
    }

    #[test]
    fn load_failure_retains_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "supervisord.conf",
            "[program:web]\ncommand = /bin/sleep 60\n",
        );
        let mut config = Config::new(&path);
        config.load().unwrap();

        write_config(
            dir.path(),
            "supervisord.conf",
            "[program:web]\ncommand = %(undefined_key)s\n",
        );
        assert!(config.load().is_err());
        assert_eq!(config.get_program_names(), vec!["web".to_string()]);
    }

    #[test]
    fn include_pulls_in_matched_files() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "web.conf",
            "[program:web]\ncommand = /bin/sleep 60\n",
        );
        let main = write_config(
            dir.path(),
            "supervisord.conf",
            "[include]\nfiles = *.d.conf web.conf\n",
        );
        let mut config = Config::new(&main);
        let names = config.load().unwrap();
        assert_eq!(names, vec!["web".to_string()]);
        assert_eq!(
            config.get_program("web").unwrap().conf_file,
            dir.path().join("web.conf")
        );
    }

    #[test]
    fn get_bytes_accepts_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "s.conf",
            "[program:p]\ncommand = /bin/true\na = 1024\nb = 2KB\nc = 3MB\nd = 1GB\nbad = lots\n",
        );
        let mut config = Config::new(&path);
        config.load().unwrap();
        let p = config.get_program("p").unwrap();
        assert_eq!(p.get_bytes("a", 0), 1024);
        assert_eq!(p.get_bytes("b", 0), 2 * 1024);
        assert_eq!(p.get_bytes("c", 0), 3 * 1024 * 1024);
        assert_eq!(p.get_bytes("d", 0), 1024 * 1024 * 1024);
        assert_eq!(p.get_bytes("bad", 42), 42);
        assert_eq!(p.get_bytes("absent", 7), 7);
    }

    #[test]
    fn environment_is_ordered_and_unquoted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "s.conf",
            "[program:p]\ncommand = /bin/true\nenvironment = B=\"2\",A=1\n",
        );
        let mut config = Config::new(&path);
        config.load().unwrap();
        let env = config.get_program("p").unwrap().get_env();
        assert_eq!(
            env,
            vec![
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "1".to_string())
            ]
        );
    }

    #[test]
    fn expression_expands_env_and_escapes() {
        std::env::set_var("SUPERVISORD_TEST_VALUE", "xyz");
        let expr = StringExpression::new("here", "/etc");
        assert_eq!(
            expr.eval("%(here)s/%(ENV_SUPERVISORD_TEST_VALUE)s/100%%").unwrap(),
            "/etc/xyz/100%"
        );
        assert!(expr.eval("%(nope)s").is_err());
    }

    #[test]
    fn group_diff_reports_added_changed_removed() {
        let mut prev = ProgramGroup::default();
        prev.add("a", "p1");
        prev.add("a", "p2");
        prev.add("b", "p3");

        let mut next = ProgramGroup::default();
        next.add("a", "p1");
        next.add("b", "p3");
        next.add("b", "p4");
        next.add("c", "p5");

        let (added, changed, removed) = next.sub(&prev);
        assert_eq!(added, vec!["c".to_string()]);
        assert_eq!(changed, vec!["a".to_string(), "b".to_string()]);
        assert!(removed.is_empty());

        // Rename-only membership move: exactly one changed pair, nothing
        // added or removed when group names persist.
        let mut renamed = prev.clone();
        renamed.remove_program("p2");
        let (added, changed, removed) = renamed.sub(&prev);
        assert!(added.is_empty());
        assert_eq!(changed, vec!["a".to_string()]);
        assert!(removed.is_empty());
    }
}
