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

//! Line-level INI reader. Understands `[section]` headers, `key = value` and
//! `key: value` pairs, and full-line `;`/`#` comments. Anything else fails
//! the parse, and the caller throws the whole load away.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct IniSection {
    pub name: String,
    pub keys: Vec<(String, String)>,
}

impl IniSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default)]
pub struct Ini {
    pub sections: Vec<IniSection>,
}

impl Ini {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Ini> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(path.to_path_buf(), e.to_string()))?;
        Self::parse(&text).map_err(|reason| Error::ConfigLoad(path.to_path_buf(), reason))
    }

    /// Parse INI text. Returns a human-readable reason on failure so the
    /// caller can attach the file name.
    pub fn parse(text: &str) -> std::result::Result<Ini, String> {
        let mut ini = Ini::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(format!("line {}: malformed section header", lineno + 1));
                }
                let name = line[1..line.len() - 1].trim().to_string();
                if name.is_empty() {
                    return Err(format!("line {}: empty section name", lineno + 1));
                }
                ini.sections.push(IniSection {
                    name,
                    keys: Vec::new(),
                });
                continue;
            }
            let sep = match (line.find('='), line.find(':')) {
                (Some(e), Some(c)) => Some(e.min(c)),
                (Some(e), None) => Some(e),
                (None, Some(c)) => Some(c),
                (None, None) => None,
            };
            let sep = match sep {
                Some(pos) if pos > 0 => pos,
                _ => return Err(format!("line {}: expected key = value", lineno + 1)),
            };
            let key = line[..sep].trim().to_string();
            let value = unquote(line[sep + 1..].trim()).to_string();
            match ini.sections.last_mut() {
                Some(section) => section.keys.push((key, value)),
                None => {
                    return Err(format!("line {}: key outside of any section", lineno + 1));
                }
            }
        }
        Ok(ini)
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name == name)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_keys() {
        let ini = Ini::parse(
            "; a comment\n\
             [supervisord]\n\
             logfile = /tmp/supervisord.log\n\
             # another comment\n\
             [program:web]\n\
             command: /bin/sleep 60\n\
             environment = KEY=\"value\"\n",
        )
        .unwrap();
        assert_eq!(ini.sections.len(), 2);
        assert_eq!(
            ini.section("supervisord").unwrap().get("logfile"),
            Some("/tmp/supervisord.log")
        );
        let web = ini.section("program:web").unwrap();
        assert_eq!(web.get("command"), Some("/bin/sleep 60"));
        assert_eq!(web.get("environment"), Some("KEY=\"value\""));
    }

    #[test]
    fn quoted_values_are_unwrapped() {
        let ini = Ini::parse("[a]\nk = \"quoted value\"\n").unwrap();
        assert_eq!(ini.section("a").unwrap().get("k"), Some("quoted value"));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(Ini::parse("[unterminated\n").is_err());
        assert!(Ini::parse("[a]\njust some words\n").is_err());
        assert!(Ini::parse("orphan = 1\n").is_err());
    }
}
