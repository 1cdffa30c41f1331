// bridge-core/src/models/registration.rs
//
// Registration files are dropped by the terminal-side agent at
// <common-files-root>/HedgeEdge/<login>.json. The terminal writes them with
// whatever encoding its scripting runtime produces, so the reader tolerates
// UTF-8 / UTF-16LE / UTF-16BE BOMs and strips embedded NULs.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalRole {
    Master,
    Slave,
}

impl Default for TerminalRole {
    fn default() -> Self {
        TerminalRole::Master
    }
}

/// One terminal's registration, as written by its agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EaRegistration {
    #[serde(deserialize_with = "string_or_number")]
    pub login: String,
    #[serde(default)]
    pub broker: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub data_port: Option<u16>,
    #[serde(default)]
    pub command_port: Option<u16>,
    #[serde(default)]
    pub control_port: Option<u16>,
    #[serde(default)]
    pub role: TerminalRole,
    #[serde(default)]
    pub curve_enabled: Option<bool>,
    #[serde(default)]
    pub curve_public_key: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub terminal_path: Option<String>,
}

/// Terminals write `login` as a JSON number; the UI writes strings.
fn string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }
    Ok(match Raw::deserialize(de)? {
        Raw::Num(n) => n.to_string(),
        Raw::Str(s) => s,
    })
}

impl EaRegistration {
    pub fn is_master(&self) -> bool {
        self.role == TerminalRole::Master
    }

    /// Terminal id used as the key in the reader's link map and as the
    /// PortManager allocation label.
    pub fn terminal_id(&self) -> &str {
        &self.login
    }

    /// The PAIR liveness-gate port: explicit `controlPort` wins, otherwise
    /// data+2 for masters and command+1 for slaves.
    pub fn derived_control_port(&self) -> Option<u16> {
        if self.control_port.is_some() {
            return self.control_port;
        }
        match self.role {
            TerminalRole::Master => self.data_port.map(|p| p + 2),
            TerminalRole::Slave => self.command_port.map(|p| p + 1),
        }
    }

    /// Structural validation. Returns warnings for tolerated oddities;
    /// errors only for registrations that cannot be connected at all.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.login.trim().is_empty() {
            return Err(anyhow!("registration has an empty login"));
        }

        match self.role {
            TerminalRole::Master => {
                let data = self
                    .data_port
                    .ok_or_else(|| anyhow!("master registration {} has no dataPort", self.login))?;
                let command = self.command_port.ok_or_else(|| {
                    anyhow!("master registration {} has no commandPort", self.login)
                })?;
                if !crate::port_manager::is_valid_port(data)
                    || !crate::port_manager::is_valid_port(command)
                {
                    return Err(anyhow!(
                        "registration {} has out-of-range ports ({}, {})",
                        self.login,
                        data,
                        command
                    ));
                }
                if command != data + 1 {
                    warnings.push(format!(
                        "ports are not adjacent (data={}, command={})",
                        data, command
                    ));
                }
                if let Some(control) = self.control_port {
                    if control != data + 2 {
                        warnings.push(format!(
                            "controlPort {} does not match dataPort+2 ({})",
                            control,
                            data + 2
                        ));
                    }
                }
            }
            TerminalRole::Slave => {
                let command = self.command_port.ok_or_else(|| {
                    anyhow!("slave registration {} has no commandPort", self.login)
                })?;
                if !crate::port_manager::is_valid_port(command) {
                    return Err(anyhow!(
                        "registration {} has an out-of-range commandPort {}",
                        self.login,
                        command
                    ));
                }
                if let Some(control) = self.control_port {
                    if control != command + 1 {
                        warnings.push(format!(
                            "controlPort {} does not match commandPort+1 ({})",
                            control,
                            command + 1
                        ));
                    }
                }
            }
        }

        Ok(warnings)
    }

    /// The port TCP-probed to decide whether the terminal is reachable.
    pub fn probe_port(&self) -> Option<u16> {
        self.data_port.or(self.command_port)
    }
}

/// Read and parse a registration file, tolerating BOMs and embedded NULs.
pub fn read_registration_file(path: &Path) -> Result<EaRegistration> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read registration file {}", path.display()))?;
    parse_registration_bytes(&bytes)
        .with_context(|| format!("Failed to parse registration file {}", path.display()))
}

pub fn parse_registration_bytes(bytes: &[u8]) -> Result<EaRegistration> {
    let text = decode_registration_text(bytes)?;
    serde_json::from_str(&text).context("registration is not valid JSON")
}

fn decode_registration_text(bytes: &[u8]) -> Result<String> {
    let text = if bytes.starts_with(&[0xFF, 0xFE]) {
        decode_utf16(&bytes[2..], u16::from_le_bytes)?
    } else if bytes.starts_with(&[0xFE, 0xFF]) {
        decode_utf16(&bytes[2..], u16::from_be_bytes)?
    } else if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        String::from_utf8(bytes[3..].to_vec()).context("registration is not valid UTF-8")?
    } else {
        String::from_utf8(bytes.to_vec()).context("registration is not valid UTF-8")?
    };
    Ok(text.replace('\0', ""))
}

fn decode_utf16(bytes: &[u8], combine: fn([u8; 2]) -> u16) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(anyhow!("UTF-16 registration has odd byte length"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| combine([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).context("registration is not valid UTF-16")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_json() -> &'static str {
        r#"{"login":100234,"broker":"Demo","server":"Demo-01","dataPort":51810,"commandPort":51811,"role":"master","version":"1.4.2"}"#
    }

    #[test]
    fn test_parse_master_registration() {
        let reg = parse_registration_bytes(master_json().as_bytes()).unwrap();
        assert_eq!(reg.login, "100234");
        assert_eq!(reg.data_port, Some(51810));
        assert!(reg.is_master());
        assert!(reg.validate().unwrap().is_empty());
        assert_eq!(reg.derived_control_port(), Some(51812));
    }

    #[test]
    fn test_parse_slave_registration() {
        let json = r#"{"login":"200555","commandPort":51821,"role":"slave"}"#;
        let reg = parse_registration_bytes(json.as_bytes()).unwrap();
        assert!(!reg.is_master());
        assert_eq!(reg.probe_port(), Some(51821));
        assert_eq!(reg.derived_control_port(), Some(51822));
        assert!(reg.validate().unwrap().is_empty());
    }

    #[test]
    fn test_utf8_bom_and_nuls_are_stripped() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(master_json().as_bytes());
        bytes.push(0);
        let reg = parse_registration_bytes(&bytes).unwrap();
        assert_eq!(reg.login, "100234");
    }

    #[test]
    fn test_utf16le_registration() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in master_json().encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let reg = parse_registration_bytes(&bytes).unwrap();
        assert_eq!(reg.data_port, Some(51810));
    }

    #[test]
    fn test_utf16be_registration() {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in master_json().encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        let reg = parse_registration_bytes(&bytes).unwrap();
        assert_eq!(reg.command_port, Some(51811));
    }

    #[test]
    fn test_parse_serialize_parse_is_stable() {
        let reg = parse_registration_bytes(master_json().as_bytes()).unwrap();
        let serialized = serde_json::to_vec(&reg).unwrap();
        let reparsed = parse_registration_bytes(&serialized).unwrap();
        assert_eq!(reg, reparsed);
    }

    #[test]
    fn test_master_without_data_port_is_invalid() {
        let json = r#"{"login":"1","commandPort":51811,"role":"master"}"#;
        let reg = parse_registration_bytes(json.as_bytes()).unwrap();
        assert!(reg.validate().is_err());
    }

    #[test]
    fn test_non_adjacent_pair_warns_but_passes() {
        let json = r#"{"login":"1","dataPort":51810,"commandPort":51815}"#;
        let reg = parse_registration_bytes(json.as_bytes()).unwrap();
        let warnings = reg.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("not adjacent"));
    }

    #[test]
    fn test_explicit_control_port_wins() {
        let json = r#"{"login":"1","dataPort":51810,"commandPort":51811,"controlPort":51899}"#;
        let reg = parse_registration_bytes(json.as_bytes()).unwrap();
        assert_eq!(reg.derived_control_port(), Some(51899));
        let warnings = reg.validate().unwrap();
        assert!(warnings[0].contains("dataPort+2"));
    }
}
