//! Hostfile parsing.
//!
//! One host per line, `<ip> slots=<n> port=<p>`; line order defines node
//! index 0..N-1. Blank lines and `#` comments are ignored.

use std::path::Path;

use thiserror::Error;

use super::protocol::HostInfo;

#[derive(Debug, Error)]
pub enum HostfileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line_number}: {reason}: {line:?}")]
    Malformed {
        line_number: usize,
        line: String,
        reason: String,
    },

    #[error("Hostfile contains no hosts")]
    Empty,
}

pub fn parse_hostfile(path: &Path) -> Result<Vec<HostInfo>, HostfileError> {
    parse_hostfile_str(&std::fs::read_to_string(path)?)
}

pub fn parse_hostfile_str(content: &str) -> Result<Vec<HostInfo>, HostfileError> {
    let mut hosts = Vec::new();

    for (index, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let malformed = |reason: &str| HostfileError::Malformed {
            line_number: index + 1,
            line: raw_line.to_string(),
            reason: reason.to_string(),
        };

        let mut fields = line.split_whitespace();
        let ip = fields.next().ok_or_else(|| malformed("missing host"))?;

        let mut devices: Option<usize> = None;
        let mut port: Option<u16> = None;
        for field in fields {
            if let Some(value) = field.strip_prefix("slots=") {
                devices = Some(
                    value
                        .parse()
                        .map_err(|_| malformed("invalid slots value"))?,
                );
            } else if let Some(value) = field.strip_prefix("port=") {
                port = Some(value.parse().map_err(|_| malformed("invalid port value"))?);
            } else {
                return Err(malformed("unknown field"));
            }
        }

        hosts.push(HostInfo {
            ip: ip.to_string(),
            devices: devices.ok_or_else(|| malformed("missing slots="))?,
            port: port.ok_or_else(|| malformed("missing port="))?,
        });
    }

    if hosts.is_empty() {
        return Err(HostfileError::Empty);
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ordered_hosts() {
        let hosts = parse_hostfile_str(
            "# cluster A\n\
             10.0.0.1 slots=2 port=1234\n\
             \n\
             10.0.0.2 slots=2 port=1234\n\
             10.0.0.3 slots=4 port=4321\n",
        )
        .unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[0].ip, "10.0.0.1");
        assert_eq!(hosts[2].devices, 4);
        assert_eq!(hosts[2].port, 4321);
    }

    #[test]
    fn rejects_missing_slots() {
        let err = parse_hostfile_str("10.0.0.1 port=1234\n").unwrap_err();
        assert!(matches!(err, HostfileError::Malformed { line_number: 1, .. }));
    }

    #[test]
    fn rejects_garbage_fields() {
        assert!(parse_hostfile_str("10.0.0.1 slots=2 port=1 extra\n").is_err());
    }

    #[test]
    fn comment_only_file_is_empty() {
        assert!(matches!(
            parse_hostfile_str("# nothing here\n"),
            Err(HostfileError::Empty)
        ));
    }
}
