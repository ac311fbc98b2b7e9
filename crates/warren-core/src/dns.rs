//! DNS label normalization for peer hostnames

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

const MAX_LABEL_LEN: usize = 58;

/// Normalizes a hostname into a DNS label: lowercased, non-alphanumeric
/// runs collapsed to a single dash, trimmed, capped at 58 characters.
///
/// Errors when nothing usable remains, e.g. a hostname of punctuation only.
pub fn parse_domain_label(hostname: &str) -> Result<String> {
    let mut label = String::with_capacity(hostname.len());
    let mut last_dash = true; // suppress leading dashes
    for c in hostname.chars() {
        if c.is_ascii_alphanumeric() {
            label.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            label.push('-');
            last_dash = true;
        }
    }
    while label.ends_with('-') {
        label.pop();
    }
    if label.len() > MAX_LABEL_LEN {
        label.truncate(MAX_LABEL_LEN);
        while label.ends_with('-') {
            label.pop();
        }
    }
    if label.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "hostname {hostname:?} yields no valid DNS label"
        )));
    }
    Ok(label)
}

/// Collision fallback: `<label>-<third octet>-<fourth octet>`.
pub fn peer_ip_dns_label(ip: Ipv4Addr, hostname: &str) -> Result<String> {
    let label = parse_domain_label(hostname)?;
    let octets = ip.octets();
    Ok(format!("{}-{}-{}", label, octets[2], octets[3]))
}

/// Validates extra DNS labels supplied by a client. Each label must be a
/// plain DNS label: alphanumeric with interior dashes, at most 63 chars.
pub fn validate_domain_labels(labels: &[String]) -> Result<()> {
    for label in labels {
        if label.is_empty() || label.len() > 63 {
            return Err(Error::InvalidArgument(format!(
                "invalid extra DNS label {label:?}: must be 1-63 characters"
            )));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::InvalidArgument(format!(
                "invalid extra DNS label {label:?}: must not start or end with a dash"
            )));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::InvalidArgument(format!(
                "invalid extra DNS label {label:?}: only alphanumerics and dashes allowed"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_hostnames_pass_through() {
        assert_eq!(parse_domain_label("laptop-1").unwrap(), "laptop-1");
        assert_eq!(parse_domain_label("iPhone-alice").unwrap(), "iphone-alice");
    }

    #[test]
    fn punctuation_collapses_to_dashes() {
        assert_eq!(parse_domain_label("My Laptop_2").unwrap(), "my-laptop-2");
        assert_eq!(parse_domain_label("a..b").unwrap(), "a-b");
        assert_eq!(parse_domain_label("--host--").unwrap(), "host");
    }

    #[test]
    fn empty_result_is_an_error() {
        assert!(parse_domain_label("***").is_err());
        assert!(parse_domain_label("").is_err());
    }

    #[test]
    fn long_hostnames_are_truncated() {
        let label = parse_domain_label(&"x".repeat(100)).unwrap();
        assert_eq!(label.len(), 58);
    }

    #[test]
    fn ip_fallback_label() {
        let ip = "100.64.3.7".parse().unwrap();
        assert_eq!(peer_ip_dns_label(ip, "laptop").unwrap(), "laptop-3-7");
    }

    #[test]
    fn extra_label_validation() {
        assert!(validate_domain_labels(&["web".into(), "db-1".into()]).is_ok());
        assert!(validate_domain_labels(&["-bad".into()]).is_err());
        assert!(validate_domain_labels(&["bad.dot".into()]).is_err());
        assert!(validate_domain_labels(&[String::new()]).is_err());
    }
}
