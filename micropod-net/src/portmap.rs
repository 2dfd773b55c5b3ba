//! Parses the user-supplied `host:guest` port-publish list.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Parses `host:guest` pairs into a `host_port -> guest_port` map.
///
/// Anything else (`"8080"`, `"abc:80"`, `"8080:def"`, `"8080:80:90"`) is
/// rejected as [`Error::InvalidPortMapping`]. A host port repeated across
/// multiple entries keeps only the last definition.
pub fn parse_port_mappings(specs: &[String]) -> Result<BTreeMap<u16, u16>> {
    let mut map = BTreeMap::new();
    for spec in specs {
        let mut parts = spec.split(':');
        let (Some(host), Some(guest), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::InvalidPortMapping(spec.clone()));
        };
        let host_port: u16 = host
            .parse()
            .map_err(|_| Error::InvalidPortMapping(spec.clone()))?;
        let guest_port: u16 = guest
            .parse()
            .map_err(|_| Error::InvalidPortMapping(spec.clone()))?;
        map.insert(host_port, guest_port);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_pairs() {
        let specs = vec!["8080:80".to_owned(), "443:443".to_owned()];
        let map = parse_port_mappings(&specs).unwrap();
        assert_eq!(map.get(&8080), Some(&80));
        assert_eq!(map.get(&443), Some(&443));
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(parse_port_mappings(&["8080".to_owned()]).is_err());
    }

    #[test]
    fn rejects_non_numeric_host() {
        assert!(parse_port_mappings(&["abc:80".to_owned()]).is_err());
    }

    #[test]
    fn rejects_non_numeric_guest() {
        assert!(parse_port_mappings(&["8080:def".to_owned()]).is_err());
    }

    #[test]
    fn rejects_extra_colon() {
        assert!(parse_port_mappings(&["8080:80:90".to_owned()]).is_err());
    }

    #[test]
    fn duplicate_host_ports_collapse_to_last() {
        let specs = vec!["8080:80".to_owned(), "8080:8080".to_owned()];
        let map = parse_port_mappings(&specs).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&8080), Some(&8080));
    }
}
