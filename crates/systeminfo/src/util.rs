use std::path::Path;

use crate::{Error, Result};

pub(crate) fn read_usize(path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();

    let raw = std::fs::read_to_string(path).map_err(|e| Error::unreadable(e, path))?;
    let raw = raw.trim();

    raw.parse().map_err(|e| Error::unparseable(e, path))
}

pub(crate) fn read_list(path: impl AsRef<Path>) -> Result<Vec<usize>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| Error::unreadable(e, path))?;
    parse_list(&raw, path)
}

/// Parse a kernel cpu/node list such as `0-3,8,10-11`.
pub(crate) fn parse_list(raw: &str, path: &Path) -> Result<Vec<usize>> {
    let raw = raw.trim();
    let mut ret = Vec::new();

    if raw.is_empty() {
        return Ok(ret);
    }

    for range in raw.split(',') {
        let mut parts = range.split('-');

        let first: Option<usize> = parts
            .next()
            .map(|text| text.parse())
            .transpose()
            .map_err(|e| Error::unparseable(e, path))?;
        let second: Option<usize> = parts
            .next()
            .map(|text| text.parse())
            .transpose()
            .map_err(|e| Error::unparseable(e, path))?;

        if parts.next().is_some() {
            // The range is invalid, skip it.
            continue;
        }

        match (first, second) {
            (Some(value), None) => ret.push(value),
            (Some(start), Some(stop)) => ret.extend(start..=stop),
            _ => continue,
        }
    }

    ret.sort_unstable();
    ret.dedup();

    Ok(ret)
}
