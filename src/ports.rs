use anyhow::{bail, Context, Result};

use crate::error::ScanError;

/// Parse a port range spec into an inclusive `(start, end)` pair (1..=65535).
///
/// Supported formats:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - surrounding whitespace is ignored
pub fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let spec = s.trim();
    if spec.is_empty() {
        bail!("empty port range");
    }

    if let Some((a, b)) = spec.split_once('-') {
        let start = parse_port_str(a.trim())
            .with_context(|| format!("invalid start in range: {a}"))?;
        let end = parse_port_str(b.trim())
            .with_context(|| format!("invalid end in range: {b}"))?;
        if start > end {
            bail!("invalid range {start}-{end} (start > end)");
        }
        return Ok((start, end));
    }

    let p = parse_port_str(spec).with_context(|| format!("invalid port value: {spec}"))?;
    Ok((p, p))
}

/// Check caller-supplied bounds before a scan starts.
///
/// Takes wide integers so out-of-range input from JSON or other callers is
/// rejected instead of silently truncated.
pub fn validate_range(start: u32, end: u32) -> Result<(u16, u16), ScanError> {
    let in_bounds = |p: u32| (1..=65535).contains(&p);
    if !in_bounds(start) || !in_bounds(end) || start > end {
        return Err(ScanError::InvalidRange { start, end });
    }
    Ok((start as u16, end as u16))
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
