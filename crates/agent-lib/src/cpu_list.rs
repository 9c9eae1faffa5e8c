//! CPU list syntax used by `cpuset.cpus` and the topology annotations
//!
//! A list is a comma-separated sequence of CPU ids and inclusive ranges,
//! for example `0-7,10,12-15`. The empty string is the empty set.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cpu list {input:?}: {reason}")]
pub struct CpuSetParseError {
    pub input: String,
    pub reason: String,
}

/// Highest CPU id accepted, matching the kernel's `NR_CPUS` ceiling
pub const MAX_CPU_ID: u32 = 8191;

/// A set of logical CPU ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuSet(BTreeSet<u32>);

impl CpuSet {
    pub fn parse(input: &str) -> Result<Self, CpuSetParseError> {
        let err = |reason: String| CpuSetParseError {
            input: input.to_string(),
            reason,
        };

        let trimmed = input.trim();
        let mut cpus = BTreeSet::new();
        if trimmed.is_empty() {
            return Ok(Self(cpus));
        }

        for token in trimmed.split(',') {
            let token = token.trim();
            if token.is_empty() {
                return Err(err("empty element".to_string()));
            }

            match token.split_once('-') {
                Some((start, end)) => {
                    let start: u32 = start
                        .trim()
                        .parse()
                        .map_err(|_| err(format!("bad range start in {token:?}")))?;
                    let end: u32 = end
                        .trim()
                        .parse()
                        .map_err(|_| err(format!("bad range end in {token:?}")))?;
                    if start > end {
                        return Err(err(format!("reversed range {token:?}")));
                    }
                    if end > MAX_CPU_ID {
                        return Err(err(format!("cpu id {end} above {MAX_CPU_ID}")));
                    }
                    cpus.extend(start..=end);
                }
                None => {
                    let cpu: u32 = token
                        .parse()
                        .map_err(|_| err(format!("bad cpu id {token:?}")))?;
                    if cpu > MAX_CPU_ID {
                        return Err(err(format!("cpu id {cpu} above {MAX_CPU_ID}")));
                    }
                    cpus.insert(cpu);
                }
            }
        }

        Ok(Self(cpus))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.0.contains(&cpu)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    /// Compares two cpu lists as sets; unparsable input falls back to text
    pub fn same_list(a: &str, b: &str) -> bool {
        match (Self::parse(a), Self::parse(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => a.trim() == b.trim(),
        }
    }
}

impl FromStr for CpuSet {
    type Err = CpuSetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl FromIterator<u32> for CpuSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Formats in canonical range-list form
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.0.iter().copied().peekable();

        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }

            if !first {
                f.write_str(",")?;
            }
            first = false;

            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranges_and_singles() {
        let set = CpuSet::parse("0-3,8,10-11").unwrap();
        assert_eq!(set.len(), 7);
        assert!(set.contains(2));
        assert!(set.contains(8));
        assert!(!set.contains(9));
    }

    #[test]
    fn test_parse_empty() {
        assert!(CpuSet::parse("").unwrap().is_empty());
        assert!(CpuSet::parse(" \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(CpuSet::parse("bad-fmt").is_err());
        assert!(CpuSet::parse("7-3").is_err());
        assert!(CpuSet::parse("1,,2").is_err());
        assert!(CpuSet::parse("x").is_err());
    }

    #[test]
    fn test_parse_rejects_ids_above_ceiling() {
        assert!(CpuSet::parse("0-4294967295").is_err());
        assert!(CpuSet::parse("100000").is_err());
        assert!(CpuSet::parse("8192").is_err());

        let set = CpuSet::parse("8190-8191").unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_same_list() {
        assert!(CpuSet::same_list("0-7,8-15", "0-15"));
        assert!(CpuSet::same_list("", "\n"));
        assert!(!CpuSet::same_list("0-3", "0-4"));
        assert!(!CpuSet::same_list("x", "0"));
    }

    #[test]
    fn test_display_canonical() {
        let set: CpuSet = "8-15,0-7,20".parse().unwrap();
        assert_eq!(set.to_string(), "0-15,20");

        let set: CpuSet = [3, 1, 2, 5].into_iter().collect();
        assert_eq!(set.to_string(), "1-3,5");
    }
}
