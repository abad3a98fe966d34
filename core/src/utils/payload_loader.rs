use std::fs;
use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;

/// Syntax breakers appended to the original value for error-based probing.
pub const ERROR_SUFFIXES: &[&str] = &["'", "\"", "\\", "')", "\")", "'))", "`"];

/// `(breaks, repairs)`: a lone quote and its escaped twin.
pub const STRING_PAIR: (&str, &str) = ("'", "''");

/// `(neutral, shifting)` arithmetic appended to a numeric value.
pub const NUMERIC_PAIR: (&str, &str) = ("-0", "-1");

/// `(valid, invalid)` extra sort column appended to an ORDER BY value.
pub const ORDER_PAIR: (&str, &str) = (",1", ",99999");

/// `(true, false)` condition pairs; the first closes a quoted context.
pub const BOOLEAN_PAIRS: &[(&str, &str)] = &[
    ("' AND '1'='1", "' AND '1'='2"),
    (" AND 1=1", " AND 1=2"),
];

/// User-supplied DIY material read from disk.
#[derive(Debug, Clone, Default)]
pub struct PayloadLoader {
    pub payloads: Vec<String>,
    pub patterns: Vec<String>,
}

impl PayloadLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads DIY payloads and, optionally, response patterns that flag them.
    pub fn load_from_paths(payloads_path: Option<&str>, patterns_path: Option<&str>) -> Result<Self> {
        let mut loader = Self::new();

        if let Some(path) = payloads_path {
            loader.payloads = load_list_from_file(path)
                .with_context(|| format!("reading DIY payloads from {}", path))?;
            if loader.payloads.is_empty() {
                warn!("No DIY payloads loaded from {}", path);
            }
        }

        if let Some(path) = patterns_path {
            loader.patterns = load_list_from_file(path)
                .with_context(|| format!("reading DIY patterns from {}", path))?;
            if loader.patterns.is_empty() {
                warn!("No DIY patterns loaded from {}", path);
            }
        }

        Ok(loader)
    }

    pub fn payload_count(&self) -> usize {
        self.payloads.len()
    }
}

/// Loads lines from a file, skipping empty lines and `#` comments.
pub fn load_list_from_file(path: &str) -> Result<Vec<String>> {
    let file = fs::File::open(Path::new(path))
        .with_context(|| format!("failed to open {}", path))?;
    let reader = std::io::BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            lines.push(trimmed.to_string());
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_pairs_differ() {
        assert_ne!(STRING_PAIR.0, STRING_PAIR.1);
        assert_ne!(NUMERIC_PAIR.0, NUMERIC_PAIR.1);
        assert_ne!(ORDER_PAIR.0, ORDER_PAIR.1);
        for (t, f) in BOOLEAN_PAIRS {
            assert_ne!(t, f);
        }
        assert!(ERROR_SUFFIXES.iter().all(|s| !s.contains('%')));
    }

    #[test]
    fn test_load_list_skips_comments_and_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# header").unwrap();
        writeln!(file, "  ' OR SLEEP(5)--  ").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "1;WAITFOR DELAY '0:0:5'--").unwrap();

        let lines = load_list_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(lines, vec!["' OR SLEEP(5)--", "1;WAITFOR DELAY '0:0:5'--"]);
    }

    #[test]
    fn test_load_from_paths() {
        let mut payloads = tempfile::NamedTempFile::new().unwrap();
        writeln!(payloads, "'||pg_sleep(3)--").unwrap();
        let mut patterns = tempfile::NamedTempFile::new().unwrap();
        writeln!(patterns, "pg_sleep").unwrap();

        let loader = PayloadLoader::load_from_paths(
            payloads.path().to_str(),
            patterns.path().to_str(),
        )
        .unwrap();
        assert_eq!(loader.payload_count(), 1);
        assert_eq!(loader.patterns, vec!["pg_sleep"]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_list_from_file("/definitely/not/here.txt").is_err());
        assert!(PayloadLoader::load_from_paths(Some("/definitely/not/here.txt"), None).is_err());
        assert_eq!(PayloadLoader::load_from_paths(None, None).unwrap().payload_count(), 0);
    }
}
