use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

/// Vendor error signatures, `(pattern, dbms)`.
const SQL_ERROR_PATTERNS: &[(&str, &str)] = &[
    (r"SQL syntax.*?MySQL", "MySQL"),
    (r"Warning.*?\Wmysqli?_", "MySQL"),
    (r"You have an error in your SQL syntax", "MySQL"),
    (r"valid MySQL result", "MySQL"),
    (r"check the manual that (?:corresponds to|fits) your (?:MySQL|MariaDB) server version", "MySQL"),
    (r"MySqlClient\.", "MySQL"),
    (r"com\.mysql\.jdbc", "MySQL"),
    (r"PostgreSQL.*?ERROR", "PostgreSQL"),
    (r"Warning.*?\Wpg_", "PostgreSQL"),
    (r"valid PostgreSQL result", "PostgreSQL"),
    (r"Npgsql\.", "PostgreSQL"),
    (r"PG::SyntaxError:", "PostgreSQL"),
    (r"org\.postgresql\.util\.PSQLException", "PostgreSQL"),
    (r"unterminated quoted string at or near", "PostgreSQL"),
    (r"Driver.*? SQL[\-_ ]*Server", "Microsoft SQL Server"),
    (r"OLE DB.*? SQL Server", "Microsoft SQL Server"),
    (r"\bSQL Server[^&<]+Driver", "Microsoft SQL Server"),
    (r"Warning.*?\W(?:mssql|sqlsrv)_", "Microsoft SQL Server"),
    (r"System\.Data\.SqlClient\.SqlException", "Microsoft SQL Server"),
    (r"Unclosed quotation mark after the character string", "Microsoft SQL Server"),
    (r"com\.microsoft\.sqlserver\.jdbc", "Microsoft SQL Server"),
    (r"Microsoft Access (?:\d+ )?Driver", "Microsoft Access"),
    (r"JET Database Engine", "Microsoft Access"),
    (r"\bORA-\d{5}", "Oracle"),
    (r"Oracle error", "Oracle"),
    (r"Oracle.*?Driver", "Oracle"),
    (r"Warning.*?\W(?:oci|ora)_", "Oracle"),
    (r"quoted string not properly terminated", "Oracle"),
    (r"CLI Driver.*?DB2", "IBM DB2"),
    (r"DB2 SQL error", "IBM DB2"),
    (r"\bdb2_\w+\(", "IBM DB2"),
    (r"SQLSTATE=\d+", "IBM DB2"),
    (r"SQLite/JDBCDriver", "SQLite"),
    (r"SQLite\.Exception", "SQLite"),
    (r"System\.Data\.SQLite\.SQLiteException", "SQLite"),
    (r"Warning.*?\W(?:sqlite_|SQLite3::)", "SQLite"),
    (r"\[SQLITE_ERROR\]", "SQLite"),
    (r"SQLite error \d+:", "SQLite"),
    (r"unrecognized token:", "SQLite"),
    (r"Dynamic SQL Error", "Firebird"),
    (r"Warning.*?\Wibase_", "Firebird"),
    (r"Sybase message", "Sybase"),
    (r"Warning.*?\Wsybase_", "Sybase"),
    (r"SQL error.*?POS\d+", "SAP MaxDB"),
    (r"Informix ODBC Driver", "Informix"),
    (r"SQLSTATE\[\w+\]", "PDO"),
    (r"ODBC SQL Server Driver", "ODBC"),
    (r"\[ODBC [^\]]*Driver\]", "ODBC"),
];

/// Size limit for each compiled pattern; keeps hostile custom patterns bounded.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// A pattern hit in a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMatch {
    pub label: String,
    pub pattern: String,
    pub snippet: String,
}

/// A labelled regex set matched against response bodies.
///
/// `regex` runs in linear time; [`SignatureBank::find_within`] additionally
/// bounds wall-clock time so very large bodies cannot stall a scan worker.
#[derive(Debug, Default)]
pub struct SignatureBank {
    signatures: Vec<(String, Regex)>,
}

static BUILTIN: Lazy<Arc<SignatureBank>> = Lazy::new(|| {
    let signatures = SQL_ERROR_PATTERNS
        .iter()
        .filter_map(|(pattern, dbms)| {
            compile(pattern, true).ok().map(|re| (dbms.to_string(), re))
        })
        .collect();
    Arc::new(SignatureBank { signatures })
});

fn compile(pattern: &str, case_insensitive: bool) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
}

impl SignatureBank {
    /// Shared bank of database vendor error messages.
    pub fn builtin() -> Arc<SignatureBank> {
        Arc::clone(&BUILTIN)
    }

    /// Compiles user-supplied patterns. Invalid ones are skipped with a warning.
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Self {
        let signatures = patterns
            .iter()
            .map(AsRef::as_ref)
            .filter(|p| !p.trim().is_empty())
            .filter_map(|p| match compile(p, false) {
                Ok(re) => Some(("custom".to_string(), re)),
                Err(e) => {
                    warn!("Dropping invalid custom pattern {:?}: {}", p, e);
                    None
                }
            })
            .collect();
        Self { signatures }
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// First signature found in `body`, in bank order.
    pub fn find(&self, body: &str) -> Option<SignatureMatch> {
        self.signatures.iter().find_map(|(label, re)| {
            re.find(body).map(|m| SignatureMatch {
                label: label.clone(),
                pattern: re.as_str().to_string(),
                snippet: m.as_str().chars().take(200).collect(),
            })
        })
    }

    /// [`find`](Self::find) on a blocking thread with a hard time budget.
    /// Running out of budget counts as no match.
    pub async fn find_within(
        self: &Arc<Self>,
        body: Arc<str>,
        budget: Duration,
    ) -> Option<SignatureMatch> {
        if self.is_empty() {
            return None;
        }
        let bank = Arc::clone(self);
        let job = tokio::task::spawn_blocking(move || bank.find(&body));
        match tokio::time::timeout(budget, job).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!("signature matching task failed: {}", e);
                None
            }
            Err(_) => {
                debug!("signature matching exceeded {:?}, treating as no match", budget);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_compiles_every_pattern() {
        assert_eq!(SignatureBank::builtin().len(), SQL_ERROR_PATTERNS.len());
    }

    #[test]
    fn test_vendor_errors_are_recognised() {
        let bank = SignatureBank::builtin();
        let cases = [
            ("You have an error in your SQL syntax; check the manual", "MySQL"),
            ("ERROR: unterminated quoted string at or near \"'\"", "PostgreSQL"),
            ("Unclosed quotation mark after the character string ''.", "Microsoft SQL Server"),
            ("ORA-01756: quoted string not properly terminated", "Oracle"),
            ("SQLite error 1: unrecognized token: \"'\"", "SQLite"),
            ("DB2 SQL error: SQLCODE=-104", "IBM DB2"),
        ];
        for (body, dbms) in cases {
            let found = bank.find(body).unwrap_or_else(|| panic!("no match for {body}"));
            assert_eq!(found.label, dbms, "body: {body}");
        }
    }

    #[test]
    fn test_clean_pages_do_not_match() {
        let bank = SignatureBank::builtin();
        assert!(bank.find("<html><body>Welcome back, alice</body></html>").is_none());
        assert!(bank.find("").is_none());
    }

    #[test]
    fn test_custom_patterns_skip_invalid() {
        let bank = SignatureBank::from_patterns(&["token=[a-f0-9]{8}", "(unclosed", "  "]);
        assert_eq!(bank.len(), 1);
        let found = bank.find("ok token=deadbeef").unwrap();
        assert_eq!(found.label, "custom");
        assert_eq!(found.snippet, "token=deadbeef");
    }

    #[tokio::test]
    async fn test_find_within_budget() {
        let bank = SignatureBank::builtin();
        let hit = bank
            .find_within(Arc::from("Warning: mysql_fetch_array()"), Duration::from_secs(5))
            .await;
        assert_eq!(hit.map(|m| m.label), Some("MySQL".to_string()));

        let empty = Arc::new(SignatureBank::default());
        assert!(empty
            .find_within(Arc::from("anything"), Duration::from_secs(1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_find_within_timeout_counts_as_no_match() {
        let bank = SignatureBank::builtin();
        let mut body = "<div>row</div>".repeat(300_000);
        body.push_str("You have an error in your SQL syntax; check the manual");
        assert!(bank.find(&body).is_some());

        let hit = bank.find_within(Arc::from(body), Duration::from_nanos(1)).await;
        assert!(hit.is_none());
    }
}
