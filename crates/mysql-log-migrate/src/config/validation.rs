//! Configuration validation, including the WHERE-fragment safety check.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{parse_timezone, ExportConfig, LoadConfig, MigrateConfig, MAX_CHUNK_SIZE, MAX_WORKERS};
use crate::error::{MigrateError, Result};

/// Keywords that must never appear in a user-supplied filter fragment.
static DANGEROUS_KEYWORDS: &[&str] = &[
    "DROP",
    "DELETE",
    "UPDATE",
    "INSERT",
    "TRUNCATE",
    "ALTER",
    "CREATE",
    "REPLACE",
    "GRANT",
    "REVOKE",
    "EXECUTE",
    "CALL",
    "LOAD_FILE",
    "INTO OUTFILE",
    "INTO DUMPFILE",
];

static KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    let alternation = DANGEROUS_KEYWORDS.join("|").replace(' ', "\\s+");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).expect("keyword regex")
});

static BACKTICK_SEMICOLON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`\s*;|;\s*`").expect("backtick regex"));

/// Validate an optional WHERE fragment before it is spliced into a query.
///
/// Rejects dangerous statement keywords as whole words (case-insensitive),
/// SQL comment sequences, semicolons, and backtick-adjacent semicolons.
pub fn validate_filter(filter: &str) -> Result<()> {
    let filter = filter.trim();
    if filter.is_empty() {
        return Ok(());
    }

    if let Some(m) = KEYWORD_RE.find(filter) {
        return Err(MigrateError::Config(format!(
            "filter contains forbidden keyword: {}",
            m.as_str().to_uppercase()
        )));
    }

    if filter.contains("--") || filter.contains("/*") || filter.contains("*/") {
        return Err(MigrateError::Config(
            "filter contains forbidden comment syntax".into(),
        ));
    }

    if filter.contains(';') {
        return Err(MigrateError::Config(
            "filter contains forbidden semicolon".into(),
        ));
    }

    if BACKTICK_SEMICOLON_RE.is_match(filter) {
        return Err(MigrateError::Config(
            "filter contains suspicious backtick usage".into(),
        ));
    }

    Ok(())
}

fn validate_workers(name: &str, value: usize) -> Result<()> {
    if value < 1 || value > MAX_WORKERS {
        return Err(MigrateError::Config(format!(
            "{} must be between 1 and {}, got {}",
            name, MAX_WORKERS, value
        )));
    }
    Ok(())
}

fn validate_chunk_size(value: u64) -> Result<()> {
    if value < 1 || value > MAX_CHUNK_SIZE {
        return Err(MigrateError::Config(format!(
            "chunk size must be between 1 and {}, got {}",
            MAX_CHUNK_SIZE, value
        )));
    }
    Ok(())
}

pub(super) fn validate_migrate(cfg: &MigrateConfig) -> Result<()> {
    if cfg.src_dsn.is_empty() || cfg.dst_dsn.is_empty() {
        return Err(MigrateError::Config(
            "src-dsn and dst-dsn are required".into(),
        ));
    }
    if cfg.src_table.is_empty() || cfg.dst_table.is_empty() {
        return Err(MigrateError::Config(
            "src-table and dst-table are required".into(),
        ));
    }

    validate_workers("stage workers", cfg.stage_workers)?;
    validate_workers("load workers", cfg.load_workers)?;
    validate_chunk_size(cfg.chunk_size)?;

    if cfg.ts_column_idx < 1 {
        return Err(MigrateError::Config("ts-idx must be at least 1".into()));
    }

    if let Some(ref filter) = cfg.src_filter {
        validate_filter(filter)
            .map_err(|e| MigrateError::Config(format!("invalid source filter: {}", e)))?;
    }

    parse_timezone(&cfg.uuid_tz)?;

    // TODO: lift this gate once the MySQL driver can negotiate the
    // CLIENT_LOCAL_FILES capability and serve the LOCAL INFILE transfer.
    if cfg.use_local_infile {
        return Err(MigrateError::Config(
            "local-infile mode is not supported: the MySQL driver cannot \
             negotiate client-side file transfer, so the LOAD DATA LOCAL \
             INFILE statement would be rejected by the server; stage chunks \
             under the destination's secure_file_priv instead"
                .into(),
        ));
    }

    Ok(())
}

pub(super) fn validate_export(cfg: &ExportConfig) -> Result<()> {
    if cfg.dsn.is_empty() {
        return Err(MigrateError::Config("dsn is required".into()));
    }
    if cfg.table.is_empty() {
        return Err(MigrateError::Config("table is required".into()));
    }

    validate_workers("workers", cfg.workers)?;
    validate_chunk_size(cfg.chunk_size)?;

    if let Some(ref filter) = cfg.filter {
        validate_filter(filter)
            .map_err(|e| MigrateError::Config(format!("invalid filter: {}", e)))?;
    }

    Ok(())
}

pub(super) fn validate_load(cfg: &LoadConfig) -> Result<()> {
    if cfg.dsn.is_empty() {
        return Err(MigrateError::Config("dsn is required".into()));
    }
    if cfg.tar_path.as_os_str().is_empty() {
        return Err(MigrateError::Config("tar path is required".into()));
    }
    if cfg.dst_table.is_empty() {
        return Err(MigrateError::Config("dst-table is required".into()));
    }
    if cfg.dst_columns.is_empty() {
        return Err(MigrateError::Config("dst-columns is required".into()));
    }
    if !cfg.dst_columns[0].eq_ignore_ascii_case("id") {
        return Err(MigrateError::Config(
            "dst-columns must start with the UUID column 'id'".into(),
        ));
    }
    if cfg.uuid_from_idx < 1 {
        return Err(MigrateError::Config(
            "uuidv7-from-index must be at least 1".into(),
        ));
    }

    validate_workers("workers", cfg.workers)?;
    parse_timezone(&cfg.uuid_tz)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_plain_predicates() {
        assert!(validate_filter("").is_ok());
        assert!(validate_filter("id % 100 = 0").is_ok());
        assert!(validate_filter("created_at >= '2024-01-01'").is_ok());
        assert!(validate_filter("status IN ('a', 'b') AND id > 5").is_ok());
    }

    #[test]
    fn test_filter_rejects_statement_keywords() {
        assert!(validate_filter("id > 1; DROP TABLE users").is_err());
        assert!(validate_filter("1=1 AND delete from t").is_err());
        assert!(validate_filter("x = LOAD_FILE('/etc/passwd')").is_err());
        assert!(validate_filter("1 INTO OUTFILE '/tmp/x'").is_err());
    }

    #[test]
    fn test_filter_keywords_match_whole_words_only() {
        // Column names containing keywords as substrings are fine.
        assert!(validate_filter("dropped_at IS NULL").is_ok());
        assert!(validate_filter("updated > 5").is_ok());
        assert!(validate_filter("recreated = 0").is_ok());
    }

    #[test]
    fn test_filter_rejects_comments_and_semicolons() {
        assert!(validate_filter("id > 1 -- x").is_err());
        assert!(validate_filter("id > 1 /* hidden */").is_err());
        assert!(validate_filter("id > 1;").is_err());
        assert!(validate_filter("`id` ; x").is_err());
    }

    fn valid_migrate() -> MigrateConfig {
        MigrateConfig {
            src_dsn: "mysql://u:p@src/logs".into(),
            dst_dsn: "mysql://u:p@dst/logs".into(),
            ..MigrateConfig::default()
        }
    }

    #[test]
    fn test_migrate_config_requires_dsns() {
        let cfg = MigrateConfig::default();
        assert!(cfg.validate().is_err());
        assert!(valid_migrate().validate().is_ok());
    }

    #[test]
    fn test_migrate_config_bounds() {
        let mut cfg = valid_migrate();
        cfg.stage_workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_migrate();
        cfg.load_workers = 101;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_migrate();
        cfg.chunk_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_migrate();
        cfg.chunk_size = 10_000_001;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_migrate();
        cfg.ts_column_idx = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_migrate_config_rejects_local_infile() {
        let mut cfg = valid_migrate();
        cfg.use_local_infile = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("local-infile"));
    }

    #[test]
    fn test_migrate_config_rejects_bad_timezone() {
        let mut cfg = valid_migrate();
        cfg.uuid_tz = "Mars/Olympus_Mons".into();
        assert!(cfg.validate().is_err());

        cfg.uuid_tz = "America/Los_Angeles".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_config_requires_uuid_column_first() {
        let mut cfg = LoadConfig {
            dsn: "mysql://u:p@dst/logs".into(),
            tar_path: "export.tar.gz".into(),
            dst_table: "log".into(),
            dst_columns: vec!["id".into(), "ins_ts".into(), "msg".into()],
            uuid_from_idx: 2,
            ..LoadConfig::default()
        };
        assert!(cfg.validate().is_ok());

        cfg.dst_columns[0] = "nid".into();
        assert!(cfg.validate().is_err());
    }
}
