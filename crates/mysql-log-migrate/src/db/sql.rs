//! SQL text builders for the range SELECT and the bulk-load statement.
//!
//! Identifiers cannot be parameterised in prepared statements, so every
//! identifier spliced into these strings is backtick-quoted with embedded
//! backticks doubled.

use std::path::Path;

/// Quote a MySQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Escape a filesystem path for embedding in a single-quoted SQL literal.
fn escape_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
}

/// Build the per-shard source query:
///
/// ```sql
/// SELECT <cols> FROM <table>
///  WHERE <pk> > ? AND <pk> <= ? [AND (<filter>)]
///  ORDER BY <pk> [LIMIT ?]
/// ```
///
/// Bound with `(from - 1, to)` so adjacent shards share no boundary rows.
/// A `max_statement_time` hint is prepended when `max_exec_ms > 0`, and a
/// `LIMIT ?` is appended when `with_limit` is set (export keyset paging).
pub fn build_range_select(
    table: &str,
    columns: &[String],
    pk_col: &str,
    filter: Option<&str>,
    max_exec_ms: u64,
    with_limit: bool,
) -> String {
    let select_columns = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(",")
    };

    let pk = quote_ident(pk_col);

    let mut where_clause = format!("{} > ? AND {} <= ?", pk, pk);
    if let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) {
        where_clause.push_str(&format!(" AND ({})", filter));
    }

    let hint = if max_exec_ms > 0 {
        format!(
            "SET STATEMENT max_statement_time={:.3} FOR ",
            max_exec_ms as f64 / 1000.0
        )
    } else {
        String::new()
    };

    let limit = if with_limit { " LIMIT ?" } else { "" };

    format!(
        "{}SELECT {} FROM {} WHERE {} ORDER BY {}{}",
        hint,
        select_columns,
        quote_ident(table),
        where_clause,
        pk,
        limit,
    )
}

/// Build the bulk-load statement for one staged chunk.
///
/// The chunk's first field is the hex identifier, decoded server-side with
/// `UNHEX`. The column whose name case-insensitively equals `ts_column` is
/// parsed with `STR_TO_DATE`; every other column maps empty fields to NULL.
/// Returns the empty string when the column list is empty.
pub fn build_load_data(
    chunk_path: &Path,
    table: &str,
    uuid_col: &str,
    ts_column: &str,
    columns: &[String],
    use_local: bool,
) -> String {
    if columns.is_empty() {
        return String::new();
    }

    let mut vars = Vec::with_capacity(columns.len());
    vars.push("@id_hex".to_string());
    for col in &columns[1..] {
        vars.push(format!("@{}", col));
    }

    let mut set_clauses = vec![format!("{}=UNHEX(@id_hex)", quote_ident(uuid_col))];
    for col in &columns[1..] {
        if col.eq_ignore_ascii_case(ts_column) {
            set_clauses.push(format!(
                "{}=STR_TO_DATE(@{},'%Y-%m-%d %H:%i:%s')",
                quote_ident(col),
                col
            ));
        } else {
            set_clauses.push(format!("{}=NULLIF(@{},'')", quote_ident(col), col));
        }
    }

    let load_cmd = if use_local {
        "LOAD DATA LOCAL INFILE"
    } else {
        "LOAD DATA INFILE"
    };

    format!(
        "{} '{}' INTO TABLE {}\n\
         FIELDS TERMINATED BY ',' ENCLOSED BY '\"' ESCAPED BY '\\\\'\n\
         LINES TERMINATED BY '\\n'\n\
         IGNORE 0 LINES\n\
         ({})\n\
         SET {}",
        load_cmd,
        escape_path(chunk_path),
        quote_ident(table),
        vars.join(","),
        set_clauses.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("name"), "`name`");
        assert_eq!(quote_ident("ta`ble"), "`ta``ble`");
    }

    #[test]
    fn test_range_select_shape() {
        let cols = vec!["id".to_string(), "ins_ts".to_string(), "msg".to_string()];
        let sql = build_range_select("log", &cols, "id", None, 0, false);
        assert_eq!(
            sql,
            "SELECT `id`,`ins_ts`,`msg` FROM `log` WHERE `id` > ? AND `id` <= ? ORDER BY `id`"
        );
    }

    #[test]
    fn test_range_select_with_filter_and_hint() {
        let sql = build_range_select("log", &[], "id", Some("kind = 'audit'"), 1500, true);
        assert!(sql.starts_with("SET STATEMENT max_statement_time=1.500 FOR "));
        assert!(sql.contains("SELECT * FROM `log`"));
        assert!(sql.contains("AND (kind = 'audit')"));
        assert!(sql.ends_with("ORDER BY `id` LIMIT ?"));
    }

    #[test]
    fn test_range_select_ignores_blank_filter() {
        let sql = build_range_select("log", &[], "id", Some("   "), 0, false);
        assert!(!sql.contains("AND ("));
    }

    #[test]
    fn test_load_data_statement() {
        let cols: Vec<String> = ["id", "nid", "ins_ts", "msg"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let sql = build_load_data(
            &PathBuf::from("/var/lib/mysql-files/stage_log_1-10_42.csv"),
            "log",
            "id",
            "ins_ts",
            &cols,
            false,
        );

        assert!(sql.starts_with(
            "LOAD DATA INFILE '/var/lib/mysql-files/stage_log_1-10_42.csv' INTO TABLE `log`"
        ));
        assert!(sql.contains("FIELDS TERMINATED BY ',' ENCLOSED BY '\"' ESCAPED BY '\\\\'"));
        assert!(sql.contains("LINES TERMINATED BY '\\n'"));
        assert!(sql.contains("IGNORE 0 LINES"));
        assert!(sql.contains("(@id_hex,@nid,@ins_ts,@msg)"));
        assert!(sql.contains("SET `id`=UNHEX(@id_hex)"));
        assert!(sql.contains("`ins_ts`=STR_TO_DATE(@ins_ts,'%Y-%m-%d %H:%i:%s')"));
        assert!(sql.contains("`nid`=NULLIF(@nid,'')"));
        assert!(sql.contains("`msg`=NULLIF(@msg,'')"));
    }

    #[test]
    fn test_load_data_local_switch() {
        let cols = vec!["id".to_string(), "msg".to_string()];
        let sql = build_load_data(&PathBuf::from("/tmp/c.csv"), "log", "id", "ins_ts", &cols, true);
        assert!(sql.starts_with("LOAD DATA LOCAL INFILE"));
    }

    #[test]
    fn test_load_data_ts_column_match_is_case_insensitive() {
        let cols = vec!["id".to_string(), "INS_TS".to_string()];
        let sql = build_load_data(&PathBuf::from("/tmp/c.csv"), "log", "id", "ins_ts", &cols, false);
        assert!(sql.contains("`INS_TS`=STR_TO_DATE(@INS_TS,"));
    }

    #[test]
    fn test_load_data_escapes_path() {
        let cols = vec!["id".to_string()];
        let sql = build_load_data(
            &PathBuf::from(r"C:\stage\o'brien.csv"),
            "log",
            "id",
            "ins_ts",
            &cols,
            false,
        );
        assert!(sql.contains(r"C:\\stage\\o\'brien.csv"));
    }

    #[test]
    fn test_load_data_empty_columns() {
        assert_eq!(
            build_load_data(&PathBuf::from("/tmp/c.csv"), "log", "id", "ins_ts", &[], false),
            ""
        );
    }
}
