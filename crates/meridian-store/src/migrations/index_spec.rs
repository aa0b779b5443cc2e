//! Parser for the compact index specification strings of the schema registry.
//!
//! ```text
//! "&id, sessionId, meta.title, &uuid, [sessionId+topicId]"
//! ```
//!
//! The first entry names the primary key (`id`, optionally written `&id` or
//! `++id`). Every further entry becomes a SQLite expression index over the
//! JSON record body: `&` marks it unique, `*` (multi-entry) is accepted and
//! indexed as a plain value, `[a+b]` is a compound index.

use crate::error::{Result, StoreError};

/// Parsed specification of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub table: String,
    pub indexes: Vec<IndexDef>,
}

/// A single secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub paths: Vec<String>,
    pub unique: bool,
}

impl IndexDef {
    /// Name of the SQLite index that realises this definition on `table`.
    /// Dots and compound separators both become `_`, so [`parse`] rejects
    /// specs whose entries would share a name.
    pub fn sql_name(&self, table: &str) -> String {
        let cols: Vec<String> = self.paths.iter().map(|p| p.replace('.', "_")).collect();
        let suffix = if self.unique { "_unique" } else { "" };
        format!("idx_{}_{}{}", table, cols.join("_"), suffix)
    }

    /// `CREATE INDEX` statement for this definition on `table`.
    pub fn create_sql(&self, table: &str) -> String {
        let exprs: Vec<String> = self.paths.iter().map(|p| json_path_expr(p)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.sql_name(table),
            table,
            exprs.join(", ")
        )
    }
}

/// `json_extract` expression addressing a (possibly dotted) field of the
/// record body. Callers must validate `path` with [`is_valid_path`].
pub fn json_path_expr(path: &str) -> String {
    format!("json_extract(data, '$.{path}')")
}

/// Field paths and table names are interpolated into SQL, so only a
/// conservative character set is accepted.
pub fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('.')
        && !path.ends_with('.')
        && !path.contains("..")
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

pub fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse one table's index specification.
pub fn parse(table: &str, spec: &str) -> Result<TableSpec> {
    let invalid = |reason: String| StoreError::IndexSpec {
        spec: format!("{table}: {spec}"),
        reason,
    };

    if !is_valid_table_name(table) {
        return Err(invalid(format!("invalid table name `{table}`")));
    }

    let mut entries = spec.split(',').map(str::trim).filter(|e| !e.is_empty());

    let primary = entries
        .next()
        .ok_or_else(|| invalid("missing primary key".to_string()))?;
    let primary = primary.trim_start_matches("++").trim_start_matches('&');
    if primary != "id" {
        return Err(invalid(format!("primary key must be `id`, found `{primary}`")));
    }

    let mut indexes = Vec::new();
    for entry in entries {
        let (unique, body) = match entry.strip_prefix('&') {
            Some(rest) => (true, rest),
            None => (false, entry.strip_prefix('*').unwrap_or(entry)),
        };

        if body.starts_with("++") {
            return Err(invalid(format!("auto-increment is only allowed on the primary key: `{entry}`")));
        }

        let paths: Vec<String> = match body.strip_prefix('[').and_then(|b| b.strip_suffix(']')) {
            Some(compound) => compound.split('+').map(|p| p.trim().to_string()).collect(),
            None => vec![body.to_string()],
        };

        if let Some(bad) = paths.iter().find(|p| !is_valid_path(p)) {
            return Err(invalid(format!("invalid field path `{bad}`")));
        }

        let index = IndexDef { paths, unique };
        let name = index.sql_name(table);
        if indexes.iter().any(|other: &IndexDef| other.sql_name(table) == name) {
            return Err(invalid(format!("`{entry}` maps to the already used index name `{name}`")));
        }
        indexes.push(index);
    }

    Ok(TableSpec {
        table: table.to_string(),
        indexes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_unique_nested_and_compound_indexes() {
        let spec = parse("messages", "&id, role, &uuid, meta.title, *tags, [sessionId+topicId]").unwrap();
        assert_eq!(spec.indexes.len(), 5);
        assert_eq!(spec.indexes[1], IndexDef { paths: vec!["uuid".into()], unique: true });
        assert_eq!(spec.indexes[3].paths, vec!["tags".to_string()]);
        assert_eq!(
            spec.indexes[4].paths,
            vec!["sessionId".to_string(), "topicId".to_string()]
        );
        assert_eq!(
            spec.indexes[4].sql_name("messages"),
            "idx_messages_sessionId_topicId"
        );
        assert!(spec.indexes[2]
            .create_sql("messages")
            .contains("json_extract(data, '$.meta.title')"));
    }

    #[test]
    fn auto_increment_primary_key_is_accepted() {
        let spec = parse("users", "++id").unwrap();
        assert!(spec.indexes.is_empty());
    }

    #[test]
    fn rejects_foreign_primary_keys_and_unsafe_paths() {
        assert!(parse("plugins", "&identifier, type").is_err());
        assert!(parse("sessions", "&id, meta.title'); DROP TABLE x; --").is_err());
        assert!(parse("bad name", "&id").is_err());
        assert!(parse("users", "&id, ++seq").is_err());
        assert!(parse("users", "").is_err());
    }

    #[test]
    fn entries_mapping_to_the_same_index_name_are_rejected() {
        assert!(parse("sessions", "&id, meta.title, meta_title").is_err());
        assert!(parse("sessions", "&id, [a+b_c], [a_b+c]").is_err());
        assert!(parse("sessions", "&id, title_unique, &title").is_err());

        let spec = parse("sessions", "&id, meta.title, &meta.title").unwrap();
        assert_ne!(
            spec.indexes[0].sql_name("sessions"),
            spec.indexes[1].sql_name("sessions")
        );
    }
}
