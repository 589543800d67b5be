//! Schema generation
//!
//! Tables are generated from entity definitions: key attributes become the
//! composite primary key, parent edges become foreign keys. Primary edges
//! cascade deletes downstream; secondary edges restrict them. Every table
//! carries a `created_at` column filled by SQLite.

use crate::registry::{EdgeKind, EntityDef, Registry};

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

pub(crate) fn create_table_sql(registry: &Registry, def: &EntityDef, prefix: &str) -> String {
    let mut lines: Vec<String> = Vec::new();

    for attr in def.key() {
        lines.push(format!(
            "    {} {} NOT NULL",
            quote_ident(&attr.name),
            attr.ty.sql_type()
        ));
    }
    for attr in def.attributes() {
        let constraint = if attr.nullable { "" } else { " NOT NULL" };
        lines.push(format!(
            "    {} {}{}",
            quote_ident(&attr.name),
            attr.ty.sql_type(),
            constraint
        ));
    }
    lines.push("    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP".to_string());

    let key_cols = def
        .key()
        .iter()
        .map(|a| quote_ident(&a.name))
        .collect::<Vec<_>>()
        .join(", ");
    lines.push(format!("    PRIMARY KEY ({})", key_cols));

    for edge in def.parents() {
        // Parent validated during registry build
        if let Some(parent) = registry.entity(&edge.parent) {
            let cols = parent
                .key()
                .iter()
                .map(|a| quote_ident(&a.name))
                .collect::<Vec<_>>()
                .join(", ");
            let action = match edge.kind {
                EdgeKind::Primary => " ON DELETE CASCADE",
                EdgeKind::Secondary => "",
            };
            lines.push(format!(
                "    FOREIGN KEY ({cols}) REFERENCES {parent} ({cols}){action}",
                cols = cols,
                parent = quote_ident(&format!("{}{}", prefix, parent.name())),
                action = action
            ));
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        quote_ident(&format!("{}{}", prefix, def.name())),
        lines.join(",\n")
    )
}

/// Job reservation table shared by all auto-populated entities
pub(crate) fn create_jobs_table_sql(prefix: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            entity TEXT NOT NULL,
            key_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'reserved',
            key TEXT NOT NULL,
            error_message TEXT,
            host TEXT NOT NULL DEFAULT '',
            pid INTEGER NOT NULL DEFAULT 0,
            reserved_at TIMESTAMP NOT NULL,
            PRIMARY KEY (entity, key_hash)
        )
        "#,
        quote_ident(&format!("{}jobs", prefix))
    )
}

/// Per-scope id allocation, so sequence values survive row deletion
pub(crate) fn create_sequences_table_sql(prefix: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            entity TEXT NOT NULL,
            scope_hash TEXT NOT NULL,
            last_value INTEGER NOT NULL,
            PRIMARY KEY (entity, scope_hash)
        )
        "#,
        quote_ident(&format!("{}sequences", prefix))
    )
}
