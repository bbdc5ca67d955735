//! SQL rendering for collection statements.
//!
//! Identifiers come from validated schema descriptors (`[a-z_][a-z0-9_]*`) and
//! are additionally quoted; values are always bound.

use crate::models::{
    CREATED_AT_FIELD, Comparison, DatabaseType, FieldType, Filter, ID_FIELD, QueryParam,
    SchemaDescriptor, UPDATED_AT_FIELD,
};

/// Quote an identifier for the given backend.
pub fn quote_ident(db_type: DatabaseType, name: &str) -> String {
    match db_type {
        DatabaseType::MySQL => format!("`{}`", name),
        DatabaseType::PostgreSQL | DatabaseType::SQLite => format!("\"{}\"", name),
    }
}

/// A rendered statement and the values to bind to it, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    db_type: DatabaseType,
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl Statement {
    fn new(db_type: DatabaseType) -> Self {
        Self {
            db_type,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    fn push_ident(&mut self, name: &str) -> &mut Self {
        let quoted = quote_ident(self.db_type, name);
        self.push(&quoted)
    }

    /// Append a bound value, or a literal NULL.
    fn push_value(&mut self, param: QueryParam) -> &mut Self {
        if param.is_null() {
            return self.push("NULL");
        }
        self.params.push(param);
        let placeholder = match self.db_type {
            DatabaseType::PostgreSQL => format!("${}", self.params.len()),
            DatabaseType::MySQL | DatabaseType::SQLite => "?".to_string(),
        };
        self.push(&placeholder)
    }

    fn push_columns(&mut self, schema: &SchemaDescriptor) -> &mut Self {
        let columns = column_names(schema);
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.push_ident(column);
        }
        self
    }

    fn push_table(&mut self, schema: &SchemaDescriptor) -> &mut Self {
        self.push_ident(&schema.collection)
    }
}

/// Selected columns, in the order rows are decoded.
pub fn column_names(schema: &SchemaDescriptor) -> Vec<&str> {
    [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD]
        .into_iter()
        .chain(schema.fields.iter().map(|f| f.name.as_str()))
        .collect()
}

pub fn select_many(db_type: DatabaseType, schema: &SchemaDescriptor, filter: &Filter) -> Statement {
    let mut stmt = Statement::new(db_type);
    stmt.push("SELECT ")
        .push_columns(schema)
        .push(" FROM ")
        .push_table(schema);

    for (i, condition) in filter.conditions().iter().enumerate() {
        stmt.push(if i == 0 { " WHERE " } else { " AND " })
            .push_ident(&condition.field);
        if condition.value.is_null() && condition.op == Comparison::Eq {
            stmt.push(" IS NULL");
        } else {
            stmt.push(" ")
                .push(condition.op.operator())
                .push(" ")
                .push_value(condition.value.clone());
        }
    }

    stmt.push(" ORDER BY ")
        .push_ident(CREATED_AT_FIELD)
        .push(" DESC, ")
        .push_ident(ID_FIELD)
        .push(&format!(" DESC LIMIT {}", filter.row_limit()));
    stmt
}

pub fn select_by_id(db_type: DatabaseType, schema: &SchemaDescriptor, id: &str) -> Statement {
    let mut stmt = Statement::new(db_type);
    stmt.push("SELECT ")
        .push_columns(schema)
        .push(" FROM ")
        .push_table(schema)
        .push(" WHERE ")
        .push_ident(ID_FIELD)
        .push(" = ")
        .push_value(QueryParam::String(id.to_string()));
    stmt
}

/// `values` must hold one entry per declared field, in declaration order.
pub fn insert(
    db_type: DatabaseType,
    schema: &SchemaDescriptor,
    id: &str,
    now: &str,
    values: Vec<QueryParam>,
) -> Statement {
    let mut stmt = Statement::new(db_type);
    stmt.push("INSERT INTO ")
        .push_table(schema)
        .push(" (")
        .push_columns(schema)
        .push(") VALUES (")
        .push_value(QueryParam::String(id.to_string()))
        .push(", ")
        .push_value(QueryParam::String(now.to_string()))
        .push(", ")
        .push_value(QueryParam::String(now.to_string()));
    for value in values {
        stmt.push(", ").push_value(value);
    }
    stmt.push(")");
    stmt
}

pub fn update_by_id(
    db_type: DatabaseType,
    schema: &SchemaDescriptor,
    id: &str,
    now: &str,
    changes: Vec<(&str, QueryParam)>,
) -> Statement {
    let mut stmt = Statement::new(db_type);
    stmt.push("UPDATE ").push_table(schema).push(" SET ");
    for (name, value) in changes {
        stmt.push_ident(name).push(" = ").push_value(value).push(", ");
    }
    stmt.push_ident(UPDATED_AT_FIELD)
        .push(" = ")
        .push_value(QueryParam::String(now.to_string()))
        .push(" WHERE ")
        .push_ident(ID_FIELD)
        .push(" = ")
        .push_value(QueryParam::String(id.to_string()));
    stmt
}

pub fn delete_by_id(db_type: DatabaseType, schema: &SchemaDescriptor, id: &str) -> Statement {
    let mut stmt = Statement::new(db_type);
    stmt.push("DELETE FROM ")
        .push_table(schema)
        .push(" WHERE ")
        .push_ident(ID_FIELD)
        .push(" = ")
        .push_value(QueryParam::String(id.to_string()));
    stmt
}

fn column_type(db_type: DatabaseType, kind: FieldType, indexed: bool) -> &'static str {
    match (db_type, kind) {
        // MySQL cannot index unbounded TEXT
        (DatabaseType::MySQL, FieldType::Text) if indexed => "VARCHAR(255)",
        (DatabaseType::MySQL, FieldType::Text) => "TEXT",
        (DatabaseType::MySQL, FieldType::Timestamp) => "VARCHAR(32)",
        (_, FieldType::Text | FieldType::Timestamp | FieldType::Json) => "TEXT",
        (DatabaseType::SQLite, FieldType::Integer) => "INTEGER",
        (_, FieldType::Integer) => "BIGINT",
        (DatabaseType::PostgreSQL, FieldType::Float) => "DOUBLE PRECISION",
        (DatabaseType::MySQL, FieldType::Float) => "DOUBLE",
        (DatabaseType::SQLite, FieldType::Float) => "REAL",
        (_, FieldType::Boolean) => "BOOLEAN",
    }
}

impl SchemaDescriptor {
    /// DDL for this collection's table and its `created_at` index.
    ///
    /// Used by provisioning tooling and tests; the gateway never runs it.
    pub fn create_table_sql(&self, db_type: DatabaseType) -> Vec<String> {
        let q = |name: &str| quote_ident(db_type, name);
        let timestamp = column_type(db_type, FieldType::Timestamp, true);

        let mut columns = vec![
            format!("{} VARCHAR(36) PRIMARY KEY", q(ID_FIELD)),
            format!("{} {} NOT NULL", q(CREATED_AT_FIELD), timestamp),
            format!("{} {} NOT NULL", q(UPDATED_AT_FIELD), timestamp),
        ];
        for field in &self.fields {
            let mut column = format!(
                "{} {}",
                q(&field.name),
                column_type(db_type, field.kind, field.unique || !field.choices.is_empty())
            );
            if field.required {
                column.push_str(" NOT NULL");
            }
            if field.unique {
                column.push_str(" UNIQUE");
            }
            columns.push(column);
        }

        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                q(&self.collection),
                columns.join(", ")
            ),
            format!(
                "CREATE INDEX {}{} ON {} ({})",
                if db_type == DatabaseType::MySQL {
                    ""
                } else {
                    "IF NOT EXISTS "
                },
                q(&format!("idx_{}_created_at", self.collection)),
                q(&self.collection),
                q(CREATED_AT_FIELD)
            ),
        ]
    }
}
