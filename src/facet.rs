use crate::error::{Error, Result};

/// The three dialect facets the engine targets: a lightweight embedded
/// database, a mid-tier server database, and an enterprise database.
/// Each facet only ever needs to answer "what column type / how do I quote
/// this" — it never builds or executes SQL itself.
pub trait DialectFacet: Send + Sync {
    /// Storage column type for a 64-bit integer id or counter.
    fn bigint_type(&self) -> &'static str;

    /// Storage column type for a double-precision float.
    fn float_type(&self) -> &'static str;

    /// Quote an identifier (table or column name) for inclusion in SQL text.
    fn quote_ident(&self, name: &str) -> String;

    /// Quote a string literal for inclusion in SQL text, escaping embedded quotes.
    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// A bounded variable-length text column type able to hold `max_len` characters.
    fn varchar_type(&self, max_len: u32) -> String {
        format!("VARCHAR({max_len})")
    }
}

/// SQLite-like lightweight facet.
pub struct LiteFacet;

impl DialectFacet for LiteFacet {
    fn bigint_type(&self) -> &'static str {
        "BIGINT"
    }
    fn float_type(&self) -> &'static str {
        "FLOAT"
    }
    fn quote_ident(&self, name: &str) -> String {
        format!("\"{name}\"")
    }
}

/// MySQL-like mid-tier facet.
pub struct MidFacet;

impl DialectFacet for MidFacet {
    fn bigint_type(&self) -> &'static str {
        "BIGINT"
    }
    fn float_type(&self) -> &'static str {
        "DOUBLE"
    }
    fn quote_ident(&self, name: &str) -> String {
        format!("`{name}`")
    }
}

/// Postgres/Oracle-like enterprise facet.
pub struct EnterpriseFacet;

impl DialectFacet for EnterpriseFacet {
    fn bigint_type(&self) -> &'static str {
        "BIGINT"
    }
    fn float_type(&self) -> &'static str {
        "DOUBLE PRECISION"
    }
    fn quote_ident(&self, name: &str) -> String {
        format!("\"{name}\"")
    }
}

/// Resolve a facet from a `db_driver` configuration string.
pub fn facet_for_driver(driver: &str) -> Result<Box<dyn DialectFacet>> {
    match driver {
        "sqlite" => Ok(Box::new(LiteFacet)),
        "mysql" => Ok(Box::new(MidFacet)),
        "postgres" => Ok(Box::new(EnterpriseFacet)),
        other => Err(Error::SchemaMismatch(format!(
            "unrecognized database driver: {other}"
        ))),
    }
}

/// Classifies a built-in model type name to a storage column type, per §4.1
/// (ordered as in the omc grammar for clarity): ambiguous/signed small
/// integrals and bool -> SMALLINT; `int`/`integer`/`counter`/`ushort` -> INT;
/// `long`/`llong`/unsigned-wide family -> facet bigint; float family -> facet
/// float; `file` -> bounded variable-length text. Unknown -> error.
pub fn column_type_for_builtin(facet: &dyn DialectFacet, type_name: &str) -> Result<String> {
    let lower = type_name.to_ascii_lowercase();
    let ty = match lower.as_str() {
        "char" | "schar" | "short" | "bool" | "uchar" => "SMALLINT".to_string(),
        "int" | "ushort" | "integer" | "counter" => "INT".to_string(),
        "long" | "llong" | "uint" | "ulong" | "ullong" => facet.bigint_type().to_string(),
        "float" | "double" | "ldouble" | "time" | "real" => facet.float_type().to_string(),
        "file" => facet.varchar_type(4096),
        other => return Err(Error::invalid(format!("unknown built-in type: {other}"))),
    };
    Ok(ty)
}
