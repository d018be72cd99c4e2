//! In-memory mirror of model metadata: types, parameters, output tables,
//! entities. Read-only after load; lookups by numeric id use binary search
//! since every ordered sequence is kept sorted by id (an invariant the
//! loader that builds a [`Model`] must uphold).

/// Maximum built-in type id; anything above this is an enum-based,
/// model-specific type. Mirrors `maxBuiltInTypeId` in the original.
const MAX_BUILTIN_TYPE_ID: i64 = 99;

/// One labeled value of an enum-based [`TypeDef`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub enum_id: i64,
    pub code: String,
    pub label: String,
}

/// A model type: either a built-in scalar or an enum-based type.
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub type_id: i64,
    pub name: String,
    /// Ordered by `enum_id`; empty for built-in types.
    pub enums: Vec<EnumDef>,
    /// The enum id standing for "all" / total, if this type `IsTotal`.
    pub total_enum_id: Option<i64>,
}

impl TypeDef {
    /// True if this is one of the fixed built-in types (not model-specific enum).
    pub fn is_built_in(&self) -> bool {
        self.type_id <= MAX_BUILTIN_TYPE_ID
    }

    pub fn is_bool(&self) -> bool {
        self.name.eq_ignore_ascii_case("bool")
    }

    pub fn is_string(&self) -> bool {
        self.name.eq_ignore_ascii_case("file")
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self.name.to_ascii_lowercase().as_str(),
            "float" | "double" | "ldouble" | "time" | "real"
        )
    }

    /// Integer if not bool, string, or float — includes all remaining
    /// built-ins and every model-specific enum type.
    pub fn is_int(&self) -> bool {
        !self.is_bool() && !self.is_string() && !self.is_float()
    }

    /// Find an enum by its id, ordered binary search over `enums`.
    pub fn enum_by_id(&self, enum_id: i64) -> Option<(usize, bool)> {
        Some(bisect_by_key(&self.enums, enum_id, |e| e.enum_id))
    }

    /// Find an enum by its code, linear scan (codes aren't guaranteed sorted).
    pub fn enum_by_code(&self, code: &str) -> Option<usize> {
        self.enums.iter().position(|e| e.code == code)
    }
}

/// One dimension of a parameter or output table.
#[derive(Debug, Clone)]
pub struct Dim {
    pub dim_id: i64,
    pub name: String,
    pub type_id: i64,
    pub is_total: bool,
    /// Physical column name, e.g. `dim0`.
    pub col_name: String,
}

/// A native or derived output table accumulator.
#[derive(Debug, Clone)]
pub struct Acc {
    pub acc_id: i64,
    pub name: String,
    pub is_derived: bool,
    pub src_acc: String,
    pub col_name: String,
}

impl Acc {
    /// Only native accumulators may be aggregated directly.
    pub fn is_aggregatable(&self) -> bool {
        !self.is_derived
    }
}

/// A named output table expression (pre-aggregated result column).
#[derive(Debug, Clone)]
pub struct Expr {
    pub expr_id: i64,
    pub name: String,
    pub src_expr: String,
}

/// A model parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub param_id: i64,
    pub param_hid: i64,
    pub name: String,
    pub dims: Vec<Dim>,
    pub db_run_table: String,
}

impl Parameter {
    pub fn dim_by_name(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }
}

/// A model output table.
#[derive(Debug, Clone)]
pub struct OutputTable {
    pub table_id: i64,
    pub table_hid: i64,
    pub name: String,
    pub dims: Vec<Dim>,
    pub accs: Vec<Acc>,
    pub exprs: Vec<Expr>,
    pub db_expr_table: String,
    pub db_acc_table: String,
}

impl OutputTable {
    pub fn dim_by_name(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }

    pub fn acc_by_name(&self, name: &str) -> Option<usize> {
        self.accs.iter().position(|a| a.name == name)
    }

    pub fn expr_by_name(&self, name: &str) -> Option<usize> {
        self.exprs.iter().position(|e| e.name == name)
    }

    /// Index of the first native (aggregatable) accumulator, used by the
    /// compiler as the default outer predicate for the outermost level.
    pub fn first_native_acc(&self) -> Option<usize> {
        self.accs.iter().position(|a| !a.is_derived)
    }
}

/// A model entity attribute.
#[derive(Debug, Clone)]
pub struct Attr {
    pub attr_id: i64,
    pub name: String,
    pub type_id: i64,
}

/// A versioned schema for a microdata table.
#[derive(Debug, Clone)]
pub struct EntityGeneration {
    pub gen_hid: i64,
    pub gen_digest: String,
    pub attrs: Vec<Attr>,
    pub db_entity_table: String,
}

impl EntityGeneration {
    pub fn attr_by_name(&self, name: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a.name == name)
    }
}

/// A model entity (the owner of a sequence of generations across runs).
#[derive(Debug, Clone)]
pub struct Entity {
    pub entity_id: i64,
    pub entity_hid: i64,
    pub name: String,
    pub attrs: Vec<Attr>,
    pub generations: Vec<EntityGeneration>,
}

impl Entity {
    pub fn attr_by_name(&self, name: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a.name == name)
    }

    pub fn generation_by_hid(&self, hid: i64) -> Option<usize> {
        self.generations.iter().position(|g| g.gen_hid == hid)
    }

    pub fn generation_by_digest(&self, digest: &str) -> Option<usize> {
        self.generations.iter().position(|g| g.gen_digest == digest)
    }
}

/// The run status, as stored in `run_lst.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Init,
    Progress,
    Wait,
    Success,
    Exit,
    Error,
    Deleted,
}

impl RunStatus {
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "i" => RunStatus::Init,
            "p" => RunStatus::Progress,
            "w" => RunStatus::Wait,
            "s" => RunStatus::Success,
            "x" => RunStatus::Exit,
            "e" => RunStatus::Error,
            "d" => RunStatus::Deleted,
            _ => return None,
        })
    }

    pub fn code(self) -> &'static str {
        match self {
            RunStatus::Init => "i",
            RunStatus::Progress => "p",
            RunStatus::Wait => "w",
            RunStatus::Success => "s",
            RunStatus::Exit => "x",
            RunStatus::Error => "e",
            RunStatus::Deleted => "d",
        }
    }

    /// Only `s|x|e` may be read from.
    pub fn is_readable(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Exit | RunStatus::Error)
    }

    /// Only `s` may feed microdata reads.
    pub fn is_microdata_readable(self) -> bool {
        matches!(self, RunStatus::Success)
    }
}

/// A model run.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: i64,
    pub run_digest: String,
    pub run_stamp: String,
    pub name: String,
    pub status: RunStatus,
}

/// One entry of the model's language list (`LangMeta` in the original).
#[derive(Debug, Clone)]
pub struct Lang {
    pub lang_id: i64,
    pub code: String,
}

/// A full model: ordered Type/Param/Table/Entity sequences plus identity.
#[derive(Debug, Clone)]
pub struct Model {
    pub model_id: i64,
    pub digest: String,
    pub name: String,
    pub types: Vec<TypeDef>,
    pub params: Vec<Parameter>,
    pub tables: Vec<OutputTable>,
    pub entities: Vec<Entity>,
    /// Ordered by `lang_id`; enum labels are only held for the default
    /// (first) language, so this list exists purely to resolve codes.
    pub langs: Vec<Lang>,
}

/// Binary-search a slice ordered by an id key; returns `(index, found)`
/// exactly like the original's `sort.Search`-based lookups: `index` is
/// either the position of the match or the insertion point.
fn bisect_by_key<T>(items: &[T], key: i64, f: impl Fn(&T) -> i64) -> (usize, bool) {
    let idx = items.partition_point(|item| f(item) < key);
    let found = idx < items.len() && f(&items[idx]) == key;
    (idx, found)
}

impl Model {
    pub fn type_by_id(&self, type_id: i64) -> (usize, bool) {
        bisect_by_key(&self.types, type_id, |t| t.type_id)
    }

    pub fn type_by_name(&self, name: &str) -> Option<usize> {
        self.types.iter().position(|t| t.name == name)
    }

    pub fn param_by_id(&self, param_id: i64) -> (usize, bool) {
        bisect_by_key(&self.params, param_id, |p| p.param_id)
    }

    pub fn param_by_name(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    pub fn param_by_hid(&self, hid: i64) -> Option<usize> {
        self.params.iter().position(|p| p.param_hid == hid)
    }

    pub fn table_by_id(&self, table_id: i64) -> (usize, bool) {
        bisect_by_key(&self.tables, table_id, |t| t.table_id)
    }

    pub fn table_by_name(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.name == name)
    }

    pub fn table_by_hid(&self, hid: i64) -> Option<usize> {
        self.tables.iter().position(|t| t.table_hid == hid)
    }

    pub fn entity_by_id(&self, entity_id: i64) -> (usize, bool) {
        bisect_by_key(&self.entities, entity_id, |e| e.entity_id)
    }

    pub fn entity_by_name(&self, name: &str) -> Option<usize> {
        self.entities.iter().position(|e| e.name == name)
    }

    pub fn entity_by_hid(&self, hid: i64) -> Option<usize> {
        self.entities.iter().position(|e| e.entity_hid == hid)
    }

    /// Deep clone of model metadata, structurally independent so callers may
    /// mutate copies freely. Ordinary `Clone` already gives value semantics
    /// in Rust, so unlike the original's JSON-round-trip workaround this is
    /// just a derive; kept as a named method so call sites read the same way.
    pub fn clone_model(&self) -> Model {
        self.clone()
    }

    /// Language code for `lang_id`. Falls back to the first language in
    /// `langs` on a miss, matching `CodeById`'s behavior in the original —
    /// kept as found rather than changed to return `None`, per the open
    /// question recorded in DESIGN.md: whether silently substituting a
    /// different language's code is desirable is unresolved, but the
    /// original's callers depend on always getting *a* code back.
    pub fn lang_code_by_id(&self, lang_id: i64) -> Option<&str> {
        if let Some(l) = self.langs.iter().find(|l| l.lang_id == lang_id) {
            return Some(&l.code);
        }
        self.langs.first().map(|l| l.code.as_str())
    }
}
