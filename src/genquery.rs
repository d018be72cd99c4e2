//! Turns a [`crate::compile::Compiled`] level arena into `(cteSql, mainSql)`
//! SQL text, per §4.2. Grounded directly on the nested-join shape worked
//! through by hand against `translateToAccSql.go`'s example query.

use crate::catalog::{EntityGeneration, Model, OutputTable};
use crate::compile::{Compiled, LevelDef};
use crate::error::{Error, Result};
use crate::facet::DialectFacet;

/// A single `WHERE`/`AND` comparison the Orchestrator has already resolved
/// to storage-level values (dimension codes translated to enum ids, etc).
#[derive(Debug, Clone)]
pub struct Filter {
    pub name: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

impl FilterOp {
    fn sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "<>",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::In => "IN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// Everything [`build`] needs beyond the compiled level arena.
pub struct QueryParams<'a> {
    pub table: &'a OutputTable,
    pub model: &'a Model,
    pub run_ids: &'a [i64],
    pub calc_id: i64,
    pub filters: &'a [Filter],
    pub order_by: &'a [OrderBy],
    pub facet: &'a dyn DialectFacet,
}

/// Compile the level arena into `(cteSql, mainSql)`. `cteSql` holds the
/// `WITH asrc AS (...), par_<hid> AS (...), ...` preamble; `mainSql` is the
/// final `SELECT` text that references it.
pub fn build(compiled: &Compiled, p: &QueryParams<'_>) -> Result<(String, String)> {
    if compiled.levels.is_empty() {
        return Err(Error::invalid("compiled expression has no levels"));
    }

    let dims: Vec<&str> = p.table.dims.iter().map(|d| d.col_name.as_str()).collect();

    let asrc = build_asrc_cte(p.table, &dims, p.run_ids);

    let mut param_ctes = Vec::new();
    for level in &compiled.levels {
        for pj in &level.param_joins {
            let param_name = pj.alias.trim_start_matches("P_");
            let param_idx = p.model.param_by_name(param_name).ok_or_else(|| {
                Error::not_found(format!("parameter referenced in calculation not found: {param_name}"))
            })?;
            let param = &p.model.params[param_idx];
            param_ctes.push(format!(
                "par_{hid}(run_id, param_value) AS (SELECT run_id, param_value FROM {tbl} WHERE sub_id = 0)",
                hid = param.param_hid,
                tbl = param.db_run_table,
            ));
        }
    }

    let mut cte_sql = format!("WITH asrc AS (\n{asrc}\n)");
    for pc in &param_ctes {
        cte_sql.push_str(",\n");
        cte_sql.push_str(pc);
    }

    // Build from the deepest level inward: each block's FROM joins the next
    // deeper level's block as a named subquery `T<level+1>`.
    let mut child_block: Option<String> = None;
    let mut child_level: Option<usize> = None;
    for level_def in compiled.levels.iter().rev() {
        let block = build_level_block(level_def, child_block.as_deref(), child_level, p.table, &dims, p.calc_id);
        child_level = Some(level_def.level);
        child_block = Some(block);
    }
    let mut main_sql = child_block.expect("at least one level");

    if !p.filters.is_empty() {
        main_sql = apply_filters(&main_sql, p.filters, p.facet)?;
    }

    main_sql.push_str(&build_order_by(p.order_by, &dims));

    Ok((cte_sql, main_sql))
}

/// Parameters for compiling a microdata aggregation (§4.2 "Microdata
/// aggregation"). `base_run_id`/`variant_run_ids` are physical storage run
/// ids, already resolved from the logical runs' `run_entity.base_run_id`
/// indirection by the caller (same resolution `ReadMicrodataTo` performs
/// before building its `WHERE run_id = ...` clause).
pub struct MicrodataParams<'a> {
    pub generation: &'a EntityGeneration,
    pub dims: &'a [String],
    pub base_run_id: i64,
    pub variant_run_ids: &'a [i64],
    pub calc_id: i64,
    pub filters: &'a [Filter],
    pub order_by: &'a [OrderBy],
    pub facet: &'a dyn DialectFacet,
}

/// Compile a microdata-calculation level arena into SQL. Unlike
/// [`build`], there is no `asrc` CTE: the entity generation's table already
/// carries one row per `(run_id, entity_key)`, so levels join straight back
/// onto it under distinct aliases per run-tag.
pub fn build_microdata(compiled: &Compiled, p: &MicrodataParams<'_>) -> Result<(String, String)> {
    if compiled.levels.is_empty() {
        return Err(Error::invalid("compiled expression has no levels"));
    }
    let table = p.generation.db_entity_table.as_str();
    let dims: Vec<&str> = p.dims.iter().map(|d| d.as_str()).collect();

    let mut child_block: Option<String> = None;
    let mut child_level: Option<usize> = None;
    for level_def in compiled.levels.iter().rev() {
        let block = build_microdata_level_block(
            level_def,
            child_block.as_deref(),
            child_level,
            table,
            &dims,
            p.base_run_id,
            p.variant_run_ids,
            p.calc_id,
        )?;
        child_level = Some(level_def.level);
        child_block = Some(block);
    }
    let mut main_sql = child_block.expect("at least one level");

    if !p.filters.is_empty() {
        main_sql = apply_filters(&main_sql, p.filters, p.facet)?;
    }
    main_sql.push_str(&build_microdata_order_by(p.order_by, &dims));

    Ok((String::new(), main_sql))
}

/// Default order-by for a microdata calculation result, which (unlike an
/// accumulator calculation) carries no `run_id` column — a single request
/// always names its base/variant runs explicitly.
fn build_microdata_order_by(order_by: &[OrderBy], dims: &[&str]) -> String {
    if order_by.is_empty() {
        let mut cols = vec!["calc_id".to_string()];
        cols.extend(dims.iter().map(|d| d.to_string()));
        format!("\nORDER BY {}", cols.join(", "))
    } else {
        let cols = order_by
            .iter()
            .map(|o| format!("{} {}", o.column, if o.descending { "DESC" } else { "ASC" }))
            .collect::<Vec<_>>()
            .join(", ");
        format!("\nORDER BY {cols}")
    }
}

/// Run id the join alias for run-tag `tag` (0 = untagged/current, 1 = base,
/// 2 = variant — see `compile::tag_key`) should filter on.
fn run_id_for_tag(tag: usize, base_run_id: i64, variant_run_ids: &[i64]) -> Result<i64> {
    match tag {
        0 | 1 => Ok(base_run_id),
        2 => variant_run_ids
            .first()
            .copied()
            .ok_or_else(|| Error::invalid("run comparison requires at least one variant run")),
        _ => Err(Error::invalid("unrecognized run-tag key")),
    }
}

fn build_microdata_level_block(
    level_def: &LevelDef,
    child_block: Option<&str>,
    child_level: Option<usize>,
    table: &str,
    dims: &[&str],
    base_run_id: i64,
    variant_run_ids: &[i64],
    calc_id: i64,
) -> Result<String> {
    let from_alias = &level_def.from_alias;
    let from_tag = level_def.first_agc_idx.map(|k| k % 4).unwrap_or(0);
    let from_run = run_id_for_tag(from_tag, base_run_id, variant_run_ids)?;

    let dim_select = dims
        .iter()
        .map(|d| format!("{from_alias}.{d}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut select_items = Vec::new();
    if level_def.level == 1 {
        select_items.push(format!("{calc_id} AS calc_id"));
    }
    select_items.push(dim_select);
    for e in &level_def.expr_arr {
        let out_name = if level_def.level == 1 { "calc_value" } else { e.col_name.as_str() };
        select_items.push(format!("{} AS {}", e.sql, out_name));
    }

    let mut joins = String::new();
    for (key, alias) in &level_def.join_aliases {
        let tag = key % 4;
        let join_run = run_id_for_tag(tag, base_run_id, variant_run_ids)?;
        joins.push_str(&format!(
            "\nINNER JOIN {table} {alias} ON ({alias}.entity_key = {from_alias}.entity_key AND {alias}.run_id = {join_run})",
        ));
    }
    if let (Some(block), Some(lvl)) = (child_block, child_level) {
        let dims_eq: String = dims.iter().map(|d| format!(" AND T{lvl}.{d} = {from_alias}.{d}")).collect();
        joins.push_str(&format!(
            "\nINNER JOIN (\n{block}\n) T{lvl} ON (T{lvl}.entity_key = {from_alias}.entity_key{dims_eq})",
        ));
    }

    let dims_group: String = dims.iter().map(|d| format!("{from_alias}.{d}")).collect::<Vec<_>>().join(", ");
    let group_by = if dims_group.is_empty() {
        String::new()
    } else {
        format!("\nGROUP BY {dims_group}")
    };

    Ok(format!(
        "SELECT {cols}\nFROM {table} {from_alias}{joins}\nWHERE {from_alias}.run_id = {from_run}{group_by}",
        cols = select_items.join(", "),
    ))
}

fn build_asrc_cte(table: &OutputTable, dims: &[&str], run_ids: &[i64]) -> String {
    let dim_cols = dims
        .iter()
        .map(|d| format!("A.{d}"))
        .collect::<Vec<_>>()
        .join(", ");
    let run_id_list = run_ids
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT RT.run_id, A.acc_id, A.sub_id, {dim_cols}, A.acc_value\n\
         FROM {acc_table} A\n\
         INNER JOIN run_table RT ON RT.table_hid = {hid} AND RT.base_run_id = A.run_id\n\
         WHERE RT.run_id IN ({run_id_list})",
        acc_table = table.db_acc_table,
        hid = table.table_hid,
    )
}

fn build_level_block(
    level_def: &crate::compile::LevelDef,
    child_block: Option<&str>,
    child_level: Option<usize>,
    table: &OutputTable,
    dims: &[&str],
    calc_id: i64,
) -> String {
    let from_alias = &level_def.from_alias;
    let dim_select = dims
        .iter()
        .map(|d| format!("{from_alias}.{d}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut select_items = vec![format!("{from_alias}.run_id")];
    if level_def.level == 1 {
        select_items.push(format!("{calc_id} AS calc_id"));
    }
    select_items.push(dim_select);
    for e in &level_def.expr_arr {
        let out_name = if level_def.level == 1 { "calc_value" } else { e.col_name.as_str() };
        select_items.push(format!("{} AS {}", e.sql, out_name));
    }

    let mut joins = String::new();
    for (acc_idx, alias) in &level_def.join_aliases {
        let acc_id = table.accs[*acc_idx].acc_id;
        let dims_eq: String = dims
            .iter()
            .map(|d| format!(" AND {alias}.{d} = {from_alias}.{d}"))
            .collect();
        joins.push_str(&format!(
            "\nINNER JOIN asrc {alias} ON ({alias}.run_id = {from_alias}.run_id AND {alias}.sub_id = {from_alias}.sub_id AND {alias}.acc_id = {acc_id}{dims_eq})",
        ));
    }
    for pj in &level_def.param_joins {
        joins.push_str(&format!(
            "\nINNER JOIN par_{hid} {alias} ON ({alias}.run_id = {from_alias}.run_id)",
            hid = pj.hid,
            alias = pj.alias,
        ));
    }
    if let (Some(block), Some(lvl)) = (child_block, child_level) {
        let dims_eq: String = dims.iter().map(|d| format!(" AND T{lvl}.{d} = {from_alias}.{d}")).collect();
        joins.push_str(&format!(
            "\nINNER JOIN (\n{block}\n) T{lvl} ON (T{lvl}.run_id = {from_alias}.run_id{dims_eq})",
        ));
    }

    let first_acc_id = level_def
        .first_agc_idx
        .map(|idx| table.accs[idx].acc_id)
        .unwrap_or(0);

    let dims_group: String = dims.iter().map(|d| format!(", {from_alias}.{d}")).collect();

    format!(
        "SELECT {cols}\nFROM asrc {from_alias}{joins}\nWHERE {from_alias}.acc_id = {first_acc_id}\nGROUP BY {from_alias}.run_id{dims_group}",
        cols = select_items.join(", "),
    )
}

pub(crate) fn apply_filters(main_sql: &str, filters: &[Filter], facet: &dyn DialectFacet) -> Result<String> {
    let mut clauses = Vec::new();
    for f in filters {
        if f.values.is_empty() {
            return Err(Error::invalid(format!("filter '{}' has no values", f.name)));
        }
        let col = f.name.clone();
        let clause = if f.op == FilterOp::In {
            let list = f
                .values
                .iter()
                .map(|v| facet.quote_literal(v))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{col} IN ({list})")
        } else {
            format!("{col} {} {}", f.op.sql(), facet.quote_literal(&f.values[0]))
        };
        clauses.push(clause);
    }
    // Filters on calc_value must be applied after the GROUP BY that produces
    // it; every other filter narrows rows before aggregation. For this
    // compiler's single-query shape both are expressed as a wrapping
    // `SELECT * FROM (...) WHERE ...`, which is valid for both cases and
    // keeps the composition simple.
    Ok(format!(
        "SELECT * FROM (\n{main_sql}\n) calc WHERE {}",
        clauses.join(" AND ")
    ))
}

fn build_order_by(order_by: &[OrderBy], dims: &[&str]) -> String {
    if order_by.is_empty() {
        let mut cols = vec!["run_id".to_string(), "calc_id".to_string()];
        cols.extend(dims.iter().map(|d| d.to_string()));
        format!("\nORDER BY {}", cols.join(", "))
    } else {
        let cols = order_by
            .iter()
            .map(|o| format!("{} {}", o.column, if o.descending { "DESC" } else { "ASC" }))
            .collect::<Vec<_>>()
            .join(", ");
        format!("\nORDER BY {cols}")
    }
}
