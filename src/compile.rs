//! Builds the `levelDef` arena (§4.2, §9 "Expression compiler state") from a
//! parsed [`crate::expr::Expr`]. `genquery` turns the arena into SQL text;
//! this module only figures out *what* each nesting level needs.

use std::collections::HashMap;

use crate::builtin::AggOp;
use crate::catalog::{EntityGeneration, Model, OutputTable};
use crate::error::{Error, Result};
use crate::expr::{ColumnRef, Expr, RunTag};
use crate::util::SmallSet;

/// What a level's base row source is: the model-specific accumulator table,
/// or a microdata entity generation table.
pub enum Source<'a> {
    Accumulator(&'a OutputTable),
    Microdata(&'a EntityGeneration),
}

/// One aggregate expression computed at a level, e.g. `ex2` or `ex31`.
#[derive(Debug, Clone)]
pub struct LevelExpr {
    pub col_name: String,
    /// Rendered SQL text of the aggregate call, e.g. `SUM(M1.acc_value + ...)`.
    pub sql: String,
}

/// A join onto a separately-compiled parameter CTE `par_<hid>`.
#[derive(Debug, Clone)]
pub struct ParamJoin {
    pub hid: i64,
    pub alias: String,
    pub run_tag: Option<RunTag>,
}

/// One nesting level of the compiled query: its own `FROM`/join aliases,
/// the aggregate expressions computed there, and which accumulators/attrs it
/// references. Mirrors the original `levelDef{level, fromAlias, innerAlias,
/// exprArr, agcUsageArr, firstAgcIdx, paramJoinArr}`.
#[derive(Debug, Clone)]
pub struct LevelDef {
    pub level: usize,
    pub from_alias: String,
    pub inner_alias: String,
    pub expr_arr: Vec<LevelExpr>,
    /// Bitmap of accumulator/attribute identities referenced at this level.
    pub agc_usage: SmallSet,
    /// Identity of the first native accumulator/attribute encountered at
    /// this level; referenced as `<fromAlias>.acc_value` with no extra join.
    pub first_agc_idx: Option<usize>,
    /// `(identity, alias)` pairs for every other accumulator/attribute
    /// referenced at this level, in first-encounter order.
    pub join_aliases: Vec<(usize, String)>,
    pub param_joins: Vec<ParamJoin>,
    /// The next-deeper level whose result is joined into this level's FROM
    /// as `T<child>`, if any nested aggregate occurs here.
    pub child_level: Option<usize>,
}

impl LevelDef {
    fn new(level: usize) -> Self {
        LevelDef {
            level,
            from_alias: format!("M{level}"),
            inner_alias: format!("T{level}"),
            expr_arr: Vec::new(),
            agc_usage: SmallSet::default(),
            first_agc_idx: None,
            join_aliases: Vec::new(),
            param_joins: Vec::new(),
            child_level: None,
        }
    }
}

/// Result of compiling one calculation expression: the level arena, ordered
/// by ascending level (index 0 is level 1, the outermost).
pub struct Compiled {
    pub levels: Vec<LevelDef>,
}

struct Compiler<'a> {
    source: Source<'a>,
    model: &'a Model,
    counts: HashMap<usize, usize>,
    next_idx: HashMap<usize, usize>,
    levels: HashMap<usize, LevelDef>,
    max_level: usize,
}

/// Compile a parsed calculation expression against an output table or an
/// entity generation's attribute set. `expr` must be an aggregate call at
/// its root — the grammar in [`crate::parse`] only ever produces these as
/// top-level calculations. `model` resolves `param.Name` references to their
/// real `param_hid`.
pub fn compile(expr: &Expr, source: Source<'_>, model: &Model) -> Result<Compiled> {
    if !matches!(expr, Expr::Agg(_, _)) {
        return Err(Error::invalid(
            "a calculation expression must be an aggregate call at its outermost level",
        ));
    }

    let mut counts = HashMap::new();
    count_levels(expr, 0, &mut counts);

    let mut compiler = Compiler {
        source,
        model,
        counts,
        next_idx: HashMap::new(),
        levels: HashMap::new(),
        max_level: 0,
    };
    compiler.render(expr, 0)?;

    let mut levels: Vec<LevelDef> = compiler.levels.into_values().collect();
    levels.sort_by_key(|l| l.level);
    Ok(Compiled { levels })
}

fn count_levels(e: &Expr, level: usize, counts: &mut HashMap<usize, usize>) {
    match e {
        Expr::Agg(_, inner) => {
            let lvl = level + 1;
            *counts.entry(lvl).or_insert(0) += 1;
            count_levels(inner, lvl, counts);
        }
        Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
            count_levels(a, level, counts);
            count_levels(b, level, counts);
        }
        Expr::Neg(a) => count_levels(a, level, counts),
        Expr::Case { cond_lhs, cond_rhs, then, els, .. } => {
            count_levels(cond_lhs, level, counts);
            count_levels(cond_rhs, level, counts);
            count_levels(then, level, counts);
            count_levels(els, level, counts);
        }
        Expr::Const(_) | Expr::Column(_) | Expr::Null => {}
    }
}

impl<'a> Compiler<'a> {
    fn level_mut(&mut self, level: usize) -> &mut LevelDef {
        self.levels.entry(level).or_insert_with(|| LevelDef::new(level))
    }

    /// Render `e`, which lives textually at nesting depth `level` (0 means
    /// "not yet inside any aggregate" — only valid while still looking for
    /// the root `Agg`).
    fn render(&mut self, e: &Expr, level: usize) -> Result<String> {
        match e {
            Expr::Const(v) => Ok(format_literal(*v)),
            Expr::Column(col) => self.render_column(col, level),
            Expr::Add(a, b) => Ok(format!("({} + {})", self.render(a, level)?, self.render(b, level)?)),
            Expr::Sub(a, b) => Ok(format!("({} - {})", self.render(a, level)?, self.render(b, level)?)),
            Expr::Mul(a, b) => Ok(format!("({} * {})", self.render(a, level)?, self.render(b, level)?)),
            Expr::Div(a, b) => Ok(format!("({} / {})", self.render(a, level)?, self.render(b, level)?)),
            Expr::Neg(a) => Ok(format!("(-{})", self.render(a, level)?)),
            Expr::Null => Ok("NULL".to_string()),
            Expr::Case { cond_op, cond_lhs, cond_rhs, then, els } => Ok(format!(
                "(CASE WHEN {} {} {} THEN {} ELSE {} END)",
                self.render(cond_lhs, level)?,
                cond_op.sql(),
                self.render(cond_rhs, level)?,
                self.render(then, level)?,
                self.render(els, level)?
            )),
            Expr::Agg(op, inner) => self.render_agg(*op, inner, level),
        }
    }

    fn render_agg(&mut self, op: AggOp, inner: &Expr, level: usize) -> Result<String> {
        let child_level = level + 1;
        self.max_level = self.max_level.max(child_level);

        if level > 0 {
            let parent = self.level_mut(level);
            if parent.child_level.is_none() {
                parent.child_level = Some(child_level);
            } else if parent.child_level != Some(child_level) {
                return Err(Error::invalid(
                    "a level may only join a single deeper nesting level",
                ));
            }
        }

        let inner_sql = self.render(inner, child_level)?;
        let agg_sql = op.render_sql(&inner_sql);

        let total = *self.counts.get(&child_level).unwrap_or(&1);
        let idx = {
            let e = self.next_idx.entry(child_level).or_insert(0);
            let i = *e;
            *e += 1;
            i
        };
        let col_name = if total <= 1 {
            format!("ex{child_level}")
        } else {
            format!("ex{child_level}{}", idx + 1)
        };

        let def = self.level_mut(child_level);
        def.expr_arr.push(LevelExpr {
            col_name: col_name.clone(),
            sql: agg_sql,
        });

        if level == 0 {
            // Root aggregate: its value is the final calc_value, referenced
            // directly by genquery rather than through a T-alias join.
            Ok(col_name)
        } else {
            Ok(format!("T{child_level}.{col_name}"))
        }
    }

    fn render_column(&mut self, col: &ColumnRef, level: usize) -> Result<String> {
        if level == 0 {
            return Err(Error::invalid(
                "a column reference must occur inside an aggregate call",
            ));
        }
        if col.is_param {
            return self.render_param(col, level);
        }
        match &self.source {
            Source::Accumulator(table) => self.render_accumulator(table, col, level),
            Source::Microdata(generation) => self.render_attribute(generation, col, level),
        }
    }

    fn render_accumulator(&mut self, table: &OutputTable, col: &ColumnRef, level: usize) -> Result<String> {
        let idx = table.acc_by_name(&col.name).ok_or_else(|| {
            Error::not_found(format!("accumulator '{}' not found in table {}", col.name, table.name))
        })?;
        if table.accs[idx].is_derived {
            return Err(Error::invalid(format!(
                "derived accumulator '{}' cannot be referenced directly; \
                 reference its underlying native accumulators instead",
                col.name
            )));
        }
        if col.run_tag.is_some() {
            return Err(Error::invalid(
                "accumulator aggregation does not support run-compared references",
            ));
        }
        let def = self.level_mut(level);
        def.agc_usage.insert(idx);
        if def.first_agc_idx.is_none() {
            def.first_agc_idx = Some(idx);
        }
        if def.first_agc_idx == Some(idx) {
            Ok(format!("{}.acc_value", def.from_alias))
        } else {
            let alias = format!("L{level}A{idx}");
            if !def.join_aliases.iter().any(|(i, _)| *i == idx) {
                def.join_aliases.push((idx, alias.clone()));
            }
            Ok(format!("{alias}.acc_value"))
        }
    }

    fn render_attribute(&mut self, generation: &EntityGeneration, col: &ColumnRef, level: usize) -> Result<String> {
        let idx = generation.attr_by_name(&col.name).ok_or_else(|| {
            Error::not_found(format!("attribute '{}' not found in entity generation", col.name))
        })?;
        let tag_suffix = match col.run_tag {
            Some(RunTag::Base) => "base",
            Some(RunTag::Variant) => "variant",
            None => "cur",
        };
        let def = self.level_mut(level);
        // An attribute is keyed by (attr index, run tag): `Income[base]` and
        // `Income[variant]` are distinct join targets even though they name
        // the same attribute.
        let key = idx * 4 + tag_key(col.run_tag);
        def.agc_usage.insert(key);
        if def.first_agc_idx.is_none() {
            def.first_agc_idx = Some(key);
        }
        if def.first_agc_idx == Some(key) {
            Ok(format!("{}.{}", def.from_alias, col.name))
        } else {
            let alias = format!("L{level}A{idx}_{tag_suffix}");
            if !def.join_aliases.iter().any(|(i, _)| *i == key) {
                def.join_aliases.push((key, alias.clone()));
            }
            Ok(format!("{alias}.{}", col.name))
        }
    }

    fn render_param(&mut self, col: &ColumnRef, level: usize) -> Result<String> {
        let param_idx = self.model.param_by_name(&col.name).ok_or_else(|| {
            Error::not_found(format!("parameter '{}' not found in model", col.name))
        })?;
        let hid = self.model.params[param_idx].param_hid;
        let alias = format!("P_{}", col.name);
        let def = self.level_mut(level);
        if !def.param_joins.iter().any(|p| p.alias == alias) {
            def.param_joins.push(ParamJoin {
                hid,
                alias: alias.clone(),
                run_tag: col.run_tag,
            });
        }
        Ok(format!("{alias}.param_value"))
    }
}

fn tag_key(tag: Option<RunTag>) -> usize {
    match tag {
        None => 0,
        Some(RunTag::Base) => 1,
        Some(RunTag::Variant) => 2,
    }
}

fn format_literal(v: f64) -> String {
    if v == v.trunc() {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Acc, Dim, OutputTable};
    use crate::parse::parse_calculation;

    fn sample_model(table: OutputTable) -> Model {
        Model {
            model_id: 1,
            digest: "d".into(),
            name: "M".into(),
            types: vec![],
            params: vec![crate::catalog::Parameter {
                param_id: 1,
                param_hid: 50,
                name: "Scale".into(),
                dims: vec![],
                db_run_table: "scale_p".into(),
            }],
            tables: vec![table],
            entities: vec![],
            langs: vec![],
        }
    }

    fn sample_table() -> OutputTable {
        OutputTable {
            table_id: 1,
            table_hid: 1,
            name: "T1".into(),
            dims: vec![Dim {
                dim_id: 0,
                name: "age".into(),
                type_id: 100,
                is_total: false,
                col_name: "dim0".into(),
            }],
            accs: vec![
                Acc {
                    acc_id: 0,
                    name: "acc0".into(),
                    is_derived: false,
                    src_acc: String::new(),
                    col_name: "acc0".into(),
                },
                Acc {
                    acc_id: 1,
                    name: "acc1".into(),
                    is_derived: false,
                    src_acc: String::new(),
                    col_name: "acc1".into(),
                },
            ],
            exprs: vec![],
            db_expr_table: "t1_v".into(),
            db_acc_table: "t1_a".into(),
        }
    }

    #[test]
    fn simple_aggregate_is_single_level() {
        let table = sample_table();
        let model = sample_model(table.clone());
        let e = parse_calculation("OM_SUM(acc0 + 0.5 * acc1)").unwrap();
        let compiled = compile(&e, Source::Accumulator(&table), &model).unwrap();
        assert_eq!(compiled.levels.len(), 1);
        let l1 = &compiled.levels[0];
        assert_eq!(l1.level, 1);
        assert_eq!(l1.first_agc_idx, Some(0));
        assert_eq!(l1.join_aliases, vec![(1, "L1A1".to_string())]);
        assert!(l1.expr_arr[0].sql.starts_with("SUM("));
        assert!(l1.expr_arr[0].sql.contains("M1.acc_value"));
        assert!(l1.expr_arr[0].sql.contains("L1A1.acc_value"));
    }

    #[test]
    fn nested_aggregate_creates_two_levels() {
        let table = sample_table();
        let model = sample_model(table.clone());
        let e = parse_calculation("OM_AVG(acc0 + OM_MAX(acc1))").unwrap();
        let compiled = compile(&e, Source::Accumulator(&table), &model).unwrap();
        assert_eq!(compiled.levels.len(), 2);
        assert_eq!(compiled.levels[0].level, 1);
        assert_eq!(compiled.levels[1].level, 2);
        assert_eq!(compiled.levels[0].child_level, Some(2));
        assert_eq!(compiled.levels[0].expr_arr[0].col_name, "ex1");
        assert_eq!(compiled.levels[1].expr_arr[0].col_name, "ex2");
        assert!(compiled.levels[0].expr_arr[0].sql.contains("T2.ex2"));
    }

    #[test]
    fn derived_accumulator_reference_is_rejected() {
        let mut table = sample_table();
        table.accs.push(Acc {
            acc_id: 2,
            name: "acc2".into(),
            is_derived: true,
            src_acc: "acc0+acc1".into(),
            col_name: "acc2".into(),
        });
        let model = sample_model(table.clone());
        let e = parse_calculation("OM_SUM(acc2)").unwrap();
        assert!(compile(&e, Source::Accumulator(&table), &model).is_err());
    }
}
