//! Validates read/calculate requests and composes the Compiler, Reader and
//! Cell Converter into one pipeline (§4.6).

use sqlx::any::AnyPool;
use sqlx::Row;

use crate::catalog::{Acc, EntityGeneration, Model, OutputTable, Run};
use crate::cell::{self, CellKind, ColumnConv, HeaderSpec};
use crate::compile::{self, Source};
use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::facet::DialectFacet;
use crate::genquery::{self, apply_filters, Filter, MicrodataParams, OrderBy, QueryParams};
use crate::reader::{Page, PageResult, Reader, RowCells};

/// What kind of read is being requested; determines which run statuses are
/// acceptable and which validations apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    Parameter,
    Expression,
    Accumulator,
    AllAccumulator,
    Calculation,
    Microdata,
    MicrodataCalculation,
}

impl ReadKind {
    fn is_microdata(self) -> bool {
        matches!(self, ReadKind::Microdata | ReadKind::MicrodataCalculation)
    }
}

/// A fully validated request, ready to dispatch to the Reader.
pub struct ReadLayout<'a> {
    pub name: String,
    pub from_id: i64,
    pub page: Page,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub calculation: Option<&'a Expr>,
}

/// Caller-supplied request. Field names mirror §6's request shape.
pub struct ReadRequest<'a> {
    pub kind: ReadKind,
    pub run: &'a Run,
    pub name: String,
    pub offset: u64,
    pub size: Option<u64>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub calculation: Option<&'a Expr>,
    pub entity_gen_digest: Option<&'a str>,
    /// Variant runs compared against `run` (the base) for run-comparison
    /// microdata aggregation; ignored for every other `ReadKind`.
    pub variant_runs: Vec<&'a Run>,
    /// Attribute names to group microdata aggregation by; ignored for every
    /// other `ReadKind`.
    pub dims: Vec<String>,
    /// Caller wants raw storage ids (`isIdCsv`) rather than decoded
    /// codes/names in every converted column.
    pub is_id_csv: bool,
}

/// A validated request compiled down to SQL, a header, and the per-column
/// conversion the Cell Converter should apply to each streamed row — the
/// output of [`Orchestrator::prepare`], consumed by [`Orchestrator::read`].
pub struct PreparedRead {
    pub cte_sql: String,
    pub main_sql: String,
    pub header: HeaderSpec,
    pub columns: Vec<ColumnConv>,
}

pub struct Orchestrator<'a> {
    model: &'a Model,
    facet: &'a dyn DialectFacet,
    pool: &'a AnyPool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(model: &'a Model, facet: &'a dyn DialectFacet, pool: &'a AnyPool) -> Self {
        Orchestrator { model, facet, pool }
    }

    /// Validate `req` and compile it down to SQL text plus the header/column
    /// conversions that should accompany the streamed cells. Call
    /// [`Orchestrator::read`] with the result to actually stream rows.
    pub async fn prepare(&self, req: &ReadRequest<'_>) -> Result<PreparedRead> {
        self.validate_run_status(req)?;

        if req.kind == ReadKind::Parameter {
            return self.prepare_parameter(req).await;
        }

        let table_idx = self.model.table_by_name(&req.name);
        let table = match table_idx {
            Some(idx) => &self.model.tables[idx],
            None if req.kind.is_microdata() => {
                return self.prepare_microdata(req).await;
            }
            None => {
                return Err(Error::not_found(format!("output table '{}' not found", req.name)));
            }
        };

        match req.kind {
            ReadKind::Calculation => {
                self.validate_filters(table, &req.filters)?;
                self.prepare_calculation(table, req).await
            }
            ReadKind::Expression => self.prepare_expression(table, req).await,
            ReadKind::Accumulator => self.prepare_accumulator(table, req).await,
            ReadKind::AllAccumulator => self.prepare_all_accumulator(table, req).await,
            _ => Err(Error::invalid("unsupported read kind for an output table request")),
        }
    }

    /// Stream `prepared`'s rows within `page` to `sink`, converting each row
    /// through the Cell Converter per `prepared.columns` / `isIdCsv` first.
    pub async fn read(
        &self,
        prepared: &PreparedRead,
        page: Page,
        mut sink: impl FnMut(RowCells) -> Result<bool> + Send,
    ) -> Result<PageResult> {
        let full_sql = if prepared.cte_sql.is_empty() {
            prepared.main_sql.clone()
        } else {
            format!("{}\n{}", prepared.cte_sql, prepared.main_sql)
        };
        let columns = &prepared.columns;
        let is_id_csv = prepared.header.is_id_csv;
        let mut boxed: Box<crate::reader::Sink<'_>> = Box::new(move |row| {
            let converted = cell::convert_row(&row, columns, is_id_csv)?;
            sink(converted)
        });
        self.reader().read_to(&full_sql, page, &mut *boxed).await
    }

    fn validate_run_status(&self, req: &ReadRequest<'_>) -> Result<()> {
        if req.kind.is_microdata() {
            if !req.run.status.is_microdata_readable() {
                return Err(Error::incomplete_run(format!(
                    "run {} is not status 's'; microdata reads require a fully successful run",
                    req.run.run_id
                )));
            }
            for variant in &req.variant_runs {
                if !variant.status.is_microdata_readable() {
                    return Err(Error::incomplete_run(format!(
                        "run {} is not status 's'; microdata reads require a fully successful run",
                        variant.run_id
                    )));
                }
            }
        } else if !req.run.status.is_readable() {
            return Err(Error::incomplete_run(format!(
                "run {} has status '{}', which is not a terminal readable status",
                req.run.run_id,
                req.run.status.code()
            )));
        }
        Ok(())
    }

    fn validate_filters(&self, table: &OutputTable, filters: &[Filter]) -> Result<()> {
        for f in filters {
            if f.name == "calc_value" {
                continue;
            }
            if table.dim_by_name(&f.name).is_none() {
                return Err(Error::invalid(format!(
                    "filter references unknown column '{}' on table '{}'",
                    f.name, table.name
                )));
            }
        }
        Ok(())
    }

    /// Generic filter-name validator for the direct-read paths, which have no
    /// `calc_value` column to special-case.
    fn validate_filter_names(&self, valid: &[&str], filters: &[Filter]) -> Result<()> {
        for f in filters {
            if !valid.contains(&f.name.as_str()) {
                return Err(Error::invalid(format!(
                    "filter references unknown column '{}'",
                    f.name
                )));
            }
        }
        Ok(())
    }

    async fn prepare_calculation(&self, table: &OutputTable, req: &ReadRequest<'_>) -> Result<PreparedRead> {
        let expr = req
            .calculation
            .ok_or_else(|| Error::invalid("calculation read requires a compiled expression"))?;

        reject_run_compared_parameter(expr)?;

        let compiled = compile::compile(expr, Source::Accumulator(table), self.model)?;

        let params = QueryParams {
            table,
            model: self.model,
            run_ids: std::slice::from_ref(&req.run.run_id),
            calc_id: 0,
            filters: &req.filters,
            order_by: &req.order_by,
            facet: self.facet,
        };
        let (cte_sql, main_sql) = genquery::build(&compiled, &params)?;

        // Columns follow build()'s SELECT order: run_id, calc_id, dims..., calc_value.
        let mut columns = vec![ColumnConv::Pass, ColumnConv::Pass];
        for d in &table.dims {
            columns.push(cell::conv_for_type(self.model, d.type_id));
        }
        columns.push(ColumnConv::Pass);

        let dims: Vec<String> = table.dims.iter().map(|d| d.name.clone()).collect();
        let header = HeaderSpec {
            kind: CellKind::Calc,
            dims,
            item_names: vec![],
            is_id_csv: req.is_id_csv,
            has_sub_id: false,
        };

        Ok(PreparedRead { cte_sql, main_sql, header, columns })
    }

    async fn prepare_parameter(&self, req: &ReadRequest<'_>) -> Result<PreparedRead> {
        let param_idx = self
            .model
            .param_by_name(&req.name)
            .ok_or_else(|| Error::not_found(format!("parameter '{}' not found", req.name)))?;
        let param = &self.model.params[param_idx];

        let dim_names: Vec<&str> = param.dims.iter().map(|d| d.name.as_str()).collect();
        self.validate_filter_names(&dim_names, &req.filters)?;

        let dim_cols: Vec<&str> = param.dims.iter().map(|d| d.col_name.as_str()).collect();
        let mut cols = vec!["sub_id".to_string()];
        cols.extend(dim_cols.iter().map(|s| s.to_string()));
        cols.push("param_value".to_string());

        let mut sql = format!(
            "SELECT {} FROM {} WHERE run_id = {}",
            cols.join(", "),
            param.db_run_table,
            req.run.run_id,
        );
        if !req.filters.is_empty() {
            sql = apply_filters(&sql, &req.filters, self.facet)?;
        }
        let mut order_cols = vec!["sub_id".to_string()];
        order_cols.extend(dim_cols.iter().map(|s| s.to_string()));
        sql.push_str(&format!("\nORDER BY {}", order_cols.join(", ")));

        let mut columns = vec![ColumnConv::Pass];
        for d in &param.dims {
            columns.push(cell::conv_for_type(self.model, d.type_id));
        }
        columns.push(ColumnConv::Pass);

        let dims: Vec<String> = param.dims.iter().map(|d| d.name.clone()).collect();
        let header = HeaderSpec {
            kind: CellKind::Parameter,
            dims,
            item_names: vec![],
            is_id_csv: req.is_id_csv,
            has_sub_id: true,
        };

        Ok(PreparedRead { cte_sql: String::new(), main_sql: sql, header, columns })
    }

    async fn prepare_expression(&self, table: &OutputTable, req: &ReadRequest<'_>) -> Result<PreparedRead> {
        let dim_names: Vec<&str> = table.dims.iter().map(|d| d.name.as_str()).collect();
        self.validate_filter_names(&dim_names, &req.filters)?;

        let physical_run_id = self
            .resolve_physical_run_id(req.run.run_id, "run_table", "table_hid", table.table_hid)
            .await?;

        let dim_cols: Vec<&str> = table.dims.iter().map(|d| d.col_name.as_str()).collect();
        let mut cols = vec!["expr_id".to_string()];
        cols.extend(dim_cols.iter().map(|s| s.to_string()));
        cols.push("expr_value".to_string());

        let mut sql = format!(
            "SELECT {} FROM {} WHERE run_id = {physical_run_id}",
            cols.join(", "),
            table.db_expr_table,
        );
        if !req.filters.is_empty() {
            sql = apply_filters(&sql, &req.filters, self.facet)?;
        }
        let mut order_cols = vec!["expr_id".to_string()];
        order_cols.extend(dim_cols.iter().map(|s| s.to_string()));
        sql.push_str(&format!("\nORDER BY {}", order_cols.join(", ")));

        let items: Vec<(i64, String)> = table.exprs.iter().map(|e| (e.expr_id, e.name.clone())).collect();
        let mut columns = vec![ColumnConv::ItemName(items)];
        for d in &table.dims {
            columns.push(cell::conv_for_type(self.model, d.type_id));
        }
        columns.push(ColumnConv::Pass);

        let dims: Vec<String> = table.dims.iter().map(|d| d.name.clone()).collect();
        let header = HeaderSpec {
            kind: CellKind::Expr,
            dims,
            item_names: table.exprs.iter().map(|e| e.name.clone()).collect(),
            is_id_csv: req.is_id_csv,
            has_sub_id: false,
        };

        Ok(PreparedRead { cte_sql: String::new(), main_sql: sql, header, columns })
    }

    async fn prepare_accumulator(&self, table: &OutputTable, req: &ReadRequest<'_>) -> Result<PreparedRead> {
        let dim_names: Vec<&str> = table.dims.iter().map(|d| d.name.as_str()).collect();
        self.validate_filter_names(&dim_names, &req.filters)?;

        let physical_run_id = self
            .resolve_physical_run_id(req.run.run_id, "run_table", "table_hid", table.table_hid)
            .await?;

        let dim_cols: Vec<&str> = table.dims.iter().map(|d| d.col_name.as_str()).collect();
        let mut cols = vec!["acc_id".to_string(), "sub_id".to_string()];
        cols.extend(dim_cols.iter().map(|s| s.to_string()));
        cols.push("acc_value".to_string());

        let mut sql = format!(
            "SELECT {} FROM {} WHERE run_id = {physical_run_id}",
            cols.join(", "),
            table.db_acc_table,
        );
        if !req.filters.is_empty() {
            sql = apply_filters(&sql, &req.filters, self.facet)?;
        }
        let mut order_cols = vec!["acc_id".to_string(), "sub_id".to_string()];
        order_cols.extend(dim_cols.iter().map(|s| s.to_string()));
        sql.push_str(&format!("\nORDER BY {}", order_cols.join(", ")));

        let items: Vec<(i64, String)> = table.accs.iter().map(|a| (a.acc_id, a.name.clone())).collect();
        let mut columns = vec![ColumnConv::ItemName(items), ColumnConv::Pass];
        for d in &table.dims {
            columns.push(cell::conv_for_type(self.model, d.type_id));
        }
        columns.push(ColumnConv::Pass);

        let dims: Vec<String> = table.dims.iter().map(|d| d.name.clone()).collect();
        let header = HeaderSpec {
            kind: CellKind::Acc,
            dims,
            item_names: table.accs.iter().map(|a| a.name.clone()).collect(),
            is_id_csv: req.is_id_csv,
            has_sub_id: true,
        };

        Ok(PreparedRead { cte_sql: String::new(), main_sql: sql, header, columns })
    }

    /// All native accumulators pivoted into their own columns per sub_id/dims
    /// bucket, via `MAX(CASE WHEN acc_id = n THEN acc_value END)` per native
    /// accumulator.
    async fn prepare_all_accumulator(&self, table: &OutputTable, req: &ReadRequest<'_>) -> Result<PreparedRead> {
        let dim_names: Vec<&str> = table.dims.iter().map(|d| d.name.as_str()).collect();
        self.validate_filter_names(&dim_names, &req.filters)?;

        let physical_run_id = self
            .resolve_physical_run_id(req.run.run_id, "run_table", "table_hid", table.table_hid)
            .await?;

        let native: Vec<&Acc> = table.accs.iter().filter(|a| !a.is_derived).collect();
        if native.is_empty() {
            return Err(Error::invalid(format!(
                "output table '{}' has no native accumulators",
                table.name
            )));
        }

        let dim_cols: Vec<&str> = table.dims.iter().map(|d| d.col_name.as_str()).collect();
        let mut select_items = vec!["sub_id".to_string()];
        select_items.extend(dim_cols.iter().map(|s| s.to_string()));
        for a in &native {
            select_items.push(format!(
                "MAX(CASE WHEN acc_id = {} THEN acc_value END) AS {}",
                a.acc_id, a.col_name
            ));
        }

        let mut group_cols = vec!["sub_id".to_string()];
        group_cols.extend(dim_cols.iter().map(|s| s.to_string()));

        let mut sql = format!(
            "SELECT {} FROM {} WHERE run_id = {physical_run_id}",
            select_items.join(", "),
            table.db_acc_table,
        );
        sql.push_str(&format!("\nGROUP BY {}", group_cols.join(", ")));

        if !req.filters.is_empty() {
            sql = apply_filters(&sql, &req.filters, self.facet)?;
        }
        sql.push_str(&format!("\nORDER BY {}", group_cols.join(", ")));

        let mut columns = vec![ColumnConv::Pass];
        for d in &table.dims {
            columns.push(cell::conv_for_type(self.model, d.type_id));
        }
        for _ in &native {
            columns.push(ColumnConv::Pass);
        }

        let dims: Vec<String> = table.dims.iter().map(|d| d.name.clone()).collect();
        let header = HeaderSpec {
            kind: CellKind::AllAcc,
            dims,
            item_names: native.iter().map(|a| a.name.clone()).collect(),
            is_id_csv: req.is_id_csv,
            has_sub_id: true,
        };

        Ok(PreparedRead { cte_sql: String::new(), main_sql: sql, header, columns })
    }

    async fn prepare_microdata(&self, req: &ReadRequest<'_>) -> Result<PreparedRead> {
        let entity_idx = self
            .model
            .entity_by_name(&req.name)
            .ok_or_else(|| Error::not_found(format!("entity '{}' not found", req.name)))?;
        let entity = &self.model.entities[entity_idx];

        let gen_idx = match req.entity_gen_digest {
            Some(digest) => entity
                .generation_by_digest(digest)
                .ok_or_else(|| Error::invalid(format!("entity generation digest '{digest}' not found for entity '{}'", req.name)))?,
            None => entity
                .generations
                .first()
                .and_then(|g| entity.generation_by_hid(g.gen_hid))
                .ok_or_else(|| Error::not_found("entity has no generations"))?,
        };
        let generation = &entity.generations[gen_idx];

        match req.kind {
            ReadKind::MicrodataCalculation => self.prepare_microdata_calculation(generation, req).await,
            _ => self.prepare_microdata_page(generation, req).await,
        }
    }

    /// Resolves `run_id`'s stored physical run for `hid` via `link_table`
    /// (`run_entity`/`entity_gen_hid` for microdata, `run_table`/`table_hid`
    /// for output tables): rows live only under the run that first produced
    /// them, so every other run sharing them points at it through
    /// `base_run_id`.
    async fn resolve_physical_run_id(&self, run_id: i64, link_table: &str, hid_col: &str, hid: i64) -> Result<i64> {
        let row = sqlx::query(&format!(
            "SELECT base_run_id FROM {link_table} WHERE run_id = {run_id} AND {hid_col} = {hid}"
        ))
        .fetch_one(self.pool)
        .await
        .map_err(|e| Error::not_found(format!("run {run_id} has no {link_table} row for {hid_col} {hid}: {e}")))?;
        row.try_get::<i64, _>(0)
            .map_err(|e| Error::io("decode base_run_id", e))
    }

    async fn prepare_microdata_page(
        &self,
        generation: &EntityGeneration,
        req: &ReadRequest<'_>,
    ) -> Result<PreparedRead> {
        let physical_run_id = self
            .resolve_physical_run_id(req.run.run_id, "run_entity", "entity_gen_hid", generation.gen_hid)
            .await?;

        let mut cols = vec!["entity_key".to_string()];
        cols.extend(generation.attrs.iter().map(|a| a.name.clone()));

        let mut sql = format!(
            "SELECT {} FROM {} WHERE run_id = {physical_run_id}",
            cols.join(", "),
            generation.db_entity_table,
        );
        if !req.filters.is_empty() {
            sql = apply_filters(&sql, &req.filters, self.facet)?;
        }
        sql.push_str("\nORDER BY entity_key");

        let mut columns = vec![ColumnConv::Pass];
        for a in &generation.attrs {
            columns.push(cell::conv_for_type(self.model, a.type_id));
        }

        let attrs: Vec<String> = generation.attrs.iter().map(|a| a.name.clone()).collect();
        let header = HeaderSpec {
            kind: CellKind::Microdata,
            dims: attrs,
            item_names: vec![],
            is_id_csv: req.is_id_csv,
            has_sub_id: false,
        };

        Ok(PreparedRead { cte_sql: String::new(), main_sql: sql, header, columns })
    }

    async fn prepare_microdata_calculation(
        &self,
        generation: &EntityGeneration,
        req: &ReadRequest<'_>,
    ) -> Result<PreparedRead> {
        let expr = req
            .calculation
            .ok_or_else(|| Error::invalid("microdata calculation read requires a compiled expression"))?;

        let compiled = compile::compile(expr, Source::Microdata(generation), self.model)?;

        let base_run_id = self
            .resolve_physical_run_id(req.run.run_id, "run_entity", "entity_gen_hid", generation.gen_hid)
            .await?;
        let mut variant_run_ids = Vec::with_capacity(req.variant_runs.len());
        for variant in &req.variant_runs {
            variant_run_ids.push(
                self.resolve_physical_run_id(variant.run_id, "run_entity", "entity_gen_hid", generation.gen_hid)
                    .await?,
            );
        }

        let params = MicrodataParams {
            generation,
            dims: &req.dims,
            base_run_id,
            variant_run_ids: &variant_run_ids,
            calc_id: 0,
            filters: &req.filters,
            order_by: &req.order_by,
            facet: self.facet,
        };
        let (cte_sql, main_sql) = genquery::build_microdata(&compiled, &params)?;

        // Columns follow build_microdata()'s level-1 SELECT order: calc_id, dims..., calc_value.
        let mut columns = vec![ColumnConv::Pass];
        for dim_name in &req.dims {
            let type_id = generation
                .attr_by_name(dim_name)
                .map(|idx| generation.attrs[idx].type_id)
                .unwrap_or(0);
            columns.push(cell::conv_for_type(self.model, type_id));
        }
        columns.push(ColumnConv::Pass);

        let header = HeaderSpec {
            kind: CellKind::Calc,
            dims: req.dims.clone(),
            item_names: vec![],
            is_id_csv: req.is_id_csv,
            has_sub_id: false,
        };

        Ok(PreparedRead { cte_sql, main_sql, header, columns })
    }

    pub fn reader(&self) -> Reader<'a> {
        Reader::new(self.pool)
    }
}

/// Derived accumulators and run-compared parameters are rejected for
/// accumulator aggregation (§4.2 "Parameter references"); microdata
/// aggregation is the only mode permitted to mix `[base]`/`[variant]`.
fn reject_run_compared_parameter(expr: &Expr) -> Result<()> {
    match expr {
        Expr::Column(col) if col.is_param && col.run_tag.is_some() => Err(Error::invalid(
            "run-compared parameter references are not permitted in accumulator aggregation",
        )),
        Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
            reject_run_compared_parameter(a)?;
            reject_run_compared_parameter(b)
        }
        Expr::Neg(a) => reject_run_compared_parameter(a),
        Expr::Case { cond_lhs, cond_rhs, then, els, .. } => {
            reject_run_compared_parameter(cond_lhs)?;
            reject_run_compared_parameter(cond_rhs)?;
            reject_run_compared_parameter(then)?;
            reject_run_compared_parameter(els)
        }
        Expr::Agg(_, inner) => reject_run_compared_parameter(inner),
        Expr::Const(_) | Expr::Column(_) | Expr::Null => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ColumnRef, RunTag};

    #[test]
    fn rejects_run_compared_parameter_anywhere_in_tree() {
        let e = Expr::Agg(
            crate::builtin::AggOp::Sum,
            Box::new(Expr::Column(ColumnRef {
                is_param: true,
                name: "Scale".into(),
                run_tag: Some(RunTag::Base),
            })),
        );
        assert!(reject_run_compared_parameter(&e).is_err());
    }

    #[test]
    fn allows_plain_parameter_reference() {
        let e = Expr::Agg(
            crate::builtin::AggOp::Sum,
            Box::new(Expr::Column(ColumnRef {
                is_param: true,
                name: "Scale".into(),
                run_tag: None,
            })),
        );
        assert!(reject_run_compared_parameter(&e).is_ok());
    }

    #[test]
    fn rejects_run_compared_parameter_inside_case_condition() {
        let e = Expr::Agg(
            crate::builtin::AggOp::Sum,
            Box::new(Expr::Case {
                cond_op: crate::expr::CompareOp::Ne,
                cond_lhs: Box::new(Expr::Column(ColumnRef {
                    is_param: true,
                    name: "Scale".into(),
                    run_tag: Some(RunTag::Variant),
                })),
                cond_rhs: Box::new(Expr::Const(0.0)),
                then: Box::new(Expr::Const(1.0)),
                els: Box::new(Expr::Null),
            }),
        );
        assert!(reject_run_compared_parameter(&e).is_err());
    }
}
