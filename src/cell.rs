//! Bidirectional id<->code conversion for dimensions/attributes, float and
//! null formatting, and CSV header/row production for every cell kind named
//! in §4.5: parameter, expression, accumulator, all-accumulator, microdata.

use crate::catalog::{Model, TypeDef};
use crate::error::{Error, Result};

/// The canonical "all" / total enum code emitted for a `IsTotal` dimension
/// whose id equals the type's `total_enum_id`.
pub const TOTAL_CODE: &str = "all";

/// A single cell value, independent of storage representation.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Null,
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// Convert an enum id to its code for a dimension/attribute of enum-based
/// type. If the type `IsTotal` and `id` is the designated total id, emits
/// the canonical "all" code.
pub fn id_to_code(type_def: &TypeDef, id: i64) -> Result<String> {
    if type_def.total_enum_id == Some(id) {
        return Ok(TOTAL_CODE.to_string());
    }
    match type_def.enum_by_id(id) {
        Some((idx, true)) => Ok(type_def.enums[idx].code.clone()),
        _ => Err(Error::not_found(format!(
            "enum id {id} not found in type {}",
            type_def.name
        ))),
    }
}

/// Symmetric inverse of [`id_to_code`].
pub fn code_to_id(type_def: &TypeDef, code: &str) -> Result<i64> {
    if code == TOTAL_CODE {
        if let Some(id) = type_def.total_enum_id {
            return Ok(id);
        }
        return Err(Error::invalid(format!(
            "type {} has no total enum",
            type_def.name
        )));
    }
    match type_def.enum_by_code(code) {
        Some(idx) => Ok(type_def.enums[idx].enum_id),
        None => Err(Error::not_found(format!(
            "enum code {code:?} not found in type {}",
            type_def.name
        ))),
    }
}

/// Parse a boolean code, case-insensitively: `"true"`/`"false"` only on
/// encode; on decode also accept `-1` as legacy true (see original
/// `dbModelCommon.go` `IsBool` branch).
pub fn code_to_bool_id(code: &str) -> Result<i64> {
    match code.to_ascii_lowercase().as_str() {
        "true" => Ok(1),
        "false" => Ok(0),
        other => Err(Error::invalid(format!("invalid boolean code: {other}"))),
    }
}

pub fn bool_id_to_code(id: i64) -> Result<&'static str> {
    match id {
        0 => Ok("false"),
        1 | -1 => Ok("true"),
        other => Err(Error::invalid(format!("invalid boolean id: {other}"))),
    }
}

/// Parse an integer dimension/attribute code as plain decimal.
pub fn code_to_int_id(code: &str) -> Result<i64> {
    code.parse::<i64>()
        .map_err(|e| Error::invalid(format!("invalid integer code {code:?}: {e}")))
}

/// Format a floating point value using a caller-provided `Sprintf`-style
/// format string (e.g. `"%.15g"`). An empty format string falls back to the
/// driver/Rust default `Display` formatting.
pub fn format_float(value: f64, fmt: &str) -> String {
    if fmt.is_empty() {
        return format_default(value);
    }
    if let Some(precision) = parse_g_precision(fmt) {
        return format_g(value, precision);
    }
    format_default(value)
}

fn format_default(value: f64) -> String {
    if value == value.trunc() && value.is_finite() {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

/// Parse `%.<N>g` into `N`; returns `None` for anything else, in which case
/// callers fall back to the default formatting.
fn parse_g_precision(fmt: &str) -> Option<usize> {
    let rest = fmt.strip_prefix("%.")?;
    let rest = rest.strip_suffix('g')?;
    rest.parse::<usize>().ok()
}

/// `%.<precision>g`-style formatting: `precision` significant digits,
/// trailing zeros trimmed.
fn format_g(value: f64, precision: usize) -> String {
    let precision = precision.max(1);
    let s = format!("{value:.*e}", precision - 1);
    // Re-parse through Rust's scientific notation and re-render fixed/exp as %g would.
    if let Some(parsed) = s.parse::<f64>().ok() {
        let abs = parsed.abs();
        if abs != 0.0 && (abs < 1e-4 || abs >= 10f64.powi(precision as i32)) {
            return trim_trailing_zeros(&s);
        }
    }
    let digits_after_point = precision.saturating_sub(int_digit_count(value));
    let fixed = format!("{value:.*}", digits_after_point.min(17));
    trim_trailing_zeros(&fixed)
}

fn int_digit_count(value: f64) -> usize {
    let abs = value.abs();
    if abs < 1.0 {
        1
    } else {
        (abs.log10().floor() as usize) + 1
    }
}

fn trim_trailing_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    let trimmed = s.trim_end_matches('0');
    let trimmed = trimmed.trim_end_matches('.');
    trimmed.to_string()
}

/// The literal CSV token for a null cell.
pub const CSV_NULL: &str = "null";

/// Render a [`CellValue`] as one CSV field. Null cells emit the literal `"null"`.
pub fn to_csv_field(value: &CellValue, double_format: &str) -> String {
    match value {
        CellValue::Null => CSV_NULL.to_string(),
        CellValue::Int(i) => i.to_string(),
        CellValue::Float(f) => format_float(*f, double_format),
        CellValue::Bool(b) => b.to_string(),
        CellValue::Str(s) => s.clone(),
    }
}

/// Parse one CSV field into a [`CellValue`]; both `""` and `"null"` decode
/// to a null cell.
pub fn csv_field_to_cell(field: &str, kind: CsvFieldKind) -> Result<CellValue> {
    if field.is_empty() || field == CSV_NULL {
        return Ok(CellValue::Null);
    }
    Ok(match kind {
        CsvFieldKind::Int => CellValue::Int(
            field
                .parse()
                .map_err(|e| Error::invalid(format!("invalid int cell {field:?}: {e}")))?,
        ),
        CsvFieldKind::Float => CellValue::Float(
            field
                .parse()
                .map_err(|e| Error::invalid(format!("invalid float cell {field:?}: {e}")))?,
        ),
        CsvFieldKind::Bool => CellValue::Int(code_to_bool_id(field)?),
        CsvFieldKind::Str => CellValue::Str(field.to_string()),
    })
}

/// How to parse a CSV field back into a typed [`CellValue`].
#[derive(Debug, Clone, Copy)]
pub enum CsvFieldKind {
    Int,
    Float,
    Bool,
    Str,
}

/// Tag identifying which cell-kind-specific header/row shape to produce.
/// The shared conversion interface named in §9 (Design Notes): a single
/// enum dispatch rather than a trait object, since the set of kinds is
/// closed and known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Parameter,
    Expr,
    Acc,
    AllAcc,
    Microdata,
    Calc,
}

/// Build the CSV header row for a cell kind, per §4.5.
pub struct HeaderSpec {
    pub kind: CellKind,
    pub dims: Vec<String>,
    /// Accumulator or expression names in declaration order (used by Acc/AllAcc/Expr).
    pub item_names: Vec<String>,
    pub is_id_csv: bool,
    pub has_sub_id: bool,
}

pub fn csv_header(spec: &HeaderSpec) -> Vec<String> {
    let mut header = Vec::new();
    match spec.kind {
        CellKind::Parameter => {
            if spec.has_sub_id {
                header.push("sub_id".to_string());
            }
            header.extend(spec.dims.iter().cloned());
            header.push("param_value".to_string());
        }
        CellKind::Expr => {
            header.push(if spec.is_id_csv {
                "expr_id".to_string()
            } else {
                "expr_name".to_string()
            });
            header.extend(spec.dims.iter().cloned());
            header.push("expr_value".to_string());
        }
        CellKind::Calc => {
            header.push("calc_id".to_string());
            header.extend(spec.dims.iter().cloned());
            header.push("calc_value".to_string());
        }
        CellKind::Acc => {
            header.push(if spec.is_id_csv {
                "acc_id".to_string()
            } else {
                "acc_name".to_string()
            });
            header.push("sub_id".to_string());
            header.extend(spec.dims.iter().cloned());
            header.push("acc_value".to_string());
        }
        CellKind::AllAcc => {
            header.push("sub_id".to_string());
            header.extend(spec.dims.iter().cloned());
            header.extend(spec.item_names.iter().cloned());
        }
        CellKind::Microdata => {
            header.push("key".to_string());
            header.extend(spec.dims.iter().cloned());
        }
    }
    header
}

/// How to convert one streamed column's raw storage value into the caller's
/// requested representation (§4.5 "Cell Converters" composed with the
/// orchestrator's per-request `isCode`/`isIdCsv` flag).
#[derive(Debug, Clone)]
pub enum ColumnConv {
    /// Emit the storage value unchanged (numeric measures, `sub_id`, ...).
    Pass,
    /// `0`/`1` (or legacy `-1`) storage id <-> `"true"`/`"false"` code.
    Bool,
    /// Enum-typed dimension/attribute id <-> its declared code.
    EnumCode(TypeDef),
    /// A table's own `expr_id`/`acc_id` <-> its declared name.
    ItemName(Vec<(i64, String)>),
}

/// Resolve the [`ColumnConv`] for a dimension/attribute's `type_id`. Falls
/// back to [`ColumnConv::Pass`] for an unknown type id rather than failing
/// conversion outright; the model loader is the place that should have
/// caught a dangling type reference.
pub fn conv_for_type(model: &Model, type_id: i64) -> ColumnConv {
    let (idx, found) = model.type_by_id(type_id);
    if !found {
        return ColumnConv::Pass;
    }
    let t = &model.types[idx];
    if t.is_bool() {
        ColumnConv::Bool
    } else if t.is_built_in() {
        ColumnConv::Pass
    } else {
        ColumnConv::EnumCode(t.clone())
    }
}

/// Convert one cell per `conv`. When `is_id_csv` is set the caller wants raw
/// storage ids rather than codes/names, so every conversion is a no-op.
pub fn convert_cell(value: &CellValue, conv: &ColumnConv, is_id_csv: bool) -> Result<CellValue> {
    if is_id_csv {
        return Ok(value.clone());
    }
    match conv {
        ColumnConv::Pass => Ok(value.clone()),
        ColumnConv::Bool => match value {
            CellValue::Int(i) => Ok(CellValue::Str(bool_id_to_code(*i)?.to_string())),
            other => Ok(other.clone()),
        },
        ColumnConv::EnumCode(type_def) => match value {
            CellValue::Int(i) => Ok(CellValue::Str(id_to_code(type_def, *i)?)),
            other => Ok(other.clone()),
        },
        ColumnConv::ItemName(pairs) => match value {
            CellValue::Int(i) => pairs
                .iter()
                .find(|(id, _)| id == i)
                .map(|(_, name)| CellValue::Str(name.clone()))
                .ok_or_else(|| Error::not_found(format!("item id {i} not found"))),
            other => Ok(other.clone()),
        },
    }
}

/// Convert a whole streamed row, column by column. A row wider than
/// `columns` passes its extra trailing cells through unconverted.
pub fn convert_row(row: &[CellValue], columns: &[ColumnConv], is_id_csv: bool) -> Result<Vec<CellValue>> {
    row.iter()
        .enumerate()
        .map(|(i, v)| match columns.get(i) {
            Some(conv) => convert_cell(v, conv, is_id_csv),
            None => Ok(v.clone()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EnumDef;

    fn age_type() -> TypeDef {
        TypeDef {
            type_id: 100,
            name: "age_group".into(),
            enums: vec![
                EnumDef {
                    enum_id: 0,
                    code: "young".into(),
                    label: "Young".into(),
                },
                EnumDef {
                    enum_id: 1,
                    code: "old".into(),
                    label: "Old".into(),
                },
            ],
            total_enum_id: Some(2),
        }
    }

    #[test]
    fn code_id_round_trips() {
        let t = age_type();
        for code in ["young", "old", "all"] {
            let id = code_to_id(&t, code).unwrap();
            assert_eq!(id_to_code(&t, id).unwrap(), code);
        }
    }

    #[test]
    fn bool_decode_accepts_legacy_minus_one() {
        assert_eq!(bool_id_to_code(-1).unwrap(), "true");
        assert_eq!(bool_id_to_code(1).unwrap(), "true");
        assert_eq!(bool_id_to_code(0).unwrap(), "false");
        assert!(bool_id_to_code(7).is_err());
    }

    #[test]
    fn bool_encode_is_case_insensitive() {
        assert_eq!(code_to_bool_id("TRUE").unwrap(), 1);
        assert_eq!(code_to_bool_id("False").unwrap(), 0);
    }

    #[test]
    fn csv_null_round_trips() {
        let rendered = to_csv_field(&CellValue::Null, "");
        assert_eq!(rendered, "null");
        for field in ["", "null"] {
            assert_eq!(
                csv_field_to_cell(field, CsvFieldKind::Float).unwrap(),
                CellValue::Null
            );
        }
    }

    #[test]
    fn float_formatting_uses_double_format() {
        assert_eq!(format_float(41.0, "%.15g"), "41");
        assert_eq!(format_float(21.5, "%.15g"), "21.5");
    }

    #[test]
    fn header_shapes_match_spec() {
        let dims = vec!["age".to_string()];
        let accs = vec!["acc0".to_string(), "acc1".to_string()];
        let spec = HeaderSpec {
            kind: CellKind::AllAcc,
            dims: dims.clone(),
            item_names: accs,
            is_id_csv: false,
            has_sub_id: true,
        };
        assert_eq!(
            csv_header(&spec),
            vec!["sub_id", "age", "acc0", "acc1"]
        );

        let spec2 = HeaderSpec {
            kind: CellKind::Parameter,
            dims: dims.clone(),
            item_names: vec![],
            is_id_csv: false,
            has_sub_id: false,
        };
        assert_eq!(csv_header(&spec2), vec!["age", "param_value"]);
    }

    #[test]
    fn calc_header_is_distinct_from_expr_header() {
        let dims = vec!["age".to_string()];
        let spec = HeaderSpec {
            kind: CellKind::Calc,
            dims: dims.clone(),
            item_names: vec![],
            is_id_csv: false,
            has_sub_id: false,
        };
        assert_eq!(csv_header(&spec), vec!["calc_id", "age", "calc_value"]);
    }

    #[test]
    fn convert_row_passes_through_and_maps_enum_codes() {
        let t = age_type();
        let columns = vec![ColumnConv::Pass, ColumnConv::EnumCode(t)];
        let row = vec![CellValue::Int(5), CellValue::Int(1)];
        let converted = convert_row(&row, &columns, false).unwrap();
        assert_eq!(converted[0], CellValue::Int(5));
        assert_eq!(converted[1], CellValue::Str("old".to_string()));

        let raw = convert_row(&row, &columns, true).unwrap();
        assert_eq!(raw[1], CellValue::Int(1));
    }
}
