//! Header reconciliation between a table and the view reading from it.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::{can_cast_types, cast};
use arrow::datatypes::{Field, FieldRef, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::error::{BlazeError, Result};

/// How result columns are found among source columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchColumnsMode {
    /// The i-th result column comes from the i-th source column
    Position,
    /// Result columns are looked up by name
    Name,
}

/// Where one result column comes from and what it is cast to.
#[derive(Debug, Clone)]
struct ColumnConversion {
    source_name: String,
    source_position: usize,
    result: FieldRef,
    needs_cast: bool,
}

/// Converts blocks of one header into another header, casting types where
/// they differ.
#[derive(Debug, Clone)]
pub struct ConvertingActions {
    source: SchemaRef,
    result: SchemaRef,
    mode: MatchColumnsMode,
    conversions: Vec<ColumnConversion>,
    project_input: bool,
}

impl ConvertingActions {
    /// Plan the conversion of `source` into `result`.
    pub fn new(source: &Schema, result: &Schema, mode: MatchColumnsMode) -> Result<Self> {
        if mode == MatchColumnsMode::Position && source.fields().len() != result.fields().len() {
            return Err(BlazeError::bad_arguments(format!(
                "Number of columns doesn't match: source has {}, result has {}",
                source.fields().len(),
                result.fields().len()
            )));
        }

        let mut conversions = Vec::with_capacity(result.fields().len());
        for (i, result_field) in result.fields().iter().enumerate() {
            let source_position = match mode {
                MatchColumnsMode::Position => i,
                MatchColumnsMode::Name => source.index_of(result_field.name()).map_err(|_| {
                    BlazeError::bad_arguments(format!(
                        "Cannot find column `{}` in source stream",
                        result_field.name()
                    ))
                })?,
            };
            let source_field = source.field(source_position);
            let needs_cast = source_field.data_type() != result_field.data_type();
            if needs_cast && !can_cast_types(source_field.data_type(), result_field.data_type()) {
                return Err(BlazeError::bad_arguments(format!(
                    "Cannot convert column `{}` from {} to {}",
                    result_field.name(),
                    source_field.data_type(),
                    result_field.data_type()
                )));
            }
            conversions.push(ColumnConversion {
                source_name: source_field.name().clone(),
                source_position,
                result: result_field.clone(),
                needs_cast,
            });
        }

        Ok(Self {
            source: Arc::new(source.clone()),
            result: Arc::new(result.clone()),
            mode,
            conversions,
            project_input: true,
        })
    }

    /// With `project_input` off, input columns the conversion does not use
    /// are passed through after the converted ones instead of being dropped.
    pub fn project_input(&mut self, project_input: bool) {
        self.project_input = project_input;
    }

    pub fn source_header(&self) -> &SchemaRef {
        &self.source
    }

    pub fn result_header(&self) -> &SchemaRef {
        &self.result
    }

    /// Number of columns whose type changes.
    pub fn num_casts(&self) -> usize {
        self.conversions.iter().filter(|c| c.needs_cast).count()
    }

    /// Header produced for an input block with header `input`.
    pub fn output_header(&self, input: &Schema) -> SchemaRef {
        let mut fields: Vec<FieldRef> = self.conversions.iter().map(|c| c.result.clone()).collect();
        if !self.project_input {
            let used = self.used_input_names();
            fields.extend(
                input
                    .fields()
                    .iter()
                    .filter(|f| !used.contains(f.name().as_str()))
                    .cloned(),
            );
        }
        Arc::new(Schema::new(fields))
    }

    /// Convert one block.
    pub fn execute(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let input = batch.schema();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(input.fields().len());
        for conversion in &self.conversions {
            let position = match self.mode {
                MatchColumnsMode::Position => conversion.source_position,
                MatchColumnsMode::Name => input.index_of(&conversion.source_name)?,
            };
            let column = batch.column(position);
            if conversion.needs_cast || column.data_type() != conversion.result.data_type() {
                columns.push(cast(column, conversion.result.data_type())?);
            } else {
                columns.push(column.clone());
            }
        }
        if !self.project_input {
            let used = self.used_input_names();
            for (i, field) in input.fields().iter().enumerate() {
                if !used.contains(field.name().as_str()) {
                    columns.push(batch.column(i).clone());
                }
            }
        }
        Ok(RecordBatch::try_new(self.output_header(&input), columns)?)
    }

    fn used_input_names(&self) -> HashSet<&str> {
        self.conversions
            .iter()
            .map(|c| c.source_name.as_str())
            .collect()
    }
}

/// Drop from `target` every column whose name does not appear in `src`.
pub fn remove_non_common_columns(src: &Schema, target: &Schema) -> Schema {
    let fields: Vec<FieldRef> = target
        .fields()
        .iter()
        .filter(|f| src.field_with_name(f.name()).is_ok())
        .cloned()
        .collect();
    Schema::new(fields)
}

/// Same column names and types in the same order.
pub fn blocks_have_equal_structure(a: &Schema, b: &Schema) -> bool {
    a.fields().len() == b.fields().len()
        && a
            .fields()
            .iter()
            .zip(b.fields().iter())
            .all(|(x, y)| x.name() == y.name() && x.data_type() == y.data_type())
}

/// Columns of `schema` named in `names`, in the order of `names`. Names the
/// schema does not contain are skipped.
pub fn project_known_columns(schema: &Schema, names: &[String]) -> Schema {
    let fields: Vec<Field> = names
        .iter()
        .filter_map(|name| schema.field_with_name(name).ok().cloned())
        .collect();
    Schema::new(fields)
}

/// Columns of `schema` named in `names`, in the order of `names`.
pub fn project_columns(schema: &Schema, names: &[String]) -> Result<Schema> {
    let fields = names
        .iter()
        .map(|name| {
            schema.field_with_name(name).cloned().map_err(|_| {
                BlazeError::bad_arguments(format!("There is no column with name `{}`", name))
            })
        })
        .collect::<Result<Vec<Field>>>()?;
    Ok(Schema::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, Int64Array, StringArray};
    use arrow::datatypes::DataType;

    fn schema(fields: &[(&str, DataType)]) -> Schema {
        Schema::new(
            fields
                .iter()
                .map(|(n, t)| Field::new(*n, t.clone(), true))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_remove_non_common_columns() {
        let view = schema(&[("a", DataType::Int64), ("b", DataType::Utf8)]);
        let target = schema(&[
            ("a", DataType::Int64),
            ("c", DataType::Utf8),
            ("b", DataType::Utf8),
        ]);
        let trimmed = remove_non_common_columns(&view, &target);
        let names: Vec<_> = trimmed.fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_equal_structure_is_order_sensitive() {
        let ab = schema(&[("a", DataType::Int64), ("b", DataType::Utf8)]);
        let ba = schema(&[("b", DataType::Utf8), ("a", DataType::Int64)]);
        assert!(blocks_have_equal_structure(&ab, &ab.clone()));
        assert!(!blocks_have_equal_structure(&ab, &ba));
    }

    #[test]
    fn test_convert_by_name_with_passthrough() {
        let source = schema(&[
            ("b", DataType::Utf8),
            ("a", DataType::Int32),
            ("joined", DataType::Utf8),
        ]);
        let result = schema(&[("a", DataType::Int64), ("b", DataType::Utf8)]);
        let mut actions = ConvertingActions::new(&source, &result, MatchColumnsMode::Name).unwrap();
        actions.project_input(false);
        assert_eq!(actions.num_casts(), 1);

        let batch = RecordBatch::try_new(
            Arc::new(source),
            vec![
                Arc::new(StringArray::from(vec!["x", "y"])),
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec!["j1", "j2"])),
            ],
        )
        .unwrap();

        let out = actions.execute(&batch).unwrap();
        let names: Vec<_> = out.schema().fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(names, vec!["a", "b", "joined"]);
        let a = out.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(a.value(0), 1);
        assert_eq!(a.value(1), 2);
    }

    #[test]
    fn test_convert_by_name_projects_by_default() {
        let source = schema(&[("a", DataType::Int64), ("extra", DataType::Utf8)]);
        let result = schema(&[("a", DataType::Int64)]);
        let actions = ConvertingActions::new(&source, &result, MatchColumnsMode::Name).unwrap();
        let header = actions.output_header(&source);
        assert_eq!(header.fields().len(), 1);
    }

    #[test]
    fn test_missing_column_rejected() {
        let source = schema(&[("a", DataType::Int64)]);
        let result = schema(&[("z", DataType::Int64)]);
        let err = ConvertingActions::new(&source, &result, MatchColumnsMode::Name).unwrap_err();
        assert!(matches!(err, BlazeError::BadArguments { .. }));
    }

    #[test]
    fn test_position_mode_requires_same_width() {
        let source = schema(&[("a", DataType::Int64)]);
        let result = schema(&[("a", DataType::Int64), ("b", DataType::Int64)]);
        assert!(ConvertingActions::new(&source, &result, MatchColumnsMode::Position).is_err());
    }

    #[test]
    fn test_project_columns() {
        let s = schema(&[("a", DataType::Int64), ("b", DataType::Utf8)]);
        let projected = project_columns(&s, &["b".to_string()]).unwrap();
        assert_eq!(projected.field(0).name(), "b");
        assert!(project_columns(&s, &["z".to_string()]).is_err());
        assert_eq!(
            project_known_columns(&s, &["z".to_string(), "a".to_string()])
                .fields()
                .len(),
            1
        );
    }
}
