//! Sink row shaping
//!
//! The sink's write protocol requires every Symbol (tag) column of a row to come before
//! any other column. [`SinkRow`] enforces that on insertion, and [`RowMapper`] lays out
//! one row per decoded signal in a fixed column order per value type:
//!
//! | value type | columns                                                      |
//! |------------|--------------------------------------------------------------|
//! | enum       | `name`, `enum_value`, `can_id`, `raw_value`                  |
//! | flag       | `name`, `can_id`, `raw_value`, `flag_value`                  |
//! | integer    | `name`, `can_id`, `raw_value`, `integer_value`               |
//! | float      | `name`, `can_id`, `raw_value`, `float_value`                 |

use crate::stage::Handler;
use crate::types::{DecodedSignal, Result, SignalBatch, SignalTable, SignalValue, TelemetryError, Timestamp};
use serde::Serialize;

/// A typed column value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ColumnValue {
    /// Indexed string tag
    Symbol(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl ColumnValue {
    pub fn is_symbol(&self) -> bool {
        matches!(self, ColumnValue::Symbol(_))
    }

    /// Short name of the value kind
    pub fn kind(&self) -> &'static str {
        match self {
            ColumnValue::Symbol(_) => "symbol",
            ColumnValue::Integer(_) => "integer",
            ColumnValue::Float(_) => "float",
            ColumnValue::Bool(_) => "bool",
        }
    }
}

/// A named column
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub value: ColumnValue,
}

/// One row destined for a sink table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkRow {
    pub table: String,
    pub timestamp: Timestamp,
    columns: Vec<Column>,
}

impl SinkRow {
    pub fn new(table: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            table: table.into(),
            timestamp,
            columns: Vec::new(),
        }
    }

    /// Append a column
    ///
    /// A Symbol column after any non-Symbol column is rejected and the row is left
    /// unchanged.
    pub fn add_column(&mut self, name: impl Into<String>, value: ColumnValue) -> Result<()> {
        let name = name.into();
        if value.is_symbol() && self.columns.iter().any(|c| !c.value.is_symbol()) {
            return Err(TelemetryError::ColumnOrder { column: name });
        }
        self.columns.push(Column { name, value });
        Ok(())
    }

    /// Builder form of [`SinkRow::add_column`]
    pub fn with_column(mut self, name: impl Into<String>, value: ColumnValue) -> Result<Self> {
        self.add_column(name, value)?;
        Ok(self)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Look a column value up by name
    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.iter().find(|c| c.name == name).map(|c| &c.value)
    }

    /// True when no Symbol column follows a non-Symbol column
    pub fn is_well_ordered(&self) -> bool {
        let first_field = self
            .columns
            .iter()
            .position(|c| !c.value.is_symbol())
            .unwrap_or(self.columns.len());
        self.columns[first_field..].iter().all(|c| !c.value.is_symbol())
    }
}

/// Rows produced from one signal batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowBatch {
    pub sequence_number: u8,
    pub rows: Vec<SinkRow>,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Shapes decoded signals into sink rows
#[derive(Debug, Default)]
pub struct RowMapper;

impl RowMapper {
    pub fn new() -> Self {
        Self
    }

    /// Build the row for one decoded signal
    pub fn map_signal(signal: &DecodedSignal, timestamp: Timestamp) -> Result<SinkRow> {
        let mut row = SinkRow::new(Self::table_for(signal).as_str(), timestamp);
        row.add_column("name", ColumnValue::Symbol(signal.name.clone()))?;

        let can_id = ColumnValue::Integer(i64::from(signal.frame_id));
        let raw_value = ColumnValue::Integer(Self::raw_column_value(signal));

        if let SignalValue::Enum(label) = &signal.value {
            row.add_column("enum_value", ColumnValue::Symbol(label.clone()))?;
            row.add_column("can_id", can_id)?;
            row.add_column("raw_value", raw_value)?;
            return Ok(row);
        }

        row.add_column("can_id", can_id)?;
        row.add_column("raw_value", raw_value)?;
        match &signal.value {
            SignalValue::Flag(v) => row.add_column("flag_value", ColumnValue::Bool(*v))?,
            SignalValue::Integer(v) => row.add_column("integer_value", ColumnValue::Integer(*v))?,
            SignalValue::Float(v) => row.add_column("float_value", ColumnValue::Float(*v))?,
            SignalValue::Enum(_) => {}
        }
        Ok(row)
    }

    /// Raw bits as a sink integer, saturated at `i64::MAX` for 64-bit raw values
    fn raw_column_value(signal: &DecodedSignal) -> i64 {
        i64::try_from(signal.raw_value).unwrap_or_else(|_| {
            log::warn!(
                "Signal '{}' of frame 0x{:X}: raw value {} exceeds the integer column, saturating",
                signal.name,
                signal.frame_id,
                signal.raw_value
            );
            i64::MAX
        })
    }

    /// Table a signal is written to
    ///
    /// Follows the decoded value; a value whose kind disagrees with the declared value
    /// type lands in the unknown table.
    fn table_for(signal: &DecodedSignal) -> SignalTable {
        if signal.value.value_type() == signal.value_type {
            signal.table
        } else {
            SignalTable::Unknown
        }
    }

    /// Map a whole batch; rows carry the batch's reception time
    pub fn map_batch(batch: &SignalBatch) -> Result<RowBatch> {
        let rows = batch
            .signals
            .iter()
            .map(|signal| Self::map_signal(signal, batch.received_at))
            .collect::<Result<Vec<_>>>()?;

        Ok(RowBatch {
            sequence_number: batch.sequence_number,
            rows,
        })
    }
}

impl Handler for RowMapper {
    type In = SignalBatch;
    type Out = RowBatch;

    fn handle(&self, batch: SignalBatch) -> Result<Option<RowBatch>> {
        let rows = Self::map_batch(&batch)?;
        Ok(if rows.is_empty() { None } else { Some(rows) })
    }
}
