//! Table schema and per-value type checks.

use csv::StringRecord;
use serde::{Deserialize, Serialize};

use super::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Int64,
    Float64,
    String,
}

impl FieldType {
    /// Whether a non-empty CSV cell parses as this type.
    pub fn accepts(self, value: &str) -> bool {
        match self {
            FieldType::Int64 => value.trim().parse::<i64>().is_ok(),
            FieldType::Float64 => value.trim().parse::<f64>().is_ok(),
            FieldType::String => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Int64 => "INT64",
            FieldType::Float64 => "FLOAT64",
            FieldType::String => "STRING",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
}

impl SchemaField {
    pub fn nullable(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            mode: FieldMode::Nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    /// Green taxi trip records: twenty nullable columns in file order.
    pub fn green_trips() -> Self {
        use FieldType::{Float64, Int64, String};
        let fields = [
            ("VendorID", Int64),
            ("lpep_pickup_datetime", String),
            ("lpep_dropoff_datetime", String),
            ("store_and_fwd_flag", String),
            ("RatecodeID", Float64),
            ("PULocationID", Float64),
            ("DOLocationID", Float64),
            ("passenger_count", Float64),
            ("trip_distance", Float64),
            ("fare_amount", Float64),
            ("extra", Float64),
            ("mta_tax", Float64),
            ("tip_amount", Float64),
            ("tolls_amount", Float64),
            ("ehail_fee", Float64),
            ("improvement_surcharge", Float64),
            ("total_amount", Float64),
            ("payment_type", Float64),
            ("trip_type", Float64),
            ("congestion_surcharge", Float64),
        ];
        Self {
            fields: fields
                .iter()
                .map(|(name, ty)| SchemaField::nullable(name, *ty))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Check one data record. `line` is 1-based within `object`.
    /// Empty cells are NULL.
    pub fn validate_record(
        &self,
        object: &str,
        line: u64,
        record: &StringRecord,
    ) -> Result<(), LoadError> {
        if record.len() != self.fields.len() {
            return Err(LoadError::ColumnCount {
                object: object.to_string(),
                line,
                expected: self.fields.len(),
                found: record.len(),
            });
        }
        for (field, value) in self.fields.iter().zip(record.iter()) {
            if value.is_empty() {
                if field.mode == FieldMode::Required {
                    return Err(LoadError::NullInRequired {
                        object: object.to_string(),
                        line,
                        column: field.name.clone(),
                    });
                }
                continue;
            }
            if !field.field_type.accepts(value) {
                return Err(LoadError::InvalidValue {
                    object: object.to_string(),
                    line,
                    column: field.name.clone(),
                    expected: field.field_type.as_str(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cells: &[&str]) -> StringRecord {
        StringRecord::from(cells.to_vec())
    }

    fn small() -> TableSchema {
        TableSchema {
            fields: vec![
                SchemaField::nullable("id", FieldType::Int64),
                SchemaField {
                    name: "fare".into(),
                    field_type: FieldType::Float64,
                    mode: FieldMode::Required,
                },
                SchemaField::nullable("flag", FieldType::String),
            ],
        }
    }

    #[test]
    fn green_trip_schema_shape() {
        let schema = TableSchema::green_trips();
        assert_eq!(schema.len(), 20);
        assert_eq!(schema.fields[0].name, "VendorID");
        assert_eq!(schema.fields[0].field_type, FieldType::Int64);
        assert_eq!(schema.fields[19].name, "congestion_surcharge");
        assert!(schema.fields.iter().all(|f| f.mode == FieldMode::Nullable));
    }

    #[test]
    fn serializes_in_warehouse_form() {
        let json =
            serde_json::to_value(SchemaField::nullable("VendorID", FieldType::Int64)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "VendorID", "type": "INT64", "mode": "NULLABLE"})
        );
    }

    #[test]
    fn accepts_valid_and_null_cells() {
        let schema = small();
        assert!(schema.validate_record("o", 2, &record(&["1", "2.5", "N"])).is_ok());
        assert!(schema.validate_record("o", 2, &record(&["", "2", ""])).is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let schema = small();
        let err = schema
            .validate_record("o", 3, &record(&["1.5", "2", "N"]))
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidValue { line: 3, .. }));

        let err = schema.validate_record("o", 4, &record(&["1", "", "N"])).unwrap_err();
        assert!(matches!(err, LoadError::NullInRequired { .. }));

        let err = schema.validate_record("o", 5, &record(&["1", "2"])).unwrap_err();
        assert!(matches!(
            err,
            LoadError::ColumnCount {
                expected: 3,
                found: 2,
                ..
            }
        ));
    }
}
