//! Conversion of configuration argument maps to AMQP field tables.
//!
//! Declare and consume calls accept free-form `args`; configs carry them as
//! JSON values. The conversion is the validation step: a value that has no
//! field-table representation is rejected before it reaches the broker.

use cv_config::Args;
use lapin::types::{AMQPValue, FieldTable};

use crate::Error;

/// Convert an argument map into a lapin [`FieldTable`].
pub fn field_table(args: &Args) -> Result<FieldTable, Error> {
    let mut table = FieldTable::default();
    for (key, value) in args {
        table.insert(key.as_str().into(), amqp_value(key, value)?);
    }
    Ok(table)
}

fn amqp_value(key: &str, value: &serde_json::Value) -> Result<AMQPValue, Error> {
    use serde_json::Value;

    match value {
        Value::Null => Ok(AMQPValue::Void),
        Value::Bool(b) => Ok(AMQPValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(AMQPValue::LongLongInt(i))
            } else if n.is_u64() {
                // Out of signed 64-bit range, no field-table encoding.
                Err(Error::InvalidArgs(key.to_string()))
            } else if let Some(f) = n.as_f64() {
                Ok(AMQPValue::Double(f))
            } else {
                Err(Error::InvalidArgs(key.to_string()))
            }
        }
        Value::String(s) => Ok(AMQPValue::LongString(s.clone().into())),
        Value::Array(items) => {
            let values = items
                .iter()
                .map(|item| amqp_value(key, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(AMQPValue::FieldArray(values.into()))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (inner_key, inner_value) in map {
                table.insert(inner_key.as_str().into(), amqp_value(inner_key, inner_value)?);
            }
            Ok(AMQPValue::FieldTable(table))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;
    use serde_json::json;

    fn args(pairs: &[(&str, serde_json::Value)]) -> Args {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn scalar_values_convert() {
        let table = field_table(&args(&[
            ("x-max-priority", json!(10)),
            ("x-queue-mode", json!("lazy")),
            ("x-single-active-consumer", json!(true)),
        ]))
        .unwrap();

        assert_eq!(
            table.inner().get(&ShortString::from("x-max-priority")),
            Some(&AMQPValue::LongLongInt(10))
        );
        assert_eq!(
            table.inner().get(&ShortString::from("x-single-active-consumer")),
            Some(&AMQPValue::Boolean(true))
        );
    }

    #[test]
    fn nested_tables_and_arrays_convert() {
        let table = field_table(&args(&[(
            "x-arguments",
            json!({"retries": [1, 2, 3], "dead-letter": {"exchange": "dlx"}}),
        )]))
        .unwrap();
        assert!(table
            .inner()
            .contains_key(&ShortString::from("x-arguments")));
    }

    #[test]
    fn unrepresentable_number_is_rejected() {
        let result = field_table(&args(&[("x-huge", json!(u64::MAX))]));
        assert!(matches!(result, Err(Error::InvalidArgs(key)) if key == "x-huge"));
    }

    #[test]
    fn empty_args_yield_empty_table() {
        let table = field_table(&Args::new()).unwrap();
        assert!(table.inner().is_empty());
    }
}
