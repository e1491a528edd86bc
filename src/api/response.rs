//! Response serialization helpers.
//!
//! Every outbound body passes through [`clean_json`], the single place
//! where non-finite floats become JSON null. Aggregates computed over
//! sparse history (averages over empty windows, divisions by zero
//! distance) produce NaN; browsers reject it as invalid JSON.

use serde::Serialize;
use serde_json::Value;

/// Serialize any value to a JSON tree with NaN/Infinity mapped to null.
pub fn clean_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
