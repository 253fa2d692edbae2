//! Structural merge of a change map into a stored map.

use crate::types::{Field, Value};

/// Apply the fields of `changes` to `target`.
///
/// Field policy:
/// - a field missing from `target` is appended;
/// - an existing array field is replaced wholesale (never concatenated);
/// - an existing map field is merged recursively;
/// - an existing scalar field is overwritten.
///
/// Both sides must be maps; otherwise nothing happens. An existing map field
/// receiving a non-map change is left as is.
pub fn apply_changes(target: &mut Value, changes: &Value) {
    let (fields, incoming) = match (target, changes) {
        (Value::Map(fields), Value::Map(incoming)) => (fields, incoming),
        _ => return,
    };

    for change in incoming {
        let existing = match fields.iter().position(|f| f.name == change.name) {
            Some(i) => &mut fields[i],
            None => {
                fields.push(Field::new(change.name.as_str(), change.value.clone()));
                continue;
            }
        };

        match existing.value {
            Value::Array(_) => existing.value = change.value.clone(),
            Value::Map(_) => apply_changes(&mut existing.value, &change.value),
            Value::Scalar(_) => existing.value = change.value.clone(),
        }
    }
}
