//! Joining streamed fragments back into a single value.
//!
//! A stage that cannot consume its input incrementally receives the
//! aggregate of every upstream fragment. The rules mirror what a streamed
//! response looks like once complete:
//!
//! - strings concatenate, arrays append
//! - objects merge key by key; `role` must agree and is kept once
//! - equal scalars are kept once
//!
//! Anything else is a shape error.

use crate::error::{describe, StageFault, StageResult};
use serde_json::{Map, Value};

/// Keys whose values identify a fragment rather than carry its payload.
const IDENTITY_KEYS: &[&str] = &["role"];

/// Append `next` onto `acc`.
pub fn concat(acc: Value, next: Value) -> StageResult<Value> {
    match (acc, next) {
        (Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Ok(Value::String(a))
        }
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (Value::Object(a), Value::Object(b)) => merge_objects(a, b).map(Value::Object),
        (a, b) if a == b => Ok(a),
        (a, b) => Err(mismatch(&a, &b)),
    }
}

/// Aggregate every fragment in order. No fragments aggregate to `null`.
pub fn concat_all<I>(fragments: I) -> StageResult<Value>
where
    I: IntoIterator<Item = Value>,
{
    let mut iter = fragments.into_iter();
    let Some(first) = iter.next() else {
        return Ok(Value::Null);
    };
    iter.try_fold(first, concat)
}

fn merge_objects(mut acc: Map<String, Value>, next: Map<String, Value>) -> StageResult<Map<String, Value>> {
    for (key, value) in next {
        match acc.remove(&key) {
            None => {
                acc.insert(key, value);
            }
            Some(existing) if IDENTITY_KEYS.contains(&key.as_str()) => {
                if existing != value {
                    return Err(mismatch(&existing, &value));
                }
                acc.insert(key, existing);
            }
            Some(existing) => {
                let merged = concat(existing, value)?;
                acc.insert(key, merged);
            }
        }
    }
    Ok(acc)
}

fn mismatch(acc: &Value, next: &Value) -> StageFault {
    StageFault::Input {
        expected: format!("fragments that can be joined onto {}", describe(acc)),
        found: describe(next),
    }
}
