// Test case payload decoding
use gauntlet_common::types::{RunError, RunErrorKind, TestCase};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a JSON array of test-case records: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("test case {ordinal}: field `{field}` is not valid JSON: {source}")]
    Field {
        ordinal: usize,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<DecodeError> for RunError {
    fn from(err: DecodeError) -> Self {
        RunError::new(RunErrorKind::MalformedPayload, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct Fields {
    input_data: Value,
    expected_output: Value,
}

/// Either a bare record or a model-serializer envelope (`{"model", "pk", "fields"}`)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Record {
    Envelope { fields: Fields },
    Flat(Fields),
}

impl Record {
    fn into_fields(self) -> Fields {
        match self {
            Record::Envelope { fields } => fields,
            Record::Flat(fields) => fields,
        }
    }
}

/// Decode the whole payload; any bad field fails the whole suite
pub fn decode(payload: &str) -> Result<Vec<TestCase>, DecodeError> {
    let records: Vec<Record> = serde_json::from_str(payload).map_err(DecodeError::Payload)?;

    records
        .into_iter()
        .enumerate()
        .map(|(ordinal, record)| {
            let fields = record.into_fields();
            Ok(TestCase {
                ordinal,
                input_value: decode_field(fields.input_data, ordinal, "input_data")?,
                expected_output: decode_field(fields.expected_output, ordinal, "expected_output")?,
            })
        })
        .collect()
}

/// String fields hold serialized JSON; anything else is taken as already decoded
fn decode_field(raw: Value, ordinal: usize, field: &'static str) -> Result<Value, DecodeError> {
    match raw {
        Value::String(text) => serde_json::from_str(&text)
            .map_err(|source| DecodeError::Field { ordinal, field, source }),
        other => Ok(other),
    }
}
