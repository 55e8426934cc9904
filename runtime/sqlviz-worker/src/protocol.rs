//! Messages exchanged between the caller and the worker.

use serde::{Deserialize, Serialize};
use sqlviz_db::{ColumnData, ExecResult, ImportSummary, Params, ProgressUpdate, TableSchema};
use thiserror::Error;

pub const QUEUE_FULL: &str = "Worker queue full";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid action : {0}")]
    InvalidAction(String),
    #[error("{action}: missing {field}")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },
    #[error("Invalid request: {0}")]
    Decode(String),
    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// One call, as it travels on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: u64,
    pub action: String,
    #[serde(default, with = "image_opt", skip_serializing_if = "Option::is_none")]
    pub buffer: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ColumnData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_counter_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
}

/// A request after validation.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Open {
        image: Option<Vec<u8>>,
    },
    Reopen,
    Exec {
        sql: String,
        params: Option<Params>,
    },
    Import {
        table: String,
        data: ColumnData,
        counter: Option<u64>,
        chunk_size: Option<usize>,
    },
    Export,
    Close,
    Schema,
}

impl Command {
    pub fn action(&self) -> &'static str {
        match self {
            Command::Open { .. } => "open",
            Command::Reopen => "reopen",
            Command::Exec { .. } => "exec",
            Command::Import { .. } => "import",
            Command::Export => "export",
            Command::Close => "close",
            Command::Schema => "schema",
        }
    }

    pub fn into_request(self, id: u64) -> Request {
        let mut request = Request {
            id,
            action: self.action().to_string(),
            ..Request::default()
        };
        match self {
            Command::Open { image } => request.buffer = image,
            Command::Exec { sql, params } => {
                request.sql = Some(sql);
                request.params = params;
            }
            Command::Import {
                table,
                data,
                counter,
                chunk_size,
            } => {
                request.table = Some(table);
                request.data = Some(data);
                request.progress_counter_id = counter;
                request.chunk_size = chunk_size;
            }
            Command::Reopen | Command::Export | Command::Close | Command::Schema => {}
        }
        request
    }
}

impl TryFrom<Request> for Command {
    type Error = ProtocolError;

    fn try_from(request: Request) -> Result<Self, Self::Error> {
        Ok(match request.action.as_str() {
            "open" => Command::Open {
                image: request.buffer,
            },
            "reopen" => Command::Reopen,
            // A missing query is reported by the session itself.
            "exec" => Command::Exec {
                sql: request.sql.unwrap_or_default(),
                params: request.params,
            },
            "import" => Command::Import {
                table: request.table.ok_or(ProtocolError::MissingField {
                    action: "import",
                    field: "table",
                })?,
                data: request.data.ok_or(ProtocolError::MissingField {
                    action: "import",
                    field: "data",
                })?,
                counter: request.progress_counter_id,
                chunk_size: request.chunk_size,
            },
            "export" => Command::Export,
            "close" => Command::Close,
            "schema" => Command::Schema,
            other => return Err(ProtocolError::InvalidAction(other.to_string())),
        })
    }
}

/// Successful outcome of one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Payload {
    Ready,
    Results(Vec<ExecResult>),
    Imported(ImportSummary),
    Database(#[serde(with = "image")] Vec<u8>),
    Closed,
    Schema(Vec<TableSchema>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ok(id: u64, payload: Payload) -> Self {
        Self {
            id,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            payload: None,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<Payload, String> {
        match (self.error, self.payload) {
            (Some(error), _) => Err(error),
            (None, Some(payload)) => Ok(payload),
            (None, None) => Err(format!("reply {} carries neither payload nor error", self.id)),
        }
    }
}

/// Anything the worker sends back. Progress is tried first when decoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    Progress(ProgressUpdate),
    Reply(Reply),
}

/// Byte images: base64 text for human-readable formats, raw bytes otherwise.
/// Either form is accepted when decoding.
pub(crate) mod image {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&BASE64.encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_any(ImageVisitor)
    }

    struct ImageVisitor;

    impl<'de> Visitor<'de> for ImageVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a base64 string or a byte array")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<u8>, E> {
            BASE64
                .decode(v)
                .map_err(|err| E::custom(format!("Invalid base64 image: {err}")))
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                bytes.push(byte);
            }
            Ok(bytes)
        }
    }
}

pub(crate) mod image_opt {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => super::image::serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        deserializer.deserialize_option(OptionalImage)
    }

    struct OptionalImage;

    impl<'de> Visitor<'de> for OptionalImage {
        type Value = Option<Vec<u8>>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an optional byte image")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
            super::image::deserialize(deserializer).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_decodes_camel_case_fields() {
        let request: Request = serde_json::from_value(json!({
            "id": 4,
            "action": "import",
            "table": "t",
            "data": {"columns": ["a"], "values": {"a": [1, 2]}},
            "progressCounterId": 9,
            "chunkSize": 2
        }))
        .expect("decode");
        let command = Command::try_from(request).expect("command");
        assert_eq!(
            command,
            Command::Import {
                table: "t".into(),
                data: ColumnData::new().with_column("a", [1i64, 2]),
                counter: Some(9),
                chunk_size: Some(2),
            }
        );
    }

    #[test]
    fn unknown_actions_and_missing_fields_are_reported() {
        let unknown = Request {
            id: 1,
            action: "drop".into(),
            ..Request::default()
        };
        let err = Command::try_from(unknown).expect_err("unknown");
        assert_eq!(err.to_string(), "Invalid action : drop");

        let missing = Request {
            id: 2,
            action: "import".into(),
            ..Request::default()
        };
        let err = Command::try_from(missing).expect_err("missing");
        assert_eq!(err.to_string(), "import: missing table");
    }

    #[test]
    fn images_are_base64_in_json() {
        let request = Command::Open {
            image: Some(vec![0, 1, 2, 255]),
        }
        .into_request(3);
        let encoded = serde_json::to_value(&request).expect("encode");
        assert_eq!(encoded["buffer"], json!("AAEC/w=="));
        let decoded: Request = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded.buffer, Some(vec![0, 1, 2, 255]));

        let null_buffer: Request =
            serde_json::from_value(json!({"id": 1, "action": "open", "buffer": null}))
                .expect("null buffer");
        assert_eq!(null_buffer.buffer, None);
    }

    #[test]
    fn reply_shapes() {
        let ready = serde_json::to_value(Reply::ok(1, Payload::Ready)).expect("ready");
        assert_eq!(ready, json!({"id": 1, "payload": "ready"}));
        let failed = serde_json::to_value(Reply::error(2, "boom")).expect("error");
        assert_eq!(failed, json!({"id": 2, "error": "boom"}));
        let db = serde_json::to_value(Reply::ok(3, Payload::Database(vec![1, 2, 3]))).expect("db");
        assert_eq!(db, json!({"id": 3, "payload": {"database": "AQID"}}));
    }

    #[test]
    fn outbound_distinguishes_progress_from_replies() {
        let progress: Outbound =
            serde_json::from_value(json!({"id": 0, "progress": 50.0})).expect("progress");
        assert_eq!(
            progress,
            Outbound::Progress(ProgressUpdate {
                id: 0,
                progress: 50.0
            })
        );
        let reply: Outbound =
            serde_json::from_value(json!({"id": 5, "payload": "closed"})).expect("reply");
        assert_eq!(reply, Outbound::Reply(Reply::ok(5, Payload::Closed)));
    }

    #[test]
    fn into_result_prefers_the_error() {
        assert_eq!(Reply::error(1, "bad").into_result(), Err("bad".to_string()));
        assert_eq!(Reply::ok(1, Payload::Closed).into_result(), Ok(Payload::Closed));
    }
}
