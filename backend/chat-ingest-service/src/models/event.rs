use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use validator::Validate;

use crate::error::{IngestError, IngestResult};

/// Chat message event as published by the socket gateway
///
/// Every field is optional at the serde level so that a missing field is
/// reported as a validation failure naming the field, not as a parse error.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageEvent {
    #[validate(required, length(max = 255))]
    pub event_id: Option<String>,

    #[serde(default, deserialize_with = "empty_as_none")]
    #[validate(length(max = 255))]
    pub client_msg_id: Option<String>,

    #[validate(required, length(max = 255))]
    pub conversation_id: Option<String>,

    #[serde(default, deserialize_with = "empty_as_none")]
    #[validate(required, length(max = 255))]
    pub sender_id: Option<String>,

    #[serde(default, deserialize_with = "empty_as_none")]
    #[validate(length(max = 255))]
    pub recipient_id: Option<String>,

    /// Gateway spelling of `senderId`, used when `senderId` is absent
    #[serde(rename = "from", default, deserialize_with = "empty_as_none")]
    pub from: Option<String>,

    /// Gateway spelling of `recipientId`, used when `recipientId` is absent
    #[serde(rename = "to", default, deserialize_with = "empty_as_none")]
    pub to: Option<String>,

    #[validate(required)]
    pub content: Option<String>,

    #[serde(default, deserialize_with = "empty_as_none")]
    #[validate(length(max = 2048))]
    pub attachment_url: Option<String>,

    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub sent_at: Option<DateTime<Utc>>,
}

/// Event that passed validation, ready to persist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEvent {
    pub event_id: String,
    pub client_msg_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub content: String,
    pub attachment_url: Option<String>,
    /// Event time, or ingestion time when the producer sent none
    pub created_at: DateTime<Utc>,
}

impl ChatMessageEvent {
    /// Decode a record payload
    pub fn from_payload(payload: Option<&[u8]>) -> IngestResult<Self> {
        let bytes = match payload {
            Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => bytes,
            Some(_) => return Err(IngestError::Deserialization("empty payload".into())),
            None => return Err(IngestError::Deserialization("missing payload".into())),
        };

        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| IngestError::Deserialization(e.to_string()))?;

        if !value.is_object() {
            return Err(IngestError::Deserialization(format!(
                "expected JSON object, got {}",
                json_kind(&value)
            )));
        }

        serde_json::from_value(value).map_err(|e| IngestError::Deserialization(e.to_string()))
    }

    /// Check required fields and limits, filling `created_at` with
    /// `received_at` when the event carries no timestamp
    pub fn into_validated(mut self, received_at: DateTime<Utc>) -> IngestResult<ValidatedEvent> {
        self.sender_id = self.sender_id.take().or_else(|| self.from.take());
        self.recipient_id = self.recipient_id.take().or_else(|| self.to.take());

        if let Err(errors) = self.validate() {
            return Err(first_violation(&errors));
        }

        let event_id = required_id(self.event_id, "eventId")?;
        let conversation_id = required_id(self.conversation_id, "conversationId")?;
        let sender_id = required_id(self.sender_id, "senderId")?;
        let content = self
            .content
            .ok_or_else(|| IngestError::missing_field("content"))?;

        Ok(ValidatedEvent {
            event_id,
            client_msg_id: self.client_msg_id,
            conversation_id,
            sender_id,
            recipient_id: self.recipient_id,
            content,
            attachment_url: self.attachment_url,
            created_at: self.sent_at.unwrap_or(received_at),
        })
    }
}

fn required_id(value: Option<String>, field: &str) -> IngestResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(IngestError::missing_field(field)),
    }
}

fn first_violation(errors: &validator::ValidationErrors) -> IngestError {
    let mut fields: Vec<_> = errors
        .field_errors()
        .into_iter()
        .map(|(field, errs)| (field.to_string(), errs.clone()))
        .collect();
    // Deterministic order so the reported field is stable
    fields.sort_by(|a, b| a.0.cmp(&b.0));

    let Some((field, errs)) = fields.into_iter().next() else {
        return IngestError::invalid_field("payload", "validation failed");
    };
    let wire_name = camel_case(&field);

    match errs.first() {
        Some(err) if err.code == "required" => IngestError::missing_field(&wire_name),
        Some(err) if err.code == "length" => {
            let max = err
                .params
                .get("max")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".into());
            IngestError::invalid_field(&wire_name, format!("exceeds {max} characters"))
        }
        Some(err) => IngestError::invalid_field(&wire_name, err.code.to_string()),
        None => IngestError::invalid_field(&wire_name, "invalid"),
    }
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// RFC 3339 timestamp; empty strings and the zero time (year 1) mean "not set"
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .map_err(|e| serde::de::Error::custom(format!("invalid sentAt '{raw}': {e}")))?
        .with_timezone(&Utc);

    if parsed.year() <= 1 {
        return Ok(None);
    }
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn parse(json: &str) -> IngestResult<ValidatedEvent> {
        ChatMessageEvent::from_payload(Some(json.as_bytes()))?.into_validated(received_at())
    }

    #[test]
    fn test_minimal_event() {
        let event = parse(r#"{"eventId":"e1","conversationId":"c1","senderId":"u1","content":"hi"}"#)
            .unwrap();

        assert_eq!(event.event_id, "e1");
        assert_eq!(event.conversation_id, "c1");
        assert_eq!(event.content, "hi");
        assert_eq!(event.client_msg_id, None);
        assert_eq!(event.created_at, received_at());
    }

    #[test]
    fn test_gateway_field_aliases() {
        let event = parse(
            r#"{"eventId":"e1","clientMsgId":"","conversationId":"c1","from":"alice","to":"bob",
                "content":"hello","sentAt":"2024-02-29T10:15:30.123456789Z","extra":true}"#,
        )
        .unwrap();

        assert_eq!(event.sender_id, "alice");
        assert_eq!(event.recipient_id.as_deref(), Some("bob"));
        assert_eq!(event.client_msg_id, None);
        assert_eq!(
            event.created_at,
            Utc.with_ymd_and_hms(2024, 2, 29, 10, 15, 30).unwrap()
                + chrono::Duration::nanoseconds(123_456_789)
        );
    }

    #[test]
    fn test_canonical_fields_win_over_gateway_spelling() {
        let event = parse(
            r#"{"eventId":"e1","conversationId":"c1","senderId":"alice","from":"mallory",
                "recipientId":"bob","to":"eve","content":"hi"}"#,
        )
        .unwrap();

        assert_eq!(event.sender_id, "alice");
        assert_eq!(event.recipient_id.as_deref(), Some("bob"));
    }

    #[test]
    fn test_blank_sender_id_falls_back_to_from() {
        let event = parse(
            r#"{"eventId":"e1","conversationId":"c1","senderId":" ","from":"alice","content":"hi"}"#,
        )
        .unwrap();

        assert_eq!(event.sender_id, "alice");
    }

    #[test]
    fn test_zero_time_falls_back_to_ingestion_time() {
        let event = parse(
            r#"{"eventId":"e1","conversationId":"c1","senderId":"u1","content":"",
                "sentAt":"0001-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(event.created_at, received_at());
        assert_eq!(event.content, "");
    }

    #[test]
    fn test_missing_conversation_id() {
        let err = parse(r#"{"eventId":"e1","senderId":"u1","content":"hi"}"#).unwrap_err();
        match err {
            IngestError::Validation { field, missing, .. } => {
                assert_eq!(field, "conversationId");
                assert!(missing);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_blank_event_id_is_missing() {
        let err = parse(r#"{"eventId":"   ","conversationId":"c1","senderId":"u1","content":"hi"}"#)
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation { ref field, missing: true, .. } if field == "eventId"));
    }

    #[test]
    fn test_null_content_is_missing() {
        let err = parse(r#"{"eventId":"e1","conversationId":"c1","senderId":"u1","content":null}"#)
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation { ref field, .. } if field == "content"));
    }

    #[test]
    fn test_oversized_identifier_is_schema_violation() {
        let long = "x".repeat(256);
        let json = format!(
            r#"{{"eventId":"e1","conversationId":"{long}","senderId":"u1","content":"hi"}}"#
        );
        let err = parse(&json).unwrap_err();
        assert!(
            matches!(err, IngestError::Validation { ref field, missing: false, .. } if field == "conversationId")
        );
    }

    #[test]
    fn test_attachment_url_limit() {
        let url = format!("https://cdn.example.com/{}", "a".repeat(2048));
        let json = format!(
            r#"{{"eventId":"e1","conversationId":"c1","senderId":"u1","content":"","attachmentUrl":"{url}"}}"#
        );
        let err = parse(&json).unwrap_err();
        assert!(matches!(err, IngestError::Validation { ref field, .. } if field == "attachmentUrl"));
    }

    #[test]
    fn test_unparseable_payloads() {
        for payload in [&b""[..], b"   ", b"null", b"[1,2]", b"\"text\"", b"{not json"] {
            let err = ChatMessageEvent::from_payload(Some(payload)).unwrap_err();
            assert!(matches!(err, IngestError::Deserialization(_)), "{payload:?}");
        }
        assert!(matches!(
            ChatMessageEvent::from_payload(None),
            Err(IngestError::Deserialization(_))
        ));
    }

    #[test]
    fn test_wrong_field_type_is_deserialization_error() {
        let err = ChatMessageEvent::from_payload(Some(br#"{"eventId":42}"#)).unwrap_err();
        assert!(matches!(err, IngestError::Deserialization(_)));
    }

    #[test]
    fn test_invalid_sent_at_is_deserialization_error() {
        let err = ChatMessageEvent::from_payload(Some(
            br#"{"eventId":"e1","conversationId":"c1","senderId":"u1","content":"hi","sentAt":"yesterday"}"#,
        ))
        .unwrap_err();
        assert!(matches!(err, IngestError::Deserialization(_)));
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("conversation_id"), "conversationId");
        assert_eq!(camel_case("attachment_url"), "attachmentUrl");
        assert_eq!(camel_case("content"), "content");
    }
}
