//! Strict decoder for extraction responses.
//!
//! Accepts a bare JSON object, a fenced ```json block, or an object wrapped in
//! prose (first `{` to last `}`). The object must then match
//! [`ExtractionPayload`] exactly as typed, and pass the value checks below.

use serde_json::Value;
use thiserror::Error;

use novelkb_shared::{ExtractionPayload, FailureKind, FailureReason};

const SECTIONS: [&str; 3] = ["entities", "relations", "events"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}: {message}", .kind.as_str())]
pub struct DecodeError {
    pub kind: FailureKind,
    pub message: String,
}

impl DecodeError {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn into_reason(self) -> FailureReason {
        FailureReason {
            kind: self.kind,
            message: self.message,
        }
    }
}

pub fn decode_response(raw: &str) -> Result<ExtractionPayload, DecodeError> {
    let text = strip_fence(raw.trim());
    if text.is_empty() {
        return Err(DecodeError::new(FailureKind::EmptyResponse, "response is empty"));
    }

    let value = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(direct) => {
            let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
                return Err(DecodeError::new(
                    FailureKind::NoJsonObject,
                    format!("no JSON object in response ({direct})"),
                ));
            };
            if start >= end {
                return Err(DecodeError::new(
                    FailureKind::NoJsonObject,
                    "no JSON object in response",
                ));
            }
            serde_json::from_str::<Value>(&text[start..=end])
                .map_err(|e| DecodeError::new(FailureKind::InvalidJson, e.to_string()))?
        }
    };

    let Value::Object(map) = &value else {
        return Err(DecodeError::new(
            FailureKind::SchemaMismatch,
            "top-level JSON value is not an object",
        ));
    };
    if !SECTIONS.iter().any(|k| map.contains_key(*k)) {
        return Err(DecodeError::new(
            FailureKind::SchemaMismatch,
            "object has none of entities, relations, events",
        ));
    }

    let payload: ExtractionPayload = serde_json::from_value(value)
        .map_err(|e| DecodeError::new(FailureKind::SchemaMismatch, e.to_string()))?;

    validate(&payload)?;
    Ok(payload)
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (`json`) line.
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn validate(payload: &ExtractionPayload) -> Result<(), DecodeError> {
    let mismatch = |msg: String| -> Result<(), DecodeError> {
        Err(DecodeError::new(FailureKind::SchemaMismatch, msg))
    };

    for (i, entity) in payload.entities.iter().enumerate() {
        if entity.name.trim().is_empty() {
            return mismatch(format!("entities[{i}].name is empty"));
        }
        check_confidence(entity.confidence, || format!("entities[{i}].confidence"))?;
    }
    for (i, rel) in payload.relations.iter().enumerate() {
        if rel.from.trim().is_empty() || rel.to.trim().is_empty() {
            return mismatch(format!("relations[{i}] has an empty endpoint"));
        }
        if rel.relation_type.trim().is_empty() {
            return mismatch(format!("relations[{i}].type is empty"));
        }
        check_confidence(rel.confidence, || format!("relations[{i}].confidence"))?;
        if let Some((start, end)) = rel
            .evidence
            .as_ref()
            .and_then(|ev| ev.start_char.zip(ev.end_char))
            .filter(|(start, end)| start > end)
        {
            return mismatch(format!("relations[{i}].evidence span {start}..{end} is reversed"));
        }
    }
    for (i, event) in payload.events.iter().enumerate() {
        check_confidence(event.confidence, || format!("events[{i}].confidence"))?;
    }
    Ok(())
}

fn check_confidence(value: Option<f64>, field: impl Fn() -> String) -> Result<(), DecodeError> {
    match value {
        Some(c) if !(0.0..=1.0).contains(&c) => Err(DecodeError::new(
            FailureKind::SchemaMismatch,
            format!("{} = {c} is outside [0, 1]", field()),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"{"entities":[{"name":"王林","aliases":["铁柱"],"type":"person","confidence":0.9}],
        "relations":[{"from":"王林","to":"司徒南","type":"师徒","status":"稳定",
          "evidence":{"quote":"司徒南收他为徒","start_char":3,"end_char":10},"confidence":0.8}],
        "events":[]}"#;

    fn kind(raw: &str) -> FailureKind {
        decode_response(raw).unwrap_err().kind
    }

    #[test]
    fn decodes_plain_object() {
        let payload = decode_response(GOOD).unwrap();
        assert_eq!(payload.entities[0].name, "王林");
        assert_eq!(payload.relations[0].relation_type, "师徒");
        assert_eq!(
            payload.relations[0].evidence.as_ref().unwrap().start_char,
            Some(3)
        );
    }

    #[test]
    fn decodes_fenced_and_wrapped_objects() {
        let fenced = format!("```json\n{GOOD}\n```");
        assert_eq!(decode_response(&fenced).unwrap().entities.len(), 1);

        let wrapped = format!("好的，结果如下：\n{GOOD}\n以上。");
        assert_eq!(decode_response(&wrapped).unwrap().relations.len(), 1);
    }

    #[test]
    fn failure_kinds() {
        assert_eq!(kind("   "), FailureKind::EmptyResponse);
        assert_eq!(kind("抱歉，我无法完成。"), FailureKind::NoJsonObject);
        assert_eq!(kind("结果 {\"entities\": [,]} 完"), FailureKind::InvalidJson);
        assert_eq!(kind("[1, 2]"), FailureKind::SchemaMismatch);
        assert_eq!(kind(r#"{"answer": 42}"#), FailureKind::SchemaMismatch);
        assert_eq!(kind(r#"{"entities": "王林"}"#), FailureKind::SchemaMismatch);
    }

    #[test]
    fn value_checks() {
        assert_eq!(
            kind(r#"{"entities":[{"name":"王林","confidence":1.5}]}"#),
            FailureKind::SchemaMismatch
        );
        assert_eq!(kind(r#"{"entities":[{"name":"  "}]}"#), FailureKind::SchemaMismatch);
        assert_eq!(
            kind(r#"{"relations":[{"from":"A","to":"","type":"敌对"}]}"#),
            FailureKind::SchemaMismatch
        );
        assert!(decode_response(r#"{"entities":[]}"#).is_ok());
    }
}
