//! Wire messages and their JSON encoding.
//!
//! ```text
//! Command:  { "_type": "Command",  "ID": string, "Function": string, "Parameters": [any...] }
//! Response: { "_type": "Response", "ID": string, "Value": any|null, "Error": bool, "ErrorMessage": string }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::{EelError, Result};
use crate::ids::CallId;

/// Function name of the unsolicited "a new callable exists" notification.
pub const ADD_SERVER_FUNCTION: &str = "_addServerFunction";

/// Request to execute a named function on the peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "ID")]
    pub id: CallId,
    #[serde(rename = "Function")]
    pub function: String,
    #[serde(rename = "Parameters")]
    pub parameters: Vec<Value>,
}

impl Command {
    /// Build a Command with a freshly generated id.
    pub fn new(function: impl Into<String>, parameters: Vec<Value>) -> Self {
        let function = function.into();
        Self {
            id: CallId::generate(&function),
            function,
            parameters,
        }
    }

    /// Announcement that `name` is now callable on this side.
    pub fn announce(name: &str) -> Self {
        Self::new(ADD_SERVER_FUNCTION, vec![Value::String(name.to_owned())])
    }

    pub fn is_announcement(&self) -> bool {
        self.function == ADD_SERVER_FUNCTION
    }
}

/// Result of executing a Command, correlated by `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "ID")]
    pub id: CallId,
    #[serde(rename = "Value", default)]
    pub value: Value,
    #[serde(rename = "Error", default, deserialize_with = "null_as_default")]
    pub error: bool,
    #[serde(rename = "ErrorMessage", default, deserialize_with = "null_as_default")]
    pub error_message: String,
}

impl Response {
    pub fn success(id: CallId, value: Value) -> Self {
        Self {
            id,
            value,
            error: false,
            error_message: String::new(),
        }
    }

    pub fn failure(id: CallId, message: impl Into<String>) -> Self {
        Self {
            id,
            value: Value::Null,
            error: true,
            error_message: message.into(),
        }
    }
}

/// Either message kind, discriminated by the `_type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type")]
pub enum Message {
    Command(Command),
    Response(Response),
}

impl Message {
    pub fn id(&self) -> &CallId {
        match self {
            Self::Command(c) => &c.id,
            Self::Response(r) => &r.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "Command",
            Self::Response(_) => "Response",
        }
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

/// Serialize a message to its wire text.
pub fn encode(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse wire text into a message.
///
/// Anything that is not a JSON object carrying a known `_type` is a
/// [`EelError::Parse`]. Extra fields are ignored.
pub fn decode(text: &str) -> Result<Message> {
    serde_json::from_str(text).map_err(|e| EelError::Parse(e.to_string()))
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_encodes_in_wire_order() {
        let resp = Response::success(CallId::from_raw("add|0.1"), json!(5));
        let text = encode(&resp.into()).unwrap();
        assert_eq!(
            text,
            r#"{"_type":"Response","ID":"add|0.1","Value":5,"Error":false,"ErrorMessage":""}"#
        );
    }

    #[test]
    fn command_encodes_with_tag() {
        let cmd = Command {
            id: CallId::from_raw("greet|0.5"),
            function: "greet".into(),
            parameters: vec![json!("Ann")],
        };
        let value: Value = serde_json::from_str(&encode(&cmd.into()).unwrap()).unwrap();
        assert_eq!(value["_type"], "Command");
        assert_eq!(value["ID"], "greet|0.5");
        assert_eq!(value["Function"], "greet");
        assert_eq!(value["Parameters"], json!(["Ann"]));
    }

    #[test]
    fn decode_command() {
        let msg = decode(r#"{"_type":"Command","ID":"add|0.1","Function":"add","Parameters":[2,3]}"#)
            .unwrap();
        let Message::Command(cmd) = msg else {
            panic!("expected command, got {msg:?}");
        };
        assert_eq!(cmd.id.as_str(), "add|0.1");
        assert_eq!(cmd.function, "add");
        assert_eq!(cmd.parameters, vec![json!(2), json!(3)]);
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let original: Message = Response {
            id: CallId::from_raw("f|0.25"),
            value: json!({"nested": [1, null, "x"]}),
            error: true,
            error_message: "bad".into(),
        }
        .into();
        let back = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn command_roundtrip_keeps_mixed_parameters() {
        let original: Message = Command {
            id: CallId::from_raw("render|0.75"),
            function: "render".into(),
            parameters: vec![
                json!("title"),
                json!(3.5),
                json!(null),
                json!([true, {"depth": [1, 2]}]),
                json!({"unicode": "héllo", "empty": {}}),
            ],
        }
        .into();
        let back = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn response_optional_fields_default() {
        let msg = decode(r#"{"_type":"Response","ID":"x|1"}"#).unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.value, Value::Null);
        assert!(!resp.error);
        assert!(resp.error_message.is_empty());
    }

    #[test]
    fn response_null_fields_default() {
        let msg =
            decode(r#"{"_type":"Response","ID":"x|1","Value":null,"Error":null,"ErrorMessage":null}"#)
                .unwrap();
        let Message::Response(resp) = msg else {
            panic!("expected response");
        };
        assert!(!resp.error);
        assert_eq!(resp.error_message, "");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg = decode(
            r#"{"_type":"Command","ID":"a|0","Function":"a","Parameters":[],"extra":{"k":1}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), "Command");
        assert_eq!(msg.id().as_str(), "a|0");
    }

    #[test]
    fn missing_type_is_parse_error() {
        let err = decode(r#"{"ID":"a|0","Function":"a","Parameters":[]}"#).unwrap_err();
        assert!(matches!(err, EelError::Parse(_)), "got {err:?}");
    }

    #[test]
    fn unknown_type_is_parse_error() {
        let err = decode(r#"{"_type":"Event","ID":"a|0"}"#).unwrap_err();
        assert!(matches!(err, EelError::Parse(_)));
    }

    #[test]
    fn non_object_is_parse_error() {
        assert!(matches!(decode("[1,2,3]"), Err(EelError::Parse(_))));
        assert!(matches!(decode("not json"), Err(EelError::Parse(_))));
        assert!(matches!(decode(""), Err(EelError::Parse(_))));
    }

    #[test]
    fn command_missing_parameters_is_parse_error() {
        let err = decode(r#"{"_type":"Command","ID":"a|0","Function":"a"}"#).unwrap_err();
        assert!(matches!(err, EelError::Parse(_)));
    }

    #[test]
    fn announcement_carries_name() {
        let cmd = Command::announce("add");
        assert!(cmd.is_announcement());
        assert_eq!(cmd.parameters, vec![json!("add")]);
        assert!(cmd.id.as_str().starts_with("_addServerFunction|"));
    }

    #[test]
    fn failure_response_has_null_value() {
        let resp = Response::failure(CallId::from_raw("a|0"), "nope");
        assert!(resp.error);
        assert_eq!(resp.value, Value::Null);
        assert_eq!(resp.error_message, "nope");
    }
}
