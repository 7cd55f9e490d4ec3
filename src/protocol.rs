use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct Request {
	/// Absent for notifications, which never get a response.
	#[serde(default)]
	pub id: Option<Value>,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

impl Request {
	pub fn is_notification(&self) -> bool {
		self.id.is_none()
	}
}

#[derive(Debug, Serialize)]
pub struct Response {
	pub jsonrpc: &'static str,
	pub id: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorObject>,
}

#[derive(Debug, Serialize)]
pub struct ErrorObject {
	pub code: i64,
	pub message: String,
}

impl Response {
	pub fn ok(id: Value, result: Value) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			result: Some(result),
			error: None
		}
	}

	pub fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			result: None,
			error: Some(ErrorObject {
				code,
				message: message.into()
			})
		}
	}
}
