//! Function calling: the allow-list, argument validation, and execution.

use crate::config::{FunctionConfig, ParameterConfig};
use crate::error::{ProviderError, ValidationError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// An allow-listed function as advertised to the model.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub endpoint: Option<String>,
    pub parameters: Vec<ParameterConfig>,
}

impl From<&FunctionConfig> for FunctionSpec {
    fn from(c: &FunctionConfig) -> Self {
        Self {
            name: c.name.clone(),
            description: c.description.clone(),
            endpoint: c.endpoint.clone(),
            parameters: c.parameters.clone(),
        }
    }
}

impl FunctionSpec {
    /// JSON-schema object describing the parameters.
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            let mut prop = json!({
                "type": p.param_type.as_str(),
                "description": p.description,
            });
            if let Some(values) = &p.enum_values {
                prop["enum"] = json!(values);
            }
            properties.insert(p.name.clone(), prop);
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    fn validate_property(&self, param: &ParameterConfig, value: &Value) -> Result<(), ValidationError> {
        if !param.param_type.matches(value) {
            return Err(ValidationError::TypeMismatch {
                param: param.name.clone(),
                expected: param.param_type.as_str().to_string(),
                got: json_type_name(value).to_string(),
            });
        }
        if let (Some(allowed), Some(s)) = (&param.enum_values, value.as_str()) {
            if !allowed.iter().any(|a| a == s) {
                return Err(ValidationError::NotInEnum {
                    param: param.name.clone(),
                    allowed: allowed.join(", "),
                });
            }
        }
        Ok(())
    }
}

/// Static allow-list of callable functions, fixed for the life of the process.
#[derive(Clone, Debug, Default)]
pub struct FunctionRegistry {
    specs: Vec<FunctionSpec>,
}

impl FunctionRegistry {
    pub fn new(specs: Vec<FunctionSpec>) -> Self {
        Self { specs }
    }

    pub fn from_config(functions: &[FunctionConfig]) -> Self {
        Self::new(functions.iter().map(FunctionSpec::from).collect())
    }

    pub fn specs(&self) -> &[FunctionSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&FunctionSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Check a proposed call against the allow-list and its parameter schema.
    pub fn validate(&self, name: &str, raw_arguments: &str) -> Result<Map<String, Value>, ValidationError> {
        let spec = self
            .get(name)
            .ok_or_else(|| ValidationError::NotAllowed(name.to_string()))?;
        let raw = raw_arguments.trim();
        let args = if raw.is_empty() {
            Map::new()
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(ValidationError::MalformedArguments(format!(
                        "expected object, got {}",
                        json_type_name(&other)
                    )))
                }
                Err(e) => return Err(ValidationError::MalformedArguments(e.to_string())),
            }
        };
        for key in args.keys() {
            if !spec.parameters.iter().any(|p| &p.name == key) {
                return Err(ValidationError::UnknownParameter(key.clone()));
            }
        }
        for param in &spec.parameters {
            match args.get(&param.name) {
                None if param.required => {
                    return Err(ValidationError::MissingParameter(param.name.clone()))
                }
                None => {}
                Some(value) => spec.validate_property(param, value)?,
            }
        }
        Ok(args)
    }
}

/// Structured failure result fed back to the model in place of a function response.
pub fn failure_result(kind: &str, message: &str) -> Value {
    json!({ "error": { "kind": kind, "message": message } })
}

pub fn rejection_result(e: &ValidationError) -> Value {
    failure_result(e.kind(), &e.to_string())
}

#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    async fn execute(&self, spec: &FunctionSpec, arguments: &Map<String, Value>) -> Result<Value, ProviderError>;
}

/// Executes validated calls by POSTing `{"name", "arguments"}` to the function's endpoint.
pub struct WebhookExecutor {
    http_client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl FunctionExecutor for WebhookExecutor {
    async fn execute(&self, spec: &FunctionSpec, arguments: &Map<String, Value>) -> Result<Value, ProviderError> {
        let endpoint = spec.endpoint.as_deref().ok_or_else(|| ProviderError::BadRequest {
            provider: spec.name.clone(),
            message: "no endpoint configured".to_string(),
        })?;
        debug!(function=%spec.name, endpoint=%endpoint, "executing function");
        let resp = self
            .http_client
            .post(endpoint)
            .json(&json!({ "name": spec.name, "arguments": arguments }))
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, function=%spec.name, "failed to send function webhook");
                ProviderError::from_reqwest(&spec.name, &e)
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(&spec.name, status.as_u16(), &body));
        }
        resp.json::<Value>().await.map_err(|e| {
            error!(error=%e, function=%spec.name, "failed to deserialize function webhook response");
            ProviderError::Protocol {
                provider: spec.name.clone(),
                message: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new(vec![FunctionSpec {
            name: "get_order_status".into(),
            description: "Look up an order".into(),
            endpoint: None,
            parameters: vec![
                ParameterConfig {
                    name: "order_id".into(),
                    param_type: ParamType::String,
                    description: "Order number".into(),
                    required: true,
                    enum_values: None,
                },
                ParameterConfig {
                    name: "channel".into(),
                    param_type: ParamType::String,
                    description: String::new(),
                    required: false,
                    enum_values: Some(vec!["sms".into(), "voice".into()]),
                },
            ],
        }])
    }

    #[test]
    fn integer_for_string_parameter_is_rejected() {
        let err = registry()
            .validate("get_order_status", r#"{"order_id": 123}"#)
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::TypeMismatch {
                param: "order_id".into(),
                expected: "string".into(),
                got: "integer".into(),
            }
        );
    }

    #[test]
    fn valid_call_passes() {
        let args = registry()
            .validate("get_order_status", r#"{"order_id": "123", "channel": "sms"}"#)
            .unwrap();
        assert_eq!(args["order_id"], "123");
    }

    #[test]
    fn allow_list_and_schema_failures() {
        let r = registry();
        assert_eq!(
            r.validate("delete_account", "{}"),
            Err(ValidationError::NotAllowed("delete_account".into()))
        );
        assert!(matches!(
            r.validate("get_order_status", "{not json"),
            Err(ValidationError::MalformedArguments(_))
        ));
        assert!(matches!(
            r.validate("get_order_status", "[1]"),
            Err(ValidationError::MalformedArguments(_))
        ));
        assert_eq!(
            r.validate("get_order_status", ""),
            Err(ValidationError::MissingParameter("order_id".into()))
        );
        assert_eq!(
            r.validate("get_order_status", r#"{"order_id": "1", "force": true}"#),
            Err(ValidationError::UnknownParameter("force".into()))
        );
        assert!(matches!(
            r.validate("get_order_status", r#"{"order_id": "1", "channel": "fax"}"#),
            Err(ValidationError::NotInEnum { .. })
        ));
    }

    #[test]
    fn schema_lists_required_parameters() {
        let schema = registry().specs()[0].json_schema();
        assert_eq!(schema["required"], json!(["order_id"]));
        assert_eq!(schema["properties"]["channel"]["enum"], json!(["sms", "voice"]));
    }

    #[test]
    fn rejection_is_structured() {
        let v = rejection_result(&ValidationError::MissingParameter("order_id".into()));
        assert_eq!(v["error"]["kind"], "missing_parameter");
    }
}
