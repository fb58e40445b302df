use crate::DispatchError;
use repr_similarity_backend::{
    FetchRequest, Shape, SimilarityFunction, SimilarityRequest, DEFAULT_STEPS,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;

pub const PROTOCOL_VERSION: u64 = 1;

/// Caller supplied identifier, echoed back unchanged
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Number(Number),
    String(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CorrelationId::Number(id) => write!(f, "{id}"),
            CorrelationId::String(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub id: Option<CorrelationId>,
    pub task: Task,
}

#[derive(Debug)]
pub enum Task {
    FetchRepr(FetchRequest),
    CalcSimilarities(SimilarityRequest),
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::FetchRepr(_) => "fetch_repr",
            Task::CalcSimilarities(_) => "calc_similarities",
        }
    }
}

/// A request refused at the boundary. `id` is set whenever it could be read.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub id: Option<CorrelationId>,
    pub error: DispatchError,
}

impl Request {
    /// Parse one raw input line. Bytes that are not UTF-8 are refused like any other bad JSON.
    pub fn from_slice(line: &[u8]) -> Result<Self, Rejected> {
        let value: Value = serde_json::from_slice(line).map_err(|err| Rejected {
            id: None,
            error: DispatchError::Validation(format!("request is not valid JSON: {err}")),
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, Rejected> {
        let Value::Object(mut object) = value else {
            return Err(Rejected {
                id: None,
                error: DispatchError::Validation("request must be a JSON object".to_string()),
            });
        };

        // Read the id first so that every later rejection can be correlated
        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(id) => Some(serde_json::from_value(id).map_err(|_| Rejected {
                id: None,
                error: DispatchError::Validation("`id` must be a string or a number".to_string()),
            })?),
        };

        match parse_task(object.remove("version"), object.remove("task"), object.remove("data")) {
            Ok(task) => Ok(Self { id, task }),
            Err(error) => Err(Rejected { id, error }),
        }
    }
}

fn parse_task(
    version: Option<Value>,
    task: Option<Value>,
    data: Option<Value>,
) -> Result<Task, DispatchError> {
    match version {
        None => {}
        Some(Value::Number(version)) if version.as_u64() == Some(PROTOCOL_VERSION) => {}
        Some(version) => return Err(DispatchError::UnsupportedVersion(version.to_string())),
    }

    let task = match task {
        Some(Value::String(task)) => task,
        Some(_) => return Err(DispatchError::Validation("`task` must be a string".to_string())),
        None => return Err(DispatchError::Validation("missing field `task`".to_string())),
    };

    match task.as_str() {
        "fetch_repr" => Ok(Task::FetchRepr(
            payload::<FetchPayload>(&task, data)?.into_request()?,
        )),
        "calc_similarities" => Ok(Task::CalcSimilarities(
            payload::<SimilarityPayload>(&task, data)?.into_request()?,
        )),
        _ => Err(DispatchError::UnknownTask(task)),
    }
}

fn payload<T: DeserializeOwned>(task: &str, data: Option<Value>) -> Result<T, DispatchError> {
    let data = data.ok_or_else(|| DispatchError::Validation("missing field `data`".to_string()))?;
    serde_json::from_value(data)
        .map_err(|err| DispatchError::Validation(format!("invalid `data` for `{task}`: {err}")))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchPayload {
    pub url: String,
    pub steps: Option<usize>,
    pub n: Option<usize>,
    pub m: Option<usize>,
}

impl FetchPayload {
    pub fn into_request(self) -> Result<FetchRequest, DispatchError> {
        if self.url.is_empty() {
            return Err(DispatchError::Validation("`url` cannot be empty".to_string()));
        }
        Ok(FetchRequest {
            url: self.url,
            shape: shape(self.steps, self.n, self.m)?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimilarityPayload {
    pub func: String,
    pub repr1_str: String,
    pub repr2_str: String,
    pub row: usize,
    pub col: usize,
    #[serde(default)]
    pub step1: usize,
    #[serde(default)]
    pub step2: usize,
    pub steps: Option<usize>,
    pub n: Option<usize>,
    pub m: Option<usize>,
}

impl SimilarityPayload {
    pub fn into_request(self) -> Result<SimilarityRequest, DispatchError> {
        let func = self
            .func
            .parse::<SimilarityFunction>()
            .map_err(|err| DispatchError::Validation(err.to_string()))?;

        for (name, key) in [("repr1_str", &self.repr1_str), ("repr2_str", &self.repr2_str)] {
            if key.is_empty() {
                return Err(DispatchError::Validation(format!("`{name}` cannot be empty")));
            }
        }

        Ok(SimilarityRequest {
            func,
            shape: shape(self.steps, self.n, self.m)?,
            repr1: self.repr1_str,
            repr2: self.repr2_str,
            step1: self.step1,
            step2: self.step2,
            row: self.row,
            col: self.col,
        })
    }
}

/// `n` and `m` come together. `steps` is only meaningful alongside them.
fn shape(
    steps: Option<usize>,
    n: Option<usize>,
    m: Option<usize>,
) -> Result<Option<Shape>, DispatchError> {
    let shape = match (n, m) {
        (Some(n), Some(m)) => Shape::new(steps.unwrap_or(DEFAULT_STEPS), n, m),
        (None, None) => return Ok(None),
        _ => {
            return Err(DispatchError::Validation(
                "`n` and `m` must be given together".to_string(),
            ))
        }
    };

    for (name, value) in [("steps", shape.steps), ("n", shape.n), ("m", shape.m)] {
        if value == 0 {
            return Err(DispatchError::Validation(format!(
                "`{name}` must be greater than 0"
            )));
        }
    }
    if shape.len().is_none() {
        return Err(DispatchError::Validation(format!(
            "shape steps={}, n={}, m={} is too large",
            shape.steps, shape.n, shape.m
        )));
    }
    Ok(Some(shape))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    Data(ResponseData),
    Error(ErrorResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    Fetch(FetchStatus),
    Similarities(Vec<f32>),
    Sentinel(Sentinel),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchStatus {
    Success,
    Error { msg: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentinel {
    /// A representation has not been fetched yet
    Loading,
    /// The comparison failed, details are in the logs
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    UnknownTask,
    Validation,
    UnsupportedVersion,
    Unavailable,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::UnknownTask => "unknown_task",
            ErrorType::Validation => "validation",
            ErrorType::UnsupportedVersion => "unsupported_version",
            ErrorType::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_type: ErrorType,
}

impl From<&DispatchError> for ErrorType {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::Validation(_) => ErrorType::Validation,
            DispatchError::UnknownTask(_) => ErrorType::UnknownTask,
            DispatchError::UnsupportedVersion(_) => ErrorType::UnsupportedVersion,
            DispatchError::Backend(_) => ErrorType::Unavailable,
        }
    }
}

impl From<DispatchError> for ErrorResponse {
    fn from(err: DispatchError) -> Self {
        Self {
            error_type: ErrorType::from(&err),
            error: err.to_string(),
        }
    }
}

impl Response {
    fn data(id: Option<CorrelationId>, data: ResponseData) -> Self {
        Self {
            id,
            body: ResponseBody::Data(data),
        }
    }

    pub fn fetch_success(id: Option<CorrelationId>) -> Self {
        Self::data(id, ResponseData::Fetch(FetchStatus::Success))
    }

    pub fn fetch_error(id: Option<CorrelationId>, msg: String) -> Self {
        Self::data(id, ResponseData::Fetch(FetchStatus::Error { msg }))
    }

    pub fn similarities(id: Option<CorrelationId>, similarities: Vec<f32>) -> Self {
        Self::data(id, ResponseData::Similarities(similarities))
    }

    pub fn loading(id: Option<CorrelationId>) -> Self {
        Self::data(id, ResponseData::Sentinel(Sentinel::Loading))
    }

    pub fn calc_error(id: Option<CorrelationId>) -> Self {
        Self::data(id, ResponseData::Sentinel(Sentinel::Error))
    }

    pub fn error(id: Option<CorrelationId>, err: DispatchError) -> Self {
        Self {
            id,
            body: ResponseBody::Error(err.into()),
        }
    }
}
