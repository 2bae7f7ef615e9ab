//! Errors accumulated by handlers while serving one request.
//!
//! These are not failures of the framework. A handler records them on the
//! [`Response`](crate::Response) it returns and carries on; middleware
//! downstream decides who gets to see which ones:
//!
//! - [`ErrorLogger`](crate::middleware::ErrorLogger) renders a chosen
//!   classification into the response body.
//! - [`Logger`](crate::middleware::Logger) prints the [`ErrorType::PRIVATE`]
//!   ones in the access-log comment.

use std::fmt;
use std::ops::BitOr;

use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::{Map, Value};

/// Classification bit set. An error matches a filter when the sets intersect.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ErrorType(u64);

impl ErrorType {
    /// Internal detail: logged, never shown to the client by default.
    pub const PRIVATE: Self = Self(1 << 0);
    /// Safe to show to the client.
    pub const PUBLIC: Self = Self(1 << 1);
    /// Producing the response failed.
    pub const RENDER: Self = Self(1 << 62);
    /// Binding the request body or parameters failed.
    pub const BIND: Self = Self(1 << 63);
    pub const ANY: Self = Self(u64::MAX);

    pub fn matches(self, filter: Self) -> bool {
        self.0 & filter.0 != 0
    }
}

impl BitOr for ErrorType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One recorded error.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestError {
    message: String,
    kind: ErrorType,
    meta: Option<Value>,
}

impl RequestError {
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self { message: message.into(), kind, meta: None }
    }

    pub fn private(message: impl Into<String>) -> Self {
        Self::new(ErrorType::PRIVATE, message)
    }

    pub fn public(message: impl Into<String>) -> Self {
        Self::new(ErrorType::PUBLIC, message)
    }

    /// Attaches extra context. Object metadata is merged into the JSON
    /// rendering; anything else appears under `"meta"`.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> ErrorType {
        self.kind
    }

    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    /// `{"error": message}` plus metadata. An `"error"` key supplied by object
    /// metadata wins over the message.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        match &self.meta {
            Some(Value::Object(fields)) => object.extend(fields.clone()),
            Some(other) => {
                object.insert("meta".to_owned(), other.clone());
            }
            None => {}
        }
        object
            .entry("error")
            .or_insert_with(|| Value::String(self.message.clone()));
        Value::Object(object)
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RequestError {}

/// Ordered collection of [`RequestError`]s.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Errors(Vec<RequestError>);

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: RequestError) {
        self.0.push(error);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RequestError> {
        self.0.iter()
    }

    pub fn last(&self) -> Option<&RequestError> {
        self.0.last()
    }

    /// The errors whose classification intersects `filter`, in order.
    pub fn by_type(&self, filter: ErrorType) -> Self {
        Self(self.0.iter().filter(|e| e.kind.matches(filter)).cloned().collect())
    }
}

impl<'a> IntoIterator for &'a Errors {
    type Item = &'a RequestError;
    type IntoIter = std::slice::Iter<'a, RequestError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Numbered, one error per line; empty when there are none.
///
/// ```text
/// Error #01: cache miss
/// Error #02: upstream slow
///      Meta: {"ms":1200}
/// ```
impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            writeln!(f, "Error #{:02}: {}", i + 1, error.message)?;
            if let Some(meta) = &error.meta {
                writeln!(f, "     Meta: {meta}")?;
            }
        }
        Ok(())
    }
}

/// A single error serializes as one object, several as an array, none as `null`.
impl Serialize for Errors {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.as_slice() {
            [] => serializer.serialize_none(),
            [only] => only.to_json().serialize(serializer),
            many => {
                let mut seq = serializer.serialize_seq(Some(many.len()))?;
                for error in many {
                    seq.serialize_element(&error.to_json())?;
                }
                seq.end()
            }
        }
    }
}
