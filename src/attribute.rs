//! Named, typed configuration cells owned by a component (§3 "Attribute").

use std::any::Any;
use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, KernelError};

/// Object-safe facet of an attribute: set/get through text, for config
/// ingestion and introspection, regardless of the concrete scalar type.
pub trait AttributeValue: Any + Send {
    fn to_text(&self) -> String;
    fn set_from_text(&mut self, text: &str) -> Result<(), KernelError>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A scalar attribute of type `T`.
pub struct Attribute<T> {
    value: T,
}

impl<T> Attribute<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
    }
}

impl<T> AttributeValue for Attribute<T>
where
    T: FromStr + ToString + Send + 'static,
{
    fn to_text(&self) -> String {
        self.value.to_string()
    }

    fn set_from_text(&mut self, text: &str) -> Result<(), KernelError> {
        self.value = text
            .parse()
            .map_err(|_| KernelError::Resource {
                component: String::new(),
                attr: String::new(),
                path: text.to_string(),
            })?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An ordered-sequence attribute, serialized/parsed as comma-separated text.
pub struct VecAttribute<T> {
    values: Vec<T>,
}

impl<T> VecAttribute<T> {
    pub fn new(values: Vec<T>) -> Self {
        Self { values }
    }

    pub fn get(&self) -> &[T] {
        &self.values
    }
}

impl<T> AttributeValue for VecAttribute<T>
where
    T: FromStr + ToString + Send + 'static,
{
    fn to_text(&self) -> String {
        self.values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn set_from_text(&mut self, text: &str) -> Result<(), KernelError> {
        let mut parsed = Vec::new();
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            parsed.push(part.parse().map_err(|_| {
                KernelError::Resource {
                    component: String::new(),
                    attr: String::new(),
                    path: text.to_string(),
                }
            })?);
        }
        self.values = parsed;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<T: fmt::Debug> fmt::Debug for Attribute<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute").field("value", &self.value).finish()
    }
}

/// `attr=file` attributes: a value that must be resolved against a set of
/// resource search paths (§6 graph spec `optional-type="file"`; §7
/// `ResourceError` recoverable path). Resolution itself is performed by the
/// external `resource_finder` collaborator (§6); this type only records
/// whether resolution is required and the literal fallback value on failure.
pub struct FileAttribute {
    literal: String,
    resolved: Option<String>,
}

impl FileAttribute {
    pub fn new(literal: impl Into<String>) -> Self {
        Self {
            literal: literal.into(),
            resolved: None,
        }
    }

    pub fn resolve_with(&mut self, finder: impl Fn(&str) -> Option<String>) {
        self.resolved = finder(&self.literal);
    }

    pub fn value(&self) -> &str {
        self.resolved.as_deref().unwrap_or(&self.literal)
    }

    pub fn was_resolved(&self) -> bool {
        self.resolved.is_some()
    }
}

impl AttributeValue for FileAttribute {
    fn to_text(&self) -> String {
        self.literal.clone()
    }

    fn set_from_text(&mut self, text: &str) -> Result<(), KernelError> {
        self.literal = text.to_string();
        self.resolved = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) fn unknown_attribute(component: &str, attr: &str) -> KernelError {
    KernelError::Config(ConfigError::UnknownAttribute {
        component: component.to_string(),
        attr: attr.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips_through_text() {
        let mut a = Attribute::new(0i64);
        a.set_from_text("42").unwrap();
        assert_eq!(a.to_text(), "42");
        assert_eq!(*a.get(), 42);
    }

    #[test]
    fn csv_vector_round_trips_through_text() {
        let mut v = VecAttribute::<i32>::new(vec![]);
        v.set_from_text("1, 2,3").unwrap();
        assert_eq!(v.get(), &[1, 2, 3]);
        assert_eq!(v.to_text(), "1,2,3");
    }
}
