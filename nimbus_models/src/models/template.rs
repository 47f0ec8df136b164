use std::str::FromStr;

use super::attribute::{Attribute, AttributeError, SingleAttribute, VectorAttribute};

/// Ordered collection of template attributes. Several attributes can share a
/// name (one `DISK` per disk), their relative order is kept.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    attributes: Vec<Attribute>,
}

impl Template {
    pub fn new() -> Template {
        Template {
            attributes: Vec::new(),
        }
    }

    pub fn set(&mut self, attribute: impl Into<Attribute>) {
        self.attributes.push(attribute.into());
    }

    /// Chained variant of [Template::set]
    pub fn with(mut self, attribute: impl Into<Attribute>) -> Template {
        self.set(attribute);
        self
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn get<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Attribute> + 'a {
        let name = name.to_string();
        self.attributes.iter().filter(move |a| a.name() == name)
    }

    pub fn count(&self, name: &str) -> usize {
        self.get(name).count()
    }

    /// First scalar value with the given name, empty values are reported as
    /// absent and vector attributes are ignored
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name)
            .find_map(|a| a.as_single().ok())
            .filter(|v| !v.is_empty())
    }

    pub fn get_parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        self.get_string(name).and_then(|v| v.trim().parse().ok())
    }

    /// Removes every attribute with this name and stores a single scalar
    pub fn replace(&mut self, name: &str, value: impl ToString) {
        self.attributes.retain(|a| a.name() != name);
        self.attributes.push(SingleAttribute::new(name, value).into());
    }

    /// Removes every attribute with this name, returning them in order
    pub fn remove(&mut self, name: &str) -> Vec<Attribute> {
        let (removed, kept): (Vec<Attribute>, Vec<Attribute>) = std::mem::take(&mut self.attributes)
            .into_iter()
            .partition(|a| a.name() == name);
        self.attributes = kept;
        removed
    }

    /// Removes the first vector attribute with this name matching `predicate`
    pub fn remove_vector_if<F>(&mut self, name: &str, predicate: F) -> Option<VectorAttribute>
    where
        F: Fn(&VectorAttribute) -> bool,
    {
        let position = self.attributes.iter().position(|a| match a {
            Attribute::Vector(v) => v.name == name && predicate(v),
            Attribute::Single(_) => false,
        })?;
        self.attributes.remove(position).into_vector().ok()
    }

    /// First attribute with this name, which must be a vector
    pub fn vector(&self, name: &str) -> Result<Option<&VectorAttribute>, AttributeError> {
        self.get(name).next().map(Attribute::as_vector).transpose()
    }

    pub fn vector_mut(&mut self, name: &str) -> Result<Option<&mut VectorAttribute>, AttributeError> {
        self.attributes
            .iter_mut()
            .find(|a| a.name() == name)
            .map(Attribute::as_vector_mut)
            .transpose()
    }

    /// Every attribute with this name, all of them must be vectors
    pub fn vectors(&self, name: &str) -> Result<Vec<&VectorAttribute>, AttributeError> {
        self.get(name).map(Attribute::as_vector).collect()
    }

    pub fn vectors_mut(&mut self, name: &str) -> Result<Vec<&mut VectorAttribute>, AttributeError> {
        self.attributes
            .iter_mut()
            .filter(|a| a.name() == name)
            .map(Attribute::as_vector_mut)
            .collect()
    }
}
