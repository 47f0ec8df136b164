use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Raised when an attribute does not have the shape its reader expects
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AttributeError {
    #[error("Wrong format for {0} attribute, expected a vector attribute")]
    NotVector(String),
    #[error("Wrong format for {0} attribute, expected a single value")]
    NotSingle(String),
}

/// Template attribute holding one scalar value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleAttribute {
    pub name: String,
    pub value: String,
}

impl SingleAttribute {
    pub fn new(name: &str, value: impl ToString) -> SingleAttribute {
        SingleAttribute {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Template attribute made of named sub-fields, e.g. `DISK = [ IMAGE_ID = 3 ]`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorAttribute {
    pub name: String,
    pub values: BTreeMap<String, String>,
}

impl VectorAttribute {
    pub fn new(name: &str) -> VectorAttribute {
        VectorAttribute {
            name: name.to_string(),
            values: BTreeMap::new(),
        }
    }

    /// Chained variant of [VectorAttribute::replace]
    pub fn with(mut self, key: &str, value: impl ToString) -> VectorAttribute {
        self.replace(key, value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of a sub-field. Empty values are reported as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn replace(&mut self, key: &str, value: impl ToString) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A named template attribute, either a scalar or a vector of sub-fields
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attribute {
    Single(SingleAttribute),
    Vector(VectorAttribute),
}

impl Attribute {
    pub fn name(&self) -> &str {
        match self {
            Attribute::Single(single) => &single.name,
            Attribute::Vector(vector) => &vector.name,
        }
    }

    pub fn as_single(&self) -> Result<&str, AttributeError> {
        match self {
            Attribute::Single(single) => Ok(&single.value),
            Attribute::Vector(vector) => Err(AttributeError::NotSingle(vector.name.clone())),
        }
    }

    pub fn as_vector(&self) -> Result<&VectorAttribute, AttributeError> {
        match self {
            Attribute::Vector(vector) => Ok(vector),
            Attribute::Single(single) => Err(AttributeError::NotVector(single.name.clone())),
        }
    }

    pub fn as_vector_mut(&mut self) -> Result<&mut VectorAttribute, AttributeError> {
        match self {
            Attribute::Vector(vector) => Ok(vector),
            Attribute::Single(single) => Err(AttributeError::NotVector(single.name.clone())),
        }
    }

    pub fn into_vector(self) -> Result<VectorAttribute, AttributeError> {
        match self {
            Attribute::Vector(vector) => Ok(vector),
            Attribute::Single(single) => Err(AttributeError::NotVector(single.name)),
        }
    }
}

impl From<SingleAttribute> for Attribute {
    fn from(value: SingleAttribute) -> Self {
        Attribute::Single(value)
    }
}

impl From<VectorAttribute> for Attribute {
    fn from(value: VectorAttribute) -> Self {
        Attribute::Vector(value)
    }
}

impl fmt::Display for VectorAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = [ ", self.name)?;
        let mut first = true;
        for (key, value) in &self.values {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{} = \"{}\"", key, value)?;
            first = false;
        }
        write!(f, " ]")
    }
}
