//! # Template expression parsing
//!
//! Attribute values may reference other attributes of the VM template
//! (`$NAME`, `$NIC[IP]`, `$NIC[IP, NETWORK_ID=2]`) or images
//! (`$FILE[IMAGE_ID=4]`). The grammar itself lives behind [ExpressionParser],
//! this module owns the process-wide parser lock and the scan buffer every
//! parse call works on.
//!
//! A single parse call holds the lock for its whole duration: the buffer is
//! created under the lock and dropped before it is released.
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

use nimbus_models::models::Template;
use tracing::trace;

use crate::pool::ImagePool;

static LEX_MUTEX: Mutex<()> = Mutex::new(());

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Error setting scan buffer")]
    ScanBuffer,
    #[error("Error parsing: {attribute}. {message}")]
    Syntax { attribute: String, message: String },
    #[error("Unknown error parsing: {0}.")]
    Unknown(String),
}

/// Input of one parse call
#[derive(Debug)]
pub struct ScanBuffer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> ScanBuffer<'a> {
    pub fn new(input: &'a str) -> Result<ScanBuffer<'a>, ParseError> {
        if input.contains('\0') {
            return Err(ParseError::ScanBuffer);
        }
        Ok(ScanBuffer { input, position: 0 })
    }

    pub fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    pub fn next_char(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.position += c.len_utf8();
        Some(c)
    }

    /// Consumes the longest prefix whose characters match `predicate`
    pub fn take_while<F: Fn(char) -> bool>(&mut self, predicate: F) -> &'a str {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|(_, c)| !predicate(*c))
            .map_or(rest.len(), |(i, _)| i);
        self.position += end;
        &rest[..end]
    }

    pub fn skip_whitespace(&mut self) {
        self.take_while(char::is_whitespace);
    }

    pub fn rest(&self) -> &'a str {
        &self.input[self.position..]
    }

    pub fn is_empty(&self) -> bool {
        self.position >= self.input.len()
    }
}

/// What an expression can refer to
#[derive(Debug, Clone, Copy)]
pub struct ParseScope<'a> {
    pub vm_id: i64,
    pub uid: i64,
    pub template: &'a Template,
    pub images: &'a dyn ImagePool,
}

pub trait ExpressionParser: Debug + Sync {
    /// Expands the expression held by `buffer`
    fn parse(&self, scope: &ParseScope<'_>, buffer: &mut ScanBuffer<'_>) -> Result<String, String>;

    /// Resolves the `$FILE[...]` references held by `buffer` into image ids
    fn parse_files(
        &self,
        scope: &ParseScope<'_>,
        buffer: &mut ScanBuffer<'_>,
    ) -> Result<Vec<i64>, String>;
}

fn syntax_error(attribute: &str, message: String) -> ParseError {
    if message.is_empty() {
        ParseError::Unknown(attribute.to_string())
    } else {
        ParseError::Syntax {
            attribute: attribute.to_string(),
            message,
        }
    }
}

/// Expands the value of `attribute`
pub fn parse_template_attribute(
    parser: &dyn ExpressionParser,
    scope: &ParseScope<'_>,
    attribute: &str,
    value: &str,
) -> Result<String, ParseError> {
    let _lock = LEX_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
    let mut buffer = ScanBuffer::new(value)?;
    trace!("Parsing {} for VM {}", attribute, scope.vm_id);

    parser
        .parse(scope, &mut buffer)
        .map_err(|message| syntax_error(attribute, message))
}

/// Resolves the images referenced by the value of `attribute`. Leading blanks
/// are ignored.
pub fn parse_file_attribute(
    parser: &dyn ExpressionParser,
    scope: &ParseScope<'_>,
    attribute: &str,
    value: &str,
) -> Result<Vec<i64>, ParseError> {
    let _lock = LEX_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
    let mut buffer = ScanBuffer::new(value.trim_start())?;

    parser
        .parse_files(scope, &mut buffer)
        .map_err(|message| syntax_error(attribute, message))
}

/// Builtin variable substitution.
///
/// `$NAME` expands to the scalar `NAME` of the template, `$NAME[FIELD]` to a
/// field of the first `NAME` vector and `$NAME[FIELD, KEY=VALUE]` to a field
/// of the first `NAME` vector whose `KEY` is `VALUE`. Unknown references
/// expand to nothing. `$UID` falls back to the owner of the VM.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableParser;

fn is_name(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"')
}

/// Splits `[FIELD, KEY=VALUE]` into its parts, the opening bracket has been
/// consumed already
fn selector<'a>(buffer: &mut ScanBuffer<'a>) -> Result<(&'a str, Option<(&'a str, &'a str)>), String> {
    let body = buffer.take_while(|c| c != ']');
    if buffer.next_char() != Some(']') {
        return Err(format!("syntax error, unterminated selector [{}", body));
    }

    let mut parts = body.splitn(2, ',');
    let field = parts.next().unwrap_or_default().trim();
    let filter = match parts.next() {
        Some(filter) => {
            let (key, value) = filter
                .split_once('=')
                .ok_or_else(|| format!("syntax error, wrong filter {}", filter.trim()))?;
            Some((key.trim(), unquote(value)))
        }
        None => None,
    };

    Ok((field, filter))
}

impl VariableParser {
    fn variable(
        scope: &ParseScope<'_>,
        name: &str,
        field: Option<(&str, Option<(&str, &str)>)>,
    ) -> String {
        match field {
            None => scope
                .template
                .get_string(name)
                .map(str::to_string)
                .or_else(|| (name == "UID").then(|| scope.uid.to_string()))
                .unwrap_or_default(),
            Some((field, filter)) => scope
                .template
                .vectors(name)
                .unwrap_or_default()
                .into_iter()
                .find(|vector| match filter {
                    Some((key, value)) => vector.get(key) == Some(value),
                    None => true,
                })
                .and_then(|vector| vector.get(field))
                .unwrap_or_default()
                .to_string(),
        }
    }
}

impl ExpressionParser for VariableParser {
    fn parse(&self, scope: &ParseScope<'_>, buffer: &mut ScanBuffer<'_>) -> Result<String, String> {
        let mut output = String::with_capacity(buffer.rest().len());

        while let Some(c) = buffer.next_char() {
            if c != '$' {
                output.push(c);
                continue;
            }

            let name = buffer.take_while(is_name);
            if name.is_empty() {
                output.push('$');
                continue;
            }

            let field = if buffer.peek() == Some('[') {
                buffer.next_char();
                Some(selector(buffer)?)
            } else {
                None
            };

            output.push_str(&Self::variable(scope, name, field));
        }

        Ok(output)
    }

    fn parse_files(
        &self,
        scope: &ParseScope<'_>,
        buffer: &mut ScanBuffer<'_>,
    ) -> Result<Vec<i64>, String> {
        let mut images = Vec::new();

        loop {
            buffer.skip_whitespace();
            if buffer.is_empty() {
                break;
            }

            if buffer.next_char() != Some('$') || buffer.take_while(is_name) != "FILE" {
                return Err("syntax error, expecting $FILE[...]".to_string());
            }
            if buffer.next_char() != Some('[') {
                return Err("syntax error, expecting [ after $FILE".to_string());
            }

            let body = buffer.take_while(|c| c != ']');
            if buffer.next_char() != Some(']') {
                return Err(format!("syntax error, unterminated $FILE[{}", body));
            }

            let mut image_id = None;
            let mut image_name = None;
            let mut owner = scope.uid;
            for pair in body.split(',') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("syntax error, wrong pair {}", pair.trim()))?;
                let value = unquote(value);
                match key.trim() {
                    "IMAGE_ID" => {
                        image_id = Some(
                            value
                                .parse::<i64>()
                                .map_err(|_| format!("wrong IMAGE_ID {}", value))?,
                        )
                    }
                    "IMAGE" => image_name = Some(value),
                    "IMAGE_UID" => {
                        owner = value
                            .parse::<i64>()
                            .map_err(|_| format!("wrong IMAGE_UID {}", value))?
                    }
                    other => return Err(format!("unknown $FILE attribute {}", other)),
                }
            }

            let id = match (image_id, image_name) {
                (Some(id), _) => id,
                (None, Some(name)) => scope
                    .images
                    .get_by_name(name, owner)
                    .map(|image| image.id)
                    .ok_or_else(|| format!("User {} does not own an image with name: {}", owner, name))?,
                (None, None) => return Err("$FILE needs IMAGE_ID or IMAGE".to_string()),
            };
            images.push(id);
        }

        Ok(images)
    }
}
