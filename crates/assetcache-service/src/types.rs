//! The typed payloads that can be cached.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::caching::CacheError;

/// How the bytes produced by a source are interpreted and stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    /// Raw bytes.
    #[default]
    #[serde(alias = "binary")]
    Buffer,
    /// UTF-8 decoded text.
    Text,
    /// Parsed JSON.
    #[serde(alias = "structured-data")]
    Json,
    /// Markup kept as raw text.
    #[serde(alias = "raw-markup")]
    Xml,
    /// Markup parsed into a [`MarkupNode`] tree.
    #[serde(alias = "structured-markup")]
    ParsedXml,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::Text => "text",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::ParsedXml => "parsed-xml",
        }
    }

    /// The suffix of the side-loaded content file.
    ///
    /// Markup is normalized onto the `text` and `json` files.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::Text | Self::Xml => "text",
            Self::Json | Self::ParsedXml => "json",
        }
    }

    /// One type per distinct content file suffix.
    pub const STORED: &'static [ContentType] = &[Self::Buffer, Self::Text, Self::Json];

    /// Whether this interpretation changes what ends up on disk for otherwise identical bytes,
    /// and thus has to be part of the cache key.
    pub fn affects_cache_key(&self) -> bool {
        matches!(self, Self::ParsedXml)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "buffer" | "binary" => Self::Buffer,
            "text" => Self::Text,
            "json" | "structured-data" => Self::Json,
            "xml" | "raw-markup" => Self::Xml,
            "parsed-xml" | "structured-markup" => Self::ParsedXml,
            other => return Err(CacheError::Malformed(format!("unknown content type `{other}`"))),
        })
    }
}

/// A parsed markup element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkupNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MarkupChild>,
}

/// A child of a [`MarkupNode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MarkupChild {
    Text(String),
    Element(MarkupNode),
}

impl MarkupNode {
    /// Parses a markup document into a tree rooted at its root element.
    ///
    /// Whitespace-only text between elements is dropped, other text is trimmed.
    pub fn parse(text: &str) -> Result<Self, CacheError> {
        let document = roxmltree::Document::parse(text)
            .map_err(|e| CacheError::Malformed(format!("invalid markup: {e}")))?;
        Ok(Self::from_element(document.root_element()))
    }

    fn from_element(node: roxmltree::Node<'_, '_>) -> Self {
        let attributes = node
            .attributes()
            .map(|attr| (attr.name().to_owned(), attr.value().to_owned()))
            .collect();

        let children = node
            .children()
            .filter_map(|child| {
                if child.is_element() {
                    Some(MarkupChild::Element(Self::from_element(child)))
                } else if child.is_text() {
                    let text = child.text()?.trim();
                    (!text.is_empty()).then(|| MarkupChild::Text(text.to_owned()))
                } else {
                    None
                }
            })
            .collect();

        Self {
            name: node.tag_name().name().to_owned(),
            attributes,
            children,
        }
    }

    /// Iterates over the direct child elements with the given name.
    pub fn elements<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MarkupNode> + 'a {
        self.children.iter().filter_map(move |child| match child {
            MarkupChild::Element(element) if element.name == name => Some(element),
            _ => None,
        })
    }

    /// Concatenates the direct text children of this element.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|child| match child {
                MarkupChild::Text(text) => Some(text.as_str()),
                MarkupChild::Element(_) => None,
            })
            .collect()
    }
}

/// A cached payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Contents {
    Buffer(Bytes),
    Text(String),
    Json(Value),
    Markup(MarkupNode),
}

impl Contents {
    /// Decodes freshly fetched bytes according to the requested content type.
    pub fn decode(ty: ContentType, bytes: Bytes) -> Result<Self, CacheError> {
        Ok(match ty {
            ContentType::Buffer => Self::Buffer(bytes),
            ContentType::Text | ContentType::Xml => Self::Text(utf8(bytes)?),
            ContentType::Json => Self::Json(serde_json::from_slice(&bytes)?),
            ContentType::ParsedXml => Self::Markup(MarkupNode::parse(&utf8(bytes)?)?),
        })
    }

    /// Reads the contents back from a side-loaded content file.
    pub(crate) fn from_file_bytes(ty: ContentType, bytes: Vec<u8>) -> Result<Self, CacheError> {
        Ok(match ty {
            ContentType::Buffer => Self::Buffer(bytes.into()),
            ContentType::Text | ContentType::Xml => Self::Text(utf8(bytes.into())?),
            ContentType::Json => Self::Json(serde_json::from_slice(&bytes)?),
            ContentType::ParsedXml => Self::Markup(serde_json::from_slice(&bytes)?),
        })
    }

    /// Serializes the contents into what is written to the side-loaded content file.
    pub(crate) fn to_file_bytes(&self) -> Result<Vec<u8>, CacheError> {
        Ok(match self {
            Self::Buffer(bytes) => bytes.to_vec(),
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Json(value) => serde_json::to_vec(value)?,
            Self::Markup(node) => serde_json::to_vec(node)?,
        })
    }

    /// Decodes contents that were embedded directly into a legacy metadata record.
    pub(crate) fn from_embedded(ty: ContentType, value: Value) -> Result<Self, CacheError> {
        Ok(match ty {
            ContentType::Buffer => Self::Buffer(embedded_buffer(value)?),
            ContentType::Text | ContentType::Xml => match value {
                Value::String(text) => Self::Text(text),
                other => Self::Text(other.to_string()),
            },
            ContentType::Json => Self::Json(value),
            ContentType::ParsedXml => Self::Markup(serde_json::from_value(value)?),
        })
    }

    /// The content type these contents naturally map to.
    pub fn natural_type(&self) -> ContentType {
        match self {
            Self::Buffer(_) => ContentType::Buffer,
            Self::Text(_) => ContentType::Text,
            Self::Json(_) => ContentType::Json,
            Self::Markup(_) => ContentType::ParsedXml,
        }
    }

    /// Picks the type these contents are stored as.
    ///
    /// The `requested` type wins whenever it can represent the contents, otherwise the
    /// [`natural_type`](Self::natural_type) is used.
    pub fn storage_type(&self, requested: ContentType) -> ContentType {
        match (self, requested) {
            (Self::Text(_), ContentType::Text | ContentType::Xml) => requested,
            _ => self.natural_type(),
        }
    }

    /// Whether these contents amount to "nothing" and must not be cached.
    ///
    /// Buffers never do, not even empty ones.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Buffer(_) => false,
            Self::Text(text) => text.is_empty(),
            Self::Json(value) => match value {
                Value::Null | Value::Bool(false) => true,
                Value::String(s) => s.is_empty(),
                Value::Number(n) => n.as_f64() == Some(0.0),
                Value::Bool(true) | Value::Array(_) | Value::Object(_) => false,
            },
            Self::Markup(_) => false,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Buffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_markup(&self) -> Option<&MarkupNode> {
        match self {
            Self::Markup(node) => Some(node),
            _ => None,
        }
    }
}

impl From<Bytes> for Contents {
    fn from(bytes: Bytes) -> Self {
        Self::Buffer(bytes)
    }
}

impl From<Vec<u8>> for Contents {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffer(bytes.into())
    }
}

impl From<String> for Contents {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Contents {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Value> for Contents {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<MarkupNode> for Contents {
    fn from(node: MarkupNode) -> Self {
        Self::Markup(node)
    }
}

fn utf8(bytes: Bytes) -> Result<String, CacheError> {
    String::from_utf8(bytes.into())
        .map_err(|e| CacheError::Malformed(format!("contents are not valid UTF-8: {e}")))
}

/// Buffers were embedded either as a `{"type": "Buffer", "data": [..]}` object, a plain array of
/// bytes, or a string.
fn embedded_buffer(value: Value) -> Result<Bytes, CacheError> {
    let data = match value {
        Value::Object(mut object) => object.remove("data").unwrap_or(Value::Null),
        other => other,
    };

    match data {
        Value::String(text) => Ok(Bytes::from(text)),
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|byte| u8::try_from(byte).ok())
                    .ok_or_else(|| CacheError::Malformed("invalid embedded buffer byte".into()))
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(Bytes::from),
        _ => Err(CacheError::Malformed("invalid embedded buffer".into())),
    }
}
