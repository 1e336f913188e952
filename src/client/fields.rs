//! Form fields and their encodings.
//!
//! Fields are an ordered list of name/value pairs. Names may repeat, and every
//! occurrence is encoded.

use bytes::{BufMut, Bytes, BytesMut};

/// A single form value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Plain text.
    Text(String),

    /// A file upload. Only meaningful for multipart bodies.
    File {
        /// Filename sent in the content disposition.
        filename: String,
        /// File contents.
        data: Bytes,
        /// Content type, `application/octet-stream` when unset.
        content_type: Option<String>,
    },
}

impl FieldValue {
    fn as_text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            FieldValue::Text(text) => text.as_str().into(),
            FieldValue::File { data, .. } => String::from_utf8_lossy(data),
        }
    }
}

/// Ordered form fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    inner: Vec<(String, FieldValue)>,
}

impl Fields {
    /// Empty fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text field.
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.push((name.into(), FieldValue::Text(value.into())));
        self
    }

    /// Append a file field.
    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        data: impl Into<Bytes>,
        content_type: Option<String>,
    ) -> Self {
        self.inner.push((
            name.into(),
            FieldValue::File {
                filename: filename.into(),
                data: data.into(),
                content_type,
            },
        ));
        self
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate over fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.inner.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Encode as `application/x-www-form-urlencoded`.
    pub fn urlencode(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &self.inner {
            serializer.append_pair(name, &value.as_text());
        }
        serializer.finish()
    }

    /// Encode as `multipart/form-data`, returning the body and its content type.
    ///
    /// A random boundary is generated when none is given.
    pub fn encode_multipart(&self, boundary: Option<&str>) -> (Bytes, String) {
        let boundary = boundary.map_or_else(choose_boundary, str::to_owned);
        let mut body = BytesMut::new();

        for (name, value) in &self.inner {
            body.put_slice(b"--");
            body.put_slice(boundary.as_bytes());
            body.put_slice(b"\r\n");

            match value {
                FieldValue::Text(text) => {
                    body.put_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                            .as_bytes(),
                    );
                    body.put_slice(text.as_bytes());
                }
                FieldValue::File {
                    filename,
                    data,
                    content_type,
                } => {
                    body.put_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n"
                        )
                        .as_bytes(),
                    );
                    let content_type = content_type
                        .as_deref()
                        .unwrap_or("application/octet-stream");
                    body.put_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
                    body.put_slice(data);
                }
            }
            body.put_slice(b"\r\n");
        }

        body.put_slice(b"--");
        body.put_slice(boundary.as_bytes());
        body.put_slice(b"--\r\n");

        (
            body.freeze(),
            format!("multipart/form-data; boundary={boundary}"),
        )
    }
}

impl<K, V> FromIterator<(K, V)> for Fields
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(name, value)| (name.into(), FieldValue::Text(value.into())))
                .collect(),
        }
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Fields
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(value: [(K, V); N]) -> Self {
        value.into_iter().collect()
    }
}

fn choose_boundary() -> String {
    format!("{:032x}", rand::random::<u128>())
}
