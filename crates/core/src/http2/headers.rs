//! The HTTP/2 header block.
//!
//! An ordered name/value map with the five pseudo-headers pre-seeded so that
//! they always render before regular headers. Unset pseudo-headers are
//! skipped when the block is rendered to a list; regular headers keep their
//! insertion order.

use indexmap::IndexMap;

/// `:scheme`
pub const PSEUDO_SCHEME: &str = ":scheme";
/// `:method`
pub const PSEUDO_METHOD: &str = ":method";
/// `:authority`
pub const PSEUDO_AUTHORITY: &str = ":authority";
/// `:path`
pub const PSEUDO_PATH: &str = ":path";
/// `:status`
pub const PSEUDO_STATUS: &str = ":status";

const PSEUDO_HEADERS: [&str; 5] = [
    PSEUDO_SCHEME,
    PSEUDO_METHOD,
    PSEUDO_AUTHORITY,
    PSEUDO_PATH,
    PSEUDO_STATUS,
];

/// An HTTP/2 header block.
#[derive(Debug, Clone)]
pub struct Http2Headers {
    headers: IndexMap<String, String>,
}

impl Http2Headers {
    /// An empty block (pseudo-headers unset).
    pub fn new() -> Self {
        let mut headers = IndexMap::with_capacity(8);
        for name in PSEUDO_HEADERS {
            headers.insert(name.to_owned(), String::new());
        }
        Self { headers }
    }

    /// Set a header. Names are lowercased; setting an existing name replaces
    /// its value in place.
    pub fn add(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Get a header value. Unset pseudo-headers read as absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        match self.headers.get(name) {
            Some(value) if !value.is_empty() => Some(value.as_str()),
            _ => None,
        }
    }

    /// `:method`
    pub fn method(&self) -> Option<&str> {
        self.get(PSEUDO_METHOD)
    }

    /// Set `:method`.
    pub fn set_method(&mut self, value: impl AsRef<str>) {
        self.headers.insert(
            PSEUDO_METHOD.to_owned(),
            value.as_ref().to_ascii_uppercase(),
        );
    }

    /// `:scheme`
    pub fn scheme(&self) -> Option<&str> {
        self.get(PSEUDO_SCHEME)
    }

    /// Set `:scheme`.
    pub fn set_scheme(&mut self, value: impl Into<String>) {
        self.headers.insert(PSEUDO_SCHEME.to_owned(), value.into());
    }

    /// `:authority`
    pub fn authority(&self) -> Option<&str> {
        self.get(PSEUDO_AUTHORITY)
    }

    /// Set `:authority`.
    pub fn set_authority(&mut self, value: impl Into<String>) {
        self.headers
            .insert(PSEUDO_AUTHORITY.to_owned(), value.into());
    }

    /// `:path`
    pub fn path(&self) -> Option<&str> {
        self.get(PSEUDO_PATH)
    }

    /// Set `:path`.
    pub fn set_path(&mut self, value: impl Into<String>) {
        self.headers.insert(PSEUDO_PATH.to_owned(), value.into());
    }

    /// `:status`
    pub fn status(&self) -> Option<&str> {
        self.get(PSEUDO_STATUS)
    }

    /// Set `:status`.
    pub fn set_status(&mut self, value: impl ToString) {
        self.headers
            .insert(PSEUDO_STATUS.to_owned(), value.to_string());
    }

    /// Render to a `(name, value)` list, skipping unset pseudo-headers.
    pub fn to_list(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(name, value)| {
                !(PSEUDO_HEADERS.contains(&name.as_str()) && value.is_empty())
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Render the non-empty headers to an ordered map.
    pub fn to_map(&self) -> IndexMap<String, String> {
        self.headers
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Rebuild a block from a decoded `(name, value)` list.
    pub fn from_list(list: Vec<(String, String)>) -> Self {
        let mut headers = Self::new();
        for (name, value) in list {
            headers.add(name, value);
        }
        headers
    }
}

impl Default for Http2Headers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_pseudo_headers_are_skipped() {
        let mut headers = Http2Headers::new();
        headers.set_method("post");
        headers.set_path("/Greeter/sayHello");
        headers.add("content-type", "application/grpc+proto");

        let list = headers.to_list();
        assert_eq!(
            list,
            vec![
                (":method".to_owned(), "POST".to_owned()),
                (":path".to_owned(), "/Greeter/sayHello".to_owned()),
                ("content-type".to_owned(), "application/grpc+proto".to_owned()),
            ]
        );
    }

    #[test]
    fn regular_headers_keep_insertion_order() {
        let mut headers = Http2Headers::new();
        headers.add("b-second", "2");
        headers.add("a-first", "1");
        headers.add("c-third", "3");
        let names: Vec<_> = headers.to_list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b-second", "a-first", "c-third"]);
    }

    #[test]
    fn names_are_lowercased() {
        let mut headers = Http2Headers::new();
        headers.add("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
    }

    #[test]
    fn round_trip_through_list() {
        let mut headers = Http2Headers::new();
        headers.set_status(200);
        headers.add("grpc-status", "0");
        let rebuilt = Http2Headers::from_list(headers.to_list());
        assert_eq!(rebuilt.status(), Some("200"));
        assert_eq!(rebuilt.get("grpc-status"), Some("0"));
    }
}
