use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// The URI scheme content names may be prefixed with.
pub const SCHEME: &str = "ccnx:";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("'{name}' is not a valid content name: {reason}")]
pub struct NameError {
    name: String,
    reason: &'static str,
}

impl NameError {
    fn new(name: &str, reason: &'static str) -> Self {
        Self { name: name.to_string(), reason }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reason(&self) -> &str {
        self.reason
    }
}

/// An immutable, hierarchical content name such as `/parc/videos/intro.mp4`.
///
/// Names are checked for basic shape only. Component encoding (percent escapes, version and segment markers) is the
/// fetch library's business; it gets the final say when the transport resolves the name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentName(String);

impl ContentName {
    /// Parses a content name, accepting an optional `ccnx:` scheme prefix.
    pub fn parse(uri: &str) -> Result<Self, NameError> {
        let trimmed = uri.trim();
        let name = match trimmed.get(..SCHEME.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(SCHEME) => &trimmed[SCHEME.len()..],
            _ => trimmed,
        };
        if name.is_empty() {
            return Err(NameError::new(uri, "the name is empty"));
        }
        if !name.starts_with('/') {
            return Err(NameError::new(uri, "names must start with '/'"));
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(NameError::new(uri, "names cannot contain whitespace or control characters"));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name's components, in order. The root name `/` has none.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').skip(1).filter(|c| !c.is_empty())
    }

    /// The name in URI form, i.e. with the `ccnx:` scheme.
    pub fn to_uri(&self) -> String {
        format!("{SCHEME}{}", self.0)
    }
}

impl Display for ContentName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentName::parse(s)
    }
}

impl AsRef<str> for ContentName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scheme_prefix_is_stripped() {
        let name = ContentName::parse("ccnx:/parc/videos/intro.mp4").unwrap();
        assert_eq!(name.as_str(), "/parc/videos/intro.mp4");
        assert_eq!(name.to_uri(), "ccnx:/parc/videos/intro.mp4");
        let name: ContentName = "CCNX:/a".parse().unwrap();
        assert_eq!(name.to_string(), "/a");
    }

    #[test]
    fn bare_names_are_accepted() {
        let name = ContentName::parse("/a/b/c").unwrap();
        assert_eq!(name.components().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        let root = ContentName::parse("/").unwrap();
        assert_eq!(root.components().count(), 0);
    }

    #[test]
    fn malformed_names_are_rejected() {
        assert_eq!(ContentName::parse("").unwrap_err().reason(), "the name is empty");
        assert_eq!(ContentName::parse("ccnx:").unwrap_err().reason(), "the name is empty");
        assert_eq!(ContentName::parse("parc/videos").unwrap_err().reason(), "names must start with '/'");
        let err = ContentName::parse("/parc/my videos").unwrap_err();
        assert_eq!(err.name(), "/parc/my videos");
        assert!(err.to_string().contains("whitespace"));
    }
}
