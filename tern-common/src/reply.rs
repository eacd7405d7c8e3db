use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// An SMTP reply: a three digit code, an optional enhanced status code and text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reply {
    pub code: u16,
    pub enhanced: Option<String>,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, enhanced: &str, text: impl Into<String>) -> Self {
        Self {
            code,
            enhanced: Some(enhanced.to_string()),
            text: text.into(),
        }
    }

    /// A reply without an enhanced status code, as received from older servers.
    pub fn plain(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            enhanced: None,
            text: text.into(),
        }
    }

    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    pub const fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// The enhanced status code, or the class default derived from the reply code.
    pub fn status(&self) -> String {
        self.enhanced.clone().unwrap_or_else(|| {
            match self.code / 100 {
                2 => "2.0.0",
                4 => "4.0.0",
                _ => "5.0.0",
            }
            .to_string()
        })
    }

    pub fn local_error() -> Self {
        Self::new(451, "4.3.0", "Local error in processing")
    }

    pub fn unknown_recipient() -> Self {
        Self::new(550, "5.1.1", "Unknown recipient")
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.enhanced {
            Some(enhanced) => write!(f, "{} {enhanced} {}", self.code, self.text),
            None => write!(f, "{} {}", self.code, self.text),
        }
    }
}
