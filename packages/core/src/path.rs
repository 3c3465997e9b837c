//! Access chains: the sequence of property names leading from an exposed
//! root to the thing an operation targets.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathError {
    pub name: String,
    pub position: usize,
    pub reason: &'static str,
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bad property name '{}' at step {}: {}",
            self.name, self.position, self.reason
        )
    }
}

impl std::error::Error for PathError {}

/// A validated access chain. The empty chain is the root itself.
///
/// Each step is an identifier (`handle_request`, `_private`) or an array
/// index (`0`). Chains decoded off the wire are checked again, so a peer
/// cannot smuggle an arbitrary string into a lookup.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Path {
    steps: Vec<String>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a `/`-separated chain. Empty steps are skipped.
    ///
    /// ```rust
    /// use tether_core::Path;
    ///
    /// let path = Path::parse("/gateway//handle_request/").unwrap();
    /// assert_eq!(path.to_string(), "gateway/handle_request");
    /// ```
    pub fn parse(s: &str) -> Result<Self, PathError> {
        s.split('/')
            .filter(|step| !step.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
            .try_into()
    }

    /// The chain one step deeper.
    pub fn child(&self, name: &str) -> Result<Path, PathError> {
        check_step(name, self.steps.len())?;
        let mut steps = self.steps.clone();
        steps.push(name.to_string());
        Ok(Path { steps })
    }

    /// The chain one step shallower. The root is its own parent.
    #[must_use]
    pub fn parent(&self) -> Path {
        let mut steps = self.steps.clone();
        steps.pop();
        Path { steps }
    }

    pub fn last(&self) -> Option<&str> {
        self.steps.last().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn check_step(step: &str, position: usize) -> Result<(), PathError> {
    let reject = |reason| {
        Err(PathError {
            name: step.to_string(),
            position,
            reason,
        })
    };

    if step.is_empty() {
        return reject("empty");
    }
    if step.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(());
    }

    let mut chars = step.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c == '_' || unicode_ident::is_xid_start(c));
    if !head_ok {
        return reject("must begin with a letter or '_'");
    }
    if !chars.all(unicode_ident::is_xid_continue) {
        return reject("not an identifier");
    }
    Ok(())
}

impl TryFrom<Vec<String>> for Path {
    type Error = PathError;

    fn try_from(steps: Vec<String>) -> Result<Self, Self::Error> {
        for (position, step) in steps.iter().enumerate() {
            check_step(step, position)?;
        }
        Ok(Path { steps })
    }
}

impl From<Path> for Vec<String> {
    fn from(path: Path) -> Self {
        path.steps
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.steps.join("/"))
    }
}

/// Build a [`Path`] from a literal known to be valid.
///
/// ```rust
/// let p = tether_core::path!("gateway/handle_request");
/// assert_eq!(p.last(), Some("handle_request"));
/// ```
#[macro_export]
macro_rules! path {
    ($s:expr) => {
        $crate::Path::parse($s).expect("invalid path literal")
    };
}
