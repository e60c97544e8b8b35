//! Logical triggers and their mapping to physical channel names.
//!
//! Publishers and subscribers address *triggers*; the engine maps each
//! trigger through a pure transform function to the physical channel name
//! used on the transport. Several triggers may map to the same channel.

use std::fmt;
use std::sync::Arc;

/// A logical event name or ordered path addressed by publishers and
/// subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// A flat event name, used as-is by the default transform.
    Name(String),
    /// An ordered path, joined with `.` by the default transform.
    Path(Vec<PathSegment>),
}

/// One segment of a path trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// A string key.
    Key(String),
    /// A numeric index.
    Index(u64),
}

impl Trigger {
    /// Build a path trigger from segments.
    #[must_use]
    pub fn path(segments: impl IntoIterator<Item = PathSegment>) -> Self {
        Self::Path(segments.into_iter().collect())
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Path(segments) => {
                for (i, segment) in segments.iter().enumerate() {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    match segment {
                        PathSegment::Key(key) => f.write_str(key)?,
                        PathSegment::Index(index) => write!(f, "{index}")?,
                    }
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Trigger {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Trigger {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<u64> for PathSegment {
    fn from(index: u64) -> Self {
        Self::Index(index)
    }
}

/// How a trigger's channel is subscribed on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Subscribe to the channel by exact name.
    Exact,
    /// Treat the channel name as a glob over channel names.
    Pattern,
}

/// Pure function mapping a trigger plus its subscribe mode to a physical
/// channel name.
pub type TriggerTransform = Arc<dyn Fn(&Trigger, SubscribeMode) -> String + Send + Sync>;

/// The default transform: names map to themselves, paths join with `.`.
#[must_use]
pub fn default_transform() -> TriggerTransform {
    Arc::new(|trigger, _mode| trigger.to_string())
}
