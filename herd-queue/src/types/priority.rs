use serde::{Deserialize, Serialize};

/// Job priority for queue ordering. Lower values are processed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(pub i32);

// Ordering among waiting jobs of one queue: (priority ascending, created_at ascending, seq ascending)

impl JobPriority {
    /// Processed before everything else
    pub const HIGHEST: Self = Self(1);

    pub const HIGH: Self = Self(5);

    /// Default when no priority is given at enqueue time
    pub const NORMAL: Self = Self(10);

    pub const LOW: Self = Self(100);

    /// Get the numeric value for ordering
    pub fn value(self) -> i32 {
        self.0
    }

    /// Get human-readable name for the named levels
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::HIGHEST => Some("highest"),
            Self::HIGH => Some("high"),
            Self::NORMAL => Some("normal"),
            Self::LOW => Some("low"),
            _ => None,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for JobPriority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "highest" => Ok(Self::HIGHEST),
            "high" => Ok(Self::HIGH),
            "normal" => Ok(Self::NORMAL),
            "low" => Ok(Self::LOW),
            other => other
                .parse::<i32>()
                .map(Self)
                .map_err(|_| format!("Invalid priority: {}", s)),
        }
    }
}
