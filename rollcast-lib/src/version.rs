use serde::{Deserialize, Serialize};

/// Build identity exchanged as the first message of every control channel.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Version {
    pub code: String,
    pub revision: String,
    pub build_time: String,
}

impl Version {
    pub fn current() -> Self {
        Self {
            code: env!("CARGO_PKG_VERSION").to_owned(),
            revision: option_env!("ROLLCAST_REVISION").unwrap_or("unknown").to_owned(),
            build_time: option_env!("ROLLCAST_BUILD_TIME").unwrap_or("unknown").to_owned(),
        }
    }

    /// Compatibility check at a given strictness level: level 1 compares the
    /// version code alone, level 2 adds the revision, level 3 and up adds the
    /// build time.
    pub fn is_similar(&self, other: &Self, level: u8) -> bool {
        if self.code != other.code {
            return false;
        }
        if level >= 2 && self.revision != other.revision {
            return false;
        }
        if level >= 3 && self.build_time != other.build_time {
            return false;
        }
        true
    }

    /// Human-readable form used in mismatch errors. The strictness here is
    /// the user-facing option, one below the `is_similar` level.
    pub fn display_for(&self, strictness: u8) -> String {
        let mut out = self.code.clone();
        if strictness >= 2 {
            out.push(' ');
            out.push_str(&self.revision);
        }
        if strictness >= 3 {
            out.push(' ');
            out.push_str(&self.build_time);
        }
        out
    }
}
