use std::cmp::Ordering;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("Failed to execute cmake: {0}")]
    ExecutionFailed(String),
    #[error("Failed to parse cmake version output")]
    ParseFailed,
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmakeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Suffix such as `rc1` or `20240301-g1234abc`
    pub suffix: Option<String>,
}

/// Oldest release whose server mode is usable
pub const SERVER_MODE_MIN: CmakeVersion = CmakeVersion::new(3, 7, 1);

/// First release without `cmake -E server`
pub const SERVER_MODE_REMOVED: CmakeVersion = CmakeVersion::new(3, 20, 0);

impl CmakeVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            suffix: None,
        }
    }

    /// Detect the version by running `cmake --version`
    pub async fn detect(cmake_path: &str) -> Result<Self, VersionError> {
        let output = Command::new(cmake_path)
            .arg("--version")
            .output()
            .await
            .map_err(|e| VersionError::ExecutionFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(VersionError::ExecutionFailed(format!(
                "{cmake_path} --version failed"
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Self::parse_version_output(&stdout)
    }

    pub fn parse_version_output(output: &str) -> Result<Self, VersionError> {
        // "cmake version 3.16.3" or "cmake3 version 3.17.5"
        let version_str = output
            .lines()
            .find_map(|line| {
                let idx = line.find(" version ")?;
                line[..idx]
                    .starts_with("cmake")
                    .then(|| line[idx + " version ".len()..].trim())
            })
            .ok_or(VersionError::ParseFailed)?;

        let mut dot_parts = version_str.splitn(3, '.');

        let major = dot_parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| VersionError::InvalidFormat("major version".to_string()))?;

        let minor = dot_parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| VersionError::InvalidFormat("minor version".to_string()))?;

        // "3-rc1", "20240301-g1234abc" or plain "3"
        let patch_part = dot_parts.next().unwrap_or("0");
        let digits_end = patch_part
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(patch_part.len());
        let patch = patch_part[..digits_end]
            .parse::<u32>()
            .map_err(|_| VersionError::InvalidFormat("patch version".to_string()))?;
        let suffix = patch_part[digits_end..]
            .trim_start_matches(['-', '.'])
            .to_string();

        Ok(Self {
            major,
            minor,
            patch,
            suffix: (!suffix.is_empty()).then_some(suffix),
        })
    }

    /// Whether `cmake -E server` can be used
    pub fn supports_server_mode(&self) -> bool {
        *self >= SERVER_MODE_MIN && *self < SERVER_MODE_REMOVED
    }
}

impl PartialOrd for CmakeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders by numeric components only
impl Ord for CmakeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl std::fmt::Display for CmakeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "-{suffix}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release() {
        let output = "cmake version 3.16.3\n\nCMake suite maintained and supported by Kitware (kitware.com/cmake).\n";
        let version = CmakeVersion::parse_version_output(output).unwrap();
        assert_eq!(version, CmakeVersion::new(3, 16, 3));
        assert!(version.supports_server_mode());
    }

    #[test]
    fn test_parse_release_candidate() {
        let version = CmakeVersion::parse_version_output("cmake version 3.7.0-rc2\n").unwrap();
        assert_eq!(version.patch, 0);
        assert_eq!(version.suffix.as_deref(), Some("rc2"));
        assert!(!version.supports_server_mode());
        assert_eq!(version.to_string(), "3.7.0-rc2");
    }

    #[test]
    fn test_parse_cmake3_binary_name() {
        let version = CmakeVersion::parse_version_output("cmake3 version 3.17.5\n").unwrap();
        assert_eq!(version, CmakeVersion::new(3, 17, 5));
    }

    #[test]
    fn test_parse_dev_build() {
        let version =
            CmakeVersion::parse_version_output("cmake version 3.29.20240301-g1234abc\n").unwrap();
        assert_eq!(version.patch, 20240301);
        assert_eq!(version.suffix.as_deref(), Some("g1234abc"));
        assert!(!version.supports_server_mode());
    }

    #[test]
    fn test_server_mode_bounds() {
        assert!(CmakeVersion::new(3, 7, 1).supports_server_mode());
        assert!(!CmakeVersion::new(3, 7, 0).supports_server_mode());
        assert!(CmakeVersion::new(3, 19, 8).supports_server_mode());
        assert!(!CmakeVersion::new(3, 20, 0).supports_server_mode());
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(
            CmakeVersion::parse_version_output("ninja 1.11.1\n"),
            Err(VersionError::ParseFailed)
        ));
        assert!(matches!(
            CmakeVersion::parse_version_output("cmake version x.y\n"),
            Err(VersionError::InvalidFormat(_))
        ));
    }

    #[cfg(feature = "cmake-integration-tests")]
    #[tokio::test]
    async fn test_detect_installed_cmake() {
        let version = CmakeVersion::detect("cmake").await.unwrap();
        assert!(version >= CmakeVersion::new(3, 0, 0));
    }
}
