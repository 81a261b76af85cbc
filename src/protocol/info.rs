use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub version: Version,
    pub build_time: u64,
    pub git: GitInfo,
    /// Topics currently held open by the relay.
    pub rooms: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_release: Option<String>,
}

impl Version {
    pub fn parse(semver: &str) -> Self {
        let (core, pre_release) = match semver.split_once('-') {
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (semver, None),
        };
        let core = core.split('+').next().unwrap_or(core);
        let mut parts = core.split('.').map(|p| p.parse().unwrap_or(0));
        Self {
            semver: semver.to_string(),
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
            pre_release,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    pub branch: String,
    pub commit: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_semver_with_pre_release() {
        let v = Version::parse("1.4.2-beta.1");
        assert_eq!((v.major, v.minor, v.patch), (1, 4, 2));
        assert_eq!(v.pre_release.as_deref(), Some("beta.1"));

        let v = Version::parse("0.4.2+build7");
        assert_eq!(v.patch, 2);
        assert!(v.pre_release.is_none());
    }
}
