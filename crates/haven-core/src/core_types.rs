use derive_more::{AsRef, Display, From, Into};
use serde::{Deserialize, Serialize};

/// 注册表中服务器的唯一名称
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    From,
    Into,
    AsRef,
    Serialize,
    Deserialize,
    Default,
)]
#[serde(transparent)]
pub struct ServerName(String);

/// 单次部署调用的标识
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, From, Into, AsRef, Serialize, Deserialize, Default,
)]
pub struct DeploymentId(String);

impl ServerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PartialEq<str> for ServerName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ServerName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl DeploymentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod server_name_tests {
        use super::*;

        #[test]
        fn test_new_and_as_str() {
            let name = ServerName::new("mini-01");
            assert_eq!(name.as_str(), "mini-01");
            assert_eq!(name, "mini-01");
        }

        #[test]
        fn test_ordering_is_lexicographic() {
            let mut names = vec![ServerName::from("b"), ServerName::from("a")];
            names.sort();
            assert_eq!(names[0], "a");
        }

        #[test]
        fn test_serializes_as_plain_string() {
            let json = serde_json::to_string(&ServerName::new("air")).unwrap();
            assert_eq!(json, "\"air\"");
        }
    }

    mod deployment_id_tests {
        use super::*;

        #[test]
        fn test_generate_is_unique_uuid() {
            let a = DeploymentId::generate();
            let b = DeploymentId::generate();
            assert_ne!(a, b);
            assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
        }
    }
}
