use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tool category a job is filed under.
///
/// Known categories get their own variant; anything else is kept verbatim in
/// `Other` so a user-defined tool never fails to load because of its label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ToolCategory {
    Crypto,
    Forensics,
    Media,
    Network,
    Reverse,
    Web,
    Misc,
    Other(String),
}

impl ToolCategory {
    pub fn as_str(&self) -> &str {
        match self {
            ToolCategory::Crypto => "crypto",
            ToolCategory::Forensics => "forensics",
            ToolCategory::Media => "media",
            ToolCategory::Network => "network",
            ToolCategory::Reverse => "reverse",
            ToolCategory::Web => "web",
            ToolCategory::Misc => "misc",
            ToolCategory::Other(label) => label,
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolCategory {
    type Err = std::convert::Infallible;

    /// Lenient parse: case-insensitive, accepts the long labels the desktop
    /// app shows ("Crypto & Encoding", "Reverse Engineering", ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let head = normalized
            .split(|c: char| c == ' ' || c == '-' || c == '_' || c == '&')
            .find(|part| !part.is_empty())
            .unwrap_or("");

        Ok(match head {
            "crypto" | "cryptography" => ToolCategory::Crypto,
            "forensics" => ToolCategory::Forensics,
            "media" | "steganography" | "stego" => ToolCategory::Media,
            "network" | "net" => ToolCategory::Network,
            "reverse" | "re" | "reversing" => ToolCategory::Reverse,
            "web" => ToolCategory::Web,
            "misc" | "miscellaneous" => ToolCategory::Misc,
            _ => ToolCategory::Other(s.trim().to_string()),
        })
    }
}

impl From<String> for ToolCategory {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(category) => category,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for ToolCategory {
    fn from(s: &str) -> Self {
        ToolCategory::from(s.to_string())
    }
}

impl From<ToolCategory> for String {
    fn from(category: ToolCategory) -> Self {
        category.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_desktop_labels() {
        assert_eq!(ToolCategory::from("Crypto & Encoding"), ToolCategory::Crypto);
        assert_eq!(
            ToolCategory::from("reverse-engineering"),
            ToolCategory::Reverse
        );
        assert_eq!(ToolCategory::from("Reverse Engineering"), ToolCategory::Reverse);
        assert_eq!(
            ToolCategory::from("Steganography & Media"),
            ToolCategory::Media
        );
        assert_eq!(ToolCategory::from("Network Security"), ToolCategory::Network);
    }

    #[test]
    fn test_unknown_label_is_kept() {
        let category = ToolCategory::from("  Hardware  ");
        assert_eq!(category, ToolCategory::Other("Hardware".to_string()));
        assert_eq!(category.to_string(), "Hardware");
    }

    #[test]
    fn test_serde_uses_plain_strings() {
        let json = serde_json::to_string(&ToolCategory::Forensics).unwrap();
        assert_eq!(json, "\"forensics\"");
        let parsed: ToolCategory = serde_json::from_str("\"Web\"").unwrap();
        assert_eq!(parsed, ToolCategory::Web);
    }
}
