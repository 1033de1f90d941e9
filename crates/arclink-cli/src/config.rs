use std::error::Error;
use std::path::Path;

use serde::Deserialize;

use arclink_core::transport::LinkConfig;

/// On-disk link settings, layered under the command-line flags.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub local_host: Option<String>,
    pub local_port: Option<String>,
    pub remote_host: Option<String>,
    pub remote_port: Option<String>,
    pub forward: Option<bool>,
}

impl FileConfig {
    pub fn into_link_config(self) -> LinkConfig {
        let defaults = LinkConfig::default();
        LinkConfig {
            local_host: self.local_host.unwrap_or(defaults.local_host),
            local_port: self.local_port.unwrap_or(defaults.local_port),
            remote_host: self.remote_host.unwrap_or(defaults.remote_host),
            remote_port: self.remote_port.unwrap_or(defaults.remote_port),
            forward: self.forward.unwrap_or(defaults.forward),
        }
    }
}

pub fn load_from_file(path: &Path) -> Result<FileConfig, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let file: FileConfig = toml::from_str("remote_port = \"15200\"").expect("parse config");
        let config = file.into_link_config();
        assert_eq!(config.remote_port, "15200");
        assert_eq!(config.local_host, "127.0.0.1");
        assert!(!config.forward);
    }

    #[test]
    fn full_file_overrides_everything() {
        let text = r#"
            local_host = "0.0.0.0"
            local_port = "15112"
            remote_host = "cab2.local"
            remote_port = "15113"
            forward = true
        "#;
        let file: FileConfig = toml::from_str(text).expect("parse config");
        let config = file.into_link_config();
        assert_eq!(config.local_host, "0.0.0.0");
        assert_eq!(config.remote_host, "cab2.local");
        assert!(config.forward);
    }
}
