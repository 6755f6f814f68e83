// Copyright 2022 The Dagkv Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Server and client configuration.

#![expect(missing_docs)]

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot parse config file {path}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },
}

/// Certificate material handed to the TLS layer. Provisioning the files is
/// the operator's problem.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Options recognized by the server.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Transport URI to bind, e.g. `tcp://127.0.0.1:8888` or
    /// `unix:///run/dagkv.sock`.
    pub uri: String,
    pub tls: Option<TlsConfig>,
    /// Backend-specific layering knob, forwarded to the backend
    /// constructor.
    pub with_lower_layer: bool,
    /// Port of the auxiliary GraphQL interface, when one is deployed
    /// alongside the native protocol.
    pub graphql_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            uri: format!("tcp://127.0.0.1:{}", crate::transport::DEFAULT_PORT),
            tls: None,
            with_lower_layer: false,
            graphql_port: None,
        }
    }
}

/// Options recognized by the client.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Transport URI to connect to.
    pub uri: String,
    pub tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            uri: format!("tcp://127.0.0.1:{}", crate::transport::DEFAULT_PORT),
            tls: false,
        }
    }
}

fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source: Box::new(source),
    })
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load(path)
    }
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.uri, "tcp://127.0.0.1:8888");
    }

    #[test]
    fn test_server_config_full() {
        let config: ServerConfig = toml::from_str(
            r#"
            uri = "unix:///run/dagkv.sock"
            with_lower_layer = true
            graphql_port = 8080

            [tls]
            cert_path = "/etc/dagkv/cert.pem"
            key_path = "/etc/dagkv/key.pem"
            "#,
        )
        .unwrap();
        assert_eq!(config.uri, "unix:///run/dagkv.sock");
        assert!(config.with_lower_layer);
        assert_eq!(config.graphql_port, Some(8080));
        assert_eq!(
            config.tls,
            Some(TlsConfig {
                cert_path: PathBuf::from("/etc/dagkv/cert.pem"),
                key_path: PathBuf::from("/etc/dagkv/key.pem"),
            })
        );
    }

    #[test]
    fn test_client_config() {
        let config: ClientConfig = toml::from_str(r#"uri = "tcp://db.example.com:9000""#).unwrap();
        assert_eq!(config.uri, "tcp://db.example.com:9000");
        assert!(!config.tls);
    }
}
