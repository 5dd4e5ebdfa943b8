use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path, time::Duration};

use crate::error::{Error, Result};

/// Immutable description of one tool endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: EndpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default request timeout in seconds.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EndpointKind {
    #[serde(rename = "stdio", alias = "subprocess")]
    Subprocess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    #[serde(rename = "sse", alias = "event-stream")]
    EventStream {
        #[serde(rename = "baseUrl")]
        base_url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl EndpointKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Subprocess { .. } => "stdio",
            Self::EventStream { .. } => "sse",
        }
    }
}

impl EndpointConfig {
    pub fn subprocess(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: EndpointKind::Subprocess {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            description: None,
            timeout_secs: None,
        }
    }

    pub fn event_stream(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EndpointKind::EventStream {
                base_url: base_url.into(),
                headers: HashMap::new(),
            },
            description: None,
            timeout_secs: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Expand `${NAME}` placeholders in every string field that reaches a
    /// process or a request.
    #[must_use]
    pub fn expand_env(self) -> Self {
        let kind = match self.kind {
            EndpointKind::Subprocess { command, args, env } => EndpointKind::Subprocess {
                command: expand_env_placeholders(&command),
                args: args.iter().map(|a| expand_env_placeholders(a)).collect(),
                env: expand_env_map(&env),
            },
            EndpointKind::EventStream { base_url, headers } => EndpointKind::EventStream {
                base_url: expand_env_placeholders(&base_url),
                headers: expand_env_map(&headers),
            },
        };
        Self { kind, ..self }
    }
}

/// `mcpServers` map entry, keyed by endpoint name.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum McpServerEntry {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        timeout: Option<u64>,
    },
    Remote {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        timeout: Option<u64>,
    },
}

/// Accepted layouts of the endpoints file.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EndpointsFile {
    List(Vec<EndpointConfig>),
    Map {
        #[serde(rename = "mcpServers")]
        mcp_servers: HashMap<String, McpServerEntry>,
    },
}

impl EndpointsFile {
    fn into_endpoints(self) -> Vec<EndpointConfig> {
        match self {
            Self::List(list) => list,
            Self::Map { mcp_servers } => {
                let mut endpoints: Vec<EndpointConfig> = mcp_servers
                    .into_iter()
                    .map(|(name, entry)| match entry {
                        McpServerEntry::Stdio {
                            command,
                            args,
                            env,
                            timeout,
                        } => EndpointConfig {
                            name,
                            kind: EndpointKind::Subprocess { command, args, env },
                            description: None,
                            timeout_secs: timeout,
                        },
                        McpServerEntry::Remote {
                            url,
                            headers,
                            timeout,
                        } => EndpointConfig {
                            name,
                            kind: EndpointKind::EventStream {
                                base_url: url,
                                headers,
                            },
                            description: None,
                            timeout_secs: timeout,
                        },
                    })
                    .collect();
                endpoints.sort_by(|a, b| a.name.cmp(&b.name));
                endpoints
            }
        }
    }
}

/// Parse an endpoints document and expand environment placeholders.
pub fn parse_endpoints(txt: &str) -> Result<Vec<EndpointConfig>> {
    let file: EndpointsFile = serde_json::from_str(txt)
        .map_err(|e| Error::Config(format!("invalid endpoints file: {e}")))?;

    let endpoints: Vec<EndpointConfig> = file
        .into_endpoints()
        .into_iter()
        .map(EndpointConfig::expand_env)
        .collect();

    if let Some(unnamed) = endpoints.iter().position(|e| e.name.trim().is_empty()) {
        return Err(Error::Config(format!("endpoint #{unnamed} has no name")));
    }
    Ok(endpoints)
}

pub fn load_endpoints(path: impl AsRef<Path>) -> Result<Vec<EndpointConfig>> {
    let path = path.as_ref();
    let txt = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    parse_endpoints(&txt)
}

/// Expand "${VAR}" placeholders from the process environment.
/// Unset variables are substituted with an empty string and logged.
pub fn expand_env_placeholders(input: &str) -> String {
    if !input.contains("${") {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find('}') else {
            // unterminated: keep the remainder as written
            out.push_str(&rest[start..]);
            return out;
        };

        let name = &after[..end];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            out.push_str(&rest[start..start + 2 + end + 1]);
        } else if let Ok(value) = std::env::var(name) {
            out.push_str(&value);
        } else {
            tracing::warn!(
                variable = %name,
                "environment variable not set, placeholder substituted with empty string"
            );
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

pub fn expand_env_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), expand_env_placeholders(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_expand_known_and_unknown() {
        unsafe {
            env::set_var("RELAY_TEST_KEY", "secret");
            env::remove_var("RELAY_TEST_MISSING");
        }

        assert_eq!(
            expand_env_placeholders("Bearer ${RELAY_TEST_KEY}"),
            "Bearer secret"
        );
        assert_eq!(
            expand_env_placeholders("a${RELAY_TEST_MISSING}b"),
            "ab"
        );
        assert_eq!(
            expand_env_placeholders("${RELAY_TEST_KEY}-${RELAY_TEST_KEY}"),
            "secret-secret"
        );

        unsafe {
            env::remove_var("RELAY_TEST_KEY");
        }
    }

    #[test]
    fn test_expand_leaves_malformed_placeholders() {
        assert_eq!(expand_env_placeholders("no placeholders"), "no placeholders");
        assert_eq!(expand_env_placeholders("cost: ${"), "cost: ${");
        assert_eq!(expand_env_placeholders("${not valid}"), "${not valid}");
        assert_eq!(expand_env_placeholders("$HOME"), "$HOME");
    }

    #[test]
    #[serial]
    fn test_parse_list_form() {
        unsafe {
            env::set_var("RELAY_TEST_TOKEN", "t0k");
        }

        let endpoints = parse_endpoints(
            r#"[
                {"name": "12306", "type": "stdio", "command": "npx", "args": ["-y", "12306-mcp"], "env": {"KEY": "${RELAY_TEST_TOKEN}"}},
                {"name": "amap", "type": "sse", "baseUrl": "https://mcp.example.com/sse", "headers": {"Authorization": "Bearer ${RELAY_TEST_TOKEN}"}, "timeout": 20}
            ]"#,
        )
        .unwrap();

        assert_eq!(endpoints.len(), 2);
        match &endpoints[0].kind {
            EndpointKind::Subprocess { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args, &vec!["-y".to_string(), "12306-mcp".to_string()]);
                assert_eq!(env.get("KEY").map(String::as_str), Some("t0k"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        match &endpoints[1].kind {
            EndpointKind::EventStream { base_url, headers } => {
                assert_eq!(base_url, "https://mcp.example.com/sse");
                assert_eq!(
                    headers.get("Authorization").map(String::as_str),
                    Some("Bearer t0k")
                );
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(endpoints[1].timeout(), Some(Duration::from_secs(20)));
        assert_eq!(endpoints[0].timeout(), None);

        unsafe {
            env::remove_var("RELAY_TEST_TOKEN");
        }
    }

    #[test]
    fn test_parse_map_form() {
        let endpoints = parse_endpoints(
            r#"{
                "mcpServers": {
                    "time": { "command": "npx", "args": ["-y", "@mcpcentral/mcp-time"] },
                    "search": { "url": "https://mcp.example.com/sse" }
                }
            }"#,
        )
        .unwrap();

        let names: Vec<&str> = endpoints.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["search", "time"]);
        assert_eq!(endpoints[0].kind.label(), "sse");
        assert_eq!(endpoints[1].kind.label(), "stdio");
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let err = parse_endpoints(r#"[{"name": "x", "type": "carrier-pigeon"}]"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_parse_rejects_unnamed() {
        let err = parse_endpoints(r#"[{"name": " ", "type": "stdio", "command": "x"}]"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
