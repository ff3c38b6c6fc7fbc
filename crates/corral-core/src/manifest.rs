//! Manifest loading: turns a workspace's Procfile or compose file into the
//! list of components it declares.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Longest accepted Procfile line, in bytes.
pub const MAX_PROCFILE_LINE: usize = 4096;

pub const PROCFILE_NAMES: &[&str] = &["Procfile"];
pub const COMPOSE_NAMES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// A component declared by a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestComponent {
    pub name: String,
    pub type_: String,
    pub spec: Value,
}

/// Components declared by a manifest, plus non-fatal diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadResult {
    pub components: Vec<ManifestComponent>,
    pub warnings: Vec<String>,
}

/// Loads the manifest of a workspace root.
pub trait ManifestLoader: Send + Sync {
    fn load(&self, root: &Path) -> Result<LoadResult>;
}

/// Parse a Procfile body into process components.
///
/// Blank lines and `#` comments are skipped. Each remaining line is
/// `name: [KEY=value ...] program [arguments ...]`, split into words with
/// POSIX shell quoting.
pub fn parse_procfile(content: &str) -> Result<LoadResult> {
    let mut result = LoadResult::default();
    for (index, line) in content.lines().enumerate() {
        let line_number = index + 1;
        if line.len() > MAX_PROCFILE_LINE {
            return Err(Error::manifest(format!("line {} is too long", line_number)));
        }
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, command)) = line.split_once(':') else {
            return Err(Error::manifest(format!("line {} is invalid", line_number)));
        };
        let name = name.trim();
        let Some(words) = shlex::split(command) else {
            return Err(Error::manifest(format!(
                "process {:?} on line {} has unbalanced quotes",
                name, line_number
            )));
        };
        let mut words = words.into_iter().peekable();

        let mut environment = BTreeMap::new();
        while let Some(word) = words.peek() {
            match word.split_once('=') {
                Some((key, value)) if is_env_key(key) => {
                    environment.insert(key.to_string(), value.to_string());
                    words.next();
                }
                _ => break,
            }
        }
        let Some(program) = words.next() else {
            return Err(Error::manifest(format!(
                "process {:?} on line {} has invalid command",
                name, line_number
            )));
        };
        let arguments: Vec<String> = words.collect();

        result.components.push(ManifestComponent {
            name: name.to_string(),
            type_: "process".to_string(),
            spec: json!({
                "program": program,
                "arguments": arguments,
                "environment": environment,
            }),
        });
    }
    Ok(result)
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Render process components back into Procfile text.
pub fn generate_procfile<'a, I>(processes: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a crate::controller::process::ProcessSpec)>,
{
    let mut out = String::new();
    for (name, spec) in processes {
        out.push_str(name);
        out.push(':');
        for (key, value) in &spec.environment {
            out.push(' ');
            out.push_str(&format!("{}={}", key, quote(value)));
        }
        out.push(' ');
        out.push_str(&quote(&spec.program));
        for argument in &spec.arguments {
            out.push(' ');
            out.push_str(&quote(argument));
        }
        out.push('\n');
    }
    out
}

fn quote(word: &str) -> String {
    if !word.is_empty() && !word.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum CommandLine {
    #[default]
    None,
    Shell(String),
    Exec(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Dictionary {
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
    List(Vec<String>),
}

impl Default for Dictionary {
    fn default() -> Self {
        Dictionary::Map(BTreeMap::new())
    }
}

impl Dictionary {
    fn into_map(self) -> BTreeMap<String, String> {
        match self {
            Dictionary::Map(map) => map
                .into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        Some(serde_yaml::Value::String(s)) => s,
                        Some(serde_yaml::Value::Number(n)) => n.to_string(),
                        Some(serde_yaml::Value::Bool(b)) => b.to_string(),
                        _ => String::new(),
                    };
                    (key, value)
                })
                .collect(),
            Dictionary::List(items) => items
                .into_iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (item, String::new()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ComposeService {
    #[serde(default)]
    image: String,
    #[serde(default)]
    command: CommandLine,
    #[serde(default)]
    environment: Dictionary,
    #[serde(default)]
    ports: Vec<serde_yaml::Value>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    networks: Vec<String>,
    #[serde(default)]
    labels: Dictionary,
}

#[derive(Debug, Default, Deserialize)]
struct ComposeResource {
    #[serde(default)]
    driver: Option<String>,
    #[serde(default)]
    labels: Dictionary,
}

const COMPOSE_SECTIONS: &[&str] = &["version", "name", "services", "networks", "volumes"];

/// Parse a compose document into container, network and volume components.
pub fn parse_compose(content: &str) -> Result<LoadResult> {
    let document: serde_yaml::Mapping =
        serde_yaml::from_str(content).map_err(|e| Error::manifest(e.to_string()))?;
    let mut result = LoadResult::default();

    for key in document.keys() {
        let key = key.as_str().unwrap_or_default();
        if !COMPOSE_SECTIONS.contains(&key) && !key.starts_with("x-") {
            result.warnings.push(format!("unsupported section: {:?}", key));
        }
    }

    let section = |name: &str| -> Result<BTreeMap<String, Option<serde_yaml::Value>>> {
        match document.get(name) {
            None => Ok(BTreeMap::new()),
            Some(value) => serde_yaml::from_value(value.clone())
                .map_err(|e| Error::manifest(format!("{}: {}", name, e))),
        }
    };

    for (name, body) in section("networks")? {
        let network: ComposeResource = decode_entry("network", &name, body)?;
        result.components.push(ManifestComponent {
            name,
            type_: "network".to_string(),
            spec: json!({ "driver": network.driver, "labels": network.labels.into_map() }),
        });
    }

    for (name, body) in section("volumes")? {
        let volume: ComposeResource = decode_entry("volume", &name, body)?;
        result.components.push(ManifestComponent {
            name,
            type_: "volume".to_string(),
            spec: json!({ "driver": volume.driver, "labels": volume.labels.into_map() }),
        });
    }

    for (name, body) in section("services")? {
        let service: ComposeService = decode_entry("service", &name, body)?;
        if service.image.is_empty() {
            result
                .warnings
                .push(format!("service {:?} has no image", name));
        }
        let command = match service.command {
            CommandLine::None => Vec::new(),
            CommandLine::Shell(line) => line.split_whitespace().map(str::to_string).collect(),
            CommandLine::Exec(argv) => argv,
        };
        let ports: Vec<String> = service
            .ports
            .iter()
            .filter_map(|port| match port {
                serde_yaml::Value::String(s) => Some(s.clone()),
                serde_yaml::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect();
        result.components.push(ManifestComponent {
            name,
            type_: "container".to_string(),
            spec: json!({
                "image": service.image,
                "command": command,
                "environment": service.environment.into_map(),
                "ports": ports,
                "volumes": service.volumes,
                "networks": service.networks,
                "labels": service.labels.into_map(),
            }),
        });
    }

    Ok(result)
}

fn decode_entry<T>(kind: &str, name: &str, body: Option<serde_yaml::Value>) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match body {
        None | Some(serde_yaml::Value::Null) => Ok(T::default()),
        Some(value) => serde_yaml::from_value(value)
            .map_err(|e| Error::manifest(format!("{} {:?}: {}", kind, name, e))),
    }
}

fn find_manifest(root: &Path, names: &[&str]) -> Option<PathBuf> {
    names.iter().map(|name| root.join(name)).find(|path| path.is_file())
}

fn read_manifest(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::manifest(format!("reading {}: {}", path.display(), e)))
}

/// Loads `Procfile` from the workspace root.
#[derive(Debug, Clone, Default)]
pub struct ProcfileLoader;

impl ManifestLoader for ProcfileLoader {
    fn load(&self, root: &Path) -> Result<LoadResult> {
        let path = find_manifest(root, PROCFILE_NAMES)
            .ok_or_else(|| Error::manifest(format!("no Procfile in {}", root.display())))?;
        parse_procfile(&read_manifest(&path)?)
    }
}

/// Loads a compose file from the workspace root.
#[derive(Debug, Clone, Default)]
pub struct ComposeLoader;

impl ManifestLoader for ComposeLoader {
    fn load(&self, root: &Path) -> Result<LoadResult> {
        let path = find_manifest(root, COMPOSE_NAMES)
            .ok_or_else(|| Error::manifest(format!("no compose file in {}", root.display())))?;
        parse_compose(&read_manifest(&path)?)
    }
}

/// Loads whichever supported manifest is present, preferring a Procfile, or an
/// explicitly chosen file.
#[derive(Debug, Clone, Default)]
pub struct DefaultLoader {
    path: Option<PathBuf>,
}

impl DefaultLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` (relative to the root unless absolute) instead of searching.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

impl ManifestLoader for DefaultLoader {
    fn load(&self, root: &Path) -> Result<LoadResult> {
        if let Some(path) = &self.path {
            let path = root.join(path);
            let content = read_manifest(&path)?;
            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if PROCFILE_NAMES.contains(&file_name) || file_name.ends_with(".procfile") {
                return parse_procfile(&content);
            }
            return parse_compose(&content);
        }
        if find_manifest(root, PROCFILE_NAMES).is_some() {
            return ProcfileLoader.load(root);
        }
        if find_manifest(root, COMPOSE_NAMES).is_some() {
            return ComposeLoader.load(root);
        }
        Err(Error::manifest(format!("no manifest found in {}", root.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::process::ProcessSpec;

    #[test]
    fn test_parse_procfile() {
        let result = parse_procfile(
            "# services\n\nweb: PORT=3000 node server.js --verbose\n  worker : ./bin/worker\n",
        )
        .unwrap();
        assert_eq!(result.components.len(), 2);
        let web = &result.components[0];
        assert_eq!(web.name, "web");
        assert_eq!(web.type_, "process");
        assert_eq!(web.spec["program"], "node");
        assert_eq!(web.spec["arguments"], json!(["server.js", "--verbose"]));
        assert_eq!(web.spec["environment"]["PORT"], "3000");
        assert_eq!(result.components[1].name, "worker");
    }

    #[test]
    fn test_parse_procfile_errors_name_the_line() {
        let err = parse_procfile("web: ok\nbroken line\n").unwrap_err();
        assert_eq!(err.to_string(), "manifest error: line 2 is invalid");

        let err = parse_procfile("web:   \n").unwrap_err();
        assert!(err.to_string().contains("line 1 has invalid command"));

        let long = format!("web: {}\n", "x".repeat(MAX_PROCFILE_LINE));
        let err = parse_procfile(&long).unwrap_err();
        assert!(err.to_string().contains("line 1 is too long"));
    }

    #[test]
    fn test_procfile_round_trips_through_export() {
        let spec = ProcessSpec {
            program: "echo".to_string(),
            arguments: vec!["hello".to_string()],
            directory: None,
            environment: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
        };
        let text = generate_procfile([("greeter", &spec)]);
        assert_eq!(text, "greeter: GREETING=hi echo hello\n");
        let parsed = parse_procfile(&text).unwrap();
        let parsed: ProcessSpec =
            serde_json::from_value(parsed.components[0].spec.clone()).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_quoted_words_survive_export() {
        let spec = ProcessSpec {
            program: "echo".to_string(),
            arguments: vec!["hello world".to_string(), "it's".to_string(), String::new()],
            directory: None,
            environment: BTreeMap::from([("MOTD".to_string(), "good day".to_string())]),
        };
        let text = generate_procfile([("greeter", &spec)]);
        assert_eq!(text, "greeter: MOTD='good day' echo 'hello world' 'it'\\''s' ''\n");
        let parsed = parse_procfile(&text).unwrap();
        let parsed: ProcessSpec =
            serde_json::from_value(parsed.components[0].spec.clone()).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_parse_procfile_rejects_unbalanced_quotes() {
        let err = parse_procfile("web: echo 'oops\n").unwrap_err();
        assert!(err.to_string().contains("line 1 has unbalanced quotes"));
    }

    #[test]
    fn test_parse_compose() {
        let result = parse_compose(
            r#"
version: "3"
services:
  db:
    image: postgres:16
    environment:
      POSTGRES_PASSWORD: secret
    ports: ["5432:5432"]
    networks: [backend]
  web:
    image: nginx
    command: nginx -g daemon_off
networks:
  backend:
volumes:
  data:
    driver: local
secrets: {}
"#,
        )
        .unwrap();

        let kinds: Vec<(&str, &str)> = result
            .components
            .iter()
            .map(|c| (c.name.as_str(), c.type_.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("backend", "network"),
                ("data", "volume"),
                ("db", "container"),
                ("web", "container"),
            ]
        );
        assert_eq!(result.components[2].spec["environment"]["POSTGRES_PASSWORD"], "secret");
        assert_eq!(result.components[3].spec["command"], json!(["nginx", "-g", "daemon_off"]));
        assert_eq!(result.warnings, vec!["unsupported section: \"secrets\"".to_string()]);
    }

    #[test]
    fn test_default_loader_prefers_procfile() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("compose.yaml"), "services: {}\n").unwrap();
        std::fs::write(dir.path().join("Procfile"), "web: run\n").unwrap();
        let result = DefaultLoader::new().load(dir.path()).unwrap();
        assert_eq!(result.components.len(), 1);

        let result = DefaultLoader::with_path("compose.yaml").load(dir.path()).unwrap();
        assert!(result.components.is_empty());

        let empty = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            DefaultLoader::new().load(empty.path()),
            Err(Error::Manifest { .. })
        ));
    }
}
