//! Script path mapping.
//!
//! Rewrites the JSON file paths named in `read`/`write` statements so that
//! every client reads and writes beneath its own directory of the
//! filesystem root. Paths named by `write` statements are the job outputs.

use std::sync::OnceLock;

use meteor_protocol::routing::{validate_id, IdError};
use regex_lite::{Captures, Regex};

fn statement_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(write|read)\s+(\$\w+\s+to|from)\s+'\s*(/?[^']+\.json)'\s*;")
            .expect("statement pattern is valid")
    })
}

/// Script with rewritten paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedScript {
    pub script: String,
    /// Output paths as the client wrote them.
    pub original_outputs: Vec<String>,
    /// Output paths after mapping, same order.
    pub mapped_outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("invalid client id: {0}")]
    InvalidClientId(#[from] IdError),

    #[error("path '{0}' leaves the client directory")]
    PathEscapes(String),
}

#[derive(Debug, Clone)]
pub struct ScriptMapper {
    root: String,
}

impl ScriptMapper {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        if !root.ends_with('/') {
            root.push('/');
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Location of `path` inside the client's directory.
    pub fn map_path(&self, client_id: &str, path: &str) -> String {
        format!("{}{}/{}", self.root, client_id, path.trim_start_matches('/'))
    }

    pub fn map(&self, client_id: &str, script: &str) -> Result<MappedScript, MappingError> {
        validate_id(client_id)?;
        let pattern = statement_pattern();

        let mut original_outputs = Vec::new();
        let mut mapped_outputs = Vec::new();
        for caps in pattern.captures_iter(script) {
            let path = caps[3].trim();
            if path.split('/').any(|segment| segment == "..") {
                return Err(MappingError::PathEscapes(path.to_string()));
            }
            if &caps[1] == "write" {
                original_outputs.push(path.to_string());
                mapped_outputs.push(self.map_path(client_id, path));
            }
        }

        let mapped = pattern.replace_all(script, |caps: &Captures<'_>| {
            match (caps.get(0), caps.get(3)) {
                (Some(whole), Some(path)) => {
                    let text = whole.as_str();
                    let start = path.start() - whole.start();
                    let end = path.end() - whole.start();
                    format!(
                        "{}{}{}",
                        &text[..start],
                        self.map_path(client_id, path.as_str().trim()),
                        &text[end..]
                    )
                }
                _ => caps[0].to_string(),
            }
        });

        Ok(MappedScript {
            script: mapped.into_owned(),
            original_outputs,
            mapped_outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "$in = read from '/input/data.json';\n\
                          $out = filter $in where $in.x > 1;\n\
                          write $out to '/results/out.json';";

    #[test]
    fn test_maps_reads_and_writes() {
        let mapper = ScriptMapper::new("file:///srv/meteor");
        let mapped = mapper.map("alice", SCRIPT).unwrap();
        assert!(mapped.script.contains("read from 'file:///srv/meteor/alice/input/data.json';"));
        assert!(mapped.script.contains("write $out to 'file:///srv/meteor/alice/results/out.json';"));
        assert!(mapped.script.contains("filter $in where $in.x > 1;"));
    }

    #[test]
    fn test_write_paths_become_outputs() {
        let mapper = ScriptMapper::new("file:///srv/meteor/");
        let mapped = mapper.map("alice", SCRIPT).unwrap();
        assert_eq!(mapped.original_outputs, vec!["/results/out.json".to_string()]);
        assert_eq!(
            mapped.mapped_outputs,
            vec!["file:///srv/meteor/alice/results/out.json".to_string()]
        );
    }

    #[test]
    fn test_relative_path_is_not_doubled() {
        let mapper = ScriptMapper::new("file:///r/");
        assert_eq!(mapper.map_path("c", "a.json"), "file:///r/c/a.json");
        assert_eq!(mapper.map_path("c", "/a.json"), "file:///r/c/a.json");
    }

    #[test]
    fn test_script_without_statements_is_unchanged() {
        let mapper = ScriptMapper::new("file:///r/");
        let mapped = mapper.map("c", "$x = 1;").unwrap();
        assert_eq!(mapped.script, "$x = 1;");
        assert!(mapped.mapped_outputs.is_empty());
    }

    #[test]
    fn test_rejects_parent_segments() {
        let mapper = ScriptMapper::new("file:///r/");
        let err = mapper.map("c", "write $o to '../bob/x.json';").unwrap_err();
        assert_eq!(err, MappingError::PathEscapes("../bob/x.json".to_string()));
    }

    #[test]
    fn test_rejects_unroutable_client_id() {
        let mapper = ScriptMapper::new("file:///r/");
        assert!(matches!(
            mapper.map("a.b", SCRIPT),
            Err(MappingError::InvalidClientId(_))
        ));
    }
}
