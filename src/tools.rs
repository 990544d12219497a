//! Tool registry
//!
//! Tools are declarations, not executors: the track engine translates a tool
//! call into either a metasploit console command or a container shell command
//! routed through the controller. Each tool declares whether it is sequential
//! (must not run concurrently with other sequential tools on the same track).

use crate::llm::ToolDefinition;
use serde_json::{json, Value};

pub const MSF_COMMAND: &str = "msf_command";
pub const BASH_COMMAND: &str = "bash_command";

/// One tool exposed to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    pub sequential: bool,
}

/// The built-in tool set.
pub struct ToolCatalog {
    tools: Vec<ToolSpec>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ToolCatalog {
    pub fn builtin() -> Self {
        Self {
            tools: vec![
                ToolSpec {
                    name: MSF_COMMAND,
                    description: "Run a command in the Metasploit console of this track's \
                                  container and return its output. The console executes one \
                                  command at a time.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "command": {
                                "type": "string",
                                "description": "The console command to run, e.g. `db_status` or `use exploit/...`"
                            }
                        },
                        "required": ["command"]
                    }),
                    sequential: true,
                },
                ToolSpec {
                    name: BASH_COMMAND,
                    description: "Run a shell command inside this track's container and return \
                                  stdout/stderr with the exit code. Commands run in parallel \
                                  with other shell commands.",
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "command": {
                                "type": "string",
                                "description": "The shell command to run"
                            }
                        },
                        "required": ["command"]
                    }),
                    sequential: false,
                },
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Whether a tool must be serialized against other sequential tools.
    /// Unknown tools are treated as sequential.
    pub fn is_sequential(&self, name: &str) -> bool {
        self.get(name).map_or(true, |t| t.sequential)
    }

    /// Tool definitions in the shape the LLM request carries.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.to_string(),
                description: t.description.to_string(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    /// Extract the command text a tool call carries.
    pub fn command_argument(arguments: &Value) -> Option<String> {
        arguments
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tools_declare_sequencing() {
        let catalog = ToolCatalog::builtin();
        assert!(catalog.is_sequential(MSF_COMMAND));
        assert!(!catalog.is_sequential(BASH_COMMAND));
        // Unknown tools default to sequential.
        assert!(catalog.is_sequential("launch_missiles"));
        assert!(catalog.get("launch_missiles").is_none());
    }

    #[test]
    fn definitions_cover_all_tools() {
        let defs = ToolCatalog::builtin().definitions();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![MSF_COMMAND, BASH_COMMAND]);
        for def in &defs {
            assert_eq!(def.input_schema["type"], "object");
            assert_eq!(def.input_schema["required"][0], "command");
        }
    }

    #[test]
    fn command_argument_extraction() {
        let args = json!({ "command": "db_nmap 10.0.0.1" });
        assert_eq!(
            ToolCatalog::command_argument(&args).as_deref(),
            Some("db_nmap 10.0.0.1")
        );
        assert_eq!(ToolCatalog::command_argument(&json!({})), None);
    }
}
