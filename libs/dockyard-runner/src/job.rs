/// Job function references and the descriptor handed to the remote entrypoint.
///
/// Jobs are dispatched by reference, never by shipping code: the runner
/// serializes `(module, function, args)` and the in-container dispatcher
/// resolves it against its own fixed table.
use crate::error::{Result, RunnerError};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully-qualified callable reference (module path + name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobFunction {
    pub module: String,
    pub name: String,
}

impl JobFunction {
    pub fn new(module: &str, name: &str) -> Result<Self> {
        let function = Self {
            module: module.to_string(),
            name: name.to_string(),
        };
        function.validate()?;
        Ok(function)
    }

    /// Parse `package.module.function`
    pub fn parse(reference: &str) -> Result<Self> {
        let (module, name) = reference
            .trim()
            .rsplit_once('.')
            .ok_or_else(|| RunnerError::InvalidJobFunction {
                reference: reference.to_string(),
                reason: "expected `module.function`".to_string(),
            })?;
        Self::new(module, name)
    }

    /// Reference the remote side dispatches on
    ///
    /// When the module is named after the function, the module path alone
    /// already identifies it.
    pub fn qualified_name(&self) -> String {
        if self.module.ends_with(&format!(".{}", self.name)) {
            self.module.clone()
        } else {
            format!("{}.{}", self.module, self.name)
        }
    }

    /// Every dotted segment must be a plain identifier
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| RunnerError::InvalidJobFunction {
            reference: format!("{}.{}", self.module, self.name),
            reason: reason.to_string(),
        };

        if !is_identifier(&self.name) {
            return Err(invalid("function name is not an identifier"));
        }
        if self.module.is_empty() || !self.module.split('.').all(is_identifier) {
            return Err(invalid("module path is not a dotted identifier path"));
        }
        Ok(())
    }
}

impl fmt::Display for JobFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Arguments the job function is called with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobArgs {
    pub project_id: String,
    pub trajectory_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u64>,
}

/// Explicit call descriptor consumed by the in-container dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub module: String,
    pub function: String,
    pub args: JobArgs,
}

impl JobDescriptor {
    pub fn new(function: &JobFunction, args: JobArgs) -> Self {
        Self {
            module: function.module.clone(),
            function: function.name.clone(),
            args,
        }
    }

    /// Base64 of the JSON form, safe to pass as a single env value
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(general_purpose::STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| RunnerError::Provisioning(format!("invalid descriptor encoding: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let function = JobFunction::parse("agents.jobs.run_trajectory").unwrap();
        assert_eq!(function.module, "agents.jobs");
        assert_eq!(function.name, "run_trajectory");
        assert_eq!(function.qualified_name(), "agents.jobs.run_trajectory");
    }

    #[test]
    fn test_module_named_after_function() {
        let function = JobFunction::new("agents.jobs.run_trajectory", "run_trajectory").unwrap();
        assert_eq!(function.qualified_name(), "agents.jobs.run_trajectory");
    }

    #[test]
    fn test_rejects_shell_syntax() {
        for reference in [
            "run",
            "agents.jobs.run; rm -rf /",
            "agents.$(whoami).run",
            "agents..run",
            "agents.jobs.1run",
            "agents jobs.run",
        ] {
            let err = JobFunction::parse(reference).unwrap_err();
            assert!(
                matches!(err, RunnerError::InvalidJobFunction { .. }),
                "{reference}"
            );
        }
    }

    #[test]
    fn test_descriptor_encoding() {
        let function = JobFunction::parse("agents.jobs.run_trajectory").unwrap();
        let descriptor = JobDescriptor::new(
            &function,
            JobArgs {
                project_id: "proj".to_string(),
                trajectory_id: "django__django-11099".to_string(),
                node_id: Some(4),
            },
        );

        let encoded = descriptor.encode().unwrap();
        assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric() || "+/=".contains(c)));
        assert_eq!(JobDescriptor::decode(&encoded).unwrap(), descriptor);

        let json: serde_json::Value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["function"], "run_trajectory");
        assert_eq!(json["args"]["node_id"], 4);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(JobDescriptor::decode("***").is_err());
    }
}
