//! Command Validation Module
//!
//! Only the host tools the injectors drive may be spawned. Commands are never
//! interpreted by a shell, so argument checks are limited to bytes the kernel
//! or the tool's own argv parsing would mangle.

/// Error types for command validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandValidationError {
    #[error("Command '{0}' is not in the allowed tool list")]
    NotAllowed(String),

    #[error("Command path contains directory traversal: '{0}'")]
    DirectoryTraversal(String),

    #[error("Argument {index} of '{program}' contains a NUL byte")]
    NulByte { program: String, index: usize },
}

/// Tools the agent drives on the host
pub const DEFAULT_TOOLS: &[&str] = &[
    "tc",
    "ip",
    "iptables",
    "ip6tables",
    "nft",
    "dig",
    "stress-ng",
    "shutdown",
    "fallocate",
    "dd",
    "nsenter",
    "hostname",
];

/// Allow-list validator for host tool invocations
#[derive(Debug, Clone)]
pub struct CommandValidator {
    allowed: Vec<String>,
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::with_allowed(DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect())
    }
}

impl CommandValidator {
    pub fn with_allowed(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    /// Validate a program and its arguments
    ///
    /// Absolute paths are accepted when their file name is on the list
    /// (`/usr/sbin/tc`), relative traversal never is.
    pub fn validate(&self, program: &str, args: &[String]) -> Result<(), CommandValidationError> {
        if program.contains("..") {
            return Err(CommandValidationError::DirectoryTraversal(
                program.to_string(),
            ));
        }

        let name = program.rsplit('/').next().unwrap_or(program);
        if !self.is_allowed(name) {
            return Err(CommandValidationError::NotAllowed(program.to_string()));
        }

        if let Some(index) = args.iter().position(|a| a.contains('\0')) {
            return Err(CommandValidationError::NulByte {
                program: program.to_string(),
                index,
            });
        }

        Ok(())
    }

    pub fn is_allowed(&self, program: &str) -> bool {
        self.allowed.iter().any(|a| a == program)
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_tools() {
        let validator = CommandValidator::default();
        for tool in ["tc", "ip", "iptables", "nft", "dig", "stress-ng"] {
            assert!(validator.is_allowed(tool), "{} should be allowed", tool);
        }
        assert!(!validator.is_allowed("bash"));
        assert!(!validator.is_allowed("rm"));
    }

    #[test]
    fn test_absolute_path_uses_file_name() {
        let validator = CommandValidator::default();
        assert!(validator.validate("/usr/sbin/tc", &args(&["-force"])).is_ok());
        assert_eq!(
            validator.validate("/bin/sh", &[]),
            Err(CommandValidationError::NotAllowed("/bin/sh".to_string()))
        );
    }

    #[test]
    fn test_directory_traversal_rejected() {
        let validator = CommandValidator::default();
        assert!(matches!(
            validator.validate("../tc", &[]),
            Err(CommandValidationError::DirectoryTraversal(_))
        ));
    }

    #[test]
    fn test_nul_byte_rejected() {
        let validator = CommandValidator::default();
        let result = validator.validate("ip", &args(&["link", "show\0eth0"]));
        assert_eq!(
            result,
            Err(CommandValidationError::NulByte {
                program: "ip".to_string(),
                index: 1
            })
        );
    }

    #[test]
    fn test_tool_arguments_with_punctuation_accepted() {
        let validator = CommandValidator::default();
        let rule = args(&["add", "rule", "inet", "nicflap_eth0", "input", "{", "}"]);
        assert!(validator.validate("nft", &rule).is_ok());
    }

    #[test]
    fn test_custom_list() {
        let validator = CommandValidator::with_allowed(vec!["sh".to_string()]);
        assert!(validator.validate("sh", &args(&["-c", "exit 0"])).is_ok());
        assert!(validator.validate("tc", &[]).is_err());
    }
}
