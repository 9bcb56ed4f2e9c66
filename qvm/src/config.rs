use std::env;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Interpreted,
    Compiled,
}

impl ExecutionMode {
    pub fn name(self) -> &'static str {
        match self {
            ExecutionMode::Interpreted => "interpreted",
            ExecutionMode::Compiled => "compiled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "interpreted" | "interp" | "interpreter" => Some(ExecutionMode::Interpreted),
            "compiled" | "jit" | "native" => Some(ExecutionMode::Compiled),
            _ => None,
        }
    }
}

pub const DEFAULT_STACK_SIZE: u32 = 0x10000;
pub const DEFAULT_MAX_MEMORY: u64 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_NESTING: usize = 64;
pub const DEFAULT_JIT_MAX_CODE_BYTES: usize = 64 * 1024 * 1024;

/// Smallest stack that still holds the host entry frame plus one guest frame.
pub const MIN_STACK_SIZE: u32 = 0x100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub mode: ExecutionMode,
    pub stack_size: u32,
    pub max_memory: u64,
    pub max_nesting: usize,
    /// Control transfers allowed per host call; `None` is unlimited.
    pub instruction_budget: Option<u64>,
    pub jit_max_code_bytes: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Compiled,
            stack_size: DEFAULT_STACK_SIZE,
            max_memory: DEFAULT_MAX_MEMORY,
            max_nesting: DEFAULT_MAX_NESTING,
            instruction_budget: None,
            jit_max_code_bytes: DEFAULT_JIT_MAX_CODE_BYTES,
        }
    }
}

impl VmConfig {
    pub fn interpreted() -> Self {
        Self {
            mode: ExecutionMode::Interpreted,
            ..Self::default()
        }
    }

    pub fn compiled() -> Self {
        Self {
            mode: ExecutionMode::Compiled,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from `QVM_*` keys resolved through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mode = match lookup("QVM_MODE") {
            Some(raw) => ExecutionMode::parse(&raw).ok_or(ConfigError::InvalidValue {
                key: "QVM_MODE",
                value: raw,
            })?,
            None => defaults.mode,
        };
        let stack_size = parse_u64(&lookup, "QVM_STACK_SIZE", defaults.stack_size as u64)?;
        let stack_size = u32::try_from(stack_size).map_err(|_| ConfigError::InvalidValue {
            key: "QVM_STACK_SIZE",
            value: stack_size.to_string(),
        })?;
        let instruction_budget = match lookup("QVM_INSTRUCTION_BUDGET") {
            Some(raw) if raw.trim().is_empty() || raw.trim() == "none" => None,
            Some(_) => Some(parse_u64(&lookup, "QVM_INSTRUCTION_BUDGET", 0)?),
            None => defaults.instruction_budget,
        };

        let config = Self {
            mode,
            stack_size,
            max_memory: parse_u64(&lookup, "QVM_MAX_MEMORY", defaults.max_memory)?,
            max_nesting: parse_u64(&lookup, "QVM_MAX_NESTING", defaults.max_nesting as u64)?
                as usize,
            instruction_budget,
            jit_max_code_bytes: parse_u64(
                &lookup,
                "QVM_JIT_MAX_CODE_BYTES",
                defaults.jit_max_code_bytes as u64,
            )? as usize,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < MIN_STACK_SIZE || self.stack_size % 4 != 0 {
            return Err(ConfigError::InvalidValue {
                key: "stack_size",
                value: self.stack_size.to_string(),
            });
        }
        if self.max_nesting == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_nesting",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value for {key}: '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_u64<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => parse_number(&value).ok_or(ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

/// Accepts decimal or `0x`-prefixed hex.
pub fn parse_number(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}
