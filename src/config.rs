//! Runtime flags consumed by the dispatch, tiering and deoptimization layer
//!
//! Flags can be built in code with the `with_*` helpers, loaded from a JSON
//! document, or parsed from VM-style `--name=value` arguments.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Diagnostic toggles. None of these change runtime behavior; each enables
/// the `tracing` events of one target (see [`crate::diagnostics`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceFlags {
    /// Trace IC handling
    pub ic: bool,
    /// Trace IC misses that happen in optimized code
    pub ic_miss_in_optimized: bool,
    /// Trace `instanceof` and assignment checks
    pub type_checks: bool,
    /// Trace patching of static calls
    pub patching: bool,
    /// Trace deoptimization
    pub deoptimization: bool,
    /// Trace every slot filled during deoptimization
    pub deoptimization_verbose: bool,
    /// Trace functions that were refused optimization
    pub failed_optimization_attempts: bool,
    /// Trace attempts at on-stack replacement
    pub osr: bool,
    /// Trace runtime entry calls
    pub runtime_calls: bool,
    /// Trace entry to and exit from every invoked function
    pub functions: bool,
}

/// Flags recognized by the runtime layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeFlags {
    /// Usage-counter value before a function is optimized, negative means never
    pub optimization_counter_threshold: i64,
    /// Usage-counter value before already optimized code is reoptimized
    pub reoptimization_counter_threshold: i64,
    /// Deoptimizations after which a function is never optimized again
    pub deoptimization_counter_threshold: u32,
    /// Maximum number of checks cached per subtype test cache
    pub max_subtype_cache_entries: usize,
    /// Receiver checks a call site may hold before it switches to the
    /// megamorphic cache
    pub max_polymorphic_checks: usize,
    /// Comma-separated substrings; when set, only matching functions optimize
    pub optimization_filter: Option<String>,
    /// Terminate the isolate when a function deoptimizes too often
    pub stop_on_excessive_deoptimization: bool,
    /// Use on-stack replacement at interrupt checks
    pub use_osr: bool,
    /// Enforce declared type parameter bounds
    pub enable_type_checks: bool,
    /// Lazily deoptimize every optimized frame whenever native code returns
    pub deoptimize_alot: bool,
    /// Diagnostic output
    pub trace: TraceFlags,
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self {
            optimization_counter_threshold: 15000,
            reoptimization_counter_threshold: 2000,
            deoptimization_counter_threshold: 16,
            max_subtype_cache_entries: 100,
            max_polymorphic_checks: 4,
            optimization_filter: None,
            stop_on_excessive_deoptimization: false,
            use_osr: true,
            enable_type_checks: false,
            deoptimize_alot: false,
            trace: TraceFlags::default(),
        }
    }
}

impl RuntimeFlags {
    /// Create flags with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse flags from a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::internal(format!("invalid flags: {}", e)))
    }

    /// Load flags from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::internal(format!("cannot read flags file {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse VM-style arguments: `--name=value`, `--name` and `--no-name`.
    /// Dashes and underscores are interchangeable in names.
    pub fn parse_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = Self::default();
        for arg in args {
            flags.apply_arg(arg.as_ref())?;
        }
        Ok(flags)
    }

    /// Apply a single `--name[=value]` argument
    pub fn apply_arg(&mut self, arg: &str) -> Result<()> {
        let body = arg
            .strip_prefix("--")
            .ok_or_else(|| Error::internal(format!("not a flag: '{}'", arg)))?;
        let (name, value) = match body.split_once('=') {
            Some((name, value)) => (name.replace('-', "_"), Some(value)),
            None => (body.replace('-', "_"), None),
        };
        if value.is_none() {
            if let Some(negated) = name.strip_prefix("no_") {
                return self.set(negated, "false");
            }
        }
        self.set(&name, value.unwrap_or("true"))
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "optimization_counter_threshold" => self.optimization_counter_threshold = parse(name, value)?,
            "reoptimization_counter_threshold" => self.reoptimization_counter_threshold = parse(name, value)?,
            "deoptimization_counter_threshold" => self.deoptimization_counter_threshold = parse(name, value)?,
            "max_subtype_cache_entries" => self.max_subtype_cache_entries = parse(name, value)?,
            "max_polymorphic_checks" => self.max_polymorphic_checks = parse(name, value)?,
            "optimization_filter" => {
                self.optimization_filter = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "stop_on_excessive_deoptimization" => self.stop_on_excessive_deoptimization = parse(name, value)?,
            "use_osr" => self.use_osr = parse(name, value)?,
            "enable_type_checks" => self.enable_type_checks = parse(name, value)?,
            "deoptimize_alot" => self.deoptimize_alot = parse(name, value)?,
            "trace_ic" => self.trace.ic = parse(name, value)?,
            "trace_ic_miss_in_optimized" => self.trace.ic_miss_in_optimized = parse(name, value)?,
            "trace_type_checks" => self.trace.type_checks = parse(name, value)?,
            "trace_patching" => self.trace.patching = parse(name, value)?,
            "trace_deoptimization" => self.trace.deoptimization = parse(name, value)?,
            "trace_deoptimization_verbose" => self.trace.deoptimization_verbose = parse(name, value)?,
            "trace_failed_optimization_attempts" => {
                self.trace.failed_optimization_attempts = parse(name, value)?
            }
            "trace_osr" => self.trace.osr = parse(name, value)?,
            "trace_runtime_calls" => self.trace.runtime_calls = parse(name, value)?,
            "trace_functions" => self.trace.functions = parse(name, value)?,
            _ => return Err(Error::internal(format!("unknown flag '{}'", name))),
        }
        Ok(())
    }

    /// Set the optimization threshold
    pub fn with_optimization_threshold(mut self, threshold: i64) -> Self {
        self.optimization_counter_threshold = threshold;
        self
    }

    /// Set the reoptimization threshold
    pub fn with_reoptimization_threshold(mut self, threshold: i64) -> Self {
        self.reoptimization_counter_threshold = threshold;
        self
    }

    /// Set the deoptimization ceiling
    pub fn with_deoptimization_threshold(mut self, threshold: u32) -> Self {
        self.deoptimization_counter_threshold = threshold;
        self
    }

    /// Set the subtype test cache capacity
    pub fn with_max_subtype_cache_entries(mut self, entries: usize) -> Self {
        self.max_subtype_cache_entries = entries;
        self
    }

    /// Set the number of receiver checks before a call site goes megamorphic
    pub fn with_max_polymorphic_checks(mut self, checks: usize) -> Self {
        self.max_polymorphic_checks = checks;
        self
    }

    /// Restrict optimization to functions matching a comma-separated filter
    pub fn with_optimization_filter(mut self, filter: impl Into<String>) -> Self {
        self.optimization_filter = Some(filter.into());
        self
    }

    /// Enforce type parameter bounds
    pub fn with_type_checks(mut self, enabled: bool) -> Self {
        self.enable_type_checks = enabled;
        self
    }

    /// Enable or disable on-stack replacement
    pub fn with_osr(mut self, enabled: bool) -> Self {
        self.use_osr = enabled;
        self
    }

    /// Replace the trace toggles
    pub fn with_trace(mut self, trace: TraceFlags) -> Self {
        self.trace = trace;
        self
    }

    /// Whether `qualified_name` passes the optimization filter
    pub fn passes_optimization_filter(&self, qualified_name: &str) -> bool {
        match &self.optimization_filter {
            None => true,
            Some(filter) => filter
                .split(',')
                .filter(|token| !token.is_empty())
                .any(|token| qualified_name.contains(token)),
        }
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::internal(format!("invalid value '{}' for flag '{}'", value, name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let flags = RuntimeFlags::default();
        assert_eq!(flags.optimization_counter_threshold, 15000);
        assert_eq!(flags.reoptimization_counter_threshold, 2000);
        assert_eq!(flags.max_subtype_cache_entries, 100);
        assert!(flags.use_osr);
        assert!(!flags.trace.ic);
    }

    #[test]
    fn test_parse_args() {
        let flags = RuntimeFlags::parse_args([
            "--optimization-counter-threshold=10",
            "--trace_ic",
            "--no-use-osr",
            "--optimization_filter=Foo,bar",
            "--trace-functions",
        ])
        .unwrap();
        assert_eq!(flags.optimization_counter_threshold, 10);
        assert!(flags.trace.ic);
        assert!(!flags.use_osr);
        assert_eq!(flags.optimization_filter.as_deref(), Some("Foo,bar"));
        assert!(flags.trace.functions);
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert!(RuntimeFlags::parse_args(["--no_such_flag=1"]).is_err());
        assert!(RuntimeFlags::parse_args(["--use_osr=maybe"]).is_err());
        assert!(RuntimeFlags::parse_args(["use_osr"]).is_err());
    }

    #[test]
    fn test_from_json_keeps_defaults() {
        let flags = RuntimeFlags::from_json(
            r#"{ "deoptimization_counter_threshold": 3, "trace": { "osr": true } }"#,
        )
        .unwrap();
        assert_eq!(flags.deoptimization_counter_threshold, 3);
        assert!(flags.trace.osr);
        assert_eq!(flags.optimization_counter_threshold, 15000);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_subtype_cache_entries": 7 }}"#).unwrap();
        let flags = RuntimeFlags::from_file(file.path()).unwrap();
        assert_eq!(flags.max_subtype_cache_entries, 7);
    }

    #[test]
    fn test_optimization_filter() {
        let flags = RuntimeFlags::default().with_optimization_filter("List.add,Map.");
        assert!(flags.passes_optimization_filter("IntList.add"));
        assert!(flags.passes_optimization_filter("Map.get"));
        assert!(!flags.passes_optimization_filter("Set.remove"));
        assert!(RuntimeFlags::default().passes_optimization_filter("anything"));
    }
}
