//! Diagnostic output for the runtime layer.
//!
//! Each trace toggle in [`TraceFlags`] corresponds to one `tracing` target.
//! Runtime entries only emit an event when its toggle is set, so enabling a
//! target through `RUST_LOG` alone shows nothing; the toggles are the switch,
//! the subscriber is the sink.

use crate::config::TraceFlags;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// `tracing` targets used by the runtime entries
pub mod targets {
    pub const IC: &str = "jitrt::ic";
    pub const TYPE_CHECKS: &str = "jitrt::type_checks";
    pub const PATCHING: &str = "jitrt::patching";
    pub const DEOPT: &str = "jitrt::deopt";
    pub const OPTIMIZATION: &str = "jitrt::optimization";
    pub const OSR: &str = "jitrt::osr";
    pub const RUNTIME_CALLS: &str = "jitrt::runtime_calls";
    pub const GC: &str = "jitrt::gc";
    pub const FUNCTIONS: &str = "jitrt::functions";
}

// ---------------------------------------------------------------------------
// Subscriber installation
// ---------------------------------------------------------------------------

/// Filter directives enabling exactly the targets toggled in `trace`
pub fn filter_directives(trace: &TraceFlags) -> Vec<String> {
    let mut directives = Vec::new();
    let mut enable = |on: bool, target: &str, level: &str| {
        if on {
            directives.push(format!("{}={}", target, level));
        }
    };
    enable(trace.ic || trace.ic_miss_in_optimized, targets::IC, "debug");
    enable(trace.type_checks, targets::TYPE_CHECKS, "debug");
    enable(trace.patching, targets::PATCHING, "debug");
    let deopt_level = if trace.deoptimization_verbose { "trace" } else { "debug" };
    enable(
        trace.deoptimization || trace.deoptimization_verbose,
        targets::DEOPT,
        deopt_level,
    );
    enable(trace.failed_optimization_attempts, targets::OPTIMIZATION, "debug");
    enable(trace.osr, targets::OSR, "debug");
    enable(trace.runtime_calls, targets::RUNTIME_CALLS, "trace");
    enable(trace.functions, targets::FUNCTIONS, "debug");
    directives
}

/// Build the `EnvFilter` for `trace`, with `RUST_LOG` directives on top
pub fn env_filter(trace: &TraceFlags) -> EnvFilter {
    let mut filter = EnvFilter::new("warn");
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let directives = filter_directives(trace)
        .into_iter()
        .chain(env.split(',').map(str::trim).filter(|d| !d.is_empty()).map(String::from));
    for directive in directives {
        match directive.parse() {
            Ok(parsed) => filter = filter.add_directive(parsed),
            Err(e) => eprintln!("jitrt: ignoring log directive '{}': {}", directive, e),
        }
    }
    filter
}

/// Install a formatting subscriber for the toggled targets.
///
/// Returns `false` when a global subscriber was already installed, in which
/// case nothing changes.
pub fn init_tracing(trace: &TraceFlags) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(trace))
        .with_target(true)
        .try_init()
        .is_ok()
}
