//! Terminal output: progress reporting and instance formatting.

use owo_colors::OwoColorize as _;

use crate::provider::{Instance, InstanceState};

/// Output context carrying terminal state derived from CLI flags and
/// environment.
pub struct OutputContext {
    /// Whether to emit ANSI styling.
    pub color: bool,
    /// Whether to suppress non-error output.
    pub quiet: bool,
}

impl OutputContext {
    /// Create output context based on CLI flags and environment.
    #[must_use]
    pub fn new(no_color: bool, quiet: bool) -> Self {
        let color = !no_color && std::env::var_os("NO_COLOR").is_none();
        Self { color, quiet }
    }
}

/// Progress events emitted by long-running operations. The orchestrator
/// depends on this trait, not on any terminal type, so tests can record
/// events instead of printing them.
pub trait Reporter {
    fn step(&self, message: &str);
    fn success(&self, message: &str);
    fn warn(&self, message: &str);
}

/// Terminal progress reporter that wraps an `OutputContext`.
pub struct TerminalReporter<'a> {
    ctx: &'a OutputContext,
}

impl<'a> TerminalReporter<'a> {
    #[must_use]
    pub fn new(ctx: &'a OutputContext) -> Self {
        Self { ctx }
    }
}

impl Reporter for TerminalReporter<'_> {
    fn step(&self, message: &str) {
        if !self.ctx.quiet {
            if self.ctx.color {
                println!("  {} {message}", "→".cyan());
            } else {
                println!("  → {message}");
            }
        }
    }

    fn success(&self, message: &str) {
        if !self.ctx.quiet {
            if self.ctx.color {
                println!("  {} {message}", "✓".green());
            } else {
                println!("  ✓ {message}");
            }
        }
    }

    fn warn(&self, message: &str) {
        if !self.ctx.quiet {
            if self.ctx.color {
                println!("  {} {message}", "!".yellow());
            } else {
                println!("  ! {message}");
            }
        }
    }
}

/// One listing row: state, name (with a `*` marker for protected
/// instances), type, and addresses.
#[must_use]
pub fn format_instance(ctx: &OutputContext, instance: &Instance, protected: bool) -> String {
    let marker = if protected { "*" } else { "" };
    let public = instance.public_ip.as_deref().unwrap_or("-");
    let private = instance.private_ip.as_deref().unwrap_or("-");
    let state = instance.state.as_str();
    if ctx.color {
        let state = if instance.state == InstanceState::Running {
            state.green().to_string()
        } else {
            state.red().to_string()
        };
        format!(
            "{state:<18} {}{marker}  {}  {public}  {private}",
            instance.name.bold(),
            instance.instance_type,
        )
    } else {
        format!(
            "{state:<10} {}{marker}  {}  {public}  {private}",
            instance.name, instance.instance_type,
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::instance;

    #[test]
    fn plain_row_includes_state_name_and_addresses() {
        let ctx = OutputContext { color: false, quiet: false };
        let row = format_instance(&ctx, &instance("i-1", "web", InstanceState::Running), false);
        assert!(row.contains("running"));
        assert!(row.contains("web"));
        assert!(row.contains("198.51.100.7"));
        assert!(row.contains("10.0.0.7"));
        assert!(!row.contains('*'));
    }

    #[test]
    fn protected_row_carries_marker() {
        let ctx = OutputContext { color: false, quiet: false };
        let row = format_instance(&ctx, &instance("i-1", "db", InstanceState::Stopped), true);
        assert!(row.contains("db*"));
    }

    #[test]
    fn missing_addresses_render_as_dashes() {
        let ctx = OutputContext { color: false, quiet: false };
        let mut i = instance("i-1", "web", InstanceState::Stopped);
        i.public_ip = None;
        i.private_ip = None;
        let row = format_instance(&ctx, &i, false);
        assert!(row.contains('-'));
    }
}
