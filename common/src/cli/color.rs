//! Terminal color policy for the gateway's log output.
//!
//! An explicit `always`/`never` on the command line wins. In `auto`,
//! `NO_COLOR` or `EMACS` in the environment turn color off, and otherwise
//! color follows whether stderr (where logs go) is a terminal.

use std::env;
use std::fmt;
use std::str::FromStr;

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorWhen {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorWhen {
    // ---
    /// Resolves the policy for a stream, given whether that stream is a TTY.
    ///
    /// Split out from the TTY probe so the environment rules can be tested
    /// without a terminal.
    pub fn resolve(self, is_tty: bool) -> bool {
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => {
                let suppressed = env::var_os("NO_COLOR").is_some() || env::var_os("EMACS").is_some();
                !suppressed && is_tty
            }
        }
    }

    /// Whether log output on stderr should be colored.
    pub fn should_color_stderr(self) -> bool {
        // ---
        self.resolve(atty::is(atty::Stream::Stderr))
    }
}

impl fmt::Display for ColorWhen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ColorWhen::Auto => "auto",
            ColorWhen::Always => "always",
            ColorWhen::Never => "never",
        })
    }
}

impl FromStr for ColorWhen {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ColorWhen::Auto),
            "always" => Ok(ColorWhen::Always),
            "never" => Ok(ColorWhen::Never),
            other => Err(format!("expected auto, always or never, got `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    // Tests touching process environment run in one function so they cannot
    // interleave with each other.
    #[test]
    fn auto_respects_environment_and_tty() {
        // ---
        let saved: Vec<_> = ["NO_COLOR", "EMACS"].iter().map(|k| (*k, env::var_os(k))).collect();
        env::remove_var("NO_COLOR");
        env::remove_var("EMACS");

        assert!(ColorWhen::Auto.resolve(true));
        assert!(!ColorWhen::Auto.resolve(false));

        env::set_var("NO_COLOR", "1");
        assert!(!ColorWhen::Auto.resolve(true));
        assert!(ColorWhen::Always.resolve(false));
        env::remove_var("NO_COLOR");

        env::set_var("EMACS", "t");
        assert!(!ColorWhen::Auto.resolve(true));

        for (key, value) in saved {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }

    #[test]
    fn never_is_never() {
        // ---
        assert!(!ColorWhen::Never.resolve(true));
    }

    #[test]
    fn parses_cli_spelling() {
        // ---
        assert_eq!("always".parse::<ColorWhen>(), Ok(ColorWhen::Always));
        assert!("sometimes".parse::<ColorWhen>().is_err());
        assert_eq!(ColorWhen::Never.to_string(), "never");
    }
}
