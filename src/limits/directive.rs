//! Configuration directives and their argument parsers.
//!
//! Each directive takes a single string argument and writes exactly one field
//! of a [`LimitsConfig`]. Parsing never touches the load-sample cache.

use std::fmt;
use std::str::FromStr;

use super::record::LimitsConfig;
use crate::error::{LimitsError, Result};

const INVALID_INTEGER: &str = "Integer overflow or invalid number";
const INVALID_LOAD: &str = "Invalid MaxLoadAVG value";

/// A named configuration directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    /// `LimitMaxConnsPerIP`
    MaxConnsPerIp,
    /// `LimitMaxConnsPerVhost`
    MaxConnsPerVhost,
    /// `LimitMaxConnsPerUid`
    MaxConnsPerUid,
    /// `LimitMaxLoadAVG`
    MaxLoadAvg,
    /// `CheckLoadInterval`
    CheckLoadInterval,
}

impl Directive {
    /// Every directive, in the order they are documented.
    pub const ALL: [Directive; 5] = [
        Directive::MaxConnsPerIp,
        Directive::MaxConnsPerVhost,
        Directive::MaxConnsPerUid,
        Directive::MaxLoadAvg,
        Directive::CheckLoadInterval,
    ];

    /// The directive name as written in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Directive::MaxConnsPerIp => "LimitMaxConnsPerIP",
            Directive::MaxConnsPerVhost => "LimitMaxConnsPerVhost",
            Directive::MaxConnsPerUid => "LimitMaxConnsPerUid",
            Directive::MaxLoadAvg => "LimitMaxLoadAVG",
            Directive::CheckLoadInterval => "CheckLoadInterval",
        }
    }

    /// Short human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Directive::MaxConnsPerIp => "maximum simultaneous connections per IP address",
            Directive::MaxConnsPerVhost => "maximum simultaneous connections per vhost",
            Directive::MaxConnsPerUid => "maximum simultaneous connections per user",
            Directive::MaxLoadAvg => "maximum permitted load average",
            Directive::CheckLoadInterval => "seconds between load average samples",
        }
    }

    /// Look up a directive by name, ignoring ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Parse `arg` and store it in the field this directive controls.
    pub fn apply(&self, config: &mut LimitsConfig, arg: &str) -> Result<()> {
        match self {
            Directive::MaxConnsPerIp => config.per_ip_limit = self.parse_integer(arg)?,
            Directive::MaxConnsPerVhost => config.per_vhost_limit = self.parse_integer(arg)?,
            Directive::MaxConnsPerUid => config.per_user_limit = self.parse_integer(arg)?,
            Directive::MaxLoadAvg => config.load_limit = self.parse_load(arg)?,
            Directive::CheckLoadInterval => {
                config.refresh_interval_secs = self.parse_integer(arg)?
            }
        }
        Ok(())
    }

    /// Parse a base-10 unsigned integer that must consume the whole argument.
    fn parse_integer<T: FromStr>(&self, arg: &str) -> Result<T> {
        let arg = arg.trim();
        // FromStr for unsigned types accepts a leading '+'
        if arg.starts_with('+') {
            return Err(self.error(INVALID_INTEGER));
        }
        arg.parse().map_err(|_| self.error(INVALID_INTEGER))
    }

    fn parse_load(&self, arg: &str) -> Result<f64> {
        let value: f64 = arg.trim().parse().map_err(|_| self.error(INVALID_LOAD))?;
        if !value.is_finite() || value < 0.0 {
            return Err(self.error(INVALID_LOAD));
        }
        Ok(value)
    }

    fn error(&self, message: &str) -> LimitsError {
        LimitsError::Directive {
            directive: self.name().to_string(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Directive {
    type Err = LimitsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| LimitsError::Directive {
            directive: s.to_string(),
            message: "Unknown directive".to_string(),
        })
    }
}

/// Apply a sequence of `(name, argument)` pairs on top of the defaults.
pub fn parse_directives<'a, I>(directives: I) -> Result<LimitsConfig>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut config = LimitsConfig::default();
    for (name, arg) in directives {
        let directive: Directive = name.parse()?;
        directive.apply(&mut config, arg)?;
    }
    Ok(config)
}
