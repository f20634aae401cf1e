//! Per-component log verbosity.
//!
//! Every log record carries one of five component targets (`core`, `cpu`,
//! `mmio`, `irq`, `dev`). Verbosity is configured per component with
//! strings of the form:
//!
//! ```text
//! quiet | warn | info | trace          set every component
//! <component>=<level>                  set a single component
//! ```
//!
//! Directives are applied in order, so later ones override earlier ones:
//!
//! ```text
//! tvmm -D info -D irq=trace            everything at info, IRQ at trace
//! tvmm -D trace -D dev=warn -D mmio=warn
//! ```
//!
//! The resulting [`Verbosity`] is turned into a `tracing_subscriber`
//! target filter by [`Verbosity::filter`].

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::filter::{LevelFilter, Targets};

/// Errors from parsing a verbosity directive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerbosityError {
    /// The string is neither a level nor `<component>=<level>`.
    #[error("invalid verbosity string '{0}'")]
    Invalid(String),

    /// The component part names no known component.
    #[error("unknown verbosity component '{0}'")]
    UnknownComponent(String),

    /// The level part names no known level.
    #[error("unknown verbosity level '{0}'")]
    UnknownLevel(String),
}

/// Log component. Doubles as the `tracing` target name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Core,
    Cpu,
    Mmio,
    Irq,
    Dev,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Core,
        Component::Cpu,
        Component::Mmio,
        Component::Irq,
        Component::Dev,
    ];

    /// The `tracing` target used for records of this component.
    pub const fn target(self) -> &'static str {
        match self {
            Component::Core => "core",
            Component::Cpu => "cpu",
            Component::Mmio => "mmio",
            Component::Irq => "irq",
            Component::Dev => "dev",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl FromStr for Component {
    type Err = VerbosityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Component::ALL
            .into_iter()
            .find(|c| c.target() == s)
            .ok_or_else(|| VerbosityError::UnknownComponent(s.to_string()))
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target())
    }
}

/// Verbosity level of a component. Each level includes the ones below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Quiet,
    Warn,
    Info,
    Trace,
}

impl Level {
    fn as_filter(self) -> LevelFilter {
        match self {
            Level::Quiet => LevelFilter::OFF,
            Level::Warn => LevelFilter::WARN,
            Level::Info => LevelFilter::INFO,
            Level::Trace => LevelFilter::TRACE,
        }
    }
}

impl FromStr for Level {
    type Err = VerbosityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quiet" => Ok(Level::Quiet),
            "warn" => Ok(Level::Warn),
            "info" => Ok(Level::Info),
            "trace" => Ok(Level::Trace),
            _ => Err(VerbosityError::UnknownLevel(s.to_string())),
        }
    }
}

/// One parsed `-D` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Bare level: applies to every component.
    All(Level),
    /// `<component>=<level>`.
    Component(Component, Level),
}

impl FromStr for Directive {
    type Err = VerbosityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_start_matches(' ');

        if let Ok(level) = s.parse::<Level>() {
            return Ok(Directive::All(level));
        }

        let (component, level) = s
            .split_once('=')
            .ok_or_else(|| VerbosityError::Invalid(s.to_string()))?;

        Ok(Directive::Component(component.parse()?, level.parse()?))
    }
}

/// Verbosity of every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verbosity {
    levels: [Level; Component::ALL.len()],
}

impl Default for Verbosity {
    fn default() -> Self {
        Self {
            levels: [Level::Warn; Component::ALL.len()],
        }
    }
}

impl Verbosity {
    /// Start from the default (`warn` everywhere) and apply `directives` in order.
    pub fn from_directives<'a, I>(directives: I) -> Self
    where
        I: IntoIterator<Item = &'a Directive>,
    {
        let mut verbosity = Self::default();
        for directive in directives {
            verbosity.apply(*directive);
        }
        verbosity
    }

    pub fn apply(&mut self, directive: Directive) {
        match directive {
            Directive::All(level) => self.levels = [level; Component::ALL.len()],
            Directive::Component(c, level) => self.levels[c.index()] = level,
        }
    }

    /// Parse and apply a verbosity string.
    pub fn apply_str(&mut self, s: &str) -> Result<(), VerbosityError> {
        self.apply(s.parse()?);
        Ok(())
    }

    pub fn level(&self, component: Component) -> Level {
        self.levels[component.index()]
    }

    /// Target filter enabling exactly the configured components and levels.
    ///
    /// Records on targets other than the five components are dropped.
    pub fn filter(&self) -> Targets {
        Component::ALL.into_iter().fold(Targets::new(), |targets, c| {
            targets.with_target(c.target(), self.level(c).as_filter())
        })
    }
}

/// Install the global log subscriber, writing to stderr.
pub fn init(verbosity: &Verbosity) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(verbosity.filter())
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_warn() {
        let v = Verbosity::default();
        for c in Component::ALL {
            assert_eq!(v.level(c), Level::Warn);
        }
    }

    #[test]
    fn test_global_level() {
        let mut v = Verbosity::default();
        v.apply_str("trace").unwrap();
        assert_eq!(v.level(Component::Mmio), Level::Trace);
        assert_eq!(v.level(Component::Dev), Level::Trace);
    }

    #[test]
    fn test_component_overrides_global() {
        let directives: Vec<Directive> = ["info", "irq=trace"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let v = Verbosity::from_directives(&directives);
        assert_eq!(v.level(Component::Core), Level::Info);
        assert_eq!(v.level(Component::Irq), Level::Trace);
    }

    #[test]
    fn test_later_global_resets_components() {
        let mut v = Verbosity::default();
        v.apply_str("mmio=trace").unwrap();
        v.apply_str("quiet").unwrap();
        assert_eq!(v.level(Component::Mmio), Level::Quiet);
    }

    #[test]
    fn test_leading_spaces_ignored() {
        assert_eq!(
            "  dev=info".parse::<Directive>(),
            Ok(Directive::Component(Component::Dev, Level::Info))
        );
    }

    #[test]
    fn test_invalid_strings() {
        assert_eq!(
            "loud".parse::<Directive>(),
            Err(VerbosityError::Invalid("loud".to_string()))
        );
        assert_eq!(
            "gpu=trace".parse::<Directive>(),
            Err(VerbosityError::UnknownComponent("gpu".to_string()))
        );
        assert_eq!(
            "mmio=loud".parse::<Directive>(),
            Err(VerbosityError::UnknownLevel("loud".to_string()))
        );
    }

    #[test]
    fn test_filter_respects_levels() {
        use tracing::Level as L;
        use tracing_subscriber::layer::SubscriberExt;

        let mut v = Verbosity::default();
        v.apply_str("mmio=trace").unwrap();
        v.apply_str("dev=quiet").unwrap();
        let filter = v.filter();

        assert!(filter.would_enable("mmio", &L::TRACE));
        assert!(filter.would_enable("core", &L::WARN));
        assert!(!filter.would_enable("core", &L::INFO));
        assert!(!filter.would_enable("dev", &L::WARN));
        assert!(!filter.would_enable("kvm_ioctls", &L::WARN));

        // The filter must be usable as a layer.
        let _subscriber = tracing_subscriber::registry().with(filter);
    }
}
