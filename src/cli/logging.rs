//! Subscriber setup.
//!
//! Logging has to be configured before the command tree can be built (the
//! tree depends on discovered plugins), so the global flags are scanned from
//! the raw arguments ahead of the real parse.

use tracing_subscriber::EnvFilter;

/// Global logging flags found before the first subcommand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EarlyFlags {
    pub verbose: bool,
    pub json: bool,
}

impl EarlyFlags {
    pub fn scan(args: &[String]) -> Self {
        let mut flags = Self::default();
        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-v" | "--verbose" => flags.verbose = true,
                "--log-format" => flags.json = iter.next().is_some_and(|v| v == "json"),
                "--log-format=json" => flags.json = true,
                "--log-format=text" => flags.json = false,
                "--" => break,
                other if !other.starts_with('-') => break,
                _ => {}
            }
        }
        flags
    }
}

/// Install the global subscriber. `RUST_LOG` wins unless `--verbose` is set.
pub(crate) fn init(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("devstrap=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("devstrap=warn"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("devstrap")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_scan_global_flags() {
        assert_eq!(
            EarlyFlags::scan(&args(&["--verbose", "--log-format", "json", "status"])),
            EarlyFlags {
                verbose: true,
                json: true
            }
        );
        assert_eq!(
            EarlyFlags::scan(&args(&["--log-format=json", "plugin", "list"])),
            EarlyFlags {
                verbose: false,
                json: true
            }
        );
    }

    #[test]
    fn test_scan_stops_at_subcommand() {
        let flags = EarlyFlags::scan(&args(&["apt", "install", "-v", "git"]));
        assert_eq!(flags, EarlyFlags::default());
    }
}
