//! Launcher environment, captured once at process start.
//!
//! Process launchers describe the group through `MASTER_ADDR`, `MASTER_PORT`,
//! `RANK`, `WORLD_SIZE` and `LOCAL_RANK`. Nothing below the binary reads the
//! environment; everything goes through a [`LauncherEnv`] value.

use tracing::{debug, warn};

/// Launcher variables that were read.
pub const LAUNCHER_VARS: [&str; 5] = ["MASTER_ADDR", "MASTER_PORT", "RANK", "WORLD_SIZE", "LOCAL_RANK"];

/// Snapshot of the launcher variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LauncherEnv {
    /// Controller host, possibly a hostname.
    pub master_addr: Option<String>,
    pub master_port: Option<u16>,
    pub rank: Option<u32>,
    pub world_size: Option<u32>,
    pub local_rank: Option<u32>,
    /// Variables that were set but could not be parsed, as `NAME=value`.
    pub invalid: Vec<String>,
}

impl LauncherEnv {
    /// Read the launcher variables from the process environment.
    #[must_use]
    pub fn capture() -> Self {
        let env = Self::from_pairs(
            LAUNCHER_VARS
                .iter()
                .filter_map(|name| std::env::var(name).ok().map(|value| (*name, value))),
        );
        if env.is_empty() {
            debug!("No launcher variables set");
        } else {
            debug!(?env, "Captured launcher environment");
        }
        env
    }

    /// Build from explicit `(name, value)` pairs. Unknown names are ignored.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut env = Self::default();
        for (name, value) in pairs {
            let (name, value) = (name.as_ref(), value.as_ref().trim());
            if value.is_empty() {
                continue;
            }
            let parsed = match name {
                "MASTER_ADDR" => {
                    env.master_addr = Some(value.to_string());
                    true
                }
                "MASTER_PORT" => set_parsed(&mut env.master_port, value),
                "RANK" => set_parsed(&mut env.rank, value),
                "WORLD_SIZE" => set_parsed(&mut env.world_size, value),
                "LOCAL_RANK" => set_parsed(&mut env.local_rank, value),
                _ => true,
            };
            if !parsed {
                warn!(name, value, "Ignoring unparsable launcher variable");
                env.invalid.push(format!("{name}={value}"));
            }
        }
        env
    }

    /// Whether no launcher variable was set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.master_addr.is_none()
            && self.master_port.is_none()
            && self.rank.is_none()
            && self.world_size.is_none()
            && self.local_rank.is_none()
            && self.invalid.is_empty()
    }

    /// Controller host and port, when both are set.
    #[must_use]
    pub fn controller(&self) -> Option<(&str, u16)> {
        Some((self.master_addr.as_deref()?, self.master_port?))
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut Option<T>, value: &str) -> bool {
    match value.parse() {
        Ok(parsed) => {
            *slot = Some(parsed);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pairs() {
        let env = LauncherEnv::from_pairs([
            ("MASTER_ADDR", "node-0"),
            ("MASTER_PORT", "29500"),
            ("RANK", "2"),
            ("WORLD_SIZE", "4"),
            ("LOCAL_RANK", "0"),
            ("PATH", "/usr/bin"),
        ]);
        assert_eq!(env.controller(), Some(("node-0", 29500)));
        assert_eq!(env.rank, Some(2));
        assert_eq!(env.world_size, Some(4));
        assert_eq!(env.local_rank, Some(0));
        assert!(env.invalid.is_empty());
    }

    #[test]
    fn test_partial_and_invalid() {
        let env = LauncherEnv::from_pairs([("MASTER_ADDR", "10.0.0.1"), ("RANK", "two"), ("WORLD_SIZE", " ")]);
        assert_eq!(env.controller(), None);
        assert_eq!(env.rank, None);
        assert_eq!(env.world_size, None);
        assert_eq!(env.invalid, vec!["RANK=two".to_string()]);
        assert!(!env.is_empty());
    }

    #[test]
    fn test_empty() {
        let env = LauncherEnv::from_pairs(Vec::<(String, String)>::new());
        assert!(env.is_empty());
        assert_eq!(env, LauncherEnv::default());
    }
}
