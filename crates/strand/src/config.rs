//! Process-wide runtime configuration.
//!
//! Configuration is a flat `section.key -> String` map with change
//! monitors. Values that describe sizes or durations are stored as small
//! arithmetic formulas (for example `"1024 * 1024"` or `"3 * 60 * 1000"`)
//! and evaluated with [`eval_formula`] at the point of use, so a YAML file
//! can express intent instead of magic numbers.
//!
//! The map starts out populated with the runtime's defaults; loading a YAML
//! document merges over them and notifies the registered watchers of every
//! key that changed.

use crate::error::Error;
use rustc_hash::FxHashMap;
use std::sync::{Mutex, OnceLock, RwLock};

type Watcher = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Default stack-size formula for new coroutines.
pub const DEFAULT_STACK_SIZE: &str = "1024 * 1024";

const DEFAULTS: &[(&str, &str)] = &[
    ("coroutine.stackSize", DEFAULT_STACK_SIZE),
    ("server.server_tcp_recv_timeout", "3 * 60 * 1000"),
    ("server.server_tcp_send_timeout", "3 * 60 * 1000"),
    ("server.server_udp_recv_timeout", "3 * 1000"),
    ("server.server_udp_send_timeout", "3 * 1000"),
];

/// Watchable key/value configuration store.
pub struct Config {
    values: RwLock<FxHashMap<String, String>>,
    watchers: Mutex<FxHashMap<String, Vec<Watcher>>>,
}

impl Config {
    fn new() -> Self {
        let mut values = FxHashMap::default();
        for (key, value) in DEFAULTS {
            values.insert((*key).to_string(), (*value).to_string());
        }
        Self {
            values: RwLock::new(values),
            watchers: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the process-wide configuration.
    pub fn global() -> &'static Config {
        static CONFIG: OnceLock<Config> = OnceLock::new();
        CONFIG.get_or_init(Config::new)
    }

    /// Looks up a raw configuration value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().expect("config map poisoned").get(key).cloned()
    }

    /// Looks up a raw configuration value, falling back to `default`.
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Sets a configuration value and notifies watchers if it changed.
    pub fn set(&self, key: &str, value: &str) {
        let old = {
            let mut values = self.values.write().expect("config map poisoned");
            values.insert(key.to_string(), value.to_string())
        };
        if old.as_deref() != Some(value) {
            self.notify(key, old.as_deref().unwrap_or(""), value);
        }
    }

    /// Registers a change monitor for `key`.
    ///
    /// The callback receives the old and the new value. Watchers fire on
    /// [`Config::set`] and on [`Config::load_yaml`] merges.
    pub fn watch(&self, key: &str, f: impl Fn(&str, &str) + Send + Sync + 'static) {
        let mut watchers = self.watchers.lock().expect("config watchers poisoned");
        watchers.entry(key.to_string()).or_default().push(Box::new(f));
    }

    /// Merges a YAML document into the configuration.
    ///
    /// The document must be a two-level mapping of sections to key/scalar
    /// pairs; each entry becomes a `section.key` value.
    pub fn load_yaml(&self, text: &str) -> Result<(), Error> {
        let doc: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| Error::config("<yaml>", e.to_string()))?;
        let serde_yaml::Value::Mapping(sections) = doc else {
            return Err(Error::config("<yaml>", "top level must be a mapping"));
        };

        for (section, body) in sections {
            let Some(section) = section.as_str() else {
                return Err(Error::config("<yaml>", "section names must be strings"));
            };
            let serde_yaml::Value::Mapping(entries) = body else {
                return Err(Error::config(section, "section body must be a mapping"));
            };
            for (key, value) in entries {
                let Some(key) = key.as_str() else {
                    return Err(Error::config(section, "keys must be strings"));
                };
                let value = scalar_to_string(&value)
                    .ok_or_else(|| Error::config(format!("{section}.{key}"), "value must be a scalar"))?;
                self.set(&format!("{section}.{key}"), &value);
            }
        }
        Ok(())
    }

    fn notify(&self, key: &str, old: &str, new: &str) {
        let watchers = self.watchers.lock().expect("config watchers poisoned");
        if let Some(list) = watchers.get(key) {
            for watcher in list {
                watcher(old, new);
            }
        }
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Evaluates an unsigned-integer formula, strictly left to right.
///
/// Accepted input is whitespace-separated numbers joined by `+ - * /`,
/// e.g. `"3 * 60 * 1000"`. There is no operator precedence.
pub fn eval_formula(formula: &str) -> Result<u64, Error> {
    let mut tokens = formula.split_whitespace();
    let first = tokens
        .next()
        .ok_or_else(|| Error::config(formula, "empty formula"))?;
    let mut acc: u64 = first
        .parse()
        .map_err(|_| Error::config(formula, format!("`{first}` is not a number")))?;

    loop {
        let Some(op) = tokens.next() else { break };
        let rhs = tokens
            .next()
            .ok_or_else(|| Error::config(formula, format!("dangling operator `{op}`")))?;
        let rhs: u64 = rhs
            .parse()
            .map_err(|_| Error::config(formula, format!("`{rhs}` is not a number")))?;
        acc = match op {
            "+" => acc.wrapping_add(rhs),
            "-" => acc.wrapping_sub(rhs),
            "*" => acc.wrapping_mul(rhs),
            "/" => {
                if rhs == 0 {
                    return Err(Error::config(formula, "division by zero"));
                }
                acc / rhs
            }
            _ => return Err(Error::config(formula, format!("unknown operator `{op}`"))),
        };
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn formula_is_left_to_right() {
        assert_eq!(eval_formula("1024 * 1024").unwrap(), 1024 * 1024);
        assert_eq!(eval_formula("3 * 60 * 1000").unwrap(), 180_000);
        assert_eq!(eval_formula("42").unwrap(), 42);
        // No precedence: (2 + 3) * 4.
        assert_eq!(eval_formula("2 + 3 * 4").unwrap(), 20);
    }

    #[test]
    fn formula_rejects_garbage() {
        assert!(eval_formula("").is_err());
        assert!(eval_formula("a + 1").is_err());
        assert!(eval_formula("1 +").is_err());
        assert!(eval_formula("1 % 2").is_err());
        assert!(eval_formula("1 / 0").is_err());
    }

    #[test]
    fn yaml_merge_and_watchers() {
        let config = Config::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        config.watch("server.server_tcp_recv_timeout", move |_, new| {
            assert_eq!(new, "5000");
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        config
            .load_yaml("server:\n  server_tcp_recv_timeout: \"5000\"\n")
            .unwrap();
        assert_eq!(config.get("server.server_tcp_recv_timeout").unwrap(), "5000");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Unchanged values do not re-notify.
        config.set("server.server_tcp_recv_timeout", "5000");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn defaults_are_present() {
        let config = Config::new();
        assert_eq!(config.get("coroutine.stackSize").unwrap(), DEFAULT_STACK_SIZE);
        assert_eq!(
            eval_formula(&config.get("server.server_udp_recv_timeout").unwrap()).unwrap(),
            3000
        );
    }
}
