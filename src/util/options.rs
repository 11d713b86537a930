use std::default::Default;
use std::str::FromStr;
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Selects how the full marking visitor decides that a function's compiled code is stale.
/// The three policies are mutually exclusive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumString, Display, IntoStaticStr)]
pub enum CodeFlushingTrigger {
    /// Each full GC that finds the function unused increments its age by one.
    /// Code is old once the age reaches `bytecode_old_age`.
    AgeCounter,
    /// The age is the number of seconds the function has been unused.
    /// Code is old once the age reaches `bytecode_old_time`.
    Time,
    /// Ages never advance. Code is old while the isolate is in a background tab,
    /// or once something else has saturated the age.
    TabVisibility,
}

fn always_valid<T>(_: &T) -> bool {
    true
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),* $(,)?) => [
        /// Runtime-tunable flags. Tables and visitors receive an `Options` reference at
        /// construction, so tests can vary the flags per instance.
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option by its name. The value is parsed and validated, and the option
            /// is left unchanged if either step fails. Returns whether the option was set.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by the embedder) to the right type
                    $(stringify!($name) => if let Ok(val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(&val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val;
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option {}", s);
                        false
                    }
                }
            }

            /// Apply every environment variable that starts with `SANDMARK_` and names an
            /// option (such as `SANDMARK_BYTECODE_OLD_AGE`).
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "SANDMARK_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { self.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }
    ]
}

options! {
    /// Allow the full marking visitor to flush bytecode of old functions.
    flush_bytecode:                    bool               [always_valid] = true,
    /// Allow the full marking visitor to flush baseline code of old functions.
    flush_baseline_code:               bool               [always_valid] = false,
    /// Treat every flushable function as old.
    stress_flush_code:                 bool               [always_valid] = false,
    /// The staleness policy for code flushing.
    code_flushing_trigger:             CodeFlushingTrigger[always_valid] = CodeFlushingTrigger::AgeCounter,
    /// The age at which code is old under `CodeFlushingTrigger::AgeCounter`.
    bytecode_old_age:                  u16                [|v: &u16| *v > 0] = 6,
    /// The number of unused seconds after which code is old under `CodeFlushingTrigger::Time`.
    bytecode_old_time:                 u16                [|v: &u16| *v > 0] = 30,
    /// Extract wrapper snapshots of embedder-traced objects.
    trace_embedder_fields:             bool               [always_valid] = true,
    /// Remember the first retainer of every marked object.
    track_retaining_path:              bool               [always_valid] = false,
    /// The number of slots a progress bar advances per increment.
    progress_bar_scanning_chunk:       usize              [|v: &usize| *v > 0] = 16 * 1024,
    /// Record allocation-site feedback while marking the young generation.
    allocation_site_pretenuring:       bool               [always_valid] = true,
    /// A site needs at least this many allocations before it is judged.
    pretenuring_min_mementos_created:  usize              [always_valid] = 100,
    /// Tenure a site once this fraction of its allocations survive.
    pretenuring_ratio:                 f64                [|v: &f64| *v > 0.0 && *v <= 1.0] = 0.85,
    /// Do not try OS subspaces for entity tables.
    entity_table_use_emulated_subspace: bool              [always_valid] = false,
    /// Allow external pointer spaces to be compacted during sweeping.
    external_pointer_table_compaction: bool               [always_valid] = true,
}

impl Options {
    /// The default options, overridden by `SANDMARK_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Options::default();
        options.read_env_var_settings();
        options
    }
}

impl FromStr for Options {
    type Err = String;

    /// Parse a comma separated `name=value` list, e.g. `flush_bytecode=false,bytecode_old_age=3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = Options::default();
        for pair in s.split(',').filter(|p| !p.is_empty()) {
            let Some((name, value)) = pair.split_once('=') else {
                return Err(format!("Expected name=value, found {:?}", pair));
            };
            if !options.set_from_str(name.trim(), value.trim()) {
                return Err(format!("Cannot set {}={}", name, value));
            }
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let options = Options::from_env();
            assert!(options.flush_bytecode);
            assert_eq!(options.bytecode_old_age, 6);
            assert_eq!(
                options.code_flushing_trigger,
                CodeFlushingTrigger::AgeCounter
            );
        })
    }

    #[test]
    fn with_valid_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("SANDMARK_BYTECODE_OLD_AGE", "3");
                    std::env::set_var("SANDMARK_CODE_FLUSHING_TRIGGER", "Time");
                    let options = Options::from_env();
                    assert_eq!(options.bytecode_old_age, 3);
                    assert_eq!(options.code_flushing_trigger, CodeFlushingTrigger::Time);
                },
                || {
                    std::env::remove_var("SANDMARK_BYTECODE_OLD_AGE");
                    std::env::remove_var("SANDMARK_CODE_FLUSHING_TRIGGER");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // zero is rejected by the validator
                    std::env::set_var("SANDMARK_BYTECODE_OLD_AGE", "0");
                    let options = Options::from_env();
                    assert_eq!(options.bytecode_old_age, 6);
                },
                || {
                    std::env::remove_var("SANDMARK_BYTECODE_OLD_AGE");
                },
            )
        })
    }

    #[test]
    fn set_from_str_rejects_bad_values() {
        let mut options = Options::default();
        assert!(!options.set_from_str("pretenuring_ratio", "1.5"));
        assert!(!options.set_from_str("pretenuring_ratio", "abc"));
        assert!(!options.set_from_str("no_such_option", "1"));
        assert!(options.set_from_str("pretenuring_ratio", "0.5"));
        assert_eq!(options.pretenuring_ratio, 0.5);
    }

    #[test]
    fn parse_option_list() {
        let options: Options = "flush_bytecode=false, progress_bar_scanning_chunk=8"
            .parse()
            .unwrap();
        assert!(!options.flush_bytecode);
        assert_eq!(options.progress_bar_scanning_chunk, 8);
        assert!("flush_bytecode".parse::<Options>().is_err());
    }
}
